//! Download reader.
//!
//! Request (`KANP_CMD_KFS_DOWNLOAD_DATA`):
//! `BIN ticket | U32 count | count x (U64 inode, U64 offset, U64 commit)`.
//!
//! The server answers with as many `KANP_RES_KFS_DOWNLOAD_DATA` frames as it
//! needs, each `U32 nb_sub | nb_sub x sub-message`. A FILE sub-message opens
//! every requested file; CHUNKs follow until `sent_size` bytes were delivered.
//! Frame boundaries are independent of file boundaries.

use crate::anp::kanp::{KANP_CMD_KFS_DOWNLOAD_DATA, KANP_RES_KFS_DOWNLOAD_DATA};
use crate::anp::value::{Message, MessageReader};
use crate::client::KcdClient;
use crate::error::{KanpError, Result};
use crate::kfs::phase_two::Submessage;
use crate::kfs::types::{FileRequest, Ticket};
use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadItem {
    /// Start of the next requested file. `sent_size` bytes of chunks follow.
    FileStart { total_size: u64, sent_size: u64 },
    Chunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Current frame exhausted; next read fetches a frame.
    AwaitingFrame,
    /// Next sub-message must be a FILE.
    FileInfo,
    /// Next sub-message must be a CHUNK of the current file.
    Chunk,
    Done,
}

pub fn encode_request(ticket: &Ticket, files: &[FileRequest]) -> Message {
    let mut m = Message::new();
    m.push_bin(ticket.as_bytes().clone())
        .push_u32(files.len() as u32);
    for f in files {
        f.write_to(&mut m);
    }
    m
}

/// Server side of [`encode_request`].
pub fn decode_request(reader: &mut MessageReader) -> Result<(Ticket, Vec<FileRequest>)> {
    let ticket = Ticket::new(reader.next_bin()?);
    let count = reader.next_u32()? as usize;
    if count > reader.remaining() / 3 {
        return Err(KanpError::Protocol(format!(
            "download declares {} files, payload holds at most {}",
            count,
            reader.remaining() / 3
        )));
    }
    let files = (0..count)
        .map(|_| FileRequest::read_from(reader))
        .collect::<Result<Vec<_>>>()?;
    Ok((ticket, files))
}

impl<S: AsyncRead + AsyncWrite + Unpin> KcdClient<S> {
    /// Send a download request. Content is read lazily from the returned
    /// stream.
    pub async fn open_download(
        &mut self,
        ticket: &Ticket,
        files: &[FileRequest],
    ) -> Result<DownloadStream<'_, S>> {
        if files.is_empty() {
            return Err(KanpError::InvalidArgument(
                "download request needs at least one file".into(),
            ));
        }
        self.send(KANP_CMD_KFS_DOWNLOAD_DATA, &encode_request(ticket, files))
            .await?;
        debug!(files = files.len(), "download requested");
        Ok(DownloadStream {
            client: self,
            frame: None,
            subs_left: 0,
            state: DownloadState::AwaitingFrame,
            resume: DownloadState::FileInfo,
            files_left: files.len(),
            expected: 0,
            received: 0,
        })
    }
}

/// Pull-based reader over the download reply frames.
pub struct DownloadStream<'c, S> {
    client: &'c mut KcdClient<S>,
    frame: Option<MessageReader>,
    subs_left: u32,
    state: DownloadState,
    /// State to enter once a new frame is fetched.
    resume: DownloadState,
    files_left: usize,
    expected: u64,
    received: u64,
}

impl<'c, S: AsyncRead + AsyncWrite + Unpin + 'c> DownloadStream<'c, S> {
    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn files_left(&self) -> usize {
        self.files_left
    }

    /// Next item, or `None` after the last chunk of the last file.
    ///
    /// Any error ends the stream: later calls return `None`.
    pub async fn next(&mut self) -> Result<Option<DownloadItem>> {
        let item = self.advance().await;
        if item.is_err() {
            self.state = DownloadState::Done;
        }
        item
    }

    async fn advance(&mut self) -> Result<Option<DownloadItem>> {
        loop {
            match self.state {
                DownloadState::Done => return Ok(None),
                DownloadState::AwaitingFrame => {
                    if self.files_left == 0 {
                        self.state = DownloadState::Done;
                        continue;
                    }
                    self.fetch_frame().await?;
                }
                DownloadState::FileInfo | DownloadState::Chunk => {
                    if self.files_left == 0 {
                        if self.subs_left > 0 {
                            return Err(self.fail(format!(
                                "{} submessages after the last file",
                                self.subs_left
                            )));
                        }
                        self.state = DownloadState::Done;
                        continue;
                    }
                    if self.subs_left == 0 {
                        self.resume = self.state;
                        self.state = DownloadState::AwaitingFrame;
                        trace!(resume = ?self.resume, "frame exhausted");
                        continue;
                    }
                    return self.read_submessage().map(Some);
                }
            }
        }
    }

    async fn fetch_frame(&mut self) -> Result<()> {
        let mut reader = self.client.expect(KANP_RES_KFS_DOWNLOAD_DATA).await?;
        let count = reader.next_u32()?;
        // Smallest sub-message is three elements
        if count as usize > reader.remaining() / 3 {
            return Err(self.fail(format!(
                "frame declares {} submessages, payload holds at most {}",
                count,
                reader.remaining() / 3
            )));
        }
        trace!(submessages = count, resume = ?self.resume, "frame fetched");
        self.subs_left = count;
        self.frame = Some(reader);
        self.state = self.resume;
        Ok(())
    }

    fn read_submessage(&mut self) -> Result<DownloadItem> {
        let reader = match self.frame.as_mut() {
            Some(r) => r,
            None => return Err(self.fail("no frame to read from".into())),
        };
        let sub = Submessage::read_from(reader)?;
        self.subs_left -= 1;

        match (self.state, sub) {
            (
                DownloadState::FileInfo,
                Submessage::File {
                    total_size,
                    sent_size,
                },
            ) => {
                if sent_size > total_size {
                    return Err(self.fail(format!(
                        "file announces {} bytes to send out of {}",
                        sent_size, total_size
                    )));
                }
                if sent_size == 0 {
                    self.files_left -= 1;
                    debug!(total_size, "empty file");
                } else {
                    self.expected = sent_size;
                    self.received = 0;
                    self.state = DownloadState::Chunk;
                    debug!(total_size, sent_size, "file start");
                }
                Ok(DownloadItem::FileStart {
                    total_size,
                    sent_size,
                })
            }
            (DownloadState::Chunk, Submessage::Chunk(data)) => {
                self.received += data.len() as u64;
                if self.received > self.expected {
                    return Err(self.fail(format!(
                        "chunk overruns file: {} of {} bytes",
                        self.received, self.expected
                    )));
                }
                trace!(len = data.len(), received = self.received, "chunk");
                if self.received == self.expected {
                    self.files_left -= 1;
                    self.state = DownloadState::FileInfo;
                    debug!(size = self.expected, "file complete");
                }
                Ok(DownloadItem::Chunk(data))
            }
            (state, other) => Err(self.fail(format!(
                "unexpected {} submessage in state {:?}",
                other.name(),
                state
            ))),
        }
    }

    fn fail(&mut self, message: String) -> KanpError {
        self.state = DownloadState::Done;
        KanpError::Protocol(message)
    }

    /// Read every remaining item into per-file buffers.
    pub async fn collect_files(mut self) -> Result<Vec<Vec<u8>>> {
        let mut files: Vec<Vec<u8>> = Vec::new();
        while let Some(item) = self.next().await? {
            match item {
                DownloadItem::FileStart { sent_size, .. } => {
                    files.push(Vec::with_capacity(sent_size as usize));
                }
                DownloadItem::Chunk(data) => {
                    if let Some(current) = files.last_mut() {
                        current.extend_from_slice(&data);
                    }
                }
            }
        }
        Ok(files)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<DownloadItem>> + 'c {
        stream::try_unfold(self, |mut reader| async move {
            let item = reader.next().await?;
            Ok::<_, KanpError>(item.map(|item| (item, reader)))
        })
    }
}
