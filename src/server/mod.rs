//! Reference KCD: the server end of the KFS transfer protocol.
//!
//! Each connection runs [`Kcd::serve`]: read a frame, dispatch on its kind,
//! answer with the same correlation id. A request the server refuses is
//! answered with `KANP_RES_FAIL` and ends the session.

pub mod store;
pub mod ticket;

use crate::anp::kanp::{
    kind_name, KANP_CMD_KFS_DOWNLOAD_DATA, KANP_CMD_KFS_DOWNLOAD_REQ, KANP_CMD_KFS_PHASE_1,
    KANP_CMD_KFS_PHASE_2, KANP_CMD_KFS_UPLOAD_REQ, KANP_CMD_MGT_SELECT_ROLE, KANP_KCD_ROLE_FILE_XFER,
    KANP_KCD_ROLE_WORKSPACE, KANP_RES_FAIL, KANP_RES_FAIL_FILE_QUOTA_EXCEEDED, KANP_RES_FAIL_GEN,
    KANP_RES_KFS_DOWNLOAD_DATA, KANP_RES_KFS_DOWNLOAD_REQ, KANP_RES_KFS_PHASE_1,
    KANP_RES_KFS_UPLOAD_REQ, KANP_RES_OK,
};
use crate::anp::transport::{read_frame, write_frame, TransportHeader};
use crate::anp::value::{Message, MessageReader};
use crate::config::ServerConfig;
use crate::error::{KanpError, Result};
use crate::kfs::phase_one;
use crate::kfs::phase_two::{Submessage, DIGEST_LEN};
use crate::kfs::download;
use crate::kfs::types::InodeId;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub use store::{BatchOutcome, KfsStore, KfsTree, OpFailure, ShareKey};
pub use ticket::{TicketAuthority, TicketGrant, TicketKind};

/// Shared server state. Cheap to clone; one clone per connection.
#[derive(Clone)]
pub struct Kcd {
    store: Arc<KfsStore>,
    tickets: Arc<TicketAuthority>,
    config: Arc<ServerConfig>,
}

impl Kcd {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            store: Arc::new(KfsStore::new()),
            tickets: Arc::new(TicketAuthority::new()),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &KfsStore {
        &self.store
    }

    pub fn tickets(&self) -> &TicketAuthority {
        &self.tickets
    }

    /// Run one session until the peer disconnects or a request is refused.
    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: S) -> Result<()> {
        let mut session = Session {
            kcd: self,
            stream,
            role: Role::None,
            upload: None,
        };
        session.run().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    None,
    Workspace,
    FileXfer,
}

/// Phase-two progress for one upload ticket.
struct PendingUpload {
    share: ShareKey,
    files: VecDeque<InodeId>,
    hasher: Md5,
    content: BytesMut,
}

impl PendingUpload {
    fn new(share: ShareKey, files: Vec<InodeId>) -> Self {
        Self {
            share,
            files: files.into(),
            hasher: Md5::new(),
            content: BytesMut::new(),
        }
    }

    fn next_file(&mut self) -> (Md5, Bytes) {
        self.files.pop_front();
        let hasher = std::mem::take(&mut self.hasher);
        (hasher, self.content.split().freeze())
    }
}

struct Session<'k, S> {
    kcd: &'k Kcd,
    stream: S,
    role: Role,
    upload: Option<PendingUpload>,
}

impl<'k, S: AsyncRead + AsyncWrite + Unpin> Session<'k, S> {
    async fn run(&mut self) -> Result<()> {
        loop {
            let (header, payload) = match read_frame(&mut self.stream).await {
                Ok(frame) => frame,
                Err(KanpError::ConnectionClosed) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            debug!(kind = kind_name(header.kind), id = header.id, size = header.size, "request");

            match self.dispatch(&header, payload).await {
                Ok(()) => {}
                Err(KanpError::Failure { code, message }) => {
                    warn!(code, "refusing request: {}", message);
                    self.fail(header.id, code, &message).await?;
                    return Ok(());
                }
                Err(e) if e.is_decoding() => {
                    warn!("bad request: {}", e);
                    self.fail(header.id, KANP_RES_FAIL_GEN, &e.to_string()).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&mut self, header: &TransportHeader, payload: Bytes) -> Result<()> {
        let mut reader = Message::decode(payload)?.into_reader();
        match header.kind {
            KANP_CMD_MGT_SELECT_ROLE => self.select_role(header.id, &mut reader).await,
            KANP_CMD_KFS_UPLOAD_REQ => {
                self.mint_ticket(header.id, &mut reader, TicketKind::Upload, KANP_RES_KFS_UPLOAD_REQ)
                    .await
            }
            KANP_CMD_KFS_DOWNLOAD_REQ => {
                self.mint_ticket(
                    header.id,
                    &mut reader,
                    TicketKind::Download,
                    KANP_RES_KFS_DOWNLOAD_REQ,
                )
                .await
            }
            KANP_CMD_KFS_PHASE_1 => self.phase_one(header.id, &mut reader).await,
            KANP_CMD_KFS_PHASE_2 => self.phase_two(header.id, &mut reader).await,
            KANP_CMD_KFS_DOWNLOAD_DATA => self.download(header.id, &mut reader).await,
            other => Err(failure(format!(
                "unexpected command {} ({})",
                other,
                kind_name(other)
            ))),
        }
    }

    async fn reply(&mut self, kind: u32, id: u64, message: &Message) -> Result<()> {
        write_frame(&mut self.stream, kind, id, &message.encode()).await
    }

    async fn fail(&mut self, id: u64, code: u32, message: &str) -> Result<()> {
        let mut m = Message::new();
        m.push_u32(code).push_str(message);
        self.reply(KANP_RES_FAIL, id, &m).await
    }

    fn require_role(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(failure(format!(
                "command needs role {:?}, session has {:?}",
                role, self.role
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Management
    // -------------------------------------------------------------------------

    async fn select_role(&mut self, id: u64, reader: &mut MessageReader) -> Result<()> {
        let role = reader.next_u32()?;
        if self.role != Role::None {
            return Err(failure("role already selected".into()));
        }
        self.role = match role {
            KANP_KCD_ROLE_WORKSPACE => Role::Workspace,
            KANP_KCD_ROLE_FILE_XFER => Role::FileXfer,
            other => return Err(failure(format!("unsupported role {}", other))),
        };
        debug!(role = ?self.role, "role selected");
        self.reply(KANP_RES_OK, id, &Message::new()).await
    }

    async fn mint_ticket(
        &mut self,
        id: u64,
        reader: &mut MessageReader,
        kind: TicketKind,
        reply_kind: u32,
    ) -> Result<()> {
        self.require_role(Role::Workspace)?;
        let workspace = reader.next_u64()?;
        let share = reader.next_u32()?;
        let ticket = self.kcd.tickets.mint(kind, (workspace, share)).await;

        let mut m = Message::new();
        m.push_bin(ticket.as_bytes().clone());
        self.reply(reply_kind, id, &m).await
    }

    // -------------------------------------------------------------------------
    // Upload
    // -------------------------------------------------------------------------

    async fn phase_one(&mut self, id: u64, reader: &mut MessageReader) -> Result<()> {
        self.require_role(Role::FileXfer)?;
        if self.upload.is_some() {
            return Err(failure("phase two in progress".into()));
        }
        let (ticket, email_id, operations) = phase_one::decode_request(reader)?;
        let grant = self.kcd.tickets.consume(&ticket, TicketKind::Upload).await?;

        let BatchOutcome { reply, uploads } =
            self.kcd.store.apply_batch(grant.share, &operations).await;
        info!(
            workspace = grant.share.0,
            share = grant.share.1,
            email_id,
            ops = operations.len(),
            commit_id = reply.commit_id,
            uploads = uploads.len(),
            "phase one applied"
        );
        self.reply(KANP_RES_KFS_PHASE_1, id, &phase_one::encode_reply(&reply))
            .await?;

        if !uploads.is_empty() {
            self.upload = Some(PendingUpload::new(grant.share, uploads));
        }
        Ok(())
    }

    async fn phase_two(&mut self, id: u64, reader: &mut MessageReader) -> Result<()> {
        let upload = self
            .upload
            .as_mut()
            .ok_or_else(|| failure("no upload in progress".into()))?;
        let count = reader.next_u32()?;

        for _ in 0..count {
            let inode = match upload.files.front() {
                Some(inode) => *inode,
                None => return Err(failure("too many submessages".into())),
            };
            match Submessage::read_from(reader)? {
                Submessage::Chunk(data) => {
                    if let Some(quota) = self.kcd.config.file_quota {
                        let used = self.kcd.store.workspace_usage(upload.share.0).await;
                        let in_flight = (upload.content.len() + data.len()) as u64;
                        if used.saturating_add(in_flight) > quota {
                            warn!(used, in_flight, quota, "file quota exceeded");
                            return Err(KanpError::Failure {
                                code: KANP_RES_FAIL_FILE_QUOTA_EXCEEDED,
                                message: "workspace file quota exceeded".into(),
                            });
                        }
                    }
                    upload.hasher.update(&data);
                    upload.content.extend_from_slice(&data);
                }
                Submessage::Commit(digest) => {
                    let (hasher, content) = upload.next_file();
                    let computed = hasher.finalize();
                    if digest.len() != DIGEST_LEN || digest.as_ref() != computed.as_slice() {
                        return Err(failure("the computed file hash does not match".into()));
                    }
                    debug!(inode, size = content.len(), digest = %hex::encode(&digest), "file committed");
                    self.kcd.store.commit_file(upload.share, inode, content).await;
                }
                Submessage::Abort => {
                    upload.next_file();
                    debug!(inode, "file aborted");
                    self.kcd.store.abort_file(upload.share, inode).await;
                }
                other => {
                    return Err(failure(format!(
                        "unexpected {} submessage in upload",
                        other.name()
                    )))
                }
            }
        }

        let finished = upload.files.is_empty();
        self.reply(KANP_RES_OK, id, &Message::new()).await?;
        if finished {
            self.upload = None;
            info!("phase two complete");
            self.reply(KANP_RES_OK, id, &Message::new()).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Download
    // -------------------------------------------------------------------------

    async fn download(&mut self, id: u64, reader: &mut MessageReader) -> Result<()> {
        self.require_role(Role::FileXfer)?;
        let (ticket, files) = download::decode_request(reader)?;
        let grant = self.kcd.tickets.consume(&ticket, TicketKind::Download).await?;
        if files.is_empty() {
            return Err(failure("no file to download".into()));
        }
        let slices = self.kcd.store.download_slices(grant.share, &files).await?;

        let max = self.kcd.config.max_download_size;
        let min_chunk = self.kcd.config.min_download_chunk_size;
        let mut frames = 0usize;
        for frame in pack_download(slices, max, min_chunk) {
            self.reply(KANP_RES_KFS_DOWNLOAD_DATA, id, &frame).await?;
            frames += 1;
        }
        info!(files = files.len(), frames, "download sent");
        Ok(())
    }
}

/// Lay out download frames: FILE then its CHUNKs for every file, a frame
/// closing once its payload reaches `max` bytes. A chunk is never smaller
/// than `min_chunk` unless the file has less left.
pub fn pack_download(files: Vec<(u64, Bytes)>, max: usize, min_chunk: usize) -> Vec<Message> {
    let mut frames = Vec::new();
    let mut files = files.into_iter().peekable();
    let mut open: Option<Bytes> = None;

    while files.peek().is_some() || open.is_some() {
        let mut body = Message::new();
        let mut count = 0u32;

        while body.encoded_len() < max && (files.peek().is_some() || open.is_some()) {
            let sub = match open.take() {
                None => {
                    let Some((total_size, remaining)) = files.next() else {
                        break;
                    };
                    let sub = Submessage::File {
                        total_size,
                        sent_size: remaining.len() as u64,
                    };
                    if !remaining.is_empty() {
                        open = Some(remaining);
                    }
                    sub
                }
                Some(mut data) => {
                    let want = min_chunk.max(max.saturating_sub(body.encoded_len()));
                    let chunk = data.split_to(want.min(data.len()));
                    if !data.is_empty() {
                        open = Some(data);
                    }
                    Submessage::Chunk(chunk)
                }
            };
            sub.write_to(&mut body);
            count += 1;
        }

        let mut frame = Message::new();
        frame.push_u32(count);
        frame.append(body);
        frames.push(frame);
    }
    frames
}

fn failure(message: String) -> KanpError {
    KanpError::Failure {
        code: KANP_RES_FAIL_GEN,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anp::value::Value;

    fn subs(frame: &Message) -> Vec<Submessage> {
        let mut r = frame.clone().into_reader();
        let count = r.next_u32().unwrap();
        (0..count)
            .map(|_| Submessage::read_from(&mut r).unwrap())
            .collect()
    }

    #[test]
    fn test_pack_empty_then_ten_bytes() {
        let frames = pack_download(
            vec![
                (0, Bytes::new()),
                (10, Bytes::from_static(b"0123456789")),
            ],
            61,
            5,
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(
            subs(&frames[0]),
            vec![
                Submessage::File {
                    total_size: 0,
                    sent_size: 0
                },
                Submessage::File {
                    total_size: 10,
                    sent_size: 10
                },
                Submessage::Chunk(Bytes::from_static(b"01234")),
            ]
        );
        assert_eq!(
            subs(&frames[1]),
            vec![Submessage::Chunk(Bytes::from_static(b"56789"))]
        );
    }

    #[test]
    fn test_pack_fills_frames() {
        let data = Bytes::from(vec![7u8; 1000]);
        let frames = pack_download(vec![(1000, data.clone())], 256, 64);
        let mut collected = Vec::new();
        for frame in &frames {
            for sub in subs(frame) {
                if let Submessage::Chunk(c) = sub {
                    collected.extend_from_slice(&c);
                }
            }
            // A frame is at most one chunk past the target size
            assert!(frame.encoded_len() <= 256 + 64 + 32);
        }
        assert_eq!(collected, data.to_vec());
    }

    #[test]
    fn test_pack_offset_download() {
        // Second field is what follows, not the file size
        let frames = pack_download(vec![(10, Bytes::from_static(b"789"))], 1024, 64);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].values()[0], Value::U32(2));
        assert_eq!(
            subs(&frames[0])[0],
            Submessage::File {
                total_size: 10,
                sent_size: 3
            }
        );
    }
}
