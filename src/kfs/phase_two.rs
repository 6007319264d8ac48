//! Phase two: file content transfer.
//!
//! Every sub-message travels in its own `KANP_CMD_KFS_PHASE_2` frame
//! (`U32 1 | sub-message`) and is acknowledged with `KANP_RES_OK`. Once the
//! last expected file is committed or aborted the server sends one more
//! `KANP_RES_OK` closing the upload.
//!
//! ```text
//! FILE    U32 4 | U32 1 | U64 total_size | U64 sent_size   (downloads only)
//! CHUNK   U32 3 | U32 2 | BIN data
//! COMMIT  U32 3 | U32 3 | BIN md5 (16 bytes)
//! ABORT   U32 2 | U32 4
//! ```

use crate::anp::kanp::{
    KANP_CMD_KFS_PHASE_2, KANP_KFS_SUBMESSAGE_ABORT, KANP_KFS_SUBMESSAGE_CHUNK,
    KANP_KFS_SUBMESSAGE_COMMIT, KANP_KFS_SUBMESSAGE_FILE, KANP_RES_OK,
};
use crate::anp::value::{Message, MessageReader};
use crate::client::KcdClient;
use crate::error::{KanpError, Result};
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

pub const DIGEST_LEN: usize = 16;

pub type ContentDigest = [u8; DIGEST_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    File { total_size: u64, sent_size: u64 },
    Chunk(Bytes),
    Commit(Bytes),
    Abort,
}

impl Submessage {
    pub fn sub_type(&self) -> u32 {
        match self {
            Submessage::File { .. } => KANP_KFS_SUBMESSAGE_FILE,
            Submessage::Chunk(_) => KANP_KFS_SUBMESSAGE_CHUNK,
            Submessage::Commit(_) => KANP_KFS_SUBMESSAGE_COMMIT,
            Submessage::Abort => KANP_KFS_SUBMESSAGE_ABORT,
        }
    }

    pub fn field_count(&self) -> u32 {
        match self {
            Submessage::File { .. } => 4,
            Submessage::Chunk(_) | Submessage::Commit(_) => 3,
            Submessage::Abort => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Submessage::File { .. } => "FILE",
            Submessage::Chunk(_) => "CHUNK",
            Submessage::Commit(_) => "COMMIT",
            Submessage::Abort => "ABORT",
        }
    }

    pub fn write_to(&self, m: &mut Message) {
        m.push_u32(self.field_count()).push_u32(self.sub_type());
        match self {
            Submessage::File {
                total_size,
                sent_size,
            } => {
                m.push_u64(*total_size).push_u64(*sent_size);
            }
            Submessage::Chunk(data) | Submessage::Commit(data) => {
                m.push_bin(data.clone());
            }
            Submessage::Abort => {}
        }
    }

    pub fn read_from(r: &mut MessageReader) -> Result<Self> {
        let field_count = r.next_u32()?;
        let sub_type = r.next_u32()?;
        let sub = match sub_type {
            KANP_KFS_SUBMESSAGE_FILE => Submessage::File {
                total_size: r.next_u64()?,
                sent_size: r.next_u64()?,
            },
            KANP_KFS_SUBMESSAGE_CHUNK => Submessage::Chunk(r.next_bin()?),
            KANP_KFS_SUBMESSAGE_COMMIT => Submessage::Commit(r.next_bin()?),
            KANP_KFS_SUBMESSAGE_ABORT => Submessage::Abort,
            other => {
                return Err(KanpError::Protocol(format!(
                    "unexpected submessage type {}",
                    other
                )))
            }
        };
        if sub.field_count() != field_count {
            return Err(KanpError::Protocol(format!(
                "{} submessage declares {} fields, expected {}",
                sub.name(),
                field_count,
                sub.field_count()
            )));
        }
        Ok(sub)
    }
}

/// A single-submessage transfer frame.
pub fn transfer_frame(sub: &Submessage) -> Message {
    let mut m = Message::new();
    m.push_u32(1);
    sub.write_to(&mut m);
    m
}

/// MD5 over `data`, as the KCD computes it.
pub fn content_digest(data: &[u8]) -> ContentDigest {
    finish(Md5::new_with_prefix(data))
}

fn finish(hasher: Md5) -> ContentDigest {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

// =============================================================================
// Upload
// =============================================================================

/// Phase-two transfer of `expected` files, in phase-one batch order.
pub struct Upload<'c, S> {
    client: &'c mut KcdClient<S>,
    remaining: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> KcdClient<S> {
    /// Start phase two. `expected_files` is the number of files the server
    /// accepted in phase one (see `PhaseOneReply::pending_uploads`).
    pub fn open_upload(&mut self, expected_files: usize) -> Upload<'_, S> {
        Upload {
            client: self,
            remaining: expected_files,
        }
    }
}

impl<'c, S: AsyncRead + AsyncWrite + Unpin> Upload<'c, S> {
    /// Files still to be committed or aborted.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Begin the next file with a fresh digest.
    pub fn next_file(&mut self) -> Result<UploadSession<'_, 'c, S>> {
        if self.remaining == 0 {
            return Err(KanpError::InvalidArgument(
                "all expected files have been transferred".into(),
            ));
        }
        let chunk_size = self.client.config().chunk_size;
        Ok(UploadSession {
            upload: self,
            hasher: Md5::new(),
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            sent: 0,
        })
    }

    async fn exchange(&mut self, sub: &Submessage) -> Result<()> {
        self.client
            .call(KANP_CMD_KFS_PHASE_2, &transfer_frame(sub), KANP_RES_OK)
            .await?;
        Ok(())
    }

    /// One file finished. After the last one the server closes phase two.
    async fn file_done(&mut self) -> Result<()> {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.client.expect(KANP_RES_OK).await?;
            debug!("phase two complete");
        }
        Ok(())
    }
}

/// Content transfer of one file.
///
/// Must end with [`commit`](Self::commit), [`commit_with`](Self::commit_with)
/// or [`abort`](Self::abort); the server waits for one of them.
pub struct UploadSession<'u, 'c, S> {
    upload: &'u mut Upload<'c, S>,
    hasher: Md5,
    buffer: BytesMut,
    chunk_size: usize,
    sent: u64,
}

impl<'u, 'c, S: AsyncRead + AsyncWrite + Unpin> UploadSession<'u, 'c, S> {
    /// Bytes handed to `write_chunk` so far.
    pub fn bytes_written(&self) -> u64 {
        self.sent + self.buffer.len() as u64
    }

    /// Append file content. Full chunks are sent as soon as they fill.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len();
        self.upload.exchange(&Submessage::Chunk(chunk)).await?;
        self.sent += len as u64;
        trace!(len, sent = self.sent, "chunk sent");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.send_chunk(tail).await?;
        }
        Ok(())
    }

    /// Send the buffered tail and commit the running digest.
    pub async fn commit(mut self) -> Result<ContentDigest> {
        let digest = finish(std::mem::take(&mut self.hasher));
        self.commit_inner(digest).await?;
        Ok(digest)
    }

    /// Commit with a caller-chosen digest. Nothing is verified locally.
    pub async fn commit_with(self, digest: ContentDigest) -> Result<()> {
        self.commit_inner(digest).await
    }

    async fn commit_inner(mut self, digest: ContentDigest) -> Result<()> {
        self.flush().await?;
        self.upload
            .exchange(&Submessage::Commit(Bytes::copy_from_slice(&digest)))
            .await?;
        debug!(size = self.sent, digest = %hex::encode(digest), "file committed");
        self.upload.file_done().await
    }

    /// Abandon this file. Buffered content is dropped.
    pub async fn abort(self) -> Result<()> {
        self.upload.exchange(&Submessage::Abort).await?;
        debug!(sent = self.sent, "file aborted");
        self.upload.file_done().await
    }
}
