//! One KCD connection.
//!
//! `KcdClient` owns the duplex byte channel and the correlation id counter.
//! Every exchange is a full request frame followed by a full reply frame; the
//! engines in [`crate::kfs`] are built on [`KcdClient::call`].

use crate::anp::kanp::{
    kind_name, KANP_CMD_KFS_DOWNLOAD_REQ, KANP_CMD_KFS_UPLOAD_REQ, KANP_CMD_MGT_SELECT_ROLE,
    KANP_RES_FAIL, KANP_RES_KFS_DOWNLOAD_REQ, KANP_RES_KFS_UPLOAD_REQ, KANP_RES_OK,
};
use crate::anp::transport::{self, TransportHeader};
use crate::anp::value::{Message, MessageReader};
use crate::config::ClientConfig;
use crate::error::{KanpError, Result};
use crate::kfs::types::Ticket;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub struct KcdClient<S> {
    stream: S,
    next_id: u64,
    config: ClientConfig,
}

impl<S: AsyncRead + AsyncWrite + Unpin> KcdClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_id: 1,
            config: ClientConfig::default(),
        }
    }

    /// Client with custom settings. The config is validated before the
    /// channel is used.
    pub fn with_config(stream: S, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stream,
            next_id: 1,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write one request frame. Returns the correlation id used.
    pub async fn send(&mut self, kind: u32, message: &Message) -> Result<u64> {
        let payload = message.encode();
        let id = self.next_id;
        let header = TransportHeader::with_version(
            self.config.protocol_major,
            self.config.protocol_minor,
            kind,
            id,
            0,
        );
        transport::write_frame_with(&mut self.stream, header, &payload).await?;
        self.next_id += 1;
        debug!(kind = kind_name(kind), id, size = payload.len(), "request sent");
        Ok(id)
    }

    /// Read one reply frame and decode its payload.
    pub async fn recv(&mut self) -> Result<(TransportHeader, Message)> {
        let (header, payload) = transport::read_frame(&mut self.stream).await?;
        debug!(
            kind = kind_name(header.kind),
            id = header.id,
            size = header.size,
            "reply received"
        );
        Ok((header, Message::decode(payload)?))
    }

    /// Read a reply that must be of kind `expected`. `KANP_RES_FAIL` becomes
    /// [`KanpError::Failure`].
    pub async fn expect(&mut self, expected: u32) -> Result<MessageReader> {
        let (header, message) = self.recv().await?;
        let mut reader = message.into_reader();
        if header.kind == KANP_RES_FAIL {
            return Err(read_failure(&mut reader)?);
        }
        if header.kind != expected {
            return Err(KanpError::Protocol(format!(
                "expected reply {} ({}), got {} ({})",
                kind_name(expected),
                expected,
                kind_name(header.kind),
                header.kind
            )));
        }
        Ok(reader)
    }

    /// Send a request and wait for its reply.
    pub async fn call(
        &mut self,
        kind: u32,
        message: &Message,
        expected: u32,
    ) -> Result<MessageReader> {
        self.send(kind, message).await?;
        self.expect(expected).await
    }

    pub async fn select_role(&mut self, role: u32) -> Result<()> {
        let mut m = Message::new();
        m.push_u32(role);
        self.call(KANP_CMD_MGT_SELECT_ROLE, &m, KANP_RES_OK).await?;
        debug!(role, "role selected");
        Ok(())
    }

    pub async fn request_upload_ticket(&mut self, workspace_id: u64, share_id: u32) -> Result<Ticket> {
        self.request_ticket(KANP_CMD_KFS_UPLOAD_REQ, KANP_RES_KFS_UPLOAD_REQ, workspace_id, share_id)
            .await
    }

    pub async fn request_download_ticket(
        &mut self,
        workspace_id: u64,
        share_id: u32,
    ) -> Result<Ticket> {
        self.request_ticket(
            KANP_CMD_KFS_DOWNLOAD_REQ,
            KANP_RES_KFS_DOWNLOAD_REQ,
            workspace_id,
            share_id,
        )
        .await
    }

    async fn request_ticket(
        &mut self,
        kind: u32,
        expected: u32,
        workspace_id: u64,
        share_id: u32,
    ) -> Result<Ticket> {
        let mut m = Message::new();
        m.push_u64(workspace_id).push_u32(share_id);
        let mut reply = self.call(kind, &m, expected).await?;
        Ok(Ticket::new(reply.next_bin()?))
    }
}

/// Decode the `(code, message)` body of a `KANP_RES_FAIL` reply.
pub fn read_failure(reader: &mut MessageReader) -> Result<KanpError> {
    let code = reader.next_u32()?;
    let message = reader.next_str()?;
    Ok(KanpError::Failure { code, message })
}
