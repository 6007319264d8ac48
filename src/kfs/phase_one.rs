//! Phase one: batched tree mutations.
//!
//! Request: `BIN ticket | U64 email_id | U32 count | count x op`.
//! Reply (`KANP_RES_KFS_PHASE_1`): `U64 commit_id | U32 count | count x (U32 code, STR message)`.

use crate::anp::kanp::{KANP_CMD_KFS_PHASE_1, KANP_RES_KFS_PHASE_1};
use crate::anp::value::{Message, MessageReader};
use crate::client::KcdClient;
use crate::error::{KanpError, Result};
use crate::kfs::types::{CommitId, Operation, OperationResult, Ticket};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Outcome of one phase-one batch, positionally aligned with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOneReply {
    pub commit_id: CommitId,
    pub results: Vec<OperationResult>,
}

impl PhaseOneReply {
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(OperationResult::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &OperationResult)> {
        self.results.iter().enumerate().filter(|(_, r)| !r.is_ok())
    }

    /// Files the server now expects in phase two, in batch order.
    pub fn pending_uploads(&self, operations: &[Operation]) -> usize {
        operations
            .iter()
            .zip(&self.results)
            .filter(|(op, r)| op.needs_content() && r.is_ok())
            .count()
    }
}

pub fn encode_request(ticket: &Ticket, email_id: u64, operations: &[Operation]) -> Message {
    let mut m = Message::new();
    m.push_bin(ticket.as_bytes().clone())
        .push_u64(email_id)
        .push_u32(operations.len() as u32);
    for op in operations {
        op.write_to(&mut m);
    }
    m
}

/// Server side of [`encode_request`].
pub fn decode_request(reader: &mut MessageReader) -> Result<(Ticket, u64, Vec<Operation>)> {
    let ticket = Ticket::new(reader.next_bin()?);
    let email_id = reader.next_u64()?;
    let count = reader.next_u32()? as usize;

    // Each op takes at least four elements
    if count > reader.remaining() / 4 {
        return Err(KanpError::Protocol(format!(
            "batch declares {} operations, payload holds at most {}",
            count,
            reader.remaining() / 4
        )));
    }
    let operations = (0..count)
        .map(|_| Operation::read_from(reader))
        .collect::<Result<Vec<_>>>()?;
    Ok((ticket, email_id, operations))
}

pub fn encode_reply(reply: &PhaseOneReply) -> Message {
    let mut m = Message::new();
    m.push_u64(reply.commit_id)
        .push_u32(reply.results.len() as u32);
    for r in &reply.results {
        m.push_u32(r.error_code).push_str(r.error_message.as_str());
    }
    m
}

/// Decode a reply and check it answers exactly `submitted` operations.
pub fn decode_reply(reader: &mut MessageReader, submitted: usize) -> Result<PhaseOneReply> {
    let commit_id = reader.next_u64()?;
    let count = reader.next_u32()? as usize;
    if count != submitted {
        return Err(KanpError::Protocol(format!(
            "phase one returned {} results for {} operations",
            count, submitted
        )));
    }
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let error_code = reader.next_u32()?;
        let error_message = reader.next_str()?;
        results.push(OperationResult {
            error_code,
            error_message,
        });
    }
    Ok(PhaseOneReply { commit_id, results })
}

impl<S: AsyncRead + AsyncWrite + Unpin> KcdClient<S> {
    /// Submit a batch of tree mutations.
    ///
    /// Per-operation failures are data in the reply. A top-level
    /// `KANP_RES_FAIL` surfaces as [`KanpError::Failure`].
    pub async fn submit_batch(
        &mut self,
        ticket: &Ticket,
        email_id: u64,
        operations: &[Operation],
    ) -> Result<PhaseOneReply> {
        let request = encode_request(ticket, email_id, operations);
        let mut reader = self
            .call(KANP_CMD_KFS_PHASE_1, &request, KANP_RES_KFS_PHASE_1)
            .await?;
        let reply = decode_reply(&mut reader, operations.len())?;

        let failed = reply.failures().count();
        debug!(
            commit_id = reply.commit_id,
            ops = operations.len(),
            failed,
            "phase one done"
        );
        for (i, r) in reply.failures() {
            warn!(index = i, code = r.error_code, "operation rejected: {}", r.error_message);
        }
        Ok(reply)
    }
}
