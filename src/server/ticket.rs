//! Transfer tickets of the reference KCD.
//!
//! A ticket is an ANP message `U32 kind | U64 workspace | U32 share | U64 serial`.
//! Only tickets minted by this authority are accepted, and each one once.

use crate::anp::kanp::KANP_RES_FAIL_PERM_DENIED;
use crate::anp::value::Message;
use crate::error::{KanpError, Result};
use crate::kfs::types::Ticket;
use crate::server::store::ShareKey;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Upload = 1,
    Download = 2,
}

impl TicketKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(TicketKind::Upload),
            2 => Some(TicketKind::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketGrant {
    pub kind: TicketKind,
    pub share: ShareKey,
}

#[derive(Default)]
struct TicketState {
    next_serial: u64,
    outstanding: HashMap<u64, TicketGrant>,
}

#[derive(Default)]
pub struct TicketAuthority {
    state: Mutex<TicketState>,
}

impl TicketAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mint(&self, kind: TicketKind, share: ShareKey) -> Ticket {
        let mut state = self.state.lock().await;
        state.next_serial += 1;
        let serial = state.next_serial;
        state.outstanding.insert(serial, TicketGrant { kind, share });

        let mut m = Message::new();
        m.push_u32(kind as u32)
            .push_u64(share.0)
            .push_u32(share.1)
            .push_u64(serial);
        debug!(?kind, workspace = share.0, share = share.1, serial, "ticket minted");
        Ticket::new(m.encode())
    }

    /// Redeem a ticket for `expected` use. A ticket is gone after one call,
    /// whether it matched or not.
    pub async fn consume(&self, ticket: &Ticket, expected: TicketKind) -> Result<TicketGrant> {
        let (kind, share, serial) = parse(ticket).ok_or_else(|| denied("invalid ticket"))?;
        let mut state = self.state.lock().await;
        let grant = state
            .outstanding
            .remove(&serial)
            .ok_or_else(|| denied("unknown or already used ticket"))?;
        if grant.kind != expected || grant.kind != kind || grant.share != share {
            return Err(denied("ticket does not grant this transfer"));
        }
        Ok(grant)
    }
}

fn parse(ticket: &Ticket) -> Option<(TicketKind, ShareKey, u64)> {
    let mut r = Message::decode(ticket.as_bytes().clone()).ok()?.into_reader();
    let kind = TicketKind::from_u32(r.next_u32().ok()?)?;
    let workspace = r.next_u64().ok()?;
    let share = r.next_u32().ok()?;
    let serial = r.next_u64().ok()?;
    if !r.is_exhausted() {
        return None;
    }
    Some((kind, (workspace, share), serial))
}

fn denied(message: &str) -> KanpError {
    KanpError::Failure {
        code: KANP_RES_FAIL_PERM_DENIED,
        message: message.to_string(),
    }
}
