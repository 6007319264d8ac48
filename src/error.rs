//! Error types for the KANP core.

use crate::anp::value::ValueKind;
use thiserror::Error;

/// Result type for every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, KanpError>;

#[derive(Debug, Error)]
pub enum KanpError {
    // -------------------------------------------------------------------------
    // Local preconditions (raised before any I/O)
    // -------------------------------------------------------------------------
    /// Payload exceeds the transport maximum; nothing was written.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Decoding
    // -------------------------------------------------------------------------
    #[error("malformed ANP message: {0}")]
    Malformed(String),

    #[error("ANP element {index}: expected {expected}, found {found}")]
    TypeMismatch {
        index: usize,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("ANP element {index}: unexpected end of message")]
    UnexpectedEnd { index: usize },

    /// Well-formed values in an order or shape the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Server-reported
    // -------------------------------------------------------------------------
    /// Top-level KANP_RES_FAIL reply.
    #[error("KCD failure {code}: {message}")]
    Failure { code: u32, message: String },

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

impl KanpError {
    /// True for errors raised while decoding a message (corruption or a
    /// misbehaving peer).
    pub fn is_decoding(&self) -> bool {
        matches!(
            self,
            KanpError::Malformed(_)
                | KanpError::TypeMismatch { .. }
                | KanpError::UnexpectedEnd { .. }
                | KanpError::Protocol(_)
        )
    }

    /// Server-provided error code, when the failure came from the KCD.
    pub fn failure_code(&self) -> Option<u32> {
        match self {
            KanpError::Failure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for KanpError {
    fn from(e: toml::de::Error) -> Self {
        KanpError::Config(e.to_string())
    }
}
