//! ANP value encoding, ANPT framing and KANP constants.

pub mod kanp;
pub mod transport;
pub mod value;

pub use transport::{read_frame, write_frame, TransportHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use value::{Message, MessageReader, Value, ValueKind};
