//! KANP client core for KFS workspace file stores.
//!
//! - [`anp`]: value codec, transport framing, message kinds
//! - [`kfs`]: phase-one tree mutations, phase-two uploads, downloads
//! - [`client::KcdClient`]: one connection to a KCD
//! - [`server`]: in-memory reference KCD

pub mod anp;
pub mod client;
pub mod config;
pub mod error;
pub mod kfs;
pub mod server;

pub use client::KcdClient;
pub use config::{ClientConfig, Config, ServerConfig};
pub use error::{KanpError, Result};
