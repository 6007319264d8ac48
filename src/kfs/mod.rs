//! KFS transfer engines: phase one (tree mutations), phase two (content
//! upload) and the download reader.

pub mod download;
pub mod phase_one;
pub mod phase_two;
pub mod types;

pub use download::{DownloadItem, DownloadState, DownloadStream};
pub use phase_one::PhaseOneReply;
pub use phase_two::{content_digest, ContentDigest, Submessage, Upload, UploadSession};
pub use types::{
    CommitId, FileRequest, Inode, InodeId, NodeStatus, NodeType, Operation, OperationResult,
    Ticket,
};
