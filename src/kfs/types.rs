//! KFS data model shared by the engines and the reference server.

use crate::anp::kanp::{
    KANP_KFS_ENTRY_DIR, KANP_KFS_ENTRY_FILE, KANP_KFS_OP_CREATE_DIR, KANP_KFS_OP_CREATE_FILE,
    KANP_KFS_OP_DELETE_DIR, KANP_KFS_OP_DELETE_FILE, KANP_KFS_OP_MOVE_DIR, KANP_KFS_OP_MOVE_FILE,
    KANP_KFS_OP_UPDATE_FILE,
};
use crate::anp::value::{Message, MessageReader};
use crate::error::{KanpError, Result};
use bytes::Bytes;
use std::fmt;

pub type InodeId = u64;
pub type CommitId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    File,
    Dir,
}

impl NodeType {
    pub fn entry_code(self) -> u32 {
        match self {
            NodeType::File => KANP_KFS_ENTRY_FILE,
            NodeType::Dir => KANP_KFS_ENTRY_DIR,
        }
    }

    pub fn from_entry_code(code: u32) -> Option<Self> {
        match code {
            KANP_KFS_ENTRY_FILE => Some(NodeType::File),
            KANP_KFS_ENTRY_DIR => Some(NodeType::Dir),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Created or updated in phase one, content not yet committed.
    Pending,
    Ok,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub parent_id: InodeId,
    pub commit_id: CommitId,
    pub node_type: NodeType,
    pub name: String,
    pub status: NodeStatus,
}

impl Inode {
    pub fn is_live(&self) -> bool {
        self.status != NodeStatus::Deleted
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }
}

// =============================================================================
// Operations
// =============================================================================

/// One phase-one tree mutation.
///
/// `name` / `dest_name` may be a relative path (`a/b/file`); every
/// intermediate component must already be a directory under the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateFile {
        parent_id: InodeId,
        parent_commit_id: CommitId,
        name: String,
    },
    CreateDir {
        parent_id: InodeId,
        parent_commit_id: CommitId,
        name: String,
    },
    UpdateFile {
        inode_id: InodeId,
        commit_id: CommitId,
    },
    DeleteFile {
        inode_id: InodeId,
        commit_id: CommitId,
    },
    DeleteDir {
        inode_id: InodeId,
        commit_id: CommitId,
    },
    MoveFile {
        inode_id: InodeId,
        commit_id: CommitId,
        dest_parent_id: InodeId,
        dest_parent_commit_id: CommitId,
        dest_name: String,
    },
    MoveDir {
        inode_id: InodeId,
        commit_id: CommitId,
        dest_parent_id: InodeId,
        dest_parent_commit_id: CommitId,
        dest_name: String,
    },
}

impl Operation {
    pub fn op_code(&self) -> u32 {
        match self {
            Operation::CreateFile { .. } => KANP_KFS_OP_CREATE_FILE,
            Operation::CreateDir { .. } => KANP_KFS_OP_CREATE_DIR,
            Operation::UpdateFile { .. } => KANP_KFS_OP_UPDATE_FILE,
            Operation::DeleteFile { .. } => KANP_KFS_OP_DELETE_FILE,
            Operation::DeleteDir { .. } => KANP_KFS_OP_DELETE_DIR,
            Operation::MoveFile { .. } => KANP_KFS_OP_MOVE_FILE,
            Operation::MoveDir { .. } => KANP_KFS_OP_MOVE_DIR,
        }
    }

    /// Number of ANP elements this op occupies, the count element included.
    pub fn field_count(&self) -> u32 {
        match self {
            Operation::CreateFile { .. } | Operation::CreateDir { .. } => 5,
            Operation::UpdateFile { .. }
            | Operation::DeleteFile { .. }
            | Operation::DeleteDir { .. } => 4,
            Operation::MoveFile { .. } | Operation::MoveDir { .. } => 7,
        }
    }

    /// True when a successful op makes the server expect file content in
    /// phase two.
    pub fn needs_content(&self) -> bool {
        matches!(
            self,
            Operation::CreateFile { .. } | Operation::UpdateFile { .. }
        )
    }

    pub fn write_to(&self, m: &mut Message) {
        m.push_u32(self.field_count()).push_u32(self.op_code());
        match self {
            Operation::CreateFile {
                parent_id,
                parent_commit_id,
                name,
            }
            | Operation::CreateDir {
                parent_id,
                parent_commit_id,
                name,
            } => {
                m.push_u64(*parent_id)
                    .push_u64(*parent_commit_id)
                    .push_str(name.as_str());
            }
            Operation::UpdateFile {
                inode_id,
                commit_id,
            }
            | Operation::DeleteFile {
                inode_id,
                commit_id,
            }
            | Operation::DeleteDir {
                inode_id,
                commit_id,
            } => {
                m.push_u64(*inode_id).push_u64(*commit_id);
            }
            Operation::MoveFile {
                inode_id,
                commit_id,
                dest_parent_id,
                dest_parent_commit_id,
                dest_name,
            }
            | Operation::MoveDir {
                inode_id,
                commit_id,
                dest_parent_id,
                dest_parent_commit_id,
                dest_name,
            } => {
                m.push_u64(*inode_id)
                    .push_u64(*commit_id)
                    .push_u64(*dest_parent_id)
                    .push_u64(*dest_parent_commit_id)
                    .push_str(dest_name.as_str());
            }
        }
    }

    /// Decode one op. The declared field count is checked against the op code.
    pub fn read_from(r: &mut MessageReader) -> Result<Self> {
        let field_count = r.next_u32()?;
        let op_code = r.next_u32()?;

        let op = match op_code {
            KANP_KFS_OP_CREATE_FILE | KANP_KFS_OP_CREATE_DIR => {
                let parent_id = r.next_u64()?;
                let parent_commit_id = r.next_u64()?;
                let name = r.next_str()?;
                if op_code == KANP_KFS_OP_CREATE_FILE {
                    Operation::CreateFile {
                        parent_id,
                        parent_commit_id,
                        name,
                    }
                } else {
                    Operation::CreateDir {
                        parent_id,
                        parent_commit_id,
                        name,
                    }
                }
            }
            KANP_KFS_OP_UPDATE_FILE | KANP_KFS_OP_DELETE_FILE | KANP_KFS_OP_DELETE_DIR => {
                let inode_id = r.next_u64()?;
                let commit_id = r.next_u64()?;
                match op_code {
                    KANP_KFS_OP_UPDATE_FILE => Operation::UpdateFile {
                        inode_id,
                        commit_id,
                    },
                    KANP_KFS_OP_DELETE_FILE => Operation::DeleteFile {
                        inode_id,
                        commit_id,
                    },
                    _ => Operation::DeleteDir {
                        inode_id,
                        commit_id,
                    },
                }
            }
            KANP_KFS_OP_MOVE_FILE | KANP_KFS_OP_MOVE_DIR => {
                let inode_id = r.next_u64()?;
                let commit_id = r.next_u64()?;
                let dest_parent_id = r.next_u64()?;
                let dest_parent_commit_id = r.next_u64()?;
                let dest_name = r.next_str()?;
                if op_code == KANP_KFS_OP_MOVE_FILE {
                    Operation::MoveFile {
                        inode_id,
                        commit_id,
                        dest_parent_id,
                        dest_parent_commit_id,
                        dest_name,
                    }
                } else {
                    Operation::MoveDir {
                        inode_id,
                        commit_id,
                        dest_parent_id,
                        dest_parent_commit_id,
                        dest_name,
                    }
                }
            }
            other => {
                return Err(KanpError::Protocol(format!(
                    "invalid operation {}",
                    other
                )))
            }
        };

        if op.field_count() != field_count {
            return Err(KanpError::Protocol(format!(
                "operation {} declares {} fields, expected {}",
                op_code,
                field_count,
                op.field_count()
            )));
        }
        Ok(op)
    }
}

// =============================================================================
// Results, tickets, download requests
// =============================================================================

/// Per-operation outcome. An empty message means success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationResult {
    pub error_code: u32,
    pub error_message: String,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error_code: u32, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_message.is_empty()
    }
}

/// Opaque authorization token minted by the KCD for one transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(pub Bytes);

impl Ticket {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tickets are credentials
        write!(f, "Ticket({} bytes)", self.0.len())
    }
}

/// One file of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    pub inode_id: InodeId,
    pub offset: u64,
    pub commit_id: CommitId,
}

impl FileRequest {
    pub fn new(inode_id: InodeId, offset: u64, commit_id: CommitId) -> Self {
        Self {
            inode_id,
            offset,
            commit_id,
        }
    }

    pub fn write_to(&self, m: &mut Message) {
        m.push_u64(self.inode_id)
            .push_u64(self.offset)
            .push_u64(self.commit_id);
    }

    pub fn read_from(r: &mut MessageReader) -> Result<Self> {
        Ok(Self {
            inode_id: r.next_u64()?,
            offset: r.next_u64()?,
            commit_id: r.next_u64()?,
        })
    }
}
