//! KANP message kinds and protocol constants.
//!
//! A kind is `PROTO | class | namespace | number`:
//! class at bit 26, namespace at bit 16, command number at bit 8.

pub const KANP_MAJOR: u32 = 0;
pub const KANP_MINOR: u32 = 4;

pub const KANP_PROTO: u32 = 1 << 28;

pub const KANP_CMD: u32 = 0 << 26;
pub const KANP_RES: u32 = 1 << 26;
pub const KANP_EVT: u32 = 2 << 26;

pub const KANP_NS_GEN: u32 = 0 << 16;
pub const KANP_NS_MGT: u32 = 1 << 16;
pub const KANP_NS_KWS: u32 = 2 << 16;
pub const KANP_NS_KFS: u32 = 5 << 16;

pub const fn kind(class: u32, namespace: u32, number: u32) -> u32 {
    KANP_PROTO | class | namespace | (number << 8)
}

pub const fn cmd(namespace: u32, number: u32) -> u32 {
    kind(KANP_CMD, namespace, number)
}

pub const fn res(namespace: u32, number: u32) -> u32 {
    kind(KANP_RES, namespace, number)
}

// =============================================================================
// Kinds
// =============================================================================

pub const KANP_RES_OK: u32 = res(KANP_NS_GEN, 0);
pub const KANP_RES_FAIL: u32 = res(KANP_NS_GEN, 1);

pub const KANP_CMD_MGT_SELECT_ROLE: u32 = cmd(KANP_NS_MGT, 0);

pub const KANP_CMD_KFS_DOWNLOAD_REQ: u32 = cmd(KANP_NS_KFS, 1);
pub const KANP_RES_KFS_DOWNLOAD_REQ: u32 = res(KANP_NS_KFS, 1);
pub const KANP_CMD_KFS_UPLOAD_REQ: u32 = cmd(KANP_NS_KFS, 2);
pub const KANP_RES_KFS_UPLOAD_REQ: u32 = res(KANP_NS_KFS, 2);
pub const KANP_CMD_KFS_DOWNLOAD_DATA: u32 = cmd(KANP_NS_KFS, 3);
pub const KANP_RES_KFS_DOWNLOAD_DATA: u32 = res(KANP_NS_KFS, 3);
pub const KANP_CMD_KFS_PHASE_1: u32 = cmd(KANP_NS_KFS, 4);
pub const KANP_RES_KFS_PHASE_1: u32 = res(KANP_NS_KFS, 4);
pub const KANP_CMD_KFS_PHASE_2: u32 = cmd(KANP_NS_KFS, 5);

// =============================================================================
// Failure codes carried by KANP_RES_FAIL
// =============================================================================

pub const KANP_RES_FAIL_GEN: u32 = 0;
pub const KANP_RES_FAIL_BACKEND: u32 = 1;
pub const KANP_RES_FAIL_CHOOSE_USER_ID: u32 = 2;
pub const KANP_RES_FAIL_EVT_OUT_OF_SYNC: u32 = 3;
pub const KANP_RES_FAIL_MUST_UPGRADE: u32 = 4;
pub const KANP_RES_FAIL_PERM_DENIED: u32 = 5;
pub const KANP_RES_FAIL_FILE_QUOTA_EXCEEDED: u32 = 6;
pub const KANP_RES_FAIL_RESOURCE_QUOTA: u32 = 7;

// =============================================================================
// Roles
// =============================================================================

pub const KANP_KCD_ROLE_WORKSPACE: u32 = 1;
pub const KANP_KCD_ROLE_FILE_XFER: u32 = 2;
pub const KANP_KCD_ROLE_APP_SHARE: u32 = 3;

// =============================================================================
// KFS
// =============================================================================

pub const KANP_KFS_SUBMESSAGE_FILE: u32 = 1;
pub const KANP_KFS_SUBMESSAGE_CHUNK: u32 = 2;
pub const KANP_KFS_SUBMESSAGE_COMMIT: u32 = 3;
pub const KANP_KFS_SUBMESSAGE_ABORT: u32 = 4;

pub const KANP_KFS_OP_CREATE_FILE: u32 = 1;
pub const KANP_KFS_OP_CREATE_DIR: u32 = 2;
pub const KANP_KFS_OP_UPDATE_FILE: u32 = 3;
pub const KANP_KFS_OP_DELETE_FILE: u32 = 4;
pub const KANP_KFS_OP_DELETE_DIR: u32 = 5;
pub const KANP_KFS_OP_MOVE_FILE: u32 = 6;
pub const KANP_KFS_OP_MOVE_DIR: u32 = 7;

pub const KANP_KFS_ENTRY_FILE: u32 = 1;
pub const KANP_KFS_ENTRY_DIR: u32 = 2;

/// Default upload chunk size.
pub const KFS_CHUNK_SIZE: usize = 256 * 1024;

/// Inode id of the share root.
pub const KFS_ROOT_INODE_ID: u64 = 0;
/// Commit id of the share root before any batch.
pub const KFS_ROOT_COMMIT_ID: u64 = 0;

/// Human-readable name of a message kind, for logs.
pub fn kind_name(kind: u32) -> &'static str {
    match kind {
        KANP_RES_OK => "RES_OK",
        KANP_RES_FAIL => "RES_FAIL",
        KANP_CMD_MGT_SELECT_ROLE => "CMD_MGT_SELECT_ROLE",
        KANP_CMD_KFS_DOWNLOAD_REQ => "CMD_KFS_DOWNLOAD_REQ",
        KANP_RES_KFS_DOWNLOAD_REQ => "RES_KFS_DOWNLOAD_REQ",
        KANP_CMD_KFS_UPLOAD_REQ => "CMD_KFS_UPLOAD_REQ",
        KANP_RES_KFS_UPLOAD_REQ => "RES_KFS_UPLOAD_REQ",
        KANP_CMD_KFS_DOWNLOAD_DATA => "CMD_KFS_DOWNLOAD_DATA",
        KANP_RES_KFS_DOWNLOAD_DATA => "RES_KFS_DOWNLOAD_DATA",
        KANP_CMD_KFS_PHASE_1 => "CMD_KFS_PHASE_1",
        KANP_RES_KFS_PHASE_1 => "RES_KFS_PHASE_1",
        KANP_CMD_KFS_PHASE_2 => "CMD_KFS_PHASE_2",
        _ => "UNKNOWN",
    }
}
