//! In-memory KFS trees backing the reference KCD.
//!
//! One [`KfsTree`] per (workspace, share). A tree holds every inode ever
//! created (deleted ones are kept with status `Deleted`) plus the committed
//! content of each file.

use crate::anp::kanp::{KANP_RES_FAIL_GEN, KFS_ROOT_COMMIT_ID, KFS_ROOT_INODE_ID};
use crate::error::{KanpError, Result};
use crate::kfs::phase_one::PhaseOneReply;
use crate::kfs::types::{
    CommitId, FileRequest, Inode, InodeId, NodeStatus, NodeType, Operation, OperationResult,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// (workspace id, share id)
pub type ShareKey = (u64, u32);

/// Why one phase-one operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpFailure {
    #[error("{0} is stale")]
    StaleCommit(&'static str),
    #[error("improper use of local commit ID")]
    LocalCommit,
    #[error("destination exists")]
    NameCollision,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("directory is not empty")]
    NotEmpty,
    #[error("cannot {0} root directory")]
    RootImmutable(&'static str),
    #[error("making directory child of itself")]
    InvalidMove,
    #[error("{0} is not a directory")]
    NotADirectory(&'static str),
    #[error("{0} is not of expected type")]
    WrongType(&'static str),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
}

impl OpFailure {
    pub fn code(&self) -> u32 {
        match self {
            OpFailure::StaleCommit(_) | OpFailure::LocalCommit => 1,
            OpFailure::NameCollision => 2,
            OpFailure::NotFound(_) => 3,
            OpFailure::NotEmpty => 4,
            OpFailure::RootImmutable(_) => 5,
            OpFailure::InvalidMove => 6,
            OpFailure::NotADirectory(_) => 7,
            OpFailure::WrongType(_) => 8,
            OpFailure::InvalidPath(_) => 9,
        }
    }
}

impl From<OpFailure> for OperationResult {
    fn from(f: OpFailure) -> Self {
        OperationResult::failed(f.code(), f.to_string())
    }
}

/// Result of evaluating one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub reply: PhaseOneReply,
    /// Files awaiting phase-two content, in batch order.
    pub uploads: Vec<InodeId>,
}

/// Per-batch bookkeeping for commit-id checks.
#[derive(Default)]
struct BatchScope {
    /// Commit id each node had before this batch first stamped it.
    before: HashMap<InodeId, CommitId>,
    created: HashSet<InodeId>,
    successes: usize,
}

// =============================================================================
// Tree
// =============================================================================

#[derive(Debug, Clone)]
pub struct KfsTree {
    nodes: HashMap<InodeId, Inode>,
    content: HashMap<InodeId, Bytes>,
    commit_id: CommitId,
    next_inode: InodeId,
}

impl Default for KfsTree {
    fn default() -> Self {
        Self::new()
    }
}

impl KfsTree {
    pub fn new() -> Self {
        let root = Inode {
            id: KFS_ROOT_INODE_ID,
            parent_id: KFS_ROOT_INODE_ID,
            commit_id: KFS_ROOT_COMMIT_ID,
            node_type: NodeType::Dir,
            name: String::new(),
            status: NodeStatus::Ok,
        };
        let mut nodes = HashMap::new();
        nodes.insert(root.id, root);
        Self {
            nodes,
            content: HashMap::new(),
            commit_id: KFS_ROOT_COMMIT_ID,
            next_inode: KFS_ROOT_INODE_ID + 1,
        }
    }

    /// Latest commit id of the share.
    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    /// Any inode, deleted ones included.
    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.nodes.get(&id)
    }

    pub fn live(&self, id: InodeId) -> Option<&Inode> {
        self.nodes.get(&id).filter(|n| n.is_live())
    }

    pub fn children(&self, dir: InodeId) -> impl Iterator<Item = &Inode> + '_ {
        self.nodes
            .values()
            .filter(move |n| n.is_live() && n.parent_id == dir && n.id != KFS_ROOT_INODE_ID)
    }

    /// Live child of `dir` named `name`, exact match.
    pub fn lookup(&self, dir: InodeId, name: &str) -> Option<&Inode> {
        self.children(dir).find(|n| n.name == name)
    }

    pub fn content(&self, id: InodeId) -> Option<&Bytes> {
        self.content.get(&id)
    }

    /// Bytes of committed content held by live files.
    pub fn stored_bytes(&self) -> u64 {
        self.content.values().map(|data| data.len() as u64).sum()
    }

    // -------------------------------------------------------------------------
    // Phase one
    // -------------------------------------------------------------------------

    /// Evaluate a batch in order. Each op succeeds or fails on its own; one new
    /// commit id covers every successful op.
    pub fn apply_batch(&mut self, operations: &[Operation]) -> BatchOutcome {
        let new_commit = self.commit_id + 1;
        let mut scope = BatchScope::default();
        let mut results = Vec::with_capacity(operations.len());
        let mut uploads = Vec::new();

        for op in operations {
            match self.apply_one(op, new_commit, &mut scope) {
                Ok(touched) => {
                    scope.successes += 1;
                    if op.needs_content() {
                        uploads.push(touched);
                    }
                    results.push(OperationResult::ok());
                }
                Err(failure) => {
                    debug!(op = op.op_code(), %failure, "operation rejected");
                    results.push(failure.into());
                }
            }
        }

        if scope.successes > 0 {
            self.commit_id = new_commit;
        }
        BatchOutcome {
            reply: PhaseOneReply {
                commit_id: self.commit_id,
                results,
            },
            uploads,
        }
    }

    fn apply_one(
        &mut self,
        op: &Operation,
        new_commit: CommitId,
        scope: &mut BatchScope,
    ) -> std::result::Result<InodeId, OpFailure> {
        match op {
            Operation::CreateFile {
                parent_id,
                parent_commit_id,
                name,
            } => self.create(
                NodeType::File,
                *parent_id,
                *parent_commit_id,
                name,
                new_commit,
                scope,
            ),
            Operation::CreateDir {
                parent_id,
                parent_commit_id,
                name,
            } => self.create(
                NodeType::Dir,
                *parent_id,
                *parent_commit_id,
                name,
                new_commit,
                scope,
            ),
            Operation::UpdateFile {
                inode_id,
                commit_id,
            } => self.update(*inode_id, *commit_id, new_commit, scope),
            Operation::DeleteFile {
                inode_id,
                commit_id,
            } => self.delete(NodeType::File, *inode_id, *commit_id, new_commit, scope),
            Operation::DeleteDir {
                inode_id,
                commit_id,
            } => self.delete(NodeType::Dir, *inode_id, *commit_id, new_commit, scope),
            Operation::MoveFile {
                inode_id,
                commit_id,
                dest_parent_id,
                dest_parent_commit_id,
                dest_name,
            } => self.relocate(
                NodeType::File,
                *inode_id,
                *commit_id,
                *dest_parent_id,
                *dest_parent_commit_id,
                dest_name,
                new_commit,
                scope,
            ),
            Operation::MoveDir {
                inode_id,
                commit_id,
                dest_parent_id,
                dest_parent_commit_id,
                dest_name,
            } => self.relocate(
                NodeType::Dir,
                *inode_id,
                *commit_id,
                *dest_parent_id,
                *dest_parent_commit_id,
                dest_name,
                new_commit,
                scope,
            ),
        }
    }

    fn create(
        &mut self,
        node_type: NodeType,
        parent_id: InodeId,
        parent_commit_id: CommitId,
        path: &str,
        new_commit: CommitId,
        scope: &mut BatchScope,
    ) -> std::result::Result<InodeId, OpFailure> {
        let parent = self
            .live(parent_id)
            .ok_or(OpFailure::NotFound("parent inode"))?;
        if !parent.is_dir() {
            return Err(OpFailure::NotADirectory("parent inode"));
        }
        self.check_commit(parent_id, parent_commit_id, scope, "parent inode")?;

        let (dir, name) = self.resolve_path(parent_id, path)?;
        self.check_collision(dir, &name, None)?;

        let id = self.next_inode;
        self.next_inode += 1;
        let status = match node_type {
            NodeType::File => NodeStatus::Pending,
            NodeType::Dir => NodeStatus::Ok,
        };
        self.nodes.insert(
            id,
            Inode {
                id,
                parent_id: dir,
                commit_id: new_commit,
                node_type,
                name,
                status,
            },
        );
        scope.created.insert(id);
        self.stamp(dir, new_commit, scope);
        Ok(id)
    }

    fn update(
        &mut self,
        inode_id: InodeId,
        commit_id: CommitId,
        new_commit: CommitId,
        scope: &mut BatchScope,
    ) -> std::result::Result<InodeId, OpFailure> {
        let node = self.live(inode_id).ok_or(OpFailure::NotFound("inode"))?;
        if node.node_type != NodeType::File {
            return Err(OpFailure::WrongType("inode"));
        }
        self.check_commit(inode_id, commit_id, scope, "inode")?;

        self.stamp(inode_id, new_commit, scope);
        if let Some(node) = self.nodes.get_mut(&inode_id) {
            node.status = NodeStatus::Pending;
        }
        Ok(inode_id)
    }

    fn delete(
        &mut self,
        node_type: NodeType,
        inode_id: InodeId,
        commit_id: CommitId,
        new_commit: CommitId,
        scope: &mut BatchScope,
    ) -> std::result::Result<InodeId, OpFailure> {
        if inode_id == KFS_ROOT_INODE_ID {
            return Err(OpFailure::RootImmutable("delete"));
        }
        let node = self.live(inode_id).ok_or(OpFailure::NotFound("inode"))?;
        if node.node_type != node_type {
            return Err(OpFailure::WrongType("inode"));
        }
        let parent_id = node.parent_id;
        self.check_commit(inode_id, commit_id, scope, "inode")?;
        if node_type == NodeType::Dir && self.children(inode_id).next().is_some() {
            return Err(OpFailure::NotEmpty);
        }

        self.stamp(inode_id, new_commit, scope);
        self.stamp(parent_id, new_commit, scope);
        if let Some(node) = self.nodes.get_mut(&inode_id) {
            node.status = NodeStatus::Deleted;
        }
        self.content.remove(&inode_id);
        Ok(inode_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn relocate(
        &mut self,
        node_type: NodeType,
        inode_id: InodeId,
        commit_id: CommitId,
        dest_parent_id: InodeId,
        dest_parent_commit_id: CommitId,
        dest_path: &str,
        new_commit: CommitId,
        scope: &mut BatchScope,
    ) -> std::result::Result<InodeId, OpFailure> {
        if inode_id == KFS_ROOT_INODE_ID {
            return Err(OpFailure::RootImmutable("move"));
        }
        let node = self
            .live(inode_id)
            .ok_or(OpFailure::NotFound("move inode"))?;
        if node.node_type != node_type {
            return Err(OpFailure::WrongType("move inode"));
        }
        let old_parent = node.parent_id;
        self.check_commit(inode_id, commit_id, scope, "move inode")?;

        let dest = self
            .live(dest_parent_id)
            .ok_or(OpFailure::NotFound("parent inode"))?;
        if !dest.is_dir() {
            return Err(OpFailure::NotADirectory("parent inode"));
        }
        self.check_commit(dest_parent_id, dest_parent_commit_id, scope, "parent inode")?;

        let (dir, name) = self.resolve_path(dest_parent_id, dest_path)?;
        if node_type == NodeType::Dir && self.is_within(dir, inode_id) {
            return Err(OpFailure::InvalidMove);
        }
        self.check_collision(dir, &name, Some(inode_id))?;

        self.stamp(inode_id, new_commit, scope);
        self.stamp(old_parent, new_commit, scope);
        self.stamp(dir, new_commit, scope);
        if let Some(node) = self.nodes.get_mut(&inode_id) {
            node.parent_id = dir;
            node.name = name;
        }
        Ok(inode_id)
    }

    /// Compare against the commit id the node had when the batch started.
    fn check_commit(
        &self,
        id: InodeId,
        supplied: CommitId,
        scope: &BatchScope,
        what: &'static str,
    ) -> std::result::Result<(), OpFailure> {
        if scope.created.contains(&id) {
            return Err(OpFailure::LocalCommit);
        }
        let current = match scope.before.get(&id) {
            Some(c) => *c,
            None => self.nodes.get(&id).map(|n| n.commit_id).unwrap_or_default(),
        };
        if current != supplied {
            return Err(OpFailure::StaleCommit(what));
        }
        Ok(())
    }

    fn stamp(&mut self, id: InodeId, new_commit: CommitId, scope: &mut BatchScope) {
        if let Some(node) = self.nodes.get_mut(&id) {
            scope.before.entry(id).or_insert(node.commit_id);
            node.commit_id = new_commit;
        }
    }

    /// Walk `path` below `parent`. Returns the directory the last component
    /// lives in and that component.
    fn resolve_path(
        &self,
        parent: InodeId,
        path: &str,
    ) -> std::result::Result<(InodeId, String), OpFailure> {
        let components: Vec<&str> = path.split('/').collect();
        let valid = components
            .iter()
            .all(|c| !c.is_empty() && *c != "." && *c != "..");
        if !valid {
            return Err(OpFailure::InvalidPath(path.to_string()));
        }
        let (last, intermediate) = match components.split_last() {
            Some(split) => split,
            None => return Err(OpFailure::InvalidPath(path.to_string())),
        };

        let mut dir = parent;
        for component in intermediate {
            let next = self
                .lookup(dir, component)
                .ok_or(OpFailure::NotFound("intermediate inode"))?;
            if !next.is_dir() {
                return Err(OpFailure::NotADirectory("intermediate inode"));
            }
            dir = next.id;
        }
        Ok((dir, (*last).to_string()))
    }

    /// Names compare case-insensitively among live children.
    fn check_collision(
        &self,
        dir: InodeId,
        name: &str,
        moving: Option<InodeId>,
    ) -> std::result::Result<(), OpFailure> {
        let lowered = name.to_lowercase();
        let clash = self
            .children(dir)
            .any(|n| Some(n.id) != moving && n.name.to_lowercase() == lowered);
        if clash {
            return Err(OpFailure::NameCollision);
        }
        Ok(())
    }

    /// True when `node` is `ancestor` or lies below it.
    fn is_within(&self, node: InodeId, ancestor: InodeId) -> bool {
        let mut current = node;
        loop {
            if current == ancestor {
                return true;
            }
            if current == KFS_ROOT_INODE_ID {
                return false;
            }
            match self.nodes.get(&current) {
                Some(n) => current = n.parent_id,
                None => return false,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phase two and downloads
    // -------------------------------------------------------------------------

    /// Install committed content. The file becomes downloadable.
    pub fn commit_file(&mut self, id: InodeId, data: Bytes) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.status == NodeStatus::Pending {
                node.status = NodeStatus::Ok;
                self.content.insert(id, data);
            }
        }
    }

    /// Drop an upload. An updated file keeps its previous content.
    pub fn abort_file(&mut self, id: InodeId) {
        if self.content.contains_key(&id) {
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.status == NodeStatus::Pending {
                    node.status = NodeStatus::Ok;
                }
            }
        }
    }

    /// Check one download request and return `(file size, bytes from offset)`.
    pub fn download_slice(&self, req: &FileRequest) -> Result<(u64, Bytes)> {
        let node = self
            .live(req.inode_id)
            .ok_or_else(|| gen_failure(format!("inode {} not found", req.inode_id)))?;
        if node.node_type != NodeType::File {
            return Err(gen_failure(format!("inode {} is not a file", req.inode_id)));
        }
        if node.commit_id != req.commit_id {
            return Err(gen_failure(format!(
                "inode {} is at commit {}, not {}",
                req.inode_id, node.commit_id, req.commit_id
            )));
        }
        let data = match (node.status, self.content.get(&req.inode_id)) {
            (NodeStatus::Ok, Some(data)) => data,
            _ => {
                return Err(gen_failure(format!(
                    "inode {} has no committed content",
                    req.inode_id
                )))
            }
        };
        let size = data.len() as u64;
        if req.offset > size {
            return Err(gen_failure(format!(
                "offset {} is bigger than file size {} for inode {}",
                req.offset, size, req.inode_id
            )));
        }
        Ok((size, data.slice(req.offset as usize..)))
    }
}

fn gen_failure(message: String) -> KanpError {
    KanpError::Failure {
        code: KANP_RES_FAIL_GEN,
        message,
    }
}

// =============================================================================
// Store
// =============================================================================

/// Every share known to one KCD, shared between sessions.
#[derive(Default)]
pub struct KfsStore {
    shares: Mutex<HashMap<ShareKey, KfsTree>>,
}

impl KfsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_batch(&self, key: ShareKey, operations: &[Operation]) -> BatchOutcome {
        let mut shares = self.shares.lock().await;
        shares.entry(key).or_default().apply_batch(operations)
    }

    pub async fn commit_file(&self, key: ShareKey, id: InodeId, data: Bytes) {
        let mut shares = self.shares.lock().await;
        shares.entry(key).or_default().commit_file(id, data);
    }

    pub async fn abort_file(&self, key: ShareKey, id: InodeId) {
        let mut shares = self.shares.lock().await;
        shares.entry(key).or_default().abort_file(id);
    }

    /// Validate a whole download request before anything is sent.
    pub async fn download_slices(
        &self,
        key: ShareKey,
        files: &[FileRequest],
    ) -> Result<Vec<(u64, Bytes)>> {
        let shares = self.shares.lock().await;
        let tree = shares
            .get(&key)
            .ok_or_else(|| gen_failure(format!("share {} of workspace {} is empty", key.1, key.0)))?;
        files.iter().map(|f| tree.download_slice(f)).collect()
    }

    pub async fn inode(&self, key: ShareKey, id: InodeId) -> Option<Inode> {
        let shares = self.shares.lock().await;
        shares.get(&key).and_then(|t| t.get(id)).cloned()
    }

    /// Committed file bytes across every share of `workspace`.
    pub async fn workspace_usage(&self, workspace: u64) -> u64 {
        let shares = self.shares.lock().await;
        shares
            .iter()
            .filter(|(key, _)| key.0 == workspace)
            .map(|(_, tree)| tree.stored_bytes())
            .sum()
    }

    pub async fn commit_id(&self, key: ShareKey) -> CommitId {
        let shares = self.shares.lock().await;
        shares
            .get(&key)
            .map(KfsTree::commit_id)
            .unwrap_or(KFS_ROOT_COMMIT_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_dir(parent_id: InodeId, parent_commit_id: CommitId, name: &str) -> Operation {
        Operation::CreateDir {
            parent_id,
            parent_commit_id,
            name: name.into(),
        }
    }

    fn create_file(parent_id: InodeId, parent_commit_id: CommitId, name: &str) -> Operation {
        Operation::CreateFile {
            parent_id,
            parent_commit_id,
            name: name.into(),
        }
    }

    /// Apply one op that must succeed; returns (new inode or target, commit).
    fn ok(tree: &mut KfsTree, op: Operation) -> (InodeId, CommitId) {
        let before = tree.next_inode;
        let outcome = tree.apply_batch(&[op]);
        assert!(outcome.reply.results[0].is_ok(), "{:?}", outcome.reply);
        let id = if tree.next_inode > before { before } else { 0 };
        (id, outcome.reply.commit_id)
    }

    fn code(tree: &mut KfsTree, op: Operation) -> u32 {
        let outcome = tree.apply_batch(&[op]);
        assert!(!outcome.reply.results[0].is_ok());
        outcome.reply.results[0].error_code
    }

    #[test]
    fn test_root_exists() {
        let tree = KfsTree::new();
        let root = tree.live(0).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.commit_id, 0);
        assert_eq!(tree.commit_id(), 0);
    }

    #[test]
    fn test_stale_commit_is_isolated() {
        let mut tree = KfsTree::new();
        let (file, _) = ok(&mut tree, create_file(0, 0, "f.txt"));
        for expected in 2..=5 {
            let commit = tree.get(file).unwrap().commit_id;
            let (_, c) = ok(
                &mut tree,
                Operation::UpdateFile {
                    inode_id: file,
                    commit_id: commit,
                },
            );
            assert_eq!(c, expected);
        }
        assert_eq!(tree.get(file).unwrap().commit_id, 5);
        let root_commit = tree.get(0).unwrap().commit_id;

        let outcome = tree.apply_batch(&[
            Operation::UpdateFile {
                inode_id: file,
                commit_id: 4,
            },
            create_dir(0, root_commit, "other"),
        ]);
        let results = &outcome.reply.results;
        assert_eq!(results.len(), 2);
        assert!(!results[0].is_ok());
        assert_eq!(results[0].error_code, 1);
        assert_eq!(results[0].error_message, "inode is stale");
        assert!(results[1].is_ok());
        assert_eq!(outcome.reply.commit_id, 6);
        assert_eq!(outcome.uploads, Vec::<InodeId>::new());
        // The rejected update left the file alone
        assert_eq!(tree.get(file).unwrap().commit_id, 5);
    }

    #[test]
    fn test_failed_batch_keeps_commit() {
        let mut tree = KfsTree::new();
        ok(&mut tree, create_dir(0, 0, "d"));
        let outcome = tree.apply_batch(&[create_dir(0, 0, "e")]);
        assert!(!outcome.reply.results[0].is_ok());
        assert_eq!(outcome.reply.commit_id, 1);
        assert_eq!(tree.commit_id(), 1);
    }

    #[test]
    fn test_one_commit_per_batch() {
        let mut tree = KfsTree::new();
        let outcome = tree.apply_batch(&[
            create_dir(0, 0, "a"),
            create_file(0, 0, "b"),
            create_file(0, 0, "c"),
        ]);
        assert!(outcome.reply.results.iter().all(OperationResult::is_ok));
        assert_eq!(outcome.reply.commit_id, 1);
        assert_eq!(outcome.uploads, vec![2, 3]);
        for id in 1..=3 {
            assert_eq!(tree.get(id).unwrap().commit_id, 1);
        }
        assert_eq!(tree.get(0).unwrap().commit_id, 1);
        assert_eq!(tree.get(2).unwrap().status, NodeStatus::Pending);
        assert_eq!(tree.get(1).unwrap().status, NodeStatus::Ok);
    }

    #[test]
    fn test_node_created_in_batch_cannot_be_referenced_by_commit() {
        let mut tree = KfsTree::new();
        let outcome = tree.apply_batch(&[create_dir(0, 0, "a"), create_file(1, 1, "x")]);
        assert!(outcome.reply.results[0].is_ok());
        assert_eq!(outcome.reply.results[1].error_message, "improper use of local commit ID");
    }

    #[test]
    fn test_name_collision() {
        let mut tree = KfsTree::new();
        ok(&mut tree, create_file(0, 0, "Report.txt"));
        assert_eq!(code(&mut tree, create_file(0, 1, "report.TXT")), 2);
        assert_eq!(code(&mut tree, create_dir(0, 1, "Report.txt")), 2);
    }

    #[test]
    fn test_deleted_name_is_reusable() {
        let mut tree = KfsTree::new();
        let (f, c) = ok(&mut tree, create_file(0, 0, "a"));
        let (_, c) = ok(
            &mut tree,
            Operation::DeleteFile {
                inode_id: f,
                commit_id: c,
            },
        );
        assert_eq!(tree.get(f).unwrap().status, NodeStatus::Deleted);
        ok(&mut tree, create_file(0, c, "a"));
    }

    #[test]
    fn test_missing_parent_and_target() {
        let mut tree = KfsTree::new();
        assert_eq!(code(&mut tree, create_file(42, 0, "a")), 3);
        assert_eq!(
            code(
                &mut tree,
                Operation::DeleteFile {
                    inode_id: 42,
                    commit_id: 0
                }
            ),
            3
        );
        assert_eq!(
            code(
                &mut tree,
                Operation::UpdateFile {
                    inode_id: 42,
                    commit_id: 0
                }
            ),
            3
        );
    }

    #[test]
    fn test_delete_non_empty_dir() {
        let mut tree = KfsTree::new();
        let (d, c) = ok(&mut tree, create_dir(0, 0, "d"));
        let (_, c2) = ok(&mut tree, create_file(d, c, "f"));
        let err = code(
            &mut tree,
            Operation::DeleteDir {
                inode_id: d,
                commit_id: c2,
            },
        );
        assert_eq!(err, 4);
    }

    #[test]
    fn test_delete_empty_dir_after_child_removed() {
        let mut tree = KfsTree::new();
        let (d, c) = ok(&mut tree, create_dir(0, 0, "d"));
        let (f, c) = ok(&mut tree, create_file(d, c, "f"));
        let (_, c) = ok(
            &mut tree,
            Operation::DeleteFile {
                inode_id: f,
                commit_id: c,
            },
        );
        ok(
            &mut tree,
            Operation::DeleteDir {
                inode_id: d,
                commit_id: c,
            },
        );
        assert!(tree.live(d).is_none());
    }

    #[test]
    fn test_root_is_immutable() {
        let mut tree = KfsTree::new();
        ok(&mut tree, create_dir(0, 0, "d"));
        assert_eq!(
            code(
                &mut tree,
                Operation::DeleteDir {
                    inode_id: 0,
                    commit_id: 1
                }
            ),
            5
        );
        assert_eq!(
            code(
                &mut tree,
                Operation::MoveDir {
                    inode_id: 0,
                    commit_id: 1,
                    dest_parent_id: 1,
                    dest_parent_commit_id: 1,
                    dest_name: "root".into()
                }
            ),
            5
        );
        assert_eq!(
            code(
                &mut tree,
                Operation::DeleteFile {
                    inode_id: 0,
                    commit_id: 1
                }
            ),
            5
        );
        assert_eq!(
            code(
                &mut tree,
                Operation::MoveFile {
                    inode_id: 0,
                    commit_id: 1,
                    dest_parent_id: 1,
                    dest_parent_commit_id: 1,
                    dest_name: "root".into()
                }
            ),
            5
        );
    }

    #[test]
    fn test_move_into_self_or_descendant() {
        let mut tree = KfsTree::new();
        let (a, c) = ok(&mut tree, create_dir(0, 0, "a"));
        let (b, c) = ok(&mut tree, create_dir(a, c, "b"));

        let into_self = Operation::MoveDir {
            inode_id: a,
            commit_id: c,
            dest_parent_id: a,
            dest_parent_commit_id: c,
            dest_name: "a2".into(),
        };
        assert_eq!(code(&mut tree, into_self), 6);

        let into_child = Operation::MoveDir {
            inode_id: a,
            commit_id: c,
            dest_parent_id: b,
            dest_parent_commit_id: c,
            dest_name: "a2".into(),
        };
        assert_eq!(code(&mut tree, into_child), 6);
        assert_eq!(tree.get(a).unwrap().parent_id, 0);
    }

    #[test]
    fn test_move_file_between_dirs() {
        let mut tree = KfsTree::new();
        let outcome = tree.apply_batch(&[
            create_dir(0, 0, "src"),
            create_dir(0, 0, "dst"),
            create_file(0, 0, "f"),
        ]);
        assert!(outcome.reply.results.iter().all(OperationResult::is_ok));
        let c = outcome.reply.commit_id;
        let (_, c2) = ok(
            &mut tree,
            Operation::MoveFile {
                inode_id: 3,
                commit_id: c,
                dest_parent_id: 2,
                dest_parent_commit_id: c,
                dest_name: "g".into(),
            },
        );
        let moved = tree.get(3).unwrap();
        assert_eq!(moved.parent_id, 2);
        assert_eq!(moved.name, "g");
        assert_eq!(moved.commit_id, c2);
        assert_eq!(tree.get(0).unwrap().commit_id, c2);
        assert_eq!(tree.get(2).unwrap().commit_id, c2);
        // untouched sibling keeps its commit
        assert_eq!(tree.get(1).unwrap().commit_id, c);
    }

    #[test]
    fn test_rename_case_only() {
        let mut tree = KfsTree::new();
        let (f, c) = ok(&mut tree, create_file(0, 0, "readme"));
        ok(
            &mut tree,
            Operation::MoveFile {
                inode_id: f,
                commit_id: c,
                dest_parent_id: 0,
                dest_parent_commit_id: c,
                dest_name: "README".into(),
            },
        );
        assert_eq!(tree.get(f).unwrap().name, "README");
    }

    #[test]
    fn test_create_under_file() {
        let mut tree = KfsTree::new();
        let (f, c) = ok(&mut tree, create_file(0, 0, "f"));
        assert_eq!(code(&mut tree, create_file(f, c, "x")), 7);
        assert_eq!(code(&mut tree, create_file(0, c, "f/x")), 7);
    }

    #[test]
    fn test_create_with_intermediate_path() {
        let mut tree = KfsTree::new();
        let (d, c) = ok(&mut tree, create_dir(0, 0, "d"));
        let (f, _) = ok(&mut tree, create_file(0, c, "d/f.txt"));
        assert_eq!(tree.get(f).unwrap().parent_id, d);
        // Only the directory that gained a child was stamped
        assert_eq!(tree.get(0).unwrap().commit_id, 1);
        assert_eq!(code(&mut tree, create_file(0, 1, "missing/f.txt")), 3);
        assert_eq!(code(&mut tree, create_file(0, 1, "d//f")), 9);
        assert_eq!(code(&mut tree, create_file(0, 1, "")), 9);
    }

    #[test]
    fn test_wrong_type() {
        let mut tree = KfsTree::new();
        let (d, c) = ok(&mut tree, create_dir(0, 0, "d"));
        assert_eq!(
            code(
                &mut tree,
                Operation::DeleteFile {
                    inode_id: d,
                    commit_id: c
                }
            ),
            8
        );
        assert_eq!(
            code(
                &mut tree,
                Operation::UpdateFile {
                    inode_id: d,
                    commit_id: c
                }
            ),
            8
        );
    }

    #[test]
    fn test_download_slice() {
        let mut tree = KfsTree::new();
        let (f, c) = ok(&mut tree, create_file(0, 0, "f"));
        let req = FileRequest::new(f, 0, c);
        // Pending until committed
        assert!(tree.download_slice(&req).is_err());

        tree.commit_file(f, Bytes::from_static(b"0123456789"));
        let (size, data) = tree.download_slice(&req).unwrap();
        assert_eq!(size, 10);
        assert_eq!(data.as_ref(), b"0123456789");

        let (_, tail) = tree.download_slice(&FileRequest::new(f, 7, c)).unwrap();
        assert_eq!(tail.as_ref(), b"789");
        let (_, none) = tree.download_slice(&FileRequest::new(f, 10, c)).unwrap();
        assert!(none.is_empty());

        assert!(tree.download_slice(&FileRequest::new(f, 11, c)).is_err());
        assert!(tree.download_slice(&FileRequest::new(f, 0, c + 1)).is_err());
    }

    #[test]
    fn test_aborted_update_keeps_old_content() {
        let mut tree = KfsTree::new();
        let (f, c) = ok(&mut tree, create_file(0, 0, "f"));
        tree.commit_file(f, Bytes::from_static(b"old"));
        let (_, c2) = ok(
            &mut tree,
            Operation::UpdateFile {
                inode_id: f,
                commit_id: c,
            },
        );
        assert_eq!(tree.get(f).unwrap().status, NodeStatus::Pending);
        tree.abort_file(f);
        let (_, data) = tree.download_slice(&FileRequest::new(f, 0, c2)).unwrap();
        assert_eq!(data.as_ref(), b"old");
    }

    #[tokio::test]
    async fn test_store_isolates_shares() {
        let store = KfsStore::new();
        store.apply_batch((1, 1), &[create_dir(0, 0, "a")]).await;
        assert_eq!(store.commit_id((1, 1)).await, 1);
        assert_eq!(store.commit_id((1, 2)).await, 0);
        assert!(store.inode((1, 2), 1).await.is_none());
        assert_eq!(store.inode((1, 1), 1).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_workspace_usage_spans_shares() {
        let store = KfsStore::new();
        for key in [(1, 1), (1, 2), (2, 1)] {
            store.apply_batch(key, &[create_file(0, 0, "f")]).await;
            store.commit_file(key, 1, Bytes::from_static(b"12345")).await;
        }
        assert_eq!(store.workspace_usage(1).await, 10);
        assert_eq!(store.workspace_usage(2).await, 5);
        assert_eq!(store.workspace_usage(3).await, 0);

        let outcome = store
            .apply_batch(
                (1, 2),
                &[Operation::DeleteFile {
                    inode_id: 1,
                    commit_id: 1,
                }],
            )
            .await;
        assert!(outcome.reply.all_ok());
        assert_eq!(store.workspace_usage(1).await, 5);
    }
}
