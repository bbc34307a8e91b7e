//-
// Copyright (c) 2016, 2017, Jason Lingle
//
// This file is part of Metanode.
//
// Metanode is free software: you can redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metanode is distributed  in the hope that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Metanode. If not, see <http://www.gnu.org/licenses/>.

//! The transactional lock manager: a namespace operation declares which
//! entities it touches and at what strength, and `acquire` takes every lock
//! in one fixed, global order.
//!
//! The order is the whole deadlock story. Inode paths first, then blocks,
//! then leases and their paths, then each member of the block-replication
//! family, then the replication queues, then block keys. Any two operations
//! that overlap request their common entities in this same relative order,
//! so a circular wait cannot form, whichever builder calls each operation
//! made and in whatever order it made them.

use std::collections::{BTreeSet, VecDeque};

use crate::context::TransactionContext;
use crate::defs::*;
use crate::errors::*;
use crate::model::*;
use crate::resolve;
use crate::storage::LockMode;

/// Lock strength for the inodes of a resolved path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeLockMode {
    /// No locks; latest committed values.
    ReadCommitted,
    /// Shared lock on every component.
    Read,
    /// Shared locks on the ancestors, exclusive lock on the final component.
    Write,
    /// Like `Write`, but the parent of the final component is also locked
    /// exclusively; what a create or mkdir needs to attach a new child.
    WriteOnParent,
}

impl InodeLockMode {
    fn base(self) -> LockMode {
        match self {
            InodeLockMode::ReadCommitted => LockMode::ReadCommitted,
            InodeLockMode::Read => LockMode::Read,
            InodeLockMode::Write | InodeLockMode::WriteOnParent => {
                LockMode::Write
            }
        }
    }

    /// The storage lock strength for path component `index` of `total`.
    fn component(self, index: usize, total: usize) -> LockMode {
        match self {
            InodeLockMode::ReadCommitted => LockMode::ReadCommitted,
            InodeLockMode::Read => LockMode::Read,
            InodeLockMode::Write => {
                if index + 1 == total {
                    LockMode::Write
                } else {
                    LockMode::Read
                }
            }
            InodeLockMode::WriteOnParent => {
                if index + 2 >= total {
                    LockMode::Write
                } else {
                    LockMode::Read
                }
            }
        }
    }
}

/// How the inode lock's paths are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeResolveKind {
    /// Resolve the literal path; missing components simply shorten the
    /// resolved chain.
    OnlyPath,
    /// The terminal components may not exist yet (create, mkdir -p). An
    /// optimistic read-committed resolution records how much of the path
    /// exists, and the real locks are then taken on exactly that prefix;
    /// if the prefix changed in between, the operation must be retried.
    OnlyPathWithUnknownHead,
    /// Resolve the path, then additionally lock the directory's direct
    /// children.
    PathAndImmediateChildren,
    /// Resolve the path, then lock every descendant file, breadth-first
    /// over the subdirectories.
    PathAndAllChildrenRecursively,
}

#[derive(Clone, Debug)]
struct InodeLockSpec {
    kind: InodeResolveKind,
    mode: InodeLockMode,
    paths: Vec<String>,
    resolve_link: bool,
}

/// Everything `acquire` returned to the operation body: the consistent,
/// locked view it may now act on.
#[derive(Clone, Debug, Default)]
pub struct AcquiredLocks {
    /// The terminal inodes, one per requested path — or, for the child
    /// resolution strategies, the collected children.
    pub inodes: Vec<Inode>,
    /// The full resolved chain of each requested path, root first.
    pub paths: Vec<Vec<Inode>>,
    pub blocks: Vec<BlockInfo>,
    pub leases: Vec<Lease>,
}

/// Declarative description of one operation's lock requirements.
///
/// Builder call order is irrelevant: acquisition order is fixed by the
/// manager, never by the caller.
#[derive(Clone, Debug, Default)]
pub struct TransactionLocks {
    inode: Option<InodeLockSpec>,
    block: Option<LockMode>,
    block_id: Option<BlockId>,
    lease: Option<LockMode>,
    lease_holder: Option<String>,
    lease_path: Option<LockMode>,
    replica: Option<LockMode>,
    corrupt: Option<LockMode>,
    excess: Option<LockMode>,
    ruc: Option<LockMode>,
    invalidated: Option<LockMode>,
    under_replicated: Option<LockMode>,
    pending: Option<LockMode>,
    block_key: Option<LockMode>,
    block_key_ids: Vec<KeyId>,
    block_key_types: Vec<KeyType>,
}

impl TransactionLocks {
    pub fn new() -> Self {
        TransactionLocks::default()
    }

    pub fn inode(mut self, kind: InodeResolveKind, mode: InodeLockMode,
                 paths: &[&str]) -> Self {
        self.inode = Some(InodeLockSpec {
            kind,
            mode,
            paths: paths.iter().map(|p| (*p).to_owned()).collect(),
            resolve_link: true,
        });
        self
    }

    /// Keep a final symlink component as-is instead of raising the restart
    /// signal for it.
    pub fn keep_final_link(mut self) -> Self {
        if let Some(ref mut spec) = self.inode {
            spec.resolve_link = false;
        }
        self
    }

    /// Lock the blocks of every locked file inode.
    pub fn block(mut self, mode: LockMode) -> Self {
        self.block = Some(mode);
        self
    }

    /// Lock one explicitly named block. Mutually exclusive with an inode
    /// lock; `acquire_by_block` is the entry point that combines them.
    pub fn block_by_id(mut self, mode: LockMode, id: BlockId) -> Self {
        self.block = Some(mode);
        self.block_id = Some(id);
        self
    }

    pub fn lease(mut self, mode: LockMode) -> Self {
        self.lease = Some(mode);
        self
    }

    pub fn lease_holder(mut self, mode: LockMode, holder: &str) -> Self {
        self.lease = Some(mode);
        self.lease_holder = Some(holder.to_owned());
        self
    }

    pub fn lease_path(mut self, mode: LockMode) -> Self {
        self.lease_path = Some(mode);
        self
    }

    pub fn replica(mut self, mode: LockMode) -> Self {
        self.replica = Some(mode);
        self
    }

    pub fn corrupt_replica(mut self, mode: LockMode) -> Self {
        self.corrupt = Some(mode);
        self
    }

    pub fn excess_replica(mut self, mode: LockMode) -> Self {
        self.excess = Some(mode);
        self
    }

    pub fn replica_uc(mut self, mode: LockMode) -> Self {
        self.ruc = Some(mode);
        self
    }

    pub fn invalidated_block(mut self, mode: LockMode) -> Self {
        self.invalidated = Some(mode);
        self
    }

    pub fn under_replicated_block(mut self, mode: LockMode) -> Self {
        self.under_replicated = Some(mode);
        self
    }

    pub fn pending_block(mut self, mode: LockMode) -> Self {
        self.pending = Some(mode);
        self
    }

    pub fn block_key_by_id(mut self, mode: LockMode, id: KeyId) -> Self {
        self.block_key = Some(mode);
        self.block_key_ids.push(id);
        self
    }

    pub fn block_key_by_type(mut self, mode: LockMode,
                             key_type: KeyType) -> Self {
        self.block_key = Some(mode);
        self.block_key_types.push(key_type);
        self
    }

    /// Acquires every requested lock in the fixed global order.
    pub fn acquire(&self, ctx: &mut TransactionContext)
                   -> Result<AcquiredLocks> {
        let mut acquired = AcquiredLocks::default();

        if let Some(ref spec) = self.inode {
            if self.block_id.is_some() {
                return Err(ErrorKind::ConflictingBlockLock.into());
            }
            self.acquire_inode_locks(ctx, spec, &mut acquired)?;
        }

        if let Some(mode) = self.block {
            acquired.blocks = self.acquire_block_locks(
                ctx,
                mode,
                &acquired.inodes,
            )?;
        }

        self.acquire_lease_locks(ctx, &mut acquired)?;
        self.acquire_block_related_locks(ctx, &acquired.blocks)?;
        Ok(acquired)
    }

    /// Entry point for callers that only know a block id, e.g. a block
    /// report from a storage node.
    ///
    /// The owning inode id is read without any lock, every speculative read
    /// is then discarded, the real inode lock is taken, and the block set is
    /// re-read under the block lock. If the originally-read block is no
    /// longer among the file's blocks — the file was deleted or rewritten in
    /// the window — this fails with `StaleResolve` and the surrounding unit
    /// retries.
    pub fn acquire_by_block(&self, ctx: &mut TransactionContext)
                            -> Result<AcquiredLocks> {
        let spec = self.inode.as_ref().ok_or_else(|| {
            Error::from(ErrorKind::InvariantViolation(
                "acquire_by_block requires an inode lock mode".to_owned(),
            ))
        })?;
        let block_mode = self.block.ok_or_else(|| {
            Error::from(ErrorKind::InvariantViolation(
                "acquire_by_block requires a block lock mode".to_owned(),
            ))
        })?;
        let block_id = self.block_id.ok_or_else(|| {
            Error::from(ErrorKind::InvariantViolation(
                "acquire_by_block requires an explicit block id".to_owned(),
            ))
        })?;

        // Optimistic, lock-free discovery of the owning file and its chain.
        ctx.read_committed()?;
        let inode_id = ctx
            .find_block_by_id(block_id)?
            .map(|b| b.inode_id)
            .unwrap_or(NON_EXISTING_INODE);
        let chain_ids: Vec<InodeId> = resolve::chain_to_root(ctx, inode_id)?
            .iter()
            .map(|i| i.id)
            .collect();
        ctx.clear_cache();

        // Real locks: read-committed down the ancestors, the requested
        // strength on the owning file itself.
        let mut owner = None;
        for (i, id) in chain_ids.iter().enumerate() {
            if i + 1 == chain_ids.len() {
                ctx.set_lock_mode(spec.mode.base())?;
            } else {
                ctx.read_committed()?;
            }
            owner = ctx.find_inode_by_id(*id)?;
        }
        let owner = owner.filter(|i| i.is_file());

        let mut acquired = AcquiredLocks::default();
        if let Some(ref inode) = owner {
            acquired.inodes.push(inode.clone());
        }

        ctx.set_lock_mode(block_mode)?;
        let mut blocks = match owner {
            Some(ref inode) => ctx.find_blocks_by_inode(inode.id)?,
            None => Vec::new(),
        };
        if blocks.is_empty() {
            if let Some(b) = ctx.find_block_by_id(block_id)? {
                blocks.push(b);
            }
        }

        let still_owned = blocks
            .iter()
            .any(|b| b.block_id == block_id && b.inode_id == inode_id);
        if NON_EXISTING_INODE == inode_id {
            // The block was already gone before any lock was taken; that is
            // plain absence, unless it reappeared in the window.
            if !blocks.is_empty() {
                return Err(ErrorKind::StaleResolve(format!(
                    "block {} appeared during acquisition",
                    block_id
                ))
                .into());
            }
        } else if owner.is_none() || !still_owned {
            return Err(ErrorKind::StaleResolve(format!(
                "block {} detached from inode {} during acquisition",
                block_id, inode_id
            ))
            .into());
        }
        acquired.blocks = blocks;

        self.acquire_lease_locks(ctx, &mut acquired)?;
        self.acquire_block_related_locks(ctx, &acquired.blocks)?;
        Ok(acquired)
    }

    fn acquire_inode_locks(
        &self,
        ctx: &mut TransactionContext,
        spec: &InodeLockSpec,
        acquired: &mut AcquiredLocks,
    ) -> Result<()> {
        for path in &spec.paths {
            let components = path_components(path);
            let chain = match spec.kind {
                InodeResolveKind::OnlyPathWithUnknownHead => {
                    lock_path_unknown_head(ctx, spec.mode, &components,
                                           spec.resolve_link)?
                }
                _ => lock_path(ctx, spec.mode, &components,
                               spec.resolve_link)?,
            };
            if let Some(last) = chain.last() {
                acquired.inodes.push(last.clone());
            }
            acquired.paths.push(chain);
        }

        match spec.kind {
            InodeResolveKind::PathAndImmediateChildren => {
                acquired.inodes =
                    find_immediate_children(ctx, spec.mode,
                                            &acquired.inodes)?;
            }
            InodeResolveKind::PathAndAllChildrenRecursively => {
                acquired.inodes =
                    find_children_recursively(ctx, spec.mode,
                                              &acquired.inodes)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn acquire_block_locks(
        &self,
        ctx: &mut TransactionContext,
        mode: LockMode,
        inodes: &[Inode],
    ) -> Result<Vec<BlockInfo>> {
        let mut blocks = Vec::new();
        ctx.set_lock_mode(mode)?;
        if let Some(block_id) = self.block_id {
            if let Some(b) = ctx.find_block_by_id(block_id)? {
                blocks.push(b);
            }
        } else {
            for inode in inodes.iter().filter(|i| i.is_file()) {
                blocks.extend(ctx.find_blocks_by_inode(inode.id)?);
            }
        }
        Ok(blocks)
    }

    /// Lease then lease-path locks. The lease set is the explicit holder (if
    /// any) plus the recorded writer of every locked file inode, sorted so
    /// that concurrent operations lock leases in the same order.
    fn acquire_lease_locks(
        &self,
        ctx: &mut TransactionContext,
        acquired: &mut AcquiredLocks,
    ) -> Result<()> {
        if let Some(mode) = self.lease {
            let mut holders = BTreeSet::new();
            if let Some(ref holder) = self.lease_holder {
                holders.insert(holder.clone());
            }
            for inode in &acquired.inodes {
                if let Some(ref client) = inode.client_name {
                    holders.insert(client.clone());
                }
            }

            ctx.set_lock_mode(mode)?;
            for holder in holders {
                if let Some(lease) = ctx.find_lease_by_holder(&holder)? {
                    acquired.leases.push(lease);
                }
            }
        }

        if let Some(mode) = self.lease_path {
            ctx.set_lock_mode(mode)?;
            for lease in &acquired.leases {
                ctx.find_lease_paths_by_holder_id(lease.holder_id)?;
            }
        }
        Ok(())
    }

    /// The strict tail of the order: for every locked block each member of
    /// the replica-state family, then the replication queues, then block
    /// keys.
    fn acquire_block_related_locks(
        &self,
        ctx: &mut TransactionContext,
        blocks: &[BlockInfo],
    ) -> Result<()> {
        if !blocks.is_empty() {
            if let Some(mode) = self.replica {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_replicas_by_block(b.block_id)?;
                }
            }
            if let Some(mode) = self.corrupt {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_corrupt_by_block(b.block_id)?;
                }
            }
            if let Some(mode) = self.excess {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_excess_by_block(b.block_id)?;
                }
            }
            if let Some(mode) = self.ruc {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_ruc_by_block(b.block_id)?;
                }
            }
            if let Some(mode) = self.invalidated {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_invalidated_by_block(b.block_id)?;
                }
            }
            if let Some(mode) = self.under_replicated {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_under_replicated(b.block_id)?;
                }
            }
            if let Some(mode) = self.pending {
                ctx.set_lock_mode(mode)?;
                for b in blocks {
                    ctx.find_pending(b.block_id)?;
                }
            }
        }

        if let Some(mode) = self.block_key {
            ctx.set_lock_mode(mode)?;
            for id in &self.block_key_ids {
                ctx.find_key_by_id(*id)?;
            }
            for key_type in &self.block_key_types {
                ctx.find_key_by_type(*key_type)?;
            }
        }
        Ok(())
    }
}

/// The locked walk: like `resolve::resolve_components`, but every component
/// is fetched under the lock strength its position demands.
fn lock_path(
    ctx: &mut TransactionContext,
    mode: InodeLockMode,
    components: &[String],
    resolve_link: bool,
) -> Result<Vec<Inode>> {
    let total = components.len();
    let mut resolved = Vec::with_capacity(total);

    ctx.set_lock_mode(mode.component(0, total))?;
    let root = ctx
        .find_inode_by_id(ROOT_INODE_ID)?
        .ok_or_else(|| ErrorKind::InodeNotFound(ROOT_INODE_ID))?;
    resolved.push(root);

    for index in 1..total {
        if !resolved[index - 1].is_dir {
            break;
        }
        let parent_id = resolved[index - 1].id;

        ctx.set_lock_mode(mode.component(index, total))?;
        let child = match ctx
            .find_inode_by_name_parent(&components[index], parent_id)?
        {
            Some(child) => child,
            None => break,
        };

        let last = index == total - 1;
        if child.is_symlink() && (!last || resolve_link) {
            let target = child
                .symlink_target
                .clone()
                .expect("symlink inode without target");
            return Err(resolve::unresolved(components, index, &target));
        }
        resolved.push(child);
    }

    Ok(resolved)
}

/// The double resolution behind `OnlyPathWithUnknownHead`.
fn lock_path_unknown_head(
    ctx: &mut TransactionContext,
    mode: InodeLockMode,
    components: &[String],
    resolve_link: bool,
) -> Result<Vec<Inode>> {
    // Optimistic pass: see how much of the path exists right now, without
    // taking anything.
    ctx.read_committed()?;
    let optimistic =
        resolve::resolve_components(ctx, components, resolve_link)?;
    let existing = optimistic.len();
    ctx.clear_cache();

    // Real pass over exactly the prefix that existed. The deepest existing
    // component is where a create attaches, so it takes the terminal lock.
    let mut resolved =
        lock_path(ctx, mode, &components[..existing], resolve_link)?;
    if resolved.len() < existing {
        return Err(ErrorKind::StaleResolve(format!(
            "resolved prefix of '{}' shrank from {} to {} components",
            prefix_path(components, components.len()),
            existing,
            resolved.len()
        ))
        .into());
    }

    // Components past the prefix that appeared since the optimistic pass
    // must be locked too before the operation can trust its view.
    for index in existing..components.len() {
        if !resolved[index - 1].is_dir {
            break;
        }
        let parent_id = resolved[index - 1].id;

        ctx.set_lock_mode(mode.base())?;
        let child = match ctx
            .find_inode_by_name_parent(&components[index], parent_id)?
        {
            Some(child) => child,
            None => break,
        };

        let last = index == components.len() - 1;
        if child.is_symlink() && (!last || resolve_link) {
            let target = child
                .symlink_target
                .clone()
                .expect("symlink inode without target");
            return Err(resolve::unresolved(components, index, &target));
        }
        resolved.push(child);
    }

    Ok(resolved)
}

fn find_immediate_children(
    ctx: &mut TransactionContext,
    mode: InodeLockMode,
    inodes: &[Inode],
) -> Result<Vec<Inode>> {
    let mut children = Vec::new();
    ctx.set_lock_mode(mode.base())?;
    for inode in inodes {
        if inode.is_dir {
            children.extend(ctx.find_inodes_by_parent(inode.id)?);
        } else {
            // The immediate child of a file is the file itself.
            children.push(inode.clone());
        }
    }
    Ok(children)
}

/// Breadth-first sweep collecting every descendant file leaf.
fn find_children_recursively(
    ctx: &mut TransactionContext,
    mode: InodeLockMode,
    inodes: &[Inode],
) -> Result<Vec<Inode>> {
    let mut files = Vec::new();
    let mut unchecked_dirs = VecDeque::new();
    for inode in inodes {
        if inode.is_dir {
            unchecked_dirs.push_back(inode.clone());
        } else {
            files.push(inode.clone());
        }
    }

    ctx.set_lock_mode(mode.base())?;
    while let Some(dir) = unchecked_dirs.pop_front() {
        for child in ctx.find_inodes_by_parent(dir.id)? {
            if child.is_dir {
                unchecked_dirs.push_back(child);
            } else if child.is_file() {
                files.push(child);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::log::NullLogger;
    use crate::storage::{BlockInfoAccess, Connector, InodeAccess,
                         LeaseAccess, MemoryStore, Storage};
    use crate::txn::run_transaction;

    fn seeded_store() -> Arc<MemoryStore> {
        let storage = Arc::new(MemoryStore::new());
        storage.begin_transaction().unwrap();
        let mut f1 = Inode::file(3, "f1", 1, 3, 4096);
        f1.is_under_construction = true;
        f1.client_name = Some("writer-1".to_owned());
        storage
            .prepare_inodes(
                &[],
                &[
                    Inode::directory(1, "d", ROOT_INODE_ID),
                    f1,
                    Inode::file(4, "f2", 1, 3, 4096),
                    Inode::directory(5, "sub", 1),
                    Inode::file(6, "f3", 5, 3, 4096),
                ],
                &[],
            )
            .unwrap();
        storage
            .prepare_blocks(
                &[],
                &[
                    BlockInfo::new(100, 3, 0),
                    BlockInfo::new(101, 3, 1),
                    BlockInfo::new(102, 4, 0),
                ],
                &[],
            )
            .unwrap();
        storage
            .prepare_leases(
                &[],
                &[Lease {
                    holder: "writer-1".to_owned(),
                    holder_id: 1,
                    last_update: 0,
                }],
                &[],
            )
            .unwrap();
        storage.commit().unwrap();
        storage
    }

    fn full_write_locks(path: &str) -> TransactionLocks {
        TransactionLocks::new()
            .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write, &[path])
            .block(LockMode::Write)
            .lease(LockMode::Write)
            .lease_path(LockMode::Write)
            .replica(LockMode::Write)
            .corrupt_replica(LockMode::Write)
            .excess_replica(LockMode::Write)
            .replica_uc(LockMode::Write)
            .invalidated_block(LockMode::Write)
            .under_replicated_block(LockMode::Write)
            .pending_block(LockMode::Write)
    }

    #[test]
    fn acquires_path_blocks_and_lease() {
        let storage = seeded_store();
        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "acquire",
            |ctx| full_write_locks("/d/f1").acquire(ctx),
        )
        .unwrap();

        assert_eq!(1, acquired.inodes.len());
        assert_eq!(3, acquired.inodes[0].id);
        assert_eq!(vec![100, 101],
                   acquired.blocks.iter().map(|b| b.block_id)
                       .collect::<Vec<_>>());
        // The file is under construction, so its writer's lease is locked
        // even though no explicit holder was named.
        assert_eq!(1, acquired.leases.len());
        assert_eq!("writer-1", acquired.leases[0].holder);
    }

    #[test]
    fn inode_and_explicit_block_conflict() {
        let storage = seeded_store();
        let locks = TransactionLocks::new()
            .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write,
                   &["/d/f1"])
            .block_by_id(LockMode::Write, 100);
        let err = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "conflict",
            |ctx| locks.acquire(ctx),
        )
        .unwrap_err();
        match *err.kind() {
            ErrorKind::ConflictingBlockLock => {}
            ref k => panic!("unexpected error: {:?}", k),
        }
    }

    #[test]
    fn immediate_children_collects_files_and_dirs() {
        let storage = seeded_store();
        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "children",
            |ctx| {
                TransactionLocks::new()
                    .inode(
                        InodeResolveKind::PathAndImmediateChildren,
                        InodeLockMode::Write,
                        &["/d"],
                    )
                    .block(LockMode::Write)
                    .acquire(ctx)
            },
        )
        .unwrap();

        let mut names: Vec<String> =
            acquired.inodes.iter().map(|i| i.name.clone()).collect();
        names.sort();
        assert_eq!(vec!["f1", "f2", "sub"], names);
        // Blocks of both immediate files are locked.
        assert_eq!(3, acquired.blocks.len());
    }

    #[test]
    fn recursive_children_collects_file_leaves_only() {
        let storage = seeded_store();
        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "recursive",
            |ctx| {
                TransactionLocks::new()
                    .inode(
                        InodeResolveKind::PathAndAllChildrenRecursively,
                        InodeLockMode::Write,
                        &["/d"],
                    )
                    .acquire(ctx)
            },
        )
        .unwrap();

        let mut names: Vec<String> =
            acquired.inodes.iter().map(|i| i.name.clone()).collect();
        names.sort();
        assert_eq!(vec!["f1", "f2", "f3"], names);
    }

    #[test]
    fn symlink_in_path_raises_restart_signal() {
        let storage = seeded_store();
        storage.begin_transaction().unwrap();
        storage
            .prepare_inodes(
                &[],
                &[Inode::symlink(9, "link", ROOT_INODE_ID, "/d")],
                &[],
            )
            .unwrap();
        storage.commit().unwrap();

        let err = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "symlink",
            |ctx| full_write_locks("/link/f1").acquire(ctx),
        )
        .unwrap_err();
        match *err.kind() {
            ErrorKind::UnresolvedPath(_, _, ref remainder, ref target) => {
                assert_eq!("f1", remainder);
                assert_eq!("/d", target);
            }
            ref k => panic!("unexpected error: {:?}", k),
        }
    }

    #[test]
    fn unknown_head_locks_existing_prefix() {
        let storage = seeded_store();
        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "mkdirs",
            |ctx| {
                TransactionLocks::new()
                    .inode(
                        InodeResolveKind::OnlyPathWithUnknownHead,
                        InodeLockMode::WriteOnParent,
                        &["/d/newdir/newfile"],
                    )
                    .acquire(ctx)
            },
        )
        .unwrap();

        // Only /d exists; it is the deepest locked inode.
        assert_eq!(1, acquired.inodes.len());
        assert_eq!(1, acquired.inodes[0].id);
        assert_eq!(2, acquired.paths[0].len());
    }

    #[test]
    fn unknown_head_detects_concurrent_prefix_change() {
        let storage = seeded_store();

        // Between the optimistic and the locked resolution, a concurrent
        // operation removes /d/sub out from under us: the second lookup of
        // "sub" no longer finds it.
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            storage.inject_fault(
                "child:sub",
                Box::new(move |tables| {
                    if 1 == calls.fetch_add(1, Ordering::SeqCst) {
                        tables.inodes.remove(&5);
                    }
                }),
            );
        }

        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "unknown-head-race",
            |ctx| {
                TransactionLocks::new()
                    .inode(
                        InodeResolveKind::OnlyPathWithUnknownHead,
                        InodeLockMode::WriteOnParent,
                        &["/d/sub/brand/new"],
                    )
                    .acquire(ctx)
            },
        )
        .unwrap();

        // The first attempt saw the prefix shrink and aborted with the
        // retry signal; the wrapper's second attempt re-ran the optimistic
        // pass (a third lookup of "sub") and came back with the shorter,
        // now-stable prefix /d.
        assert!(3 <= calls.load(Ordering::SeqCst));
        assert_eq!(1, acquired.inodes[0].id);
        assert_eq!(2, acquired.paths[0].len());
    }

    #[test]
    fn acquire_by_block_locks_owner_and_blocks() {
        let storage = seeded_store();
        let acquired = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "block-report",
            |ctx| {
                TransactionLocks::new()
                    .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write,
                           &[])
                    .block_by_id(LockMode::Write, 100)
                    .replica(LockMode::Write)
                    .acquire_by_block(ctx)
            },
        )
        .unwrap();

        assert_eq!(1, acquired.inodes.len());
        assert_eq!(3, acquired.inodes[0].id);
        assert!(acquired.blocks.iter().any(|b| 100 == b.block_id));
    }

    #[test]
    fn acquire_by_block_detects_deleted_owner() {
        let storage = seeded_store();

        // Delete the owning file (and its blocks) between the optimistic
        // read and the locked read of the owner inode.
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            storage.inject_fault(
                "inode:3",
                Box::new(move |tables| {
                    if 1 == calls.fetch_add(1, Ordering::SeqCst) {
                        tables.inodes.remove(&3);
                        tables.blocks.remove(&100);
                        tables.blocks.remove(&101);
                    }
                }),
            );
        }

        let result = run_transaction(
            &(Arc::clone(&storage) as Arc<dyn Storage>),
            &NullLogger,
            "stale-block-report",
            |ctx| {
                TransactionLocks::new()
                    .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write,
                           &[])
                    .block_by_id(LockMode::Write, 100)
                    .acquire_by_block(ctx)
            },
        );

        // First attempt aborts with StaleResolve; the wrapper retries and
        // the retry sees plain absence, which succeeds with no locks held.
        let acquired = result.unwrap();
        assert!(acquired.inodes.is_empty());
        assert!(acquired.blocks.is_empty());
        assert!(2 <= calls.load(Ordering::SeqCst));
    }

    #[test]
    fn overlapping_operations_make_progress() {
        let storage = seeded_store();
        let paths = ["/d/f1", "/d/f2", "/d"];

        let mut handles = Vec::new();
        for t in 0..4 {
            let storage = Arc::clone(&storage);
            handles.push(std::thread::spawn(move || {
                for i in 0..8 {
                    // Each thread hits the shared paths in a different
                    // rotation, the classic recipe for deadlock were the
                    // acquisition order caller-controlled.
                    let path = paths[(t + i) % paths.len()];
                    run_transaction(
                        &(Arc::clone(&storage) as Arc<dyn Storage>),
                        &NullLogger,
                        "contended",
                        |ctx| full_write_locks(path).acquire(ctx),
                    )
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn lock_strength_escalates_on_final_component() {
        // A write lock on /d/f1 leaves /d readable by a concurrent reader
        // but blocks a concurrent writer of f1.
        let storage = Arc::new(MemoryStore::with_lock_timeout(
            Duration::from_millis(100),
        ));
        storage.begin_transaction().unwrap();
        storage
            .prepare_inodes(
                &[],
                &[
                    Inode::directory(1, "d", ROOT_INODE_ID),
                    Inode::file(3, "f1", 1, 3, 4096),
                ],
                &[],
            )
            .unwrap();
        storage.commit().unwrap();

        let mut ctx = crate::context::TransactionContext::begin(
            Arc::clone(&storage) as Arc<dyn Storage>,
        )
        .unwrap();
        TransactionLocks::new()
            .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write,
                   &["/d/f1"])
            .acquire(&mut ctx)
            .unwrap();

        let probe = {
            let storage = Arc::clone(&storage);
            std::thread::spawn(move || {
                let mut ctx = crate::context::TransactionContext::begin(
                    Arc::clone(&storage) as Arc<dyn Storage>,
                )
                .unwrap();
                // Reading the directory is fine...
                let d = TransactionLocks::new()
                    .inode(InodeResolveKind::OnlyPath, InodeLockMode::Read,
                           &["/d"])
                    .acquire(&mut ctx);
                // ...but write-locking the file times out.
                let f = TransactionLocks::new()
                    .inode(InodeResolveKind::OnlyPath, InodeLockMode::Write,
                           &["/d/f1"])
                    .acquire(&mut ctx);
                ctx.rollback().unwrap();
                (d.is_ok(), f.is_err())
            })
        };

        let (dir_readable, file_blocked) = probe.join().unwrap();
        assert!(dir_readable);
        assert!(file_blocked);
        ctx.rollback().unwrap();
    }
}
