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

//! An implementation of `Storage` which holds all its tables in memory.
//!
//! Unlike the embedded SQLite backend, this one implements genuine row-level
//! shared/exclusive locks honouring the session's `LockMode`, with a
//! lock-wait timeout that surfaces as a transient `LockTimeout` error. That
//! makes it the backend of choice for exercising the lock manager's ordering
//! and retry behaviour under real contention.
//!
//! Writes are staged on the session and applied to the tables when the
//! transaction commits; commit or rollback releases every row lock the
//! session holds.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::defs::*;
use crate::errors::*;
use crate::model::*;
use crate::storage::*;

const T_INODE: &str = "inode";
const T_BLOCK: &str = "block";
const T_REPLICA: &str = "replica";
const T_CORRUPT: &str = "corrupt-replica";
const T_EXCESS: &str = "excess-replica";
const T_RUC: &str = "replica-uc";
const T_INVALIDATED: &str = "invalidated-block";
const T_URB: &str = "under-replicated";
const T_PENDING: &str = "pending-block";
const T_LEASE: &str = "lease";
const T_LEASE_PATH: &str = "lease-path";
const T_KEY: &str = "block-key";

fn replica_pk(block_id: BlockId, storage_id: &str) -> String {
    format!("{}@{}", block_id, storage_id)
}

#[derive(Clone, Default)]
pub(crate) struct Tables {
    pub(crate) inodes: HashMap<InodeId, Inode>,
    pub(crate) blocks: HashMap<BlockId, BlockInfo>,
    pub(crate) replicas: HashMap<(BlockId, String), IndexedReplica>,
    pub(crate) corrupt: HashMap<(BlockId, String), CorruptReplica>,
    pub(crate) excess: HashMap<(BlockId, String), ExcessReplica>,
    pub(crate) replicas_uc:
        HashMap<(BlockId, String), ReplicaUnderConstruction>,
    pub(crate) invalidated: HashMap<(BlockId, String), InvalidatedBlock>,
    pub(crate) under_replicated: HashMap<BlockId, UnderReplicatedBlock>,
    pub(crate) pending: HashMap<BlockId, PendingBlockInfo>,
    pub(crate) leases: HashMap<String, Lease>,
    pub(crate) lease_paths: HashMap<String, LeasePath>,
    pub(crate) keys: HashMap<KeyId, BlockKey>,
}

/// Allows tests to inject interference into the store: whenever a lookup
/// matching the key is about to be performed, the contained function may
/// mutate the tables however it wants, simulating a concurrent process
/// slipping in between two reads.
#[cfg(test)]
pub(crate) type Fault = Box<dyn Fn(&mut Tables) + Send>;

#[derive(Debug)]
enum StagedOp {
    PutInode(Inode),
    DelInode(InodeId),
    PutBlock(BlockInfo),
    DelBlock(BlockId),
    PutReplica(IndexedReplica),
    DelReplica(BlockId, String),
    PutCorrupt(CorruptReplica),
    DelCorrupt(BlockId, String),
    PutExcess(ExcessReplica),
    DelExcess(BlockId, String),
    PutReplicaUc(ReplicaUnderConstruction),
    DelReplicaUc(BlockId, String),
    PutInvalidated(InvalidatedBlock),
    DelInvalidated(BlockId, String),
    PutUnderReplicated(UnderReplicatedBlock),
    DelUnderReplicated(BlockId),
    PutPending(PendingBlockInfo),
    DelPending(BlockId),
    PutLease(Lease),
    DelLease(String),
    PutLeasePath(LeasePath),
    DelLeasePath(String),
    PutKey(BlockKey),
    DelKey(KeyId),
}

type RowKey = (&'static str, String);

#[derive(Default)]
struct RowLock {
    writer: Option<(ThreadId, u32)>,
    readers: HashMap<ThreadId, u32>,
}

impl RowLock {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

#[derive(Default)]
struct Session {
    active: bool,
    mode: LockMode,
    staged: Vec<StagedOp>,
    held: Vec<(RowKey, LockMode)>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<RowKey, RowLock>>,
    lock_cond: Condvar,
    sessions: Mutex<HashMap<ThreadId, Session>>,
    lock_timeout: Duration,
    #[cfg(test)]
    faults: Mutex<HashMap<String, Fault>>,
}

impl MemoryStore {
    /// Creates an empty store already holding the root directory.
    pub fn new() -> Self {
        MemoryStore::with_lock_timeout(Duration::from_secs(5))
    }

    /// Like `new`, but with the given lock-wait timeout. Contention tests
    /// use a short timeout so that a stuck wait fails fast.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        let store = MemoryStore {
            tables: Mutex::new(Tables::default()),
            locks: Mutex::new(HashMap::new()),
            lock_cond: Condvar::new(),
            sessions: Mutex::new(HashMap::new()),
            lock_timeout,
            #[cfg(test)]
            faults: Mutex::new(HashMap::new()),
        };
        store
            .tables
            .lock()
            .unwrap()
            .inodes
            .insert(ROOT_INODE_ID, Inode::root());
        store
    }

    fn me() -> ThreadId {
        thread::current().id()
    }

    /// Registers a fault to fire whenever a lookup matching `key` runs.
    /// Keys are `"inode:<id>"` and `"child:<name>"`; the child-lookup hook
    /// is what the resolution-race tests need.
    #[cfg(test)]
    pub(crate) fn inject_fault(&self, key: &str, fault: Fault) {
        self.faults.lock().unwrap().insert(key.to_owned(), fault);
    }

    #[cfg(test)]
    fn fire_fault(&self, key: &str) {
        let fault = self.faults.lock().unwrap().remove(key);
        if let Some(fault) = fault {
            fault(&mut self.tables.lock().unwrap());
            self.faults.lock().unwrap().insert(key.to_owned(), fault);
        }
    }

    #[cfg(not(test))]
    fn fire_fault(&self, _key: &str) {}

    /// The lock strength finds on this thread currently acquire. Outside an
    /// active transaction reads are always read-committed, since nothing
    /// would ever release the locks.
    fn effective_mode(&self) -> LockMode {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&MemoryStore::me()) {
            Some(s) if s.active => s.mode,
            _ => LockMode::ReadCommitted,
        }
    }

    fn with_session<T, F: FnOnce(&mut Session) -> T>(&self, f: F) -> T {
        let mut sessions = self.sessions.lock().unwrap();
        f(sessions.entry(MemoryStore::me()).or_default())
    }

    /// Blocks until the row identified by `key` is held with `mode`, or the
    /// lock-wait timeout elapses (a transient error).
    ///
    /// Locks are keyed by primary key, so they exist independently of any
    /// row; re-acquisition by the owning thread is permitted and a sole
    /// reader may upgrade to writer.
    fn lock_row(&self, key: RowKey, mode: LockMode) -> Result<()> {
        if let LockMode::ReadCommitted = mode {
            return Ok(());
        }

        let me = MemoryStore::me();
        let deadline = Instant::now() + self.lock_timeout;
        let mut locks = self.locks.lock().unwrap();
        loop {
            {
                let lock = locks.entry(key.clone()).or_default();
                let granted = match mode {
                    LockMode::Read => {
                        if lock.writer.map(|(t, _)| t) == Some(me)
                            || lock.writer.is_none()
                        {
                            *lock.readers.entry(me).or_insert(0) += 1;
                            true
                        } else {
                            false
                        }
                    }
                    LockMode::Write => match lock.writer {
                        Some((t, ref mut n)) if t == me => {
                            *n += 1;
                            true
                        }
                        Some(_) => false,
                        None => {
                            if lock.readers.keys().all(|&t| t == me) {
                                lock.writer = Some((me, 1));
                                true
                            } else {
                                false
                            }
                        }
                    },
                    LockMode::ReadCommitted => unreachable!(),
                };
                if granted {
                    drop(locks);
                    self.with_session(|s| s.held.push((key, mode)));
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::LockTimeout(key.0, key.1).into());
            }
            let (guard, _) = self
                .lock_cond
                .wait_timeout(locks, deadline - now)
                .expect("row lock mutex poisoned");
            locks = guard;
        }
    }

    fn release_all(&self, held: Vec<(RowKey, LockMode)>) {
        if held.is_empty() {
            return;
        }
        let me = MemoryStore::me();
        let mut locks = self.locks.lock().unwrap();
        for (key, mode) in held {
            if let Some(lock) = locks.get_mut(&key) {
                match mode {
                    LockMode::Read => {
                        if let Some(n) = lock.readers.get_mut(&me) {
                            *n -= 1;
                            if 0 == *n {
                                lock.readers.remove(&me);
                            }
                        }
                    }
                    LockMode::Write => {
                        if let Some((t, n)) = lock.writer.as_mut() {
                            if *t == me {
                                *n -= 1;
                                if 0 == *n {
                                    lock.writer = None;
                                }
                            }
                        }
                    }
                    LockMode::ReadCommitted => {}
                }
                if lock.is_free() {
                    locks.remove(&key);
                }
            }
        }
        self.lock_cond.notify_all();
    }

    /// Fetches by primary key, taking the row lock first (whether or not the
    /// row exists) so the result stays stable for the transaction.
    fn fetch<T, F: Fn(&Tables) -> Option<T>>(
        &self,
        table: &'static str,
        pk: String,
        get: F,
    ) -> Result<Option<T>> {
        self.lock_row((table, pk), self.effective_mode())?;
        Ok(get(&self.tables.lock().unwrap()))
    }

    /// Index scan: finds matching primary keys, locks them in sorted order,
    /// then re-reads. Rows inserted concurrently after the scan are not
    /// locked; the lock manager's re-resolution checks cover that window.
    fn scan<T, F>(&self, table: &'static str, keys: F) -> Result<Vec<T>>
    where
        F: Fn(&Tables) -> Vec<(String, T)>,
    {
        let mode = self.effective_mode();
        if let LockMode::ReadCommitted = mode {
            return Ok(keys(&self.tables.lock().unwrap())
                .into_iter()
                .map(|(_, v)| v)
                .collect());
        }

        let mut pks: Vec<String> = keys(&self.tables.lock().unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        pks.sort();
        for pk in &pks {
            self.lock_row((table, pk.clone()), mode)?;
        }
        Ok(keys(&self.tables.lock().unwrap())
            .into_iter()
            .filter(|(k, _)| pks.binary_search(k).is_ok())
            .map(|(_, v)| v)
            .collect())
    }

    fn stage(&self, ops: Vec<StagedOp>) -> Result<()> {
        self.with_session(|s| {
            if !s.active {
                return Err(ErrorKind::TransactionInactive.into());
            }
            s.staged.extend(ops);
            Ok(())
        })
    }

    fn apply(tables: &mut Tables, ops: &[StagedOp]) -> Result<()> {
        for op in ops {
            match *op {
                StagedOp::PutInode(ref i) => {
                    let clash = tables.inodes.values().any(|o| {
                        o.id != i.id
                            && o.parent_id == i.parent_id
                            && o.name == i.name
                    });
                    if clash {
                        return Err(ErrorKind::SchemaViolation(format!(
                            "duplicate inode name '{}' under parent {}",
                            i.name, i.parent_id
                        ))
                        .into());
                    }
                    tables.inodes.insert(i.id, i.clone());
                }
                StagedOp::DelInode(id) => {
                    tables.inodes.remove(&id);
                }
                StagedOp::PutBlock(ref b) => {
                    tables.blocks.insert(b.block_id, b.clone());
                }
                StagedOp::DelBlock(id) => {
                    tables.blocks.remove(&id);
                }
                StagedOp::PutReplica(ref r) => {
                    tables
                        .replicas
                        .insert((r.block_id, r.storage_id.clone()), r.clone());
                }
                StagedOp::DelReplica(b, ref s) => {
                    tables.replicas.remove(&(b, s.clone()));
                }
                StagedOp::PutCorrupt(ref r) => {
                    tables
                        .corrupt
                        .insert((r.block_id, r.storage_id.clone()), r.clone());
                }
                StagedOp::DelCorrupt(b, ref s) => {
                    tables.corrupt.remove(&(b, s.clone()));
                }
                StagedOp::PutExcess(ref r) => {
                    tables
                        .excess
                        .insert((r.block_id, r.storage_id.clone()), r.clone());
                }
                StagedOp::DelExcess(b, ref s) => {
                    tables.excess.remove(&(b, s.clone()));
                }
                StagedOp::PutReplicaUc(ref r) => {
                    tables
                        .replicas_uc
                        .insert((r.block_id, r.storage_id.clone()), r.clone());
                }
                StagedOp::DelReplicaUc(b, ref s) => {
                    tables.replicas_uc.remove(&(b, s.clone()));
                }
                StagedOp::PutInvalidated(ref r) => {
                    tables
                        .invalidated
                        .insert((r.block_id, r.storage_id.clone()), r.clone());
                }
                StagedOp::DelInvalidated(b, ref s) => {
                    tables.invalidated.remove(&(b, s.clone()));
                }
                StagedOp::PutUnderReplicated(ref u) => {
                    tables.under_replicated.insert(u.block_id, u.clone());
                }
                StagedOp::DelUnderReplicated(b) => {
                    tables.under_replicated.remove(&b);
                }
                StagedOp::PutPending(ref p) => {
                    tables.pending.insert(p.block_id, p.clone());
                }
                StagedOp::DelPending(b) => {
                    tables.pending.remove(&b);
                }
                StagedOp::PutLease(ref l) => {
                    tables.leases.insert(l.holder.clone(), l.clone());
                }
                StagedOp::DelLease(ref h) => {
                    tables.leases.remove(h);
                }
                StagedOp::PutLeasePath(ref lp) => {
                    tables.lease_paths.insert(lp.path.clone(), lp.clone());
                }
                StagedOp::DelLeasePath(ref p) => {
                    tables.lease_paths.remove(p);
                }
                StagedOp::PutKey(ref k) => {
                    tables.keys.insert(k.key_id, k.clone());
                }
                StagedOp::DelKey(id) => {
                    tables.keys.remove(&id);
                }
            }
        }
        Ok(())
    }
}

impl Connector for MemoryStore {
    fn begin_transaction(&self) -> Result<()> {
        self.with_session(|s| {
            if s.active {
                return Err(ErrorKind::InvariantViolation(
                    "transaction already active on this session".to_owned(),
                )
                .into());
            }
            s.active = true;
            s.mode = LockMode::ReadCommitted;
            s.staged.clear();
            Ok(())
        })
    }

    fn commit(&self) -> Result<()> {
        let (staged, held) = self.with_session(|s| {
            if !s.active {
                return Err(Error::from(ErrorKind::TransactionInactive));
            }
            s.active = false;
            Ok((
                std::mem::replace(&mut s.staged, Vec::new()),
                std::mem::replace(&mut s.held, Vec::new()),
            ))
        })?;

        // Validate and apply against a copy so a rejected batch leaves the
        // committed state untouched.
        let result = {
            let mut tables = self.tables.lock().unwrap();
            let mut next = tables.clone();
            MemoryStore::apply(&mut next, &staged).map(|()| *tables = next)
        };
        self.release_all(held);
        result
    }

    fn rollback(&self) -> Result<()> {
        let held = self.with_session(|s| {
            s.active = false;
            s.staged.clear();
            std::mem::replace(&mut s.held, Vec::new())
        });
        self.release_all(held);
        Ok(())
    }

    fn transaction_active(&self) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&MemoryStore::me())
            .map(|s| s.active)
            .unwrap_or(false)
    }

    fn set_lock_mode(&self, mode: LockMode) -> Result<()> {
        self.with_session(|s| s.mode = mode);
        Ok(())
    }

    fn format(&self) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        *tables = Tables::default();
        tables.inodes.insert(ROOT_INODE_ID, Inode::root());
        Ok(())
    }

    fn shutdown(&self) {}
}

impl InodeAccess for MemoryStore {
    fn inode_by_id(&self, id: InodeId) -> Result<Option<Inode>> {
        self.fire_fault(&format!("inode:{}", id));
        self.fetch(T_INODE, id.to_string(), |t| t.inodes.get(&id).cloned())
    }

    fn inode_by_name_parent(&self, name: &str, parent_id: InodeId)
                            -> Result<Option<Inode>> {
        self.fire_fault(&format!("child:{}", name));
        // The primary key is not known until the index is consulted, so this
        // goes through a scan of width zero or one.
        let name = name.to_owned();
        let found = self.scan(T_INODE, |t| {
            t.inodes
                .values()
                .filter(|i| i.parent_id == parent_id && i.name == name)
                .map(|i| (i.id.to_string(), i.clone()))
                .collect()
        })?;
        Ok(found.into_iter().next())
    }

    fn inodes_by_parent(&self, parent_id: InodeId) -> Result<Vec<Inode>> {
        let mut children = self.scan(T_INODE, |t| {
            t.inodes
                .values()
                .filter(|i| i.parent_id == parent_id && i.id != ROOT_INODE_ID)
                .map(|i| (i.id.to_string(), i.clone()))
                .collect()
        })?;
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn prepare_inodes(&self, removed: &[Inode], added: &[Inode],
                      modified: &[Inode]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|i| StagedOp::DelInode(i.id))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|i| StagedOp::PutInode(i.clone())));
        self.stage(ops)
    }
}

impl BlockInfoAccess for MemoryStore {
    fn block_by_id(&self, id: BlockId) -> Result<Option<BlockInfo>> {
        self.fetch(T_BLOCK, id.to_string(), |t| t.blocks.get(&id).cloned())
    }

    fn blocks_by_inode(&self, inode_id: InodeId) -> Result<Vec<BlockInfo>> {
        let mut blocks = self.scan(T_BLOCK, |t| {
            t.blocks
                .values()
                .filter(|b| b.inode_id == inode_id)
                .map(|b| (b.block_id.to_string(), b.clone()))
                .collect()
        })?;
        blocks.sort_by_key(|b| b.block_index);
        Ok(blocks)
    }

    fn prepare_blocks(&self, removed: &[BlockInfo], added: &[BlockInfo],
                      modified: &[BlockInfo]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|b| StagedOp::DelBlock(b.block_id))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|b| StagedOp::PutBlock(b.clone())));
        self.stage(ops)
    }
}

impl ReplicaAccess for MemoryStore {
    fn replicas_by_block(&self, block_id: BlockId)
                         -> Result<Vec<IndexedReplica>> {
        self.scan(T_REPLICA, |t| {
            t.replicas
                .values()
                .filter(|r| r.block_id == block_id)
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn prepare_replicas(&self, removed: &[IndexedReplica],
                        added: &[IndexedReplica],
                        modified: &[IndexedReplica]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|r| StagedOp::DelReplica(r.block_id, r.storage_id.clone()))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|r| StagedOp::PutReplica(r.clone())));
        self.stage(ops)
    }
}

impl CorruptReplicaAccess for MemoryStore {
    fn corrupt_replicas_by_block(&self, block_id: BlockId)
                                 -> Result<Vec<CorruptReplica>> {
        self.scan(T_CORRUPT, |t| {
            t.corrupt
                .values()
                .filter(|r| r.block_id == block_id)
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn prepare_corrupt_replicas(&self, removed: &[CorruptReplica],
                                added: &[CorruptReplica]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|r| StagedOp::DelCorrupt(r.block_id, r.storage_id.clone()))
            .collect();
        ops.extend(added.iter().map(|r| StagedOp::PutCorrupt(r.clone())));
        self.stage(ops)
    }
}

impl ExcessReplicaAccess for MemoryStore {
    fn excess_replicas_by_block(&self, block_id: BlockId)
                                -> Result<Vec<ExcessReplica>> {
        self.scan(T_EXCESS, |t| {
            t.excess
                .values()
                .filter(|r| r.block_id == block_id)
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn prepare_excess_replicas(&self, removed: &[ExcessReplica],
                               added: &[ExcessReplica]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|r| StagedOp::DelExcess(r.block_id, r.storage_id.clone()))
            .collect();
        ops.extend(added.iter().map(|r| StagedOp::PutExcess(r.clone())));
        self.stage(ops)
    }
}

impl ReplicaUcAccess for MemoryStore {
    fn replicas_uc_by_block(&self, block_id: BlockId)
                            -> Result<Vec<ReplicaUnderConstruction>> {
        self.scan(T_RUC, |t| {
            t.replicas_uc
                .values()
                .filter(|r| r.block_id == block_id)
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn prepare_replicas_uc(&self, removed: &[ReplicaUnderConstruction],
                           added: &[ReplicaUnderConstruction]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|r| StagedOp::DelReplicaUc(r.block_id, r.storage_id.clone()))
            .collect();
        ops.extend(added.iter().map(|r| StagedOp::PutReplicaUc(r.clone())));
        self.stage(ops)
    }
}

impl InvalidatedBlockAccess for MemoryStore {
    fn invalidated_by_block(&self, block_id: BlockId)
                            -> Result<Vec<InvalidatedBlock>> {
        self.scan(T_INVALIDATED, |t| {
            t.invalidated
                .values()
                .filter(|r| r.block_id == block_id)
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn all_invalidated(&self) -> Result<Vec<InvalidatedBlock>> {
        self.scan(T_INVALIDATED, |t| {
            t.invalidated
                .values()
                .map(|r| (replica_pk(r.block_id, &r.storage_id), r.clone()))
                .collect()
        })
    }

    fn prepare_invalidated(&self, removed: &[InvalidatedBlock],
                           added: &[InvalidatedBlock]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|r| {
                StagedOp::DelInvalidated(r.block_id, r.storage_id.clone())
            })
            .collect();
        ops.extend(added.iter().map(|r| StagedOp::PutInvalidated(r.clone())));
        self.stage(ops)
    }
}

impl UnderReplicatedBlockAccess for MemoryStore {
    fn under_replicated_by_block(&self, block_id: BlockId)
                                 -> Result<Option<UnderReplicatedBlock>> {
        self.fetch(T_URB, block_id.to_string(), |t| {
            t.under_replicated.get(&block_id).cloned()
        })
    }

    fn all_under_replicated(&self) -> Result<Vec<UnderReplicatedBlock>> {
        self.scan(T_URB, |t| {
            t.under_replicated
                .values()
                .map(|u| (u.block_id.to_string(), u.clone()))
                .collect()
        })
    }

    fn prepare_under_replicated(&self, removed: &[UnderReplicatedBlock],
                                added: &[UnderReplicatedBlock],
                                modified: &[UnderReplicatedBlock])
                                -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|u| StagedOp::DelUnderReplicated(u.block_id))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|u| StagedOp::PutUnderReplicated(u.clone())));
        self.stage(ops)
    }
}

impl PendingBlockAccess for MemoryStore {
    fn pending_by_block(&self, block_id: BlockId)
                        -> Result<Option<PendingBlockInfo>> {
        self.fetch(T_PENDING, block_id.to_string(), |t| {
            t.pending.get(&block_id).cloned()
        })
    }

    fn all_pending(&self) -> Result<Vec<PendingBlockInfo>> {
        self.scan(T_PENDING, |t| {
            t.pending
                .values()
                .map(|p| (p.block_id.to_string(), p.clone()))
                .collect()
        })
    }

    fn prepare_pending(&self, removed: &[PendingBlockInfo],
                       added: &[PendingBlockInfo],
                       modified: &[PendingBlockInfo]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|p| StagedOp::DelPending(p.block_id))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|p| StagedOp::PutPending(p.clone())));
        self.stage(ops)
    }
}

impl LeaseAccess for MemoryStore {
    fn lease_by_holder(&self, holder: &str) -> Result<Option<Lease>> {
        self.fetch(T_LEASE, holder.to_owned(), |t| {
            t.leases.get(holder).cloned()
        })
    }

    fn lease_by_holder_id(&self, holder_id: HolderId)
                          -> Result<Option<Lease>> {
        let found = self.scan(T_LEASE, |t| {
            t.leases
                .values()
                .filter(|l| l.holder_id == holder_id)
                .map(|l| (l.holder.clone(), l.clone()))
                .collect()
        })?;
        Ok(found.into_iter().next())
    }

    fn all_leases(&self) -> Result<Vec<Lease>> {
        self.scan(T_LEASE, |t| {
            t.leases
                .values()
                .map(|l| (l.holder.clone(), l.clone()))
                .collect()
        })
    }

    fn prepare_leases(&self, removed: &[Lease], added: &[Lease],
                      modified: &[Lease]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|l| StagedOp::DelLease(l.holder.clone()))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|l| StagedOp::PutLease(l.clone())));
        self.stage(ops)
    }
}

impl LeasePathAccess for MemoryStore {
    fn lease_path(&self, path: &str) -> Result<Option<LeasePath>> {
        self.fetch(T_LEASE_PATH, path.to_owned(), |t| {
            t.lease_paths.get(path).cloned()
        })
    }

    fn lease_paths_by_holder_id(&self, holder_id: HolderId)
                                -> Result<Vec<LeasePath>> {
        let mut paths = self.scan(T_LEASE_PATH, |t| {
            t.lease_paths
                .values()
                .filter(|lp| lp.holder_id == holder_id)
                .map(|lp| (lp.path.clone(), lp.clone()))
                .collect()
        })?;
        paths.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(paths)
    }

    fn prepare_lease_paths(&self, removed: &[LeasePath],
                           added: &[LeasePath]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|lp| StagedOp::DelLeasePath(lp.path.clone()))
            .collect();
        ops.extend(added.iter().map(|lp| StagedOp::PutLeasePath(lp.clone())));
        self.stage(ops)
    }
}

impl BlockKeyAccess for MemoryStore {
    fn key_by_id(&self, key_id: KeyId) -> Result<Option<BlockKey>> {
        self.fetch(T_KEY, key_id.to_string(), |t| {
            t.keys.get(&key_id).cloned()
        })
    }

    fn key_by_type(&self, key_type: KeyType) -> Result<Option<BlockKey>> {
        let found = self.scan(T_KEY, |t| {
            t.keys
                .values()
                .filter(|k| k.key_type == key_type)
                .map(|k| (k.key_id.to_string(), k.clone()))
                .collect()
        })?;
        Ok(found.into_iter().next())
    }

    fn all_keys(&self) -> Result<Vec<BlockKey>> {
        self.scan(T_KEY, |t| {
            t.keys
                .values()
                .map(|k| (k.key_id.to_string(), k.clone()))
                .collect()
        })
    }

    fn prepare_keys(&self, removed: &[BlockKey], added: &[BlockKey],
                    modified: &[BlockKey]) -> Result<()> {
        let mut ops: Vec<StagedOp> = removed
            .iter()
            .map(|k| StagedOp::DelKey(k.key_id))
            .collect();
        ops.extend(added.iter().chain(modified)
                   .map(|k| StagedOp::PutKey(k.clone())));
        self.stage(ops)
    }
}
