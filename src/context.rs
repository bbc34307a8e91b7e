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

//! The per-operation view of the store: finds go through a transaction-local
//! cache that reflects uncommitted adds, updates, and removes, and all net
//! changes are flushed in one batch per entity when the operation commits.
//!
//! A context lives exactly as long as one logical operation; nothing here
//! survives across transactions, which is what keeps several namenodes
//! coherent against the shared store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::defs::*;
use crate::errors::*;
use crate::model::*;
use crate::storage::*;

pub struct TransactionContext {
    storage: Arc<dyn Storage>,

    // Read caches for the lookups path resolution repeats. The value is
    // what the storage answered, including definite misses.
    inodes_by_id: HashMap<InodeId, Option<Inode>>,
    inodes_by_np: HashMap<(InodeId, String), Option<Inode>>,
    blocks_by_id: HashMap<BlockId, Option<BlockInfo>>,
    leases_by_holder: HashMap<String, Option<Lease>>,
    keys_by_id: HashMap<KeyId, Option<BlockKey>>,

    added_inodes: HashMap<InodeId, Inode>,
    modified_inodes: HashMap<InodeId, Inode>,
    removed_inodes: HashMap<InodeId, Inode>,

    added_blocks: HashMap<BlockId, BlockInfo>,
    modified_blocks: HashMap<BlockId, BlockInfo>,
    removed_blocks: HashMap<BlockId, BlockInfo>,

    added_replicas: HashMap<(BlockId, String), IndexedReplica>,
    modified_replicas: HashMap<(BlockId, String), IndexedReplica>,
    removed_replicas: HashMap<(BlockId, String), IndexedReplica>,

    added_corrupt: HashMap<(BlockId, String), CorruptReplica>,
    removed_corrupt: HashMap<(BlockId, String), CorruptReplica>,

    added_excess: HashMap<(BlockId, String), ExcessReplica>,
    removed_excess: HashMap<(BlockId, String), ExcessReplica>,

    added_ruc: HashMap<(BlockId, String), ReplicaUnderConstruction>,
    removed_ruc: HashMap<(BlockId, String), ReplicaUnderConstruction>,

    added_invalidated: HashMap<(BlockId, String), InvalidatedBlock>,
    removed_invalidated: HashMap<(BlockId, String), InvalidatedBlock>,

    added_urb: HashMap<BlockId, UnderReplicatedBlock>,
    modified_urb: HashMap<BlockId, UnderReplicatedBlock>,
    removed_urb: HashMap<BlockId, UnderReplicatedBlock>,

    added_pending: HashMap<BlockId, PendingBlockInfo>,
    modified_pending: HashMap<BlockId, PendingBlockInfo>,
    removed_pending: HashMap<BlockId, PendingBlockInfo>,

    added_leases: HashMap<String, Lease>,
    modified_leases: HashMap<String, Lease>,
    removed_leases: HashMap<String, Lease>,

    added_lease_paths: HashMap<String, LeasePath>,
    removed_lease_paths: HashMap<String, LeasePath>,

    added_keys: HashMap<KeyId, BlockKey>,
    modified_keys: HashMap<KeyId, BlockKey>,
    removed_keys: HashMap<KeyId, BlockKey>,
}

impl TransactionContext {
    /// Opens a transaction on the calling thread's session and wraps it in a
    /// fresh, empty context.
    pub fn begin(storage: Arc<dyn Storage>) -> Result<Self> {
        storage.begin_transaction()?;
        Ok(TransactionContext::empty_parts(storage))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Subsequent finds acquire exclusive locks.
    pub fn write_lock(&mut self) -> Result<()> {
        self.storage.set_lock_mode(LockMode::Write)
    }

    /// Subsequent finds acquire shared locks.
    pub fn read_lock(&mut self) -> Result<()> {
        self.storage.set_lock_mode(LockMode::Read)
    }

    /// Subsequent finds take no locks and see the latest committed values.
    pub fn read_committed(&mut self) -> Result<()> {
        self.storage.set_lock_mode(LockMode::ReadCommitted)
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) -> Result<()> {
        self.storage.set_lock_mode(mode)
    }

    /// Drops every cached read *and* staged change.
    ///
    /// This exists for the speculative phase of lock acquisition: an
    /// optimistic read-committed resolution must not satisfy the later,
    /// properly locked resolution from cache. It is only sound before the
    /// operation body has staged any mutation.
    pub fn clear_cache(&mut self) {
        *self = TransactionContext::empty_parts(Arc::clone(&self.storage));
    }

    fn empty_parts(storage: Arc<dyn Storage>) -> TransactionContext {
        TransactionContext {
            storage,
            inodes_by_id: HashMap::new(),
            inodes_by_np: HashMap::new(),
            blocks_by_id: HashMap::new(),
            leases_by_holder: HashMap::new(),
            keys_by_id: HashMap::new(),
            added_inodes: HashMap::new(),
            modified_inodes: HashMap::new(),
            removed_inodes: HashMap::new(),
            added_blocks: HashMap::new(),
            modified_blocks: HashMap::new(),
            removed_blocks: HashMap::new(),
            added_replicas: HashMap::new(),
            modified_replicas: HashMap::new(),
            removed_replicas: HashMap::new(),
            added_corrupt: HashMap::new(),
            removed_corrupt: HashMap::new(),
            added_excess: HashMap::new(),
            removed_excess: HashMap::new(),
            added_ruc: HashMap::new(),
            removed_ruc: HashMap::new(),
            added_invalidated: HashMap::new(),
            removed_invalidated: HashMap::new(),
            added_urb: HashMap::new(),
            modified_urb: HashMap::new(),
            removed_urb: HashMap::new(),
            added_pending: HashMap::new(),
            modified_pending: HashMap::new(),
            removed_pending: HashMap::new(),
            added_leases: HashMap::new(),
            modified_leases: HashMap::new(),
            removed_leases: HashMap::new(),
            added_lease_paths: HashMap::new(),
            removed_lease_paths: HashMap::new(),
            added_keys: HashMap::new(),
            modified_keys: HashMap::new(),
            removed_keys: HashMap::new(),
        }
    }

    /// Flushes every entity's net change through its repository and commits
    /// the storage transaction. On any failure the transaction is rolled
    /// back instead.
    pub fn commit(self) -> Result<()> {
        fn values<K, V: Clone>(m: &HashMap<K, V>) -> Vec<V> {
            m.values().cloned().collect()
        }

        let result = (|| -> Result<()> {
            let s = &self.storage;
            s.prepare_inodes(
                &values(&self.removed_inodes),
                &values(&self.added_inodes),
                &values(&self.modified_inodes),
            )?;
            s.prepare_blocks(
                &values(&self.removed_blocks),
                &values(&self.added_blocks),
                &values(&self.modified_blocks),
            )?;
            s.prepare_replicas(
                &values(&self.removed_replicas),
                &values(&self.added_replicas),
                &values(&self.modified_replicas),
            )?;
            s.prepare_corrupt_replicas(
                &values(&self.removed_corrupt),
                &values(&self.added_corrupt),
            )?;
            s.prepare_excess_replicas(
                &values(&self.removed_excess),
                &values(&self.added_excess),
            )?;
            s.prepare_replicas_uc(
                &values(&self.removed_ruc),
                &values(&self.added_ruc),
            )?;
            s.prepare_invalidated(
                &values(&self.removed_invalidated),
                &values(&self.added_invalidated),
            )?;
            s.prepare_under_replicated(
                &values(&self.removed_urb),
                &values(&self.added_urb),
                &values(&self.modified_urb),
            )?;
            s.prepare_pending(
                &values(&self.removed_pending),
                &values(&self.added_pending),
                &values(&self.modified_pending),
            )?;
            s.prepare_leases(
                &values(&self.removed_leases),
                &values(&self.added_leases),
                &values(&self.modified_leases),
            )?;
            s.prepare_lease_paths(
                &values(&self.removed_lease_paths),
                &values(&self.added_lease_paths),
            )?;
            s.prepare_keys(
                &values(&self.removed_keys),
                &values(&self.added_keys),
                &values(&self.modified_keys),
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => self.storage.commit(),
            Err(e) => {
                let _ = self.storage.rollback();
                Err(e)
            }
        }
    }

    pub fn rollback(self) -> Result<()> {
        self.storage.rollback()
    }

    // ---- inodes ----

    pub fn find_inode_by_id(&mut self, id: InodeId) -> Result<Option<Inode>> {
        if self.removed_inodes.contains_key(&id) {
            return Ok(None);
        }
        if let Some(i) = self
            .added_inodes
            .get(&id)
            .or_else(|| self.modified_inodes.get(&id))
        {
            return Ok(Some(i.clone()));
        }
        if let Some(cached) = self.inodes_by_id.get(&id) {
            return Ok(cached.clone());
        }

        let found = self.storage.inode_by_id(id)?;
        self.inodes_by_id.insert(id, found.clone());
        if let Some(ref i) = found {
            self.inodes_by_np
                .insert((i.parent_id, i.name.clone()), Some(i.clone()));
        }
        Ok(found)
    }

    pub fn find_inode_by_name_parent(
        &mut self,
        name: &str,
        parent_id: InodeId,
    ) -> Result<Option<Inode>> {
        if self
            .removed_inodes
            .values()
            .any(|i| i.parent_id == parent_id && i.name == name)
        {
            return Ok(None);
        }
        if let Some(i) = self
            .added_inodes
            .values()
            .chain(self.modified_inodes.values())
            .find(|i| i.parent_id == parent_id && i.name == name)
        {
            return Ok(Some(i.clone()));
        }

        let key = (parent_id, name.to_owned());
        if let Some(cached) = self.inodes_by_np.get(&key) {
            return Ok(cached.clone());
        }

        let found = self.storage.inode_by_name_parent(name, parent_id)?;
        if let Some(ref i) = found {
            self.inodes_by_id.insert(i.id, Some(i.clone()));
        }
        self.inodes_by_np.insert(key, found.clone());
        Ok(found)
    }

    /// Direct children of `parent_id`, merged with this transaction's
    /// uncommitted changes and sorted by name.
    pub fn find_inodes_by_parent(&mut self, parent_id: InodeId)
                                 -> Result<Vec<Inode>> {
        let mut children: Vec<Inode> = self
            .storage
            .inodes_by_parent(parent_id)?
            .into_iter()
            .filter(|i| !self.removed_inodes.contains_key(&i.id))
            .filter(|i| !self.added_inodes.contains_key(&i.id))
            .map(|i| match self.modified_inodes.get(&i.id) {
                Some(m) => m.clone(),
                None => i,
            })
            .collect();
        children.extend(
            self.added_inodes
                .values()
                .filter(|i| i.parent_id == parent_id)
                .cloned(),
        );
        for child in &children {
            self.inodes_by_id.insert(child.id, Some(child.clone()));
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    pub fn add_inode(&mut self, inode: Inode) -> Result<()> {
        if self.removed_inodes.remove(&inode.id).is_some() {
            return self.update_inode(inode);
        }
        self.inodes_by_id.insert(inode.id, Some(inode.clone()));
        self.inodes_by_np
            .insert((inode.parent_id, inode.name.clone()),
                    Some(inode.clone()));
        self.added_inodes.insert(inode.id, inode);
        Ok(())
    }

    pub fn update_inode(&mut self, inode: Inode) -> Result<()> {
        if self.removed_inodes.contains_key(&inode.id) {
            return Err(ErrorKind::InvariantViolation(format!(
                "removed inode {} passed to be persisted",
                inode.id
            ))
            .into());
        }
        self.inodes_by_id.insert(inode.id, Some(inode.clone()));
        self.inodes_by_np
            .insert((inode.parent_id, inode.name.clone()),
                    Some(inode.clone()));
        if self.added_inodes.contains_key(&inode.id) {
            self.added_inodes.insert(inode.id, inode);
        } else {
            self.modified_inodes.insert(inode.id, inode);
        }
        Ok(())
    }

    pub fn remove_inode(&mut self, inode: Inode) {
        self.inodes_by_id.insert(inode.id, None);
        self.inodes_by_np
            .insert((inode.parent_id, inode.name.clone()), None);
        let was_added = self.added_inodes.remove(&inode.id).is_some();
        self.modified_inodes.remove(&inode.id);
        if !was_added {
            self.removed_inodes.insert(inode.id, inode);
        }
    }

    // ---- blocks ----

    pub fn find_block_by_id(&mut self, id: BlockId)
                            -> Result<Option<BlockInfo>> {
        if self.removed_blocks.contains_key(&id) {
            return Ok(None);
        }
        if let Some(b) = self
            .added_blocks
            .get(&id)
            .or_else(|| self.modified_blocks.get(&id))
        {
            return Ok(Some(b.clone()));
        }
        if let Some(cached) = self.blocks_by_id.get(&id) {
            return Ok(cached.clone());
        }

        let found = self.storage.block_by_id(id)?;
        self.blocks_by_id.insert(id, found.clone());
        Ok(found)
    }

    /// The file's blocks merged with this transaction's uncommitted changes,
    /// ordered by block index.
    pub fn find_blocks_by_inode(&mut self, inode_id: InodeId)
                                -> Result<Vec<BlockInfo>> {
        let mut blocks: Vec<BlockInfo> = self
            .storage
            .blocks_by_inode(inode_id)?
            .into_iter()
            .filter(|b| !self.removed_blocks.contains_key(&b.block_id))
            .filter(|b| !self.added_blocks.contains_key(&b.block_id))
            .map(|b| match self.modified_blocks.get(&b.block_id) {
                Some(m) => m.clone(),
                None => b,
            })
            .collect();
        blocks.extend(
            self.added_blocks
                .values()
                .filter(|b| b.inode_id == inode_id)
                .cloned(),
        );
        for block in &blocks {
            self.blocks_by_id.insert(block.block_id, Some(block.clone()));
        }
        blocks.sort_by_key(|b| b.block_index);
        Ok(blocks)
    }

    pub fn add_block(&mut self, block: BlockInfo) {
        self.blocks_by_id.insert(block.block_id, Some(block.clone()));
        self.removed_blocks.remove(&block.block_id);
        self.added_blocks.insert(block.block_id, block);
    }

    pub fn update_block(&mut self, block: BlockInfo) {
        self.blocks_by_id.insert(block.block_id, Some(block.clone()));
        if self.added_blocks.contains_key(&block.block_id) {
            self.added_blocks.insert(block.block_id, block);
        } else {
            self.modified_blocks.insert(block.block_id, block);
        }
    }

    pub fn remove_block(&mut self, block: BlockInfo) {
        self.blocks_by_id.insert(block.block_id, None);
        let was_added = self.added_blocks.remove(&block.block_id).is_some();
        self.modified_blocks.remove(&block.block_id);
        if !was_added {
            self.removed_blocks.insert(block.block_id, block);
        }
    }

    // ---- replica family ----

    pub fn find_replicas_by_block(&mut self, block_id: BlockId)
                                  -> Result<Vec<IndexedReplica>> {
        let mut replicas: Vec<IndexedReplica> = self
            .storage
            .replicas_by_block(block_id)?
            .into_iter()
            .filter(|r| {
                let k = (r.block_id, r.storage_id.clone());
                !self.removed_replicas.contains_key(&k)
                    && !self.added_replicas.contains_key(&k)
            })
            .map(|r| {
                let k = (r.block_id, r.storage_id.clone());
                match self.modified_replicas.get(&k) {
                    Some(m) => m.clone(),
                    None => r,
                }
            })
            .collect();
        replicas.extend(
            self.added_replicas
                .values()
                .filter(|r| r.block_id == block_id)
                .cloned(),
        );
        Ok(replicas)
    }

    pub fn add_replica(&mut self, r: IndexedReplica) {
        let k = (r.block_id, r.storage_id.clone());
        self.removed_replicas.remove(&k);
        self.added_replicas.insert(k, r);
    }

    pub fn update_replica(&mut self, r: IndexedReplica) {
        let k = (r.block_id, r.storage_id.clone());
        if self.added_replicas.contains_key(&k) {
            self.added_replicas.insert(k, r);
        } else {
            self.modified_replicas.insert(k, r);
        }
    }

    pub fn remove_replica(&mut self, r: IndexedReplica) {
        let k = (r.block_id, r.storage_id.clone());
        let was_added = self.added_replicas.remove(&k).is_some();
        self.modified_replicas.remove(&k);
        if !was_added {
            self.removed_replicas.insert(k, r);
        }
    }

    pub fn find_corrupt_by_block(&mut self, block_id: BlockId)
                                 -> Result<Vec<CorruptReplica>> {
        let mut rows: Vec<CorruptReplica> = self
            .storage
            .corrupt_replicas_by_block(block_id)?
            .into_iter()
            .filter(|r| {
                let k = (r.block_id, r.storage_id.clone());
                !self.removed_corrupt.contains_key(&k)
                    && !self.added_corrupt.contains_key(&k)
            })
            .collect();
        rows.extend(
            self.added_corrupt
                .values()
                .filter(|r| r.block_id == block_id)
                .cloned(),
        );
        Ok(rows)
    }

    pub fn add_corrupt(&mut self, r: CorruptReplica) {
        let k = (r.block_id, r.storage_id.clone());
        self.removed_corrupt.remove(&k);
        self.added_corrupt.insert(k, r);
    }

    pub fn remove_corrupt(&mut self, r: CorruptReplica) {
        let k = (r.block_id, r.storage_id.clone());
        if self.added_corrupt.remove(&k).is_none() {
            self.removed_corrupt.insert(k, r);
        }
    }

    pub fn find_excess_by_block(&mut self, block_id: BlockId)
                                -> Result<Vec<ExcessReplica>> {
        let mut rows: Vec<ExcessReplica> = self
            .storage
            .excess_replicas_by_block(block_id)?
            .into_iter()
            .filter(|r| {
                let k = (r.block_id, r.storage_id.clone());
                !self.removed_excess.contains_key(&k)
                    && !self.added_excess.contains_key(&k)
            })
            .collect();
        rows.extend(
            self.added_excess
                .values()
                .filter(|r| r.block_id == block_id)
                .cloned(),
        );
        Ok(rows)
    }

    pub fn add_excess(&mut self, r: ExcessReplica) {
        let k = (r.block_id, r.storage_id.clone());
        self.removed_excess.remove(&k);
        self.added_excess.insert(k, r);
    }

    pub fn remove_excess(&mut self, r: ExcessReplica) {
        let k = (r.block_id, r.storage_id.clone());
        if self.added_excess.remove(&k).is_none() {
            self.removed_excess.insert(k, r);
        }
    }

    pub fn find_ruc_by_block(&mut self, block_id: BlockId)
                             -> Result<Vec<ReplicaUnderConstruction>> {
        let mut rows: Vec<ReplicaUnderConstruction> = self
            .storage
            .replicas_uc_by_block(block_id)?
            .into_iter()
            .filter(|r| {
                let k = (r.block_id, r.storage_id.clone());
                !self.removed_ruc.contains_key(&k)
                    && !self.added_ruc.contains_key(&k)
            })
            .collect();
        rows.extend(
            self.added_ruc
                .values()
                .filter(|r| r.block_id == block_id)
                .cloned(),
        );
        Ok(rows)
    }

    pub fn add_ruc(&mut self, r: ReplicaUnderConstruction) {
        let k = (r.block_id, r.storage_id.clone());
        self.removed_ruc.remove(&k);
        self.added_ruc.insert(k, r);
    }

    pub fn remove_ruc(&mut self, r: ReplicaUnderConstruction) {
        let k = (r.block_id, r.storage_id.clone());
        if self.added_ruc.remove(&k).is_none() {
            self.removed_ruc.insert(k, r);
        }
    }

    pub fn find_invalidated_by_block(&mut self, block_id: BlockId)
                                     -> Result<Vec<InvalidatedBlock>> {
        let mut rows: Vec<InvalidatedBlock> = self
            .storage
            .invalidated_by_block(block_id)?
            .into_iter()
            .filter(|r| {
                let k = (r.block_id, r.storage_id.clone());
                !self.removed_invalidated.contains_key(&k)
                    && !self.added_invalidated.contains_key(&k)
            })
            .collect();
        rows.extend(
            self.added_invalidated
                .values()
                .filter(|r| r.block_id == block_id)
                .cloned(),
        );
        Ok(rows)
    }

    pub fn add_invalidated(&mut self, r: InvalidatedBlock) {
        let k = (r.block_id, r.storage_id.clone());
        self.removed_invalidated.remove(&k);
        self.added_invalidated.insert(k, r);
    }

    pub fn remove_invalidated(&mut self, r: InvalidatedBlock) {
        let k = (r.block_id, r.storage_id.clone());
        if self.added_invalidated.remove(&k).is_none() {
            self.removed_invalidated.insert(k, r);
        }
    }

    // ---- replication queues ----

    pub fn find_under_replicated(&mut self, block_id: BlockId)
                                 -> Result<Option<UnderReplicatedBlock>> {
        if self.removed_urb.contains_key(&block_id) {
            return Ok(None);
        }
        if let Some(u) = self
            .added_urb
            .get(&block_id)
            .or_else(|| self.modified_urb.get(&block_id))
        {
            return Ok(Some(u.clone()));
        }
        self.storage.under_replicated_by_block(block_id)
    }

    pub fn add_under_replicated(&mut self, u: UnderReplicatedBlock) {
        self.removed_urb.remove(&u.block_id);
        self.added_urb.insert(u.block_id, u);
    }

    pub fn update_under_replicated(&mut self, u: UnderReplicatedBlock) {
        if self.added_urb.contains_key(&u.block_id) {
            self.added_urb.insert(u.block_id, u);
        } else {
            self.modified_urb.insert(u.block_id, u);
        }
    }

    pub fn remove_under_replicated(&mut self, u: UnderReplicatedBlock) {
        if self.added_urb.remove(&u.block_id).is_none() {
            self.modified_urb.remove(&u.block_id);
            self.removed_urb.insert(u.block_id, u);
        }
    }

    pub fn find_pending(&mut self, block_id: BlockId)
                        -> Result<Option<PendingBlockInfo>> {
        if self.removed_pending.contains_key(&block_id) {
            return Ok(None);
        }
        if let Some(p) = self
            .added_pending
            .get(&block_id)
            .or_else(|| self.modified_pending.get(&block_id))
        {
            return Ok(Some(p.clone()));
        }
        self.storage.pending_by_block(block_id)
    }

    pub fn add_pending(&mut self, p: PendingBlockInfo) {
        self.removed_pending.remove(&p.block_id);
        self.added_pending.insert(p.block_id, p);
    }

    pub fn remove_pending(&mut self, p: PendingBlockInfo) {
        if self.added_pending.remove(&p.block_id).is_none() {
            self.modified_pending.remove(&p.block_id);
            self.removed_pending.insert(p.block_id, p);
        }
    }

    // ---- leases ----

    pub fn find_lease_by_holder(&mut self, holder: &str)
                                -> Result<Option<Lease>> {
        if self.removed_leases.contains_key(holder) {
            return Ok(None);
        }
        if let Some(l) = self
            .added_leases
            .get(holder)
            .or_else(|| self.modified_leases.get(holder))
        {
            return Ok(Some(l.clone()));
        }
        if let Some(cached) = self.leases_by_holder.get(holder) {
            return Ok(cached.clone());
        }

        let found = self.storage.lease_by_holder(holder)?;
        self.leases_by_holder.insert(holder.to_owned(), found.clone());
        Ok(found)
    }

    pub fn add_lease(&mut self, lease: Lease) {
        self.leases_by_holder
            .insert(lease.holder.clone(), Some(lease.clone()));
        self.removed_leases.remove(&lease.holder);
        self.added_leases.insert(lease.holder.clone(), lease);
    }

    pub fn update_lease(&mut self, lease: Lease) {
        self.leases_by_holder
            .insert(lease.holder.clone(), Some(lease.clone()));
        if self.added_leases.contains_key(&lease.holder) {
            self.added_leases.insert(lease.holder.clone(), lease);
        } else {
            self.modified_leases.insert(lease.holder.clone(), lease);
        }
    }

    pub fn remove_lease(&mut self, lease: Lease) {
        self.leases_by_holder.insert(lease.holder.clone(), None);
        let was_added = self.added_leases.remove(&lease.holder).is_some();
        self.modified_leases.remove(&lease.holder);
        if !was_added {
            self.removed_leases.insert(lease.holder.clone(), lease);
        }
    }

    /// The holder's lease paths merged with uncommitted changes, sorted by
    /// path.
    pub fn find_lease_paths_by_holder_id(&mut self, holder_id: HolderId)
                                         -> Result<Vec<LeasePath>> {
        let mut paths: Vec<LeasePath> = self
            .storage
            .lease_paths_by_holder_id(holder_id)?
            .into_iter()
            .filter(|lp| {
                !self.removed_lease_paths.contains_key(&lp.path)
                    && !self.added_lease_paths.contains_key(&lp.path)
            })
            .collect();
        paths.extend(
            self.added_lease_paths
                .values()
                .filter(|lp| lp.holder_id == holder_id)
                .cloned(),
        );
        paths.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(paths)
    }

    pub fn add_lease_path(&mut self, lp: LeasePath) {
        self.removed_lease_paths.remove(&lp.path);
        self.added_lease_paths.insert(lp.path.clone(), lp);
    }

    pub fn remove_lease_path(&mut self, lp: LeasePath) {
        if self.added_lease_paths.remove(&lp.path).is_none() {
            self.removed_lease_paths.insert(lp.path.clone(), lp);
        }
    }

    // ---- block keys ----

    pub fn find_key_by_id(&mut self, key_id: KeyId)
                          -> Result<Option<BlockKey>> {
        if self.removed_keys.contains_key(&key_id) {
            return Ok(None);
        }
        if let Some(k) = self
            .added_keys
            .get(&key_id)
            .or_else(|| self.modified_keys.get(&key_id))
        {
            return Ok(Some(k.clone()));
        }
        if let Some(cached) = self.keys_by_id.get(&key_id) {
            return Ok(cached.clone());
        }

        let found = self.storage.key_by_id(key_id)?;
        self.keys_by_id.insert(key_id, found.clone());
        Ok(found)
    }

    pub fn find_key_by_type(&mut self, key_type: KeyType)
                            -> Result<Option<BlockKey>> {
        if let Some(k) = self
            .added_keys
            .values()
            .chain(self.modified_keys.values())
            .find(|k| k.key_type == key_type)
        {
            return Ok(Some(k.clone()));
        }

        // A stored row whose type was changed in this transaction no longer
        // counts for its old type.
        match self.storage.key_by_type(key_type)? {
            Some(k)
                if !self.removed_keys.contains_key(&k.key_id)
                    && !self.modified_keys.contains_key(&k.key_id) =>
            {
                Ok(Some(k))
            }
            _ => Ok(None),
        }
    }

    pub fn find_all_keys(&mut self) -> Result<Vec<BlockKey>> {
        let mut keys: Vec<BlockKey> = self
            .storage
            .all_keys()?
            .into_iter()
            .filter(|k| {
                !self.removed_keys.contains_key(&k.key_id)
                    && !self.added_keys.contains_key(&k.key_id)
            })
            .map(|k| match self.modified_keys.get(&k.key_id) {
                Some(m) => m.clone(),
                None => k,
            })
            .collect();
        keys.extend(self.added_keys.values().cloned());
        keys.sort_by_key(|k| k.key_id);
        Ok(keys)
    }

    pub fn add_key(&mut self, key: BlockKey) {
        self.keys_by_id.insert(key.key_id, Some(key.clone()));
        self.removed_keys.remove(&key.key_id);
        self.added_keys.insert(key.key_id, key);
    }

    pub fn update_key(&mut self, key: BlockKey) {
        self.keys_by_id.insert(key.key_id, Some(key.clone()));
        if self.added_keys.contains_key(&key.key_id) {
            self.added_keys.insert(key.key_id, key);
        } else {
            self.modified_keys.insert(key.key_id, key);
        }
    }

    pub fn remove_key(&mut self, key: BlockKey) {
        self.keys_by_id.insert(key.key_id, None);
        let was_added = self.added_keys.remove(&key.key_id).is_some();
        self.modified_keys.remove(&key.key_id);
        if !was_added {
            self.removed_keys.insert(key.key_id, key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStore;

    fn ctx() -> TransactionContext {
        TransactionContext::begin(Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn uncommitted_add_visible_through_finds() {
        let mut ctx = ctx();
        ctx.add_inode(Inode::directory(5, "d", ROOT_INODE_ID)).unwrap();

        assert!(ctx.find_inode_by_id(5).unwrap().is_some());
        assert!(ctx.find_inode_by_name_parent("d", ROOT_INODE_ID)
            .unwrap()
            .is_some());
        assert_eq!(1, ctx.find_inodes_by_parent(ROOT_INODE_ID).unwrap().len());

        // Not in the store until commit.
        assert!(ctx.storage().inode_by_id(5).unwrap().is_none());
        ctx.commit().unwrap();
    }

    #[test]
    fn committed_changes_land_in_storage() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        ctx.add_inode(Inode::directory(5, "d", ROOT_INODE_ID)).unwrap();
        ctx.add_block(BlockInfo::new(100, 5, 0));
        ctx.commit().unwrap();

        assert!(storage.inode_by_id(5).unwrap().is_some());
        assert_eq!(1, storage.blocks_by_inode(5).unwrap().len());
    }

    #[test]
    fn removed_entity_hidden_before_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        let inode = Inode::directory(5, "d", ROOT_INODE_ID);
        ctx.add_inode(inode.clone()).unwrap();
        ctx.commit().unwrap();

        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        ctx.remove_inode(inode);
        assert!(ctx.find_inode_by_id(5).unwrap().is_none());
        assert!(ctx.find_inode_by_name_parent("d", ROOT_INODE_ID)
            .unwrap()
            .is_none());
        // Still committed in the store until this transaction lands.
        assert!(storage.inode_by_id(5).unwrap().is_some());
        ctx.commit().unwrap();
        assert!(storage.inode_by_id(5).unwrap().is_none());
    }

    #[test]
    fn update_of_removed_inode_is_rejected() {
        let mut ctx = ctx();
        let inode = Inode::directory(5, "d", ROOT_INODE_ID);
        ctx.remove_inode(inode.clone());
        assert!(ctx.update_inode(inode).is_err());
        ctx.rollback().unwrap();
    }

    #[test]
    fn clear_cache_forces_storage_reads() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        {
            let mut ctx =
                TransactionContext::begin(Arc::clone(&storage)).unwrap();
            ctx.add_inode(Inode::directory(5, "d", ROOT_INODE_ID)).unwrap();
            ctx.commit().unwrap();
        }

        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        ctx.read_committed().unwrap();
        assert!(ctx.find_inode_by_id(5).unwrap().is_some());

        // Delete behind the context's back, as another namenode would.
        // Sessions are per thread, so the interfering writer needs its own.
        {
            let storage = Arc::clone(&storage);
            std::thread::spawn(move || {
                storage.begin_transaction().unwrap();
                storage
                    .prepare_inodes(
                        &[Inode::directory(5, "d", ROOT_INODE_ID)],
                        &[],
                        &[],
                    )
                    .unwrap();
                storage.commit().unwrap();
            })
            .join()
            .unwrap();
        }

        // Cache still answers; after clearing, the truth shows through.
        assert!(ctx.find_inode_by_id(5).unwrap().is_some());
        ctx.clear_cache();
        assert!(ctx.find_inode_by_id(5).unwrap().is_none());
        ctx.rollback().unwrap();
    }

    #[test]
    fn key_type_find_sees_in_tx_rotation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        ctx.add_key(BlockKey {
            key_id: 1,
            expiry_date: 100,
            key_type: KeyType::Current,
            key: vec![1; 32],
        });
        ctx.commit().unwrap();

        let mut ctx = TransactionContext::begin(Arc::clone(&storage)).unwrap();
        let mut retired = ctx.find_key_by_type(KeyType::Current)
            .unwrap()
            .unwrap();
        retired.key_type = KeyType::Simple;
        ctx.update_key(retired);
        ctx.add_key(BlockKey {
            key_id: 2,
            expiry_date: 200,
            key_type: KeyType::Current,
            key: vec![2; 32],
        });

        // The demoted key must no longer answer for Current; the new one
        // must, even before commit.
        assert_eq!(
            Some(2),
            ctx.find_key_by_type(KeyType::Current)
                .unwrap()
                .map(|k| k.key_id)
        );
        ctx.commit().unwrap();
        assert_eq!(
            Some(2),
            storage.key_by_type(KeyType::Current).unwrap().map(|k| k.key_id)
        );
        assert_eq!(
            Some(KeyType::Simple),
            storage.key_by_id(1).unwrap().map(|k| k.key_type)
        );
    }
}
