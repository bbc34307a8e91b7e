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

mod embedded;
mod memory;
#[cfg(test)]
mod storage_tests;

use std::sync::Arc;

use crate::defs::*;
use crate::errors::*;
use crate::model::*;

pub use self::embedded::SqliteStore;
pub use self::memory::MemoryStore;

/// Strength requested for the rows touched by subsequent repository calls on
/// the calling thread's session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive lock.
    Write,
    /// Shared lock.
    Read,
    /// No lock; reads the latest committed value. Used for optimistic
    /// pre-checks that are re-verified under a real lock.
    ReadCommitted,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::ReadCommitted
    }
}

/// Session and transaction contract of a storage backend.
///
/// Sessions are per thread: each calling thread gets its own lazily-opened
/// session, reused across operations on that thread and never shared.
/// `set_lock_mode` records the strength that finds on this thread's session
/// acquire until the mode is changed again; a transaction ends by `commit`
/// or `rollback`, either of which releases every lock the session holds.
pub trait Connector: Send + Sync {
    fn begin_transaction(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn transaction_active(&self) -> bool;
    fn set_lock_mode(&self, mode: LockMode) -> Result<()>;

    /// Creates the persisted layout (or wipes it back to empty) and installs
    /// the root directory.
    fn format(&self) -> Result<()>;

    /// Releases whatever the backend holds; the storage must not be used
    /// afterwards.
    fn shutdown(&self);
}

/// Repository for `Inode` rows.
pub trait InodeAccess {
    fn inode_by_id(&self, id: InodeId) -> Result<Option<Inode>>;
    fn inode_by_name_parent(&self, name: &str, parent_id: InodeId)
                            -> Result<Option<Inode>>;
    /// All direct children of `parent_id`, sorted by name.
    fn inodes_by_parent(&self, parent_id: InodeId) -> Result<Vec<Inode>>;
    fn prepare_inodes(&self, removed: &[Inode], added: &[Inode],
                      modified: &[Inode]) -> Result<()>;
}

/// Repository for `BlockInfo` rows.
pub trait BlockInfoAccess {
    fn block_by_id(&self, id: BlockId) -> Result<Option<BlockInfo>>;
    /// All blocks of the file `inode_id`, ordered by block index.
    fn blocks_by_inode(&self, inode_id: InodeId) -> Result<Vec<BlockInfo>>;
    fn prepare_blocks(&self, removed: &[BlockInfo], added: &[BlockInfo],
                      modified: &[BlockInfo]) -> Result<()>;
}

pub trait ReplicaAccess {
    fn replicas_by_block(&self, block_id: BlockId)
                         -> Result<Vec<IndexedReplica>>;
    fn prepare_replicas(&self, removed: &[IndexedReplica],
                        added: &[IndexedReplica],
                        modified: &[IndexedReplica]) -> Result<()>;
}

pub trait CorruptReplicaAccess {
    fn corrupt_replicas_by_block(&self, block_id: BlockId)
                                 -> Result<Vec<CorruptReplica>>;
    fn prepare_corrupt_replicas(&self, removed: &[CorruptReplica],
                                added: &[CorruptReplica]) -> Result<()>;
}

pub trait ExcessReplicaAccess {
    fn excess_replicas_by_block(&self, block_id: BlockId)
                                -> Result<Vec<ExcessReplica>>;
    fn prepare_excess_replicas(&self, removed: &[ExcessReplica],
                               added: &[ExcessReplica]) -> Result<()>;
}

pub trait ReplicaUcAccess {
    fn replicas_uc_by_block(&self, block_id: BlockId)
                            -> Result<Vec<ReplicaUnderConstruction>>;
    fn prepare_replicas_uc(&self, removed: &[ReplicaUnderConstruction],
                           added: &[ReplicaUnderConstruction]) -> Result<()>;
}

pub trait InvalidatedBlockAccess {
    fn invalidated_by_block(&self, block_id: BlockId)
                            -> Result<Vec<InvalidatedBlock>>;
    fn all_invalidated(&self) -> Result<Vec<InvalidatedBlock>>;
    fn prepare_invalidated(&self, removed: &[InvalidatedBlock],
                           added: &[InvalidatedBlock]) -> Result<()>;
}

pub trait UnderReplicatedBlockAccess {
    fn under_replicated_by_block(&self, block_id: BlockId)
                                 -> Result<Option<UnderReplicatedBlock>>;
    fn all_under_replicated(&self) -> Result<Vec<UnderReplicatedBlock>>;
    fn prepare_under_replicated(&self, removed: &[UnderReplicatedBlock],
                                added: &[UnderReplicatedBlock],
                                modified: &[UnderReplicatedBlock])
                                -> Result<()>;
}

pub trait PendingBlockAccess {
    fn pending_by_block(&self, block_id: BlockId)
                        -> Result<Option<PendingBlockInfo>>;
    fn all_pending(&self) -> Result<Vec<PendingBlockInfo>>;
    fn prepare_pending(&self, removed: &[PendingBlockInfo],
                       added: &[PendingBlockInfo],
                       modified: &[PendingBlockInfo]) -> Result<()>;
}

pub trait LeaseAccess {
    fn lease_by_holder(&self, holder: &str) -> Result<Option<Lease>>;
    fn lease_by_holder_id(&self, holder_id: HolderId)
                          -> Result<Option<Lease>>;
    fn all_leases(&self) -> Result<Vec<Lease>>;
    fn prepare_leases(&self, removed: &[Lease], added: &[Lease],
                      modified: &[Lease]) -> Result<()>;
}

pub trait LeasePathAccess {
    fn lease_path(&self, path: &str) -> Result<Option<LeasePath>>;
    fn lease_paths_by_holder_id(&self, holder_id: HolderId)
                                -> Result<Vec<LeasePath>>;
    fn prepare_lease_paths(&self, removed: &[LeasePath],
                           added: &[LeasePath]) -> Result<()>;
}

pub trait BlockKeyAccess {
    fn key_by_id(&self, key_id: KeyId) -> Result<Option<BlockKey>>;
    /// The unique key of the given type, if any. Meaningful for `Current`
    /// and `Next` only.
    fn key_by_type(&self, key_type: KeyType) -> Result<Option<BlockKey>>;
    fn all_keys(&self) -> Result<Vec<BlockKey>>;
    fn prepare_keys(&self, removed: &[BlockKey], added: &[BlockKey],
                    modified: &[BlockKey]) -> Result<()>;
}

/// The full data-access contract: the connector plus one repository per
/// entity kind. The lock manager, the path resolver, and the secret manager
/// run unmodified over any implementation of this trait.
pub trait Storage:
    Connector
    + InodeAccess
    + BlockInfoAccess
    + ReplicaAccess
    + CorruptReplicaAccess
    + ExcessReplicaAccess
    + ReplicaUcAccess
    + InvalidatedBlockAccess
    + UnderReplicatedBlockAccess
    + PendingBlockAccess
    + LeaseAccess
    + LeasePathAccess
    + BlockKeyAccess
{
}

impl<T> Storage for T where
    T: Connector
        + InodeAccess
        + BlockInfoAccess
        + ReplicaAccess
        + CorruptReplicaAccess
        + ExcessReplicaAccess
        + ReplicaUcAccess
        + InvalidatedBlockAccess
        + UnderReplicatedBlockAccess
        + PendingBlockAccess
        + LeaseAccess
        + LeasePathAccess
        + BlockKeyAccess
{
}

/// Opens the storage backend named by the configuration, bootstrapping the
/// persisted layout when `format` is set.
pub fn open_storage(
    backend: &crate::config::StorageBackend,
    format: bool,
) -> Result<Arc<dyn Storage>> {
    use crate::config::StorageBackend;

    let storage: Arc<dyn Storage> = match *backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Path(ref path) => {
            Arc::new(SqliteStore::open(std::path::Path::new(path))?)
        }
    };
    if format {
        storage.format()?;
    }
    Ok(storage)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::StorageBackend;

    #[test]
    fn open_storage_selects_backend() {
        let storage = open_storage(&StorageBackend::Memory, false).unwrap();
        assert!(storage.inode_by_id(ROOT_INODE_ID).unwrap().is_some());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_str().unwrap().to_owned();
        let storage =
            open_storage(&StorageBackend::Path(path), true).unwrap();
        assert!(storage.inode_by_id(ROOT_INODE_ID).unwrap().is_some());
    }
}
