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

//! The entity records shared by every namenode through the external store.
//!
//! Each struct is one row in one table. None of these carry behaviour beyond
//! small derived accessors; all mutation happens inside a lock-protected
//! transaction through the `context` layer.

use crate::defs::*;

/// Number of low bits of `Inode::header` holding the preferred block size;
/// the remaining high bits hold the replication factor.
const HEADER_SIZE_BITS: u32 = 48;
const HEADER_SIZE_MASK: i64 = (1 << HEADER_SIZE_BITS) - 1;

/// A namespace entry: file, directory, or symlink.
///
/// The tree structure is expressed through `parent_id`; `(parent_id, name)`
/// is unique. The root has id 0, an empty name, and no parent.
#[derive(Clone, Debug, PartialEq)]
pub struct Inode {
    pub id: InodeId,
    pub name: String,
    pub parent_id: InodeId,
    pub is_dir: bool,
    pub is_dir_with_quota: bool,
    pub modification_time: Timestamp,
    pub access_time: Timestamp,
    pub permission: u16,
    pub ns_quota: i64,
    pub ds_quota: i64,
    pub ns_count: i64,
    pub ds_count: i64,
    pub is_under_construction: bool,
    /// Identity of the writing client while under construction.
    pub client_name: Option<String>,
    pub client_machine: Option<String>,
    pub is_closed_file: bool,
    /// Replication factor and preferred block size packed into one word for
    /// files; 0 for directories and symlinks.
    pub header: i64,
    pub symlink_target: Option<String>,
}

impl Inode {
    pub fn directory(id: InodeId, name: &str, parent_id: InodeId) -> Self {
        Inode {
            id,
            name: name.to_owned(),
            parent_id,
            is_dir: true,
            is_dir_with_quota: false,
            modification_time: 0,
            access_time: 0,
            permission: 0o755,
            ns_quota: -1,
            ds_quota: -1,
            ns_count: 0,
            ds_count: 0,
            is_under_construction: false,
            client_name: None,
            client_machine: None,
            is_closed_file: false,
            header: 0,
            symlink_target: None,
        }
    }

    pub fn file(
        id: InodeId,
        name: &str,
        parent_id: InodeId,
        replication: u16,
        preferred_block_size: i64,
    ) -> Self {
        Inode {
            is_dir: false,
            permission: 0o644,
            header: Inode::pack_header(replication, preferred_block_size),
            ..Inode::directory(id, name, parent_id)
        }
    }

    pub fn symlink(id: InodeId, name: &str, parent_id: InodeId,
                   target: &str) -> Self {
        Inode {
            is_dir: false,
            symlink_target: Some(target.to_owned()),
            ..Inode::directory(id, name, parent_id)
        }
    }

    pub fn root() -> Self {
        Inode::directory(ROOT_INODE_ID, "", NON_EXISTING_INODE)
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir && !self.is_symlink()
    }

    pub fn pack_header(replication: u16, preferred_block_size: i64) -> i64 {
        debug_assert!(0 == preferred_block_size >> HEADER_SIZE_BITS);
        ((replication as i64) << HEADER_SIZE_BITS)
            | (preferred_block_size & HEADER_SIZE_MASK)
    }

    pub fn replication(&self) -> u16 {
        (self.header >> HEADER_SIZE_BITS) as u16
    }

    pub fn preferred_block_size(&self) -> i64 {
        self.header & HEADER_SIZE_MASK
    }
}

/// Construction state of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockUcState {
    Complete,
    UnderConstruction,
    UnderRecovery,
    Committed,
}

impl BlockUcState {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(BlockUcState::Complete),
            1 => Some(BlockUcState::UnderConstruction),
            2 => Some(BlockUcState::UnderRecovery),
            3 => Some(BlockUcState::Committed),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            BlockUcState::Complete => 0,
            BlockUcState::UnderConstruction => 1,
            BlockUcState::UnderRecovery => 2,
            BlockUcState::Committed => 3,
        }
    }
}

/// Metadata of one block of a file. Ordered within the file by
/// `block_index`.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub inode_id: InodeId,
    pub block_index: i32,
    pub num_bytes: i64,
    pub generation_stamp: i64,
    pub uc_state: BlockUcState,
    pub time_stamp: Timestamp,
    /// Index into the replica set of the node coordinating recovery.
    pub primary_node_index: i32,
    pub recovery_id: i64,
}

impl BlockInfo {
    pub fn new(block_id: BlockId, inode_id: InodeId, block_index: i32) -> Self {
        BlockInfo {
            block_id,
            inode_id,
            block_index,
            num_bytes: 0,
            generation_stamp: 0,
            uc_state: BlockUcState::UnderConstruction,
            time_stamp: 0,
            primary_node_index: -1,
            recovery_id: 0,
        }
    }
}

/// State of one physical replica that is still being written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    Finalized,
    Rbw,
    Rwr,
    Rur,
    Temporary,
}

impl ReplicaState {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ReplicaState::Finalized),
            1 => Some(ReplicaState::Rbw),
            2 => Some(ReplicaState::Rwr),
            3 => Some(ReplicaState::Rur),
            4 => Some(ReplicaState::Temporary),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ReplicaState::Finalized => 0,
            ReplicaState::Rbw => 1,
            ReplicaState::Rwr => 2,
            ReplicaState::Rur => 3,
            ReplicaState::Temporary => 4,
        }
    }
}

/// A healthy replica of a block on one datanode storage, with its position
/// in the block's replica list.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedReplica {
    pub block_id: BlockId,
    pub storage_id: String,
    pub index: i32,
}

/// A replica reported corrupt, pending invalidation once a healthy copy is
/// re-replicated.
#[derive(Clone, Debug, PartialEq)]
pub struct CorruptReplica {
    pub block_id: BlockId,
    pub storage_id: String,
}

/// A replica beyond the file's replication factor, scheduled for deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct ExcessReplica {
    pub block_id: BlockId,
    pub storage_id: String,
}

/// A replica participating in an active write pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaUnderConstruction {
    pub block_id: BlockId,
    pub storage_id: String,
    pub state: ReplicaState,
    pub index: i32,
}

/// A replica whose on-disk copy has been invalidated and awaits deletion by
/// its datanode.
#[derive(Clone, Debug, PartialEq)]
pub struct InvalidatedBlock {
    pub block_id: BlockId,
    pub storage_id: String,
    pub generation_stamp: i64,
    pub num_bytes: i64,
}

/// Presence of a row means the block has fewer live replicas than required;
/// `level` is the replication-queue priority.
#[derive(Clone, Debug, PartialEq)]
pub struct UnderReplicatedBlock {
    pub block_id: BlockId,
    pub level: i32,
}

/// Presence of a row means replication of the block has been scheduled and
/// is awaiting datanode confirmations.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingBlockInfo {
    pub block_id: BlockId,
    pub time_stamp: Timestamp,
    pub num_replicas_in_progress: i32,
}

/// A writing client's time-bounded claim, one row per active client.
#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
    pub holder: String,
    pub holder_id: HolderId,
    pub last_update: Timestamp,
}

/// One path claimed by a lease, many-to-one to `Lease` by `holder_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct LeasePath {
    pub path: String,
    pub holder_id: HolderId,
}

/// Role of a block key in the signing schedule.
///
/// Exactly one `Current` and one `Next` key exist while the secret manager
/// is active; `Simple` keys are retired but remain valid for verification
/// until their recorded expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Current,
    Next,
    Simple,
}

impl KeyType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(KeyType::Current),
            1 => Some(KeyType::Next),
            2 => Some(KeyType::Simple),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            KeyType::Current => 0,
            KeyType::Next => 1,
            KeyType::Simple => 2,
        }
    }
}

/// A symmetric key used to sign block-access tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockKey {
    pub key_id: KeyId,
    pub expiry_date: Timestamp,
    pub key_type: KeyType,
    pub key: Vec<u8>,
}

impl BlockKey {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry_date < now
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_packs_replication_and_block_size() {
        let f = Inode::file(42, "f", ROOT_INODE_ID, 3, 128 << 20);
        assert_eq!(3, f.replication());
        assert_eq!(128 << 20, f.preferred_block_size());
    }

    #[test]
    fn inode_kind_predicates() {
        let d = Inode::directory(1, "d", ROOT_INODE_ID);
        let f = Inode::file(2, "f", 1, 1, 4096);
        let s = Inode::symlink(3, "s", 1, "/target");

        assert!(d.is_dir && !d.is_file() && !d.is_symlink());
        assert!(!f.is_dir && f.is_file() && !f.is_symlink());
        assert!(!s.is_dir && !s.is_file() && s.is_symlink());
    }

    #[test]
    fn key_type_round_trips() {
        for kt in &[KeyType::Current, KeyType::Next, KeyType::Simple] {
            assert_eq!(Some(*kt), KeyType::from_i64(kt.as_i64()));
        }
        assert_eq!(None, KeyType::from_i64(9));
    }
}
