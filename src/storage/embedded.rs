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

//! Implements the storage contract on a single-node embedded SQLite
//! database.
//!
//! The store is maintained under a single "root" directory holding one
//! SQLite database, `metadata.sqlite`; its presence is also what identifies
//! a directory as a store root. Every calling thread lazily opens its own
//! connection to the shared file and keeps it for the life of the process.
//!
//! Row-lock hints are accepted but subsumed: SQLite locks at database
//! granularity, so a transaction that wrote anything excludes all other
//! writers until it completes. Contention surfaces as `SQLITE_BUSY`, which
//! the error classification treats as transient, putting it in the same
//! retry class as a row-lock timeout on the cluster-style backend.
//!
//! Nullable text attributes (client identity, symlink target) are stored as
//! the empty string; none of them can be legitimately empty.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use sqlite::Statement;

use crate::defs::*;
use crate::errors::*;
use crate::model::*;
use crate::sql::{SendConnection, StatementEx};
use crate::storage::*;

pub struct SqliteStore {
    db_path: PathBuf,
    sessions: Mutex<HashMap<ThreadId, SqliteSession>>,
}

struct SqliteSession {
    cxn: SendConnection,
    active: bool,
}

fn opt_text(v: &Option<String>) -> &str {
    v.as_ref().map(|s| &s[..]).unwrap_or("")
}

fn text_opt(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn read_inode(s: &Statement) -> sqlite::Result<Inode> {
    Ok(Inode {
        id: s.read::<i64>(0)?,
        name: s.read::<String>(1)?,
        parent_id: s.read::<i64>(2)?,
        is_dir: 0 != s.read::<i64>(3)?,
        is_dir_with_quota: 0 != s.read::<i64>(4)?,
        modification_time: s.read::<i64>(5)?,
        access_time: s.read::<i64>(6)?,
        permission: s.read::<i64>(7)? as u16,
        ns_quota: s.read::<i64>(8)?,
        ds_quota: s.read::<i64>(9)?,
        ns_count: s.read::<i64>(10)?,
        ds_count: s.read::<i64>(11)?,
        is_under_construction: 0 != s.read::<i64>(12)?,
        client_name: text_opt(s.read::<String>(13)?),
        client_machine: text_opt(s.read::<String>(14)?),
        is_closed_file: 0 != s.read::<i64>(15)?,
        header: s.read::<i64>(16)?,
        symlink_target: text_opt(s.read::<String>(17)?),
    })
}

fn read_block(s: &Statement) -> sqlite::Result<BlockInfo> {
    let uc_state = s.read::<i64>(5)?;
    Ok(BlockInfo {
        block_id: s.read::<i64>(0)?,
        inode_id: s.read::<i64>(1)?,
        block_index: s.read::<i64>(2)? as i32,
        num_bytes: s.read::<i64>(3)?,
        generation_stamp: s.read::<i64>(4)?,
        uc_state: BlockUcState::from_i64(uc_state)
            .unwrap_or(BlockUcState::Complete),
        time_stamp: s.read::<i64>(6)?,
        primary_node_index: s.read::<i64>(7)? as i32,
        recovery_id: s.read::<i64>(8)?,
    })
}

const SELECT_INODE: &str = "SELECT `id`, `name`, `parent_id`, `is_dir`, \
     `is_dir_with_quota`, `modification_time`, `access_time`, `permission`, \
     `ns_quota`, `ds_quota`, `ns_count`, `ds_count`, \
     `is_under_construction`, `client_name`, `client_machine`, \
     `is_closed_file`, `header`, `symlink_target` FROM `inodes`";

const SELECT_BLOCK: &str = "SELECT `block_id`, `inode_id`, `block_index`, \
     `num_bytes`, `generation_stamp`, `uc_state`, `time_stamp`, \
     `primary_node_index`, `recovery_id` FROM `block_infos`";

impl SqliteStore {
    /// Opens (creating if necessary) the store rooted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let store = SqliteStore {
            db_path: path.join("metadata.sqlite"),
            sessions: Mutex::new(HashMap::new()),
        };
        // Bootstrap the layout eagerly so that a read-only consumer does not
        // trip over a half-created database later.
        store.with_session(|s| {
            s.cxn.execute(include_str!("storage-schema.sql"))?;
            SqliteStore::ensure_root(&s.cxn)
        })?;
        Ok(store)
    }

    fn ensure_root(cxn: &SendConnection) -> Result<()> {
        cxn.prepare(
            "INSERT OR IGNORE INTO `inodes` ( \
             `id`, `name`, `parent_id`, `is_dir`, `is_dir_with_quota`, \
             `modification_time`, `access_time`, `permission`, `ns_quota`, \
             `ds_quota`, `ns_count`, `ds_count`, `is_under_construction`, \
             `client_name`, `client_machine`, `is_closed_file`, `header`, \
             `symlink_target`) VALUES ( \
             ?1, '', ?2, 1, 0, 0, 0, ?3, -1, -1, 0, 0, 0, '', '', 0, 0, '')",
        )
        .binding(1, ROOT_INODE_ID)
        .binding(2, NON_EXISTING_INODE)
        .binding(3, 0o755 as i64)
        .run()?;
        Ok(())
    }

    fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteSession) -> Result<T>,
    {
        let mut sessions = self.sessions.lock().unwrap();
        let me = thread::current().id();
        if !sessions.contains_key(&me) {
            let cxn = sqlite::Connection::open(&self.db_path)?;
            cxn.execute("PRAGMA busy_timeout = 5000")?;
            sessions.insert(
                me,
                SqliteSession {
                    cxn: SendConnection(cxn),
                    active: false,
                },
            );
        }
        f(sessions.get_mut(&me).expect("session just inserted"))
    }
}

impl Connector for SqliteStore {
    fn begin_transaction(&self) -> Result<()> {
        self.with_session(|s| {
            if s.active {
                return Err(ErrorKind::InvariantViolation(
                    "transaction already active on this session".to_owned(),
                )
                .into());
            }
            // IMMEDIATE so contention with a concurrent writer surfaces here
            // as SQLITE_BUSY instead of deadlocking on upgrade mid-way.
            s.cxn.execute("BEGIN IMMEDIATE")?;
            s.active = true;
            Ok(())
        })
    }

    fn commit(&self) -> Result<()> {
        self.with_session(|s| {
            if !s.active {
                return Err(ErrorKind::TransactionInactive.into());
            }
            s.active = false;
            if let Err(e) = s.cxn.execute("COMMIT") {
                // A failed COMMIT can leave the transaction open; make sure
                // the connection is usable for the retry.
                drop(s.cxn.execute("ROLLBACK"));
                return Err(e.into());
            }
            Ok(())
        })
    }

    fn rollback(&self) -> Result<()> {
        self.with_session(|s| {
            if s.active {
                s.active = false;
                // Silently drop errors from ROLLBACK, since it will fail if
                // an earlier error caused SQLite to roll back automatically.
                drop(s.cxn.execute("ROLLBACK"));
            }
            Ok(())
        })
    }

    fn transaction_active(&self) -> bool {
        self.with_session(|s| Ok(s.active)).unwrap_or(false)
    }

    fn set_lock_mode(&self, _mode: LockMode) -> Result<()> {
        // Database-granularity locking subsumes per-row hints here.
        Ok(())
    }

    fn format(&self) -> Result<()> {
        self.with_session(|s| {
            s.cxn.execute(
                "DELETE FROM `inodes`; \
                 DELETE FROM `block_infos`; \
                 DELETE FROM `replicas`; \
                 DELETE FROM `corrupt_replicas`; \
                 DELETE FROM `excess_replicas`; \
                 DELETE FROM `replicas_under_construction`; \
                 DELETE FROM `invalidated_blocks`; \
                 DELETE FROM `under_replicated_blocks`; \
                 DELETE FROM `pending_blocks`; \
                 DELETE FROM `leases`; \
                 DELETE FROM `lease_paths`; \
                 DELETE FROM `block_keys`",
            )?;
            SqliteStore::ensure_root(&s.cxn)
        })
    }

    fn shutdown(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

impl InodeAccess for SqliteStore {
    fn inode_by_id(&self, id: InodeId) -> Result<Option<Inode>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(format!("{} WHERE `id` = ?1", SELECT_INODE))
                .binding(1, id)
                .first(read_inode)?)
        })
    }

    fn inode_by_name_parent(&self, name: &str, parent_id: InodeId)
                            -> Result<Option<Inode>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(format!(
                    "{} WHERE `parent_id` = ?1 AND `name` = ?2",
                    SELECT_INODE
                ))
                .binding(1, parent_id)
                .binding(2, name)
                .first(read_inode)?)
        })
    }

    fn inodes_by_parent(&self, parent_id: InodeId) -> Result<Vec<Inode>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(format!(
                    "{} WHERE `parent_id` = ?1 AND `id` != ?2 \
                     ORDER BY `name`",
                    SELECT_INODE
                ))
                .binding(1, parent_id)
                .binding(2, ROOT_INODE_ID)
                .rows(read_inode)?)
        })
    }

    fn prepare_inodes(&self, removed: &[Inode], added: &[Inode],
                      modified: &[Inode]) -> Result<()> {
        self.with_session(|s| {
            for inode in removed {
                s.cxn
                    .prepare("DELETE FROM `inodes` WHERE `id` = ?1")
                    .binding(1, inode.id)
                    .run()?;
            }
            for inode in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `inodes` ( \
                         `id`, `name`, `parent_id`, `is_dir`, \
                         `is_dir_with_quota`, `modification_time`, \
                         `access_time`, `permission`, `ns_quota`, \
                         `ds_quota`, `ns_count`, `ds_count`, \
                         `is_under_construction`, `client_name`, \
                         `client_machine`, `is_closed_file`, `header`, \
                         `symlink_target`) VALUES ( \
                         ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                         ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    )
                    .binding(1, inode.id)
                    .binding(2, &inode.name[..])
                    .binding(3, inode.parent_id)
                    .binding(4, inode.is_dir as i64)
                    .binding(5, inode.is_dir_with_quota as i64)
                    .binding(6, inode.modification_time)
                    .binding(7, inode.access_time)
                    .binding(8, inode.permission as i64)
                    .binding(9, inode.ns_quota)
                    .binding(10, inode.ds_quota)
                    .binding(11, inode.ns_count)
                    .binding(12, inode.ds_count)
                    .binding(13, inode.is_under_construction as i64)
                    .binding(14, opt_text(&inode.client_name))
                    .binding(15, opt_text(&inode.client_machine))
                    .binding(16, inode.is_closed_file as i64)
                    .binding(17, inode.header)
                    .binding(18, opt_text(&inode.symlink_target))
                    .run()?;
            }
            Ok(())
        })
    }
}

impl BlockInfoAccess for SqliteStore {
    fn block_by_id(&self, id: BlockId) -> Result<Option<BlockInfo>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(format!("{} WHERE `block_id` = ?1", SELECT_BLOCK))
                .binding(1, id)
                .first(read_block)?)
        })
    }

    fn blocks_by_inode(&self, inode_id: InodeId) -> Result<Vec<BlockInfo>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(format!(
                    "{} WHERE `inode_id` = ?1 ORDER BY `block_index`",
                    SELECT_BLOCK
                ))
                .binding(1, inode_id)
                .rows(read_block)?)
        })
    }

    fn prepare_blocks(&self, removed: &[BlockInfo], added: &[BlockInfo],
                      modified: &[BlockInfo]) -> Result<()> {
        self.with_session(|s| {
            for block in removed {
                s.cxn
                    .prepare("DELETE FROM `block_infos` WHERE `block_id` = ?1")
                    .binding(1, block.block_id)
                    .run()?;
            }
            for block in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `block_infos` ( \
                         `block_id`, `inode_id`, `block_index`, `num_bytes`, \
                         `generation_stamp`, `uc_state`, `time_stamp`, \
                         `primary_node_index`, `recovery_id`) VALUES ( \
                         ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .binding(1, block.block_id)
                    .binding(2, block.inode_id)
                    .binding(3, block.block_index as i64)
                    .binding(4, block.num_bytes)
                    .binding(5, block.generation_stamp)
                    .binding(6, block.uc_state.as_i64())
                    .binding(7, block.time_stamp)
                    .binding(8, block.primary_node_index as i64)
                    .binding(9, block.recovery_id)
                    .run()?;
            }
            Ok(())
        })
    }
}

impl ReplicaAccess for SqliteStore {
    fn replicas_by_block(&self, block_id: BlockId)
                         -> Result<Vec<IndexedReplica>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id`, `idx` FROM `replicas` \
                     WHERE `block_id` = ?1 ORDER BY `idx`",
                )
                .binding(1, block_id)
                .rows(|s| {
                    Ok(IndexedReplica {
                        block_id: s.read::<i64>(0)?,
                        storage_id: s.read::<String>(1)?,
                        index: s.read::<i64>(2)? as i32,
                    })
                })?)
        })
    }

    fn prepare_replicas(&self, removed: &[IndexedReplica],
                        added: &[IndexedReplica],
                        modified: &[IndexedReplica]) -> Result<()> {
        self.with_session(|s| {
            for r in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `replicas` \
                         WHERE `block_id` = ?1 AND `storage_id` = ?2",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            for r in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `replicas` ( \
                         `block_id`, `storage_id`, `idx`) VALUES (?1, ?2, ?3)",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .binding(3, r.index as i64)
                    .run()?;
            }
            Ok(())
        })
    }
}

impl CorruptReplicaAccess for SqliteStore {
    fn corrupt_replicas_by_block(&self, block_id: BlockId)
                                 -> Result<Vec<CorruptReplica>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id` FROM `corrupt_replicas` \
                     WHERE `block_id` = ?1 ORDER BY `storage_id`",
                )
                .binding(1, block_id)
                .rows(|s| {
                    Ok(CorruptReplica {
                        block_id: s.read::<i64>(0)?,
                        storage_id: s.read::<String>(1)?,
                    })
                })?)
        })
    }

    fn prepare_corrupt_replicas(&self, removed: &[CorruptReplica],
                                added: &[CorruptReplica]) -> Result<()> {
        self.with_session(|s| {
            for r in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `corrupt_replicas` \
                         WHERE `block_id` = ?1 AND `storage_id` = ?2",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            for r in added {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `corrupt_replicas` ( \
                         `block_id`, `storage_id`) VALUES (?1, ?2)",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            Ok(())
        })
    }
}

impl ExcessReplicaAccess for SqliteStore {
    fn excess_replicas_by_block(&self, block_id: BlockId)
                                -> Result<Vec<ExcessReplica>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id` FROM `excess_replicas` \
                     WHERE `block_id` = ?1 ORDER BY `storage_id`",
                )
                .binding(1, block_id)
                .rows(|s| {
                    Ok(ExcessReplica {
                        block_id: s.read::<i64>(0)?,
                        storage_id: s.read::<String>(1)?,
                    })
                })?)
        })
    }

    fn prepare_excess_replicas(&self, removed: &[ExcessReplica],
                               added: &[ExcessReplica]) -> Result<()> {
        self.with_session(|s| {
            for r in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `excess_replicas` \
                         WHERE `block_id` = ?1 AND `storage_id` = ?2",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            for r in added {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `excess_replicas` ( \
                         `block_id`, `storage_id`) VALUES (?1, ?2)",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            Ok(())
        })
    }
}

impl ReplicaUcAccess for SqliteStore {
    fn replicas_uc_by_block(&self, block_id: BlockId)
                            -> Result<Vec<ReplicaUnderConstruction>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id`, `state`, `idx` \
                     FROM `replicas_under_construction` \
                     WHERE `block_id` = ?1 ORDER BY `idx`",
                )
                .binding(1, block_id)
                .rows(|s| {
                    let state = s.read::<i64>(2)?;
                    Ok(ReplicaUnderConstruction {
                        block_id: s.read::<i64>(0)?,
                        storage_id: s.read::<String>(1)?,
                        state: ReplicaState::from_i64(state)
                            .unwrap_or(ReplicaState::Temporary),
                        index: s.read::<i64>(3)? as i32,
                    })
                })?)
        })
    }

    fn prepare_replicas_uc(&self, removed: &[ReplicaUnderConstruction],
                           added: &[ReplicaUnderConstruction]) -> Result<()> {
        self.with_session(|s| {
            for r in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `replicas_under_construction` \
                         WHERE `block_id` = ?1 AND `storage_id` = ?2",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            for r in added {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO \
                         `replicas_under_construction` ( \
                         `block_id`, `storage_id`, `state`, `idx`) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .binding(3, r.state.as_i64())
                    .binding(4, r.index as i64)
                    .run()?;
            }
            Ok(())
        })
    }
}

impl InvalidatedBlockAccess for SqliteStore {
    fn invalidated_by_block(&self, block_id: BlockId)
                            -> Result<Vec<InvalidatedBlock>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id`, `generation_stamp`, \
                     `num_bytes` FROM `invalidated_blocks` \
                     WHERE `block_id` = ?1 ORDER BY `storage_id`",
                )
                .binding(1, block_id)
                .rows(read_invalidated)?)
        })
    }

    fn all_invalidated(&self) -> Result<Vec<InvalidatedBlock>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `storage_id`, `generation_stamp`, \
                     `num_bytes` FROM `invalidated_blocks` \
                     ORDER BY `block_id`, `storage_id`",
                )
                .rows(read_invalidated)?)
        })
    }

    fn prepare_invalidated(&self, removed: &[InvalidatedBlock],
                           added: &[InvalidatedBlock]) -> Result<()> {
        self.with_session(|s| {
            for r in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `invalidated_blocks` \
                         WHERE `block_id` = ?1 AND `storage_id` = ?2",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .run()?;
            }
            for r in added {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `invalidated_blocks` ( \
                         `block_id`, `storage_id`, `generation_stamp`, \
                         `num_bytes`) VALUES (?1, ?2, ?3, ?4)",
                    )
                    .binding(1, r.block_id)
                    .binding(2, &r.storage_id[..])
                    .binding(3, r.generation_stamp)
                    .binding(4, r.num_bytes)
                    .run()?;
            }
            Ok(())
        })
    }
}

fn read_invalidated(s: &Statement) -> sqlite::Result<InvalidatedBlock> {
    Ok(InvalidatedBlock {
        block_id: s.read::<i64>(0)?,
        storage_id: s.read::<String>(1)?,
        generation_stamp: s.read::<i64>(2)?,
        num_bytes: s.read::<i64>(3)?,
    })
}

impl UnderReplicatedBlockAccess for SqliteStore {
    fn under_replicated_by_block(&self, block_id: BlockId)
                                 -> Result<Option<UnderReplicatedBlock>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `level` \
                     FROM `under_replicated_blocks` WHERE `block_id` = ?1",
                )
                .binding(1, block_id)
                .first(|s| {
                    Ok(UnderReplicatedBlock {
                        block_id: s.read::<i64>(0)?,
                        level: s.read::<i64>(1)? as i32,
                    })
                })?)
        })
    }

    fn all_under_replicated(&self) -> Result<Vec<UnderReplicatedBlock>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `level` \
                     FROM `under_replicated_blocks` \
                     ORDER BY `level`, `block_id`",
                )
                .rows(|s| {
                    Ok(UnderReplicatedBlock {
                        block_id: s.read::<i64>(0)?,
                        level: s.read::<i64>(1)? as i32,
                    })
                })?)
        })
    }

    fn prepare_under_replicated(&self, removed: &[UnderReplicatedBlock],
                                added: &[UnderReplicatedBlock],
                                modified: &[UnderReplicatedBlock])
                                -> Result<()> {
        self.with_session(|s| {
            for u in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `under_replicated_blocks` \
                         WHERE `block_id` = ?1",
                    )
                    .binding(1, u.block_id)
                    .run()?;
            }
            for u in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `under_replicated_blocks` ( \
                         `block_id`, `level`) VALUES (?1, ?2)",
                    )
                    .binding(1, u.block_id)
                    .binding(2, u.level as i64)
                    .run()?;
            }
            Ok(())
        })
    }
}

impl PendingBlockAccess for SqliteStore {
    fn pending_by_block(&self, block_id: BlockId)
                        -> Result<Option<PendingBlockInfo>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `time_stamp`, \
                     `num_replicas_in_progress` FROM `pending_blocks` \
                     WHERE `block_id` = ?1",
                )
                .binding(1, block_id)
                .first(read_pending)?)
        })
    }

    fn all_pending(&self) -> Result<Vec<PendingBlockInfo>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `block_id`, `time_stamp`, \
                     `num_replicas_in_progress` FROM `pending_blocks` \
                     ORDER BY `block_id`",
                )
                .rows(read_pending)?)
        })
    }

    fn prepare_pending(&self, removed: &[PendingBlockInfo],
                       added: &[PendingBlockInfo],
                       modified: &[PendingBlockInfo]) -> Result<()> {
        self.with_session(|s| {
            for p in removed {
                s.cxn
                    .prepare(
                        "DELETE FROM `pending_blocks` WHERE `block_id` = ?1",
                    )
                    .binding(1, p.block_id)
                    .run()?;
            }
            for p in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `pending_blocks` ( \
                         `block_id`, `time_stamp`, \
                         `num_replicas_in_progress`) VALUES (?1, ?2, ?3)",
                    )
                    .binding(1, p.block_id)
                    .binding(2, p.time_stamp)
                    .binding(3, p.num_replicas_in_progress as i64)
                    .run()?;
            }
            Ok(())
        })
    }
}

fn read_pending(s: &Statement) -> sqlite::Result<PendingBlockInfo> {
    Ok(PendingBlockInfo {
        block_id: s.read::<i64>(0)?,
        time_stamp: s.read::<i64>(1)?,
        num_replicas_in_progress: s.read::<i64>(2)? as i32,
    })
}

fn read_lease(s: &Statement) -> sqlite::Result<Lease> {
    Ok(Lease {
        holder: s.read::<String>(0)?,
        holder_id: s.read::<i64>(1)? as i32,
        last_update: s.read::<i64>(2)?,
    })
}

impl LeaseAccess for SqliteStore {
    fn lease_by_holder(&self, holder: &str) -> Result<Option<Lease>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `holder`, `holder_id`, `last_update` \
                     FROM `leases` WHERE `holder` = ?1",
                )
                .binding(1, holder)
                .first(read_lease)?)
        })
    }

    fn lease_by_holder_id(&self, holder_id: HolderId)
                          -> Result<Option<Lease>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `holder`, `holder_id`, `last_update` \
                     FROM `leases` WHERE `holder_id` = ?1",
                )
                .binding(1, holder_id as i64)
                .first(read_lease)?)
        })
    }

    fn all_leases(&self) -> Result<Vec<Lease>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `holder`, `holder_id`, `last_update` \
                     FROM `leases` ORDER BY `holder`",
                )
                .rows(read_lease)?)
        })
    }

    fn prepare_leases(&self, removed: &[Lease], added: &[Lease],
                      modified: &[Lease]) -> Result<()> {
        self.with_session(|s| {
            for l in removed {
                s.cxn
                    .prepare("DELETE FROM `leases` WHERE `holder` = ?1")
                    .binding(1, &l.holder[..])
                    .run()?;
            }
            for l in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `leases` ( \
                         `holder`, `holder_id`, `last_update`) \
                         VALUES (?1, ?2, ?3)",
                    )
                    .binding(1, &l.holder[..])
                    .binding(2, l.holder_id as i64)
                    .binding(3, l.last_update)
                    .run()?;
            }
            Ok(())
        })
    }
}

impl LeasePathAccess for SqliteStore {
    fn lease_path(&self, path: &str) -> Result<Option<LeasePath>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `path`, `holder_id` FROM `lease_paths` \
                     WHERE `path` = ?1",
                )
                .binding(1, path)
                .first(|s| {
                    Ok(LeasePath {
                        path: s.read::<String>(0)?,
                        holder_id: s.read::<i64>(1)? as i32,
                    })
                })?)
        })
    }

    fn lease_paths_by_holder_id(&self, holder_id: HolderId)
                                -> Result<Vec<LeasePath>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `path`, `holder_id` FROM `lease_paths` \
                     WHERE `holder_id` = ?1 ORDER BY `path`",
                )
                .binding(1, holder_id as i64)
                .rows(|s| {
                    Ok(LeasePath {
                        path: s.read::<String>(0)?,
                        holder_id: s.read::<i64>(1)? as i32,
                    })
                })?)
        })
    }

    fn prepare_lease_paths(&self, removed: &[LeasePath],
                           added: &[LeasePath]) -> Result<()> {
        self.with_session(|s| {
            for lp in removed {
                s.cxn
                    .prepare("DELETE FROM `lease_paths` WHERE `path` = ?1")
                    .binding(1, &lp.path[..])
                    .run()?;
            }
            for lp in added {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `lease_paths` ( \
                         `path`, `holder_id`) VALUES (?1, ?2)",
                    )
                    .binding(1, &lp.path[..])
                    .binding(2, lp.holder_id as i64)
                    .run()?;
            }
            Ok(())
        })
    }
}

fn read_key(s: &Statement) -> sqlite::Result<BlockKey> {
    let key_type = s.read::<i64>(2)?;
    Ok(BlockKey {
        key_id: s.read::<i64>(0)? as i32,
        expiry_date: s.read::<i64>(1)?,
        key_type: KeyType::from_i64(key_type).unwrap_or(KeyType::Simple),
        key: s.read::<Vec<u8>>(3)?,
    })
}

impl BlockKeyAccess for SqliteStore {
    fn key_by_id(&self, key_id: KeyId) -> Result<Option<BlockKey>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `key_id`, `expiry_date`, `key_type`, `key` \
                     FROM `block_keys` WHERE `key_id` = ?1",
                )
                .binding(1, key_id as i64)
                .first(read_key)?)
        })
    }

    fn key_by_type(&self, key_type: KeyType) -> Result<Option<BlockKey>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `key_id`, `expiry_date`, `key_type`, `key` \
                     FROM `block_keys` WHERE `key_type` = ?1",
                )
                .binding(1, key_type.as_i64())
                .first(read_key)?)
        })
    }

    fn all_keys(&self) -> Result<Vec<BlockKey>> {
        self.with_session(|s| {
            Ok(s.cxn
                .prepare(
                    "SELECT `key_id`, `expiry_date`, `key_type`, `key` \
                     FROM `block_keys` ORDER BY `key_id`",
                )
                .rows(read_key)?)
        })
    }

    fn prepare_keys(&self, removed: &[BlockKey], added: &[BlockKey],
                    modified: &[BlockKey]) -> Result<()> {
        self.with_session(|s| {
            for k in removed {
                s.cxn
                    .prepare("DELETE FROM `block_keys` WHERE `key_id` = ?1")
                    .binding(1, k.key_id as i64)
                    .run()?;
            }
            for k in added.iter().chain(modified) {
                s.cxn
                    .prepare(
                        "INSERT OR REPLACE INTO `block_keys` ( \
                         `key_id`, `expiry_date`, `key_type`, `key`) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .binding(1, k.key_id as i64)
                    .binding(2, k.expiry_date)
                    .binding(3, k.key_type.as_i64())
                    .binding(4, &k.key[..])
                    .run()?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::storage_tests;

    fn new_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn contract_suite() {
        let (_dir, store) = new_store();
        storage_tests::run_all(&store);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.begin_transaction().unwrap();
            store
                .prepare_inodes(
                    &[],
                    &[Inode::directory(7, "kept", ROOT_INODE_ID)],
                    &[],
                )
                .unwrap();
            store.commit().unwrap();
            store.shutdown();
        }

        let store = SqliteStore::open(dir.path()).unwrap();
        let kept = store.inode_by_id(7).unwrap().unwrap();
        assert_eq!("kept", kept.name);
        assert!(store.inode_by_id(ROOT_INODE_ID).unwrap().is_some());
    }

    #[test]
    fn format_wipes_everything_but_root() {
        let (_dir, store) = new_store();

        store.begin_transaction().unwrap();
        store
            .prepare_inodes(&[], &[Inode::directory(3, "x", ROOT_INODE_ID)],
                            &[])
            .unwrap();
        store.commit().unwrap();

        store.format().unwrap();
        assert!(store.inode_by_id(3).unwrap().is_none());
        assert!(store.inode_by_id(ROOT_INODE_ID).unwrap().is_some());
    }
}
