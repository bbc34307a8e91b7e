// This is not a free-standing test module: it defines the contract suite
// which every `Storage` implementation's test module runs via `run_all`.
// Keeping it in one place is what enforces "two backends, no caller
// changes" — the suite only speaks through the `Storage` traits.

use crate::defs::*;
use crate::model::*;
use crate::storage::*;

fn sample_inode() -> Inode {
    Inode {
        id: 11,
        name: "report".to_owned(),
        parent_id: ROOT_INODE_ID,
        is_dir: false,
        is_dir_with_quota: false,
        modification_time: 1111,
        access_time: 2222,
        permission: 0o640,
        ns_quota: -1,
        ds_quota: -1,
        ns_count: 1,
        ds_count: 4096,
        is_under_construction: true,
        client_name: Some("client-7".to_owned()),
        client_machine: Some("host-a".to_owned()),
        is_closed_file: false,
        header: Inode::pack_header(3, 64 << 20),
        symlink_target: None,
    }
}

fn in_tx<S: Storage, F: FnOnce() -> crate::errors::Result<()>>(
    storage: &S,
    f: F,
) {
    storage.begin_transaction().unwrap();
    f().unwrap();
    storage.commit().unwrap();
}

pub fn run_all<S: Storage>(storage: &S) {
    root_is_present(storage);
    inode_round_trip(storage);
    inode_secondary_indexes(storage);
    block_round_trip_and_ordering(storage);
    replica_family_round_trip(storage);
    queue_entities_round_trip(storage);
    lease_round_trip(storage);
    lease_paths_sorted(storage);
    block_key_round_trip(storage);
    commit_publishes_writes(storage);
    rollback_discards_writes(storage);
    storage.format().unwrap();
}

fn root_is_present<S: Storage>(storage: &S) {
    let root = storage.inode_by_id(ROOT_INODE_ID).unwrap().unwrap();
    assert!(root.is_dir);
    assert_eq!("", root.name);
    assert_eq!(NON_EXISTING_INODE, root.parent_id);
}

fn inode_round_trip<S: Storage>(storage: &S) {
    let inode = sample_inode();
    in_tx(storage, || {
        storage.prepare_inodes(&[], &[inode.clone()], &[])
    });

    // Every attribute must survive the trip.
    assert_eq!(inode, storage.inode_by_id(inode.id).unwrap().unwrap());

    let mut renamed = inode.clone();
    renamed.name = "report-v2".to_owned();
    renamed.is_under_construction = false;
    renamed.client_name = None;
    in_tx(storage, || {
        storage.prepare_inodes(&[], &[], &[renamed.clone()])
    });
    assert_eq!(renamed, storage.inode_by_id(inode.id).unwrap().unwrap());

    in_tx(storage, || {
        storage.prepare_inodes(&[renamed.clone()], &[], &[])
    });
    assert!(storage.inode_by_id(inode.id).unwrap().is_none());
}

fn inode_secondary_indexes<S: Storage>(storage: &S) {
    let a = Inode::directory(21, "beta", ROOT_INODE_ID);
    let b = Inode::directory(22, "alpha", ROOT_INODE_ID);
    let c = Inode::directory(23, "nested", 21);
    in_tx(storage, || {
        storage.prepare_inodes(&[], &[a.clone(), b.clone(), c.clone()], &[])
    });

    assert_eq!(
        Some(22),
        storage
            .inode_by_name_parent("alpha", ROOT_INODE_ID)
            .unwrap()
            .map(|i| i.id)
    );
    assert!(storage
        .inode_by_name_parent("alpha", 21)
        .unwrap()
        .is_none());

    let children: Vec<String> = storage
        .inodes_by_parent(ROOT_INODE_ID)
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(vec!["alpha".to_owned(), "beta".to_owned()], children);

    in_tx(storage, || {
        storage.prepare_inodes(&[a, b, c], &[], &[])
    });
}

fn block_round_trip_and_ordering<S: Storage>(storage: &S) {
    let mut one = BlockInfo::new(101, 11, 1);
    one.num_bytes = 1024;
    one.generation_stamp = 7;
    one.uc_state = BlockUcState::Committed;
    one.time_stamp = 999;
    one.primary_node_index = 2;
    one.recovery_id = 3;
    let zero = BlockInfo::new(100, 11, 0);

    in_tx(storage, || {
        storage.prepare_blocks(&[], &[one.clone(), zero.clone()], &[])
    });

    assert_eq!(one, storage.block_by_id(101).unwrap().unwrap());
    let ordered: Vec<BlockId> = storage
        .blocks_by_inode(11)
        .unwrap()
        .into_iter()
        .map(|b| b.block_id)
        .collect();
    assert_eq!(vec![100, 101], ordered);

    in_tx(storage, || {
        storage.prepare_blocks(&[zero.clone(), one.clone()], &[], &[])
    });
    assert!(storage.block_by_id(100).unwrap().is_none());
}

fn replica_family_round_trip<S: Storage>(storage: &S) {
    let replica = IndexedReplica {
        block_id: 300,
        storage_id: "dn-1".to_owned(),
        index: 0,
    };
    let corrupt = CorruptReplica {
        block_id: 300,
        storage_id: "dn-2".to_owned(),
    };
    let excess = ExcessReplica {
        block_id: 300,
        storage_id: "dn-3".to_owned(),
    };
    let ruc = ReplicaUnderConstruction {
        block_id: 300,
        storage_id: "dn-4".to_owned(),
        state: ReplicaState::Rbw,
        index: 1,
    };
    let invalidated = InvalidatedBlock {
        block_id: 300,
        storage_id: "dn-5".to_owned(),
        generation_stamp: 9,
        num_bytes: 512,
    };

    in_tx(storage, || {
        storage.prepare_replicas(&[], &[replica.clone()], &[])?;
        storage.prepare_corrupt_replicas(&[], &[corrupt.clone()])?;
        storage.prepare_excess_replicas(&[], &[excess.clone()])?;
        storage.prepare_replicas_uc(&[], &[ruc.clone()])?;
        storage.prepare_invalidated(&[], &[invalidated.clone()])
    });

    assert_eq!(vec![replica.clone()],
               storage.replicas_by_block(300).unwrap());
    assert_eq!(vec![corrupt.clone()],
               storage.corrupt_replicas_by_block(300).unwrap());
    assert_eq!(vec![excess.clone()],
               storage.excess_replicas_by_block(300).unwrap());
    assert_eq!(vec![ruc.clone()], storage.replicas_uc_by_block(300).unwrap());
    assert_eq!(vec![invalidated.clone()],
               storage.invalidated_by_block(300).unwrap());
    assert_eq!(vec![invalidated.clone()],
               storage.all_invalidated().unwrap());
    // Rows of other blocks stay invisible to the by-block finders.
    assert!(storage.replicas_by_block(301).unwrap().is_empty());

    in_tx(storage, || {
        storage.prepare_replicas(&[replica.clone()], &[], &[])?;
        storage.prepare_corrupt_replicas(&[corrupt.clone()], &[])?;
        storage.prepare_excess_replicas(&[excess.clone()], &[])?;
        storage.prepare_replicas_uc(&[ruc.clone()], &[])?;
        storage.prepare_invalidated(&[invalidated.clone()], &[])
    });
    assert!(storage.replicas_by_block(300).unwrap().is_empty());
    assert!(storage.invalidated_by_block(300).unwrap().is_empty());
}

fn queue_entities_round_trip<S: Storage>(storage: &S) {
    let urb = UnderReplicatedBlock {
        block_id: 400,
        level: 2,
    };
    let pending = PendingBlockInfo {
        block_id: 400,
        time_stamp: 123,
        num_replicas_in_progress: 1,
    };

    in_tx(storage, || {
        storage.prepare_under_replicated(&[], &[urb.clone()], &[])?;
        storage.prepare_pending(&[], &[pending.clone()], &[])
    });

    assert_eq!(Some(urb.clone()),
               storage.under_replicated_by_block(400).unwrap());
    assert_eq!(Some(pending.clone()), storage.pending_by_block(400).unwrap());
    assert_eq!(1, storage.all_under_replicated().unwrap().len());
    assert_eq!(1, storage.all_pending().unwrap().len());
    assert!(storage.under_replicated_by_block(401).unwrap().is_none());

    let mut bumped = urb.clone();
    bumped.level = 0;
    in_tx(storage, || {
        storage.prepare_under_replicated(&[], &[], &[bumped.clone()])
    });
    assert_eq!(Some(bumped.clone()),
               storage.under_replicated_by_block(400).unwrap());

    in_tx(storage, || {
        storage.prepare_under_replicated(&[bumped.clone()], &[], &[])?;
        storage.prepare_pending(&[pending.clone()], &[], &[])
    });
    assert!(storage.under_replicated_by_block(400).unwrap().is_none());
    assert!(storage.pending_by_block(400).unwrap().is_none());
}

fn lease_round_trip<S: Storage>(storage: &S) {
    let lease = Lease {
        holder: "client-7".to_owned(),
        holder_id: 7,
        last_update: 5555,
    };
    in_tx(storage, || {
        storage.prepare_leases(&[], &[lease.clone()], &[])
    });

    assert_eq!(lease, storage.lease_by_holder("client-7").unwrap().unwrap());
    assert_eq!(lease, storage.lease_by_holder_id(7).unwrap().unwrap());
    assert!(storage.lease_by_holder("client-8").unwrap().is_none());
    assert_eq!(1, storage.all_leases().unwrap().len());

    in_tx(storage, || {
        storage.prepare_leases(&[lease.clone()], &[], &[])
    });
    assert!(storage.lease_by_holder("client-7").unwrap().is_none());
}

fn lease_paths_sorted<S: Storage>(storage: &S) {
    let paths = ["/b/two", "/a/one", "/c/three"];
    in_tx(storage, || {
        let added: Vec<LeasePath> = paths
            .iter()
            .map(|p| LeasePath {
                path: (*p).to_owned(),
                holder_id: 9,
            })
            .collect();
        storage.prepare_lease_paths(&[], &added)
    });

    let found: Vec<String> = storage
        .lease_paths_by_holder_id(9)
        .unwrap()
        .into_iter()
        .map(|lp| lp.path)
        .collect();
    // Lexicographic order, so callers can lock paths in a stable order.
    assert_eq!(
        vec!["/a/one".to_owned(), "/b/two".to_owned(),
             "/c/three".to_owned()],
        found
    );
    assert!(storage.lease_path("/a/one").unwrap().is_some());
    assert!(storage.lease_paths_by_holder_id(10).unwrap().is_empty());

    in_tx(storage, || {
        let removed: Vec<LeasePath> = paths
            .iter()
            .map(|p| LeasePath {
                path: (*p).to_owned(),
                holder_id: 9,
            })
            .collect();
        storage.prepare_lease_paths(&removed, &[])
    });
}

fn block_key_round_trip<S: Storage>(storage: &S) {
    let current = BlockKey {
        key_id: 1,
        expiry_date: 10_000,
        key_type: KeyType::Current,
        key: vec![1; 32],
    };
    let next = BlockKey {
        key_id: 2,
        expiry_date: 20_000,
        key_type: KeyType::Next,
        key: vec![2; 32],
    };
    in_tx(storage, || {
        storage.prepare_keys(&[], &[current.clone(), next.clone()], &[])
    });

    assert_eq!(current, storage.key_by_id(1).unwrap().unwrap());
    assert_eq!(current,
               storage.key_by_type(KeyType::Current).unwrap().unwrap());
    assert_eq!(next, storage.key_by_type(KeyType::Next).unwrap().unwrap());
    assert_eq!(2, storage.all_keys().unwrap().len());

    let mut retired = current.clone();
    retired.key_type = KeyType::Simple;
    in_tx(storage, || {
        storage.prepare_keys(&[], &[], &[retired.clone()])
    });
    assert!(storage.key_by_type(KeyType::Current).unwrap().is_none());
    assert_eq!(retired, storage.key_by_id(1).unwrap().unwrap());

    in_tx(storage, || {
        storage.prepare_keys(&[retired.clone(), next.clone()], &[], &[])
    });
    assert!(storage.all_keys().unwrap().is_empty());
}

fn commit_publishes_writes<S: Storage>(storage: &S) {
    storage.begin_transaction().unwrap();
    storage
        .prepare_leases(
            &[],
            &[Lease {
                holder: "pending-holder".to_owned(),
                holder_id: 77,
                last_update: 1,
            }],
            &[],
        )
        .unwrap();
    storage.commit().unwrap();
    assert!(storage.lease_by_holder("pending-holder").unwrap().is_some());

    storage.begin_transaction().unwrap();
    storage
        .prepare_leases(
            &[Lease {
                holder: "pending-holder".to_owned(),
                holder_id: 77,
                last_update: 1,
            }],
            &[],
            &[],
        )
        .unwrap();
    storage.commit().unwrap();
}

fn rollback_discards_writes<S: Storage>(storage: &S) {
    storage.begin_transaction().unwrap();
    storage
        .prepare_leases(
            &[],
            &[Lease {
                holder: "doomed".to_owned(),
                holder_id: 66,
                last_update: 1,
            }],
            &[],
        )
        .unwrap();
    storage.rollback().unwrap();
    assert!(storage.lease_by_holder("doomed").unwrap().is_none());
    assert!(!storage.transaction_active());
}
