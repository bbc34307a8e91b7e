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

//! The pure path-walking algorithm, shared by best-effort reads outside any
//! transaction and by the lock manager's resolution strategies.
//!
//! Walking never errors on a missing component: the resolved chain is
//! simply shorter than the path, and callers decide what partial existence
//! means. A symlink, on the other hand, cannot be followed here at all —
//! the walker has no authority to restart against another path while locks
//! may already be held — so it surfaces as the `UnresolvedPath` signal
//! carrying everything the caller needs to rewrite and retry.

use std::collections::BTreeSet;

use crate::context::TransactionContext;
use crate::defs::*;
use crate::errors::*;
use crate::model::Inode;
use crate::storage::*;

/// Where the walker fetches inodes from: either a transaction context
/// (lock-hinted reads) or raw storage (no transaction, latest committed).
pub trait InodeSource {
    fn source_inode_by_id(&mut self, id: InodeId) -> Result<Option<Inode>>;
    fn source_child(&mut self, parent_id: InodeId, name: &str)
                    -> Result<Option<Inode>>;
}

impl InodeSource for TransactionContext {
    fn source_inode_by_id(&mut self, id: InodeId) -> Result<Option<Inode>> {
        self.find_inode_by_id(id)
    }

    fn source_child(&mut self, parent_id: InodeId, name: &str)
                    -> Result<Option<Inode>> {
        self.find_inode_by_name_parent(name, parent_id)
    }
}

/// Adapter exposing a bare `Storage` as an `InodeSource`.
pub struct StorageSource<'a>(pub &'a dyn Storage);

impl<'a> InodeSource for StorageSource<'a> {
    fn source_inode_by_id(&mut self, id: InodeId) -> Result<Option<Inode>> {
        self.0.inode_by_id(id)
    }

    fn source_child(&mut self, parent_id: InodeId, name: &str)
                    -> Result<Option<Inode>> {
        self.0.inode_by_name_parent(name, parent_id)
    }
}

fn construct_path(components: &[String], start: usize, end: usize) -> String {
    components[start..end.min(components.len())].join("/")
}

/// Builds the symlink restart signal for `components[count]`.
pub(crate) fn unresolved(components: &[String], count: usize,
                         target: &str) -> Error {
    ErrorKind::UnresolvedPath(
        construct_path(components, 0, components.len()),
        construct_path(components, 0, count),
        construct_path(components, count + 1, components.len()),
        target.to_owned(),
    )
    .into()
}

/// Walks `components` from the root, returning the chain of inodes found
/// (root first). The chain is shorter than `components` if some component
/// does not exist; it is never longer.
///
/// A symlink stops the walk with `UnresolvedPath` unless it is the final
/// component and `resolve_last_link` is false, in which case the link inode
/// itself terminates the chain.
pub fn resolve_components<S: InodeSource>(
    source: &mut S,
    components: &[String],
    resolve_last_link: bool,
) -> Result<Vec<Inode>> {
    let mut resolved = Vec::with_capacity(components.len());

    let root = source
        .source_inode_by_id(ROOT_INODE_ID)?
        .ok_or_else(|| ErrorKind::InodeNotFound(ROOT_INODE_ID))?;
    resolved.push(root);

    let mut count = 0;
    while count + 1 < components.len() {
        let current = &resolved[count];
        if !current.is_dir {
            break;
        }

        let child = match source
            .source_child(current.id, &components[count + 1])?
        {
            Some(child) => child,
            None => break,
        };
        count += 1;
        let last = count == components.len() - 1;

        if child.is_symlink() && (!last || resolve_last_link) {
            let target = child.symlink_target.clone()
                .expect("symlink inode without target");
            return Err(unresolved(components, count, &target));
        }

        resolved.push(child);
        if last {
            break;
        }
    }

    Ok(resolved)
}

/// `resolve_components` on a slash-separated path.
pub fn resolve_path<S: InodeSource>(
    source: &mut S,
    path: &str,
    resolve_last_link: bool,
) -> Result<Vec<Inode>> {
    resolve_components(source, &path_components(path), resolve_last_link)
}

/// The inode id owning `block_id`, or `NON_EXISTING_INODE` if the block is
/// not (or no longer) in the store.
pub fn inode_id_by_block(storage: &dyn Storage, block_id: BlockId)
                         -> Result<InodeId> {
    Ok(storage
        .block_by_id(block_id)?
        .map(|b| b.inode_id)
        .unwrap_or(NON_EXISTING_INODE))
}

/// Builds the root-to-leaf inode chain for `inode_id` by following parent
/// pointers upward, then reversing. Returns an empty chain if the inode
/// does not exist; a chain whose parent disappears mid-walk is likewise
/// empty, since a partial chain is useless for locking.
pub fn chain_to_root<S: InodeSource>(source: &mut S, inode_id: InodeId)
                                     -> Result<Vec<Inode>> {
    if NON_EXISTING_INODE == inode_id {
        return Ok(Vec::new());
    }

    let mut chain = Vec::new();
    let mut next = inode_id;
    loop {
        let inode = match source.source_inode_by_id(next)? {
            Some(inode) => inode,
            None => return Ok(Vec::new()),
        };
        let parent = inode.parent_id;
        let at_root = ROOT_INODE_ID == inode.id;
        chain.push(inode);
        if at_root {
            break;
        }
        next = parent;
    }

    chain.reverse();
    Ok(chain)
}

/// Every path associated with the lease of `holder`, sorted
/// lexicographically so a caller can lock them in a stable order.
pub fn paths_by_lease_holder(storage: &dyn Storage, holder: &str)
                             -> Result<BTreeSet<String>> {
    let mut sorted = BTreeSet::new();
    let lease = match storage.lease_by_holder(holder)? {
        Some(lease) => lease,
        None => return Ok(sorted),
    };
    for lp in storage.lease_paths_by_holder_id(lease.holder_id)? {
        sorted.insert(lp.path);
    }
    Ok(sorted)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::model::*;
    use crate::storage::{Connector, InodeAccess, LeaseAccess,
                         LeasePathAccess, MemoryStore};

    fn seed(storage: &MemoryStore, inodes: Vec<Inode>) {
        storage.begin_transaction().unwrap();
        storage.prepare_inodes(&[], &inodes, &[]).unwrap();
        storage.commit().unwrap();
    }

    fn tree() -> MemoryStore {
        let storage = MemoryStore::new();
        seed(
            &storage,
            vec![
                Inode::directory(1, "a", ROOT_INODE_ID),
                Inode::directory(2, "b", 1),
                Inode::file(3, "f", 2, 1, 4096),
                Inode::symlink(4, "link", ROOT_INODE_ID, "/a/b"),
            ],
        );
        storage
    }

    #[test]
    fn resolves_existing_path() {
        let storage = tree();
        let chain =
            resolve_path(&mut StorageSource(&storage), "/a/b/f", true)
                .unwrap();
        let ids: Vec<InodeId> = chain.iter().map(|i| i.id).collect();
        assert_eq!(vec![ROOT_INODE_ID, 1, 2, 3], ids);
    }

    #[test]
    fn missing_component_shortens_chain() {
        let storage = tree();
        let chain =
            resolve_path(&mut StorageSource(&storage), "/a/nope/f", true)
                .unwrap();
        let ids: Vec<InodeId> = chain.iter().map(|i| i.id).collect();
        assert_eq!(vec![ROOT_INODE_ID, 1], ids);
    }

    #[test]
    fn root_resolves_to_itself() {
        let storage = tree();
        let chain =
            resolve_path(&mut StorageSource(&storage), "/", true).unwrap();
        assert_eq!(1, chain.len());
        assert_eq!(ROOT_INODE_ID, chain[0].id);
    }

    #[test]
    fn symlink_raises_restart_signal() {
        let storage = tree();
        let err =
            resolve_path(&mut StorageSource(&storage), "/link/f", true)
                .unwrap_err();
        match *err.kind() {
            ErrorKind::UnresolvedPath(ref path, ref preceding,
                                      ref remainder, ref target) => {
                assert_eq!("/link/f", path);
                assert_eq!("", preceding);
                assert_eq!("f", remainder);
                assert_eq!("/a/b", target);
            }
            ref k => panic!("unexpected error: {:?}", k),
        }

        // Restarting against the rewritten path reaches the real file.
        let rewritten = match *err.kind() {
            ErrorKind::UnresolvedPath(_, _, ref remainder, ref target) => {
                rewrite_link(target, remainder)
            }
            _ => unreachable!(),
        };
        assert_eq!("/a/b/f", rewritten);
        let chain =
            resolve_path(&mut StorageSource(&storage), &rewritten, true)
                .unwrap();
        assert_eq!(3, chain.last().unwrap().id);
    }

    #[test]
    fn final_symlink_kept_when_not_resolving_links() {
        let storage = tree();
        let chain =
            resolve_path(&mut StorageSource(&storage), "/link", false)
                .unwrap();
        assert_eq!(4, chain.last().unwrap().id);

        assert!(
            resolve_path(&mut StorageSource(&storage), "/link", true).is_err()
        );
    }

    #[test]
    fn chain_to_root_is_root_first() {
        let storage = tree();
        let chain = chain_to_root(&mut StorageSource(&storage), 3).unwrap();
        let ids: Vec<InodeId> = chain.iter().map(|i| i.id).collect();
        assert_eq!(vec![ROOT_INODE_ID, 1, 2, 3], ids);

        assert!(chain_to_root(&mut StorageSource(&storage), 99)
            .unwrap()
            .is_empty());
        assert!(chain_to_root(&mut StorageSource(&storage),
                              NON_EXISTING_INODE)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn chain_to_root_survives_deep_trees() {
        let storage = MemoryStore::new();
        let mut inodes = Vec::new();
        for id in 1..2048 {
            inodes.push(Inode::directory(id, &format!("d{}", id), id - 1));
        }
        seed(&storage, inodes);

        let chain =
            chain_to_root(&mut StorageSource(&storage), 2047).unwrap();
        assert_eq!(2048, chain.len());
        assert_eq!(ROOT_INODE_ID, chain[0].id);
        assert_eq!(2047, chain.last().unwrap().id);
    }

    #[test]
    fn lease_holder_paths_sorted() {
        let storage = Arc::new(MemoryStore::new());
        storage.begin_transaction().unwrap();
        storage
            .prepare_leases(
                &[],
                &[Lease {
                    holder: "writer".to_owned(),
                    holder_id: 3,
                    last_update: 0,
                }],
                &[],
            )
            .unwrap();
        storage
            .prepare_lease_paths(
                &[],
                &[
                    LeasePath {
                        path: "/z".to_owned(),
                        holder_id: 3,
                    },
                    LeasePath {
                        path: "/a".to_owned(),
                        holder_id: 3,
                    },
                ],
            )
            .unwrap();
        storage.commit().unwrap();

        let paths: Vec<String> = paths_by_lease_holder(&*storage, "writer")
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(vec!["/a".to_owned(), "/z".to_owned()], paths);
        assert!(paths_by_lease_holder(&*storage, "nobody")
            .unwrap()
            .is_empty());
    }
}
