//-
// Copyright (c) 2016, 2017, 2021, Jason Lingle
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

//! The transactional unit of work wrapping every namespace operation:
//! begin, acquire locks, run the body, commit — and on a transient storage
//! failure roll the whole thing back and run it again from scratch.
//!
//! There is no partial-progress preservation: a retried unit re-resolves,
//! re-locks, and re-executes, which is exactly what makes the optimistic
//! resolution strategies sound.

use std::sync::Arc;

use crate::context::TransactionContext;
use crate::errors::*;
use crate::log::{Log, Logger, INFO, WARN};
use crate::storage::Storage;

/// How many times a unit of work is attempted before its last transient
/// failure becomes terminal.
pub const TX_RETRY_LIMIT: u32 = 3;

/// Runs `f` — lock acquisition plus operation body — inside a transaction,
/// committing on success.
///
/// Transient failures (lock-wait timeout, store-reported deadlock abort,
/// connection loss, stale resolution) roll back and retry the whole unit up
/// to `TX_RETRY_LIMIT` times. Anything else rolls back and propagates
/// immediately; note that the unresolved-path signal takes this route, since
/// only the caller knows how to rewrite the path.
pub fn run_transaction<T, F>(
    storage: &Arc<dyn Storage>,
    logger: &dyn Logger,
    op: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut(&mut TransactionContext) -> Result<T>,
{
    let mut last = None;

    for attempt in 1..=TX_RETRY_LIMIT {
        logger.log(INFO, &Log::TxBegin(op));
        let mut ctx = TransactionContext::begin(Arc::clone(storage))?;

        let failure = match f(&mut ctx) {
            Ok(value) => match ctx.commit() {
                Ok(()) => {
                    logger.log(INFO, &Log::TxCommit(op));
                    return Ok(value);
                }
                Err(e) => e,
            },
            Err(e) => {
                if let Err(rb) = ctx.rollback() {
                    logger.log(WARN, &Log::TxAbort(op, &rb));
                }
                e
            }
        };

        if failure.is_transient() && attempt < TX_RETRY_LIMIT {
            logger.log(WARN, &Log::TxRetry(op, attempt, &failure));
            last = Some(failure);
        } else if failure.is_transient() {
            last = Some(failure);
        } else {
            logger.log(WARN, &Log::TxAbort(op, &failure));
            return Err(failure);
        }
    }

    let last = last.expect("retries exhausted with no recorded failure");
    logger.log(WARN, &Log::TxAbort(op, &last));
    Err(Error::with_chain(last, ErrorKind::TooManyTxRetries))
}

/// The light-weight variant for lock-free, best-effort reads: no
/// transaction, no context, but the same bounded retry on transient
/// failures.
pub fn run_light<T, F>(storage: &Arc<dyn Storage>, mut f: F) -> Result<T>
where
    F: FnMut(&dyn Storage) -> Result<T>,
{
    let mut last = None;
    for _ in 0..TX_RETRY_LIMIT {
        match f(&**storage) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => last = Some(e),
            Err(e) => return Err(e),
        }
    }

    let last = last.expect("retries exhausted with no recorded failure");
    Err(Error::with_chain(last, ErrorKind::TooManyTxRetries))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::defs::ROOT_INODE_ID;
    use crate::log::NullLogger;
    use crate::model::Inode;
    use crate::storage::{Connector, InodeAccess, MemoryStore};

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn commits_on_success() {
        let storage = storage();
        run_transaction(&storage, &NullLogger, "add", |ctx| {
            ctx.add_inode(Inode::directory(5, "d", ROOT_INODE_ID))
        })
        .unwrap();
        assert!(storage.inode_by_id(5).unwrap().is_some());
    }

    #[test]
    fn retries_transient_failures_until_success() {
        let storage = storage();
        let attempts = AtomicUsize::new(0);
        run_transaction(&storage, &NullLogger, "flaky", |_ctx| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ErrorKind::DeadlockAbort.into())
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(3, attempts.load(Ordering::SeqCst));
    }

    #[test]
    fn transient_failures_become_terminal_after_limit() {
        let storage = storage();
        let attempts = AtomicUsize::new(0);
        let err = run_transaction::<(), _>(
            &storage,
            &NullLogger,
            "doomed",
            |_ctx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ErrorKind::DeadlockAbort.into())
            },
        )
        .unwrap_err();

        assert_eq!(TX_RETRY_LIMIT as usize, attempts.load(Ordering::SeqCst));
        match *err.kind() {
            ErrorKind::TooManyTxRetries => {}
            ref k => panic!("unexpected error: {:?}", k),
        }
    }

    #[test]
    fn fatal_failures_do_not_retry() {
        let storage = storage();
        let attempts = AtomicUsize::new(0);
        let err = run_transaction::<(), _>(
            &storage,
            &NullLogger,
            "fatal",
            |_ctx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ErrorKind::SchemaViolation("bad".to_owned()).into())
            },
        )
        .unwrap_err();

        assert_eq!(1, attempts.load(Ordering::SeqCst));
        match *err.kind() {
            ErrorKind::SchemaViolation(..) => {}
            ref k => panic!("unexpected error: {:?}", k),
        }
    }

    #[test]
    fn failed_unit_rolls_back_its_writes() {
        let storage = storage();
        let _ = run_transaction::<(), _>(&storage, &NullLogger, "abort",
                                         |ctx| {
            ctx.add_inode(Inode::directory(5, "d", ROOT_INODE_ID))?;
            Err(ErrorKind::InvariantViolation("nope".to_owned()).into())
        });
        assert!(storage.inode_by_id(5).unwrap().is_none());
    }

    #[test]
    fn light_variant_reads_without_transaction() {
        let storage = storage();
        let name = run_light(&storage, |s| {
            Ok(s.inode_by_id(ROOT_INODE_ID)?.map(|i| i.name))
        })
        .unwrap();
        assert_eq!(Some(String::new()), name);
        assert!(!storage.transaction_active());
    }
}
