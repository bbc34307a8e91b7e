//-
// Copyright (c) 2016, Jason Lingle
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

use std::io;

use fourleaf;
use sqlite;

use crate::defs::{BlockId, InodeId, KeyId, Timestamp};

// SQLite primary result codes that indicate the database is merely busy or
// locked rather than broken; both clear up once the competing transaction
// finishes.
const SQLITE_BUSY: isize = 5;
const SQLITE_LOCKED: isize = 6;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links { }

    foreign_links {
        Io(io::Error);
        Sqlite(sqlite::Error);
        FourleafDeser(fourleaf::de::Error);
        FourleafSer(fourleaf::stream::Error);
    }

    errors {
        // Transient storage failures. The unit-of-work wrapper rolls the
        // whole operation back and retries on any of these.
        LockTimeout(entity: &'static str, key: String) {
            description("Timed out waiting for a row lock")
            display("Timed out waiting for {} lock on '{}'", entity, key)
        }
        DeadlockAbort {
            description("Storage aborted the transaction to break a deadlock")
            display("Storage aborted the transaction to break a deadlock")
        }
        ConnectionLost(detail: String) {
            description("Lost connection to the storage backend")
            display("Lost connection to the storage backend: {}", detail)
        }
        StaleResolve(detail: String) {
            description("Namespace changed between optimistic and locked \
                         resolution")
            display("Namespace changed under this operation: {}", detail)
        }

        // Fatal storage failures, surfaced to the caller without retry.
        SchemaViolation(detail: String) {
            description("Storage rejected a change that violates the schema")
            display("Schema violation: {}", detail)
        }
        InvariantViolation(detail: String) {
            description("Stored data violates a namespace invariant")
            display("Invariant violation: {}", detail)
        }
        TransactionInactive {
            description("Repository call outside an active transaction")
            display("Repository call outside an active transaction")
        }
        ConflictingBlockLock {
            description("Lock request names both an inode path and an \
                         explicit block id")
            display("Acquiring block locks by inode and by explicit block id \
                     in one request is not allowed")
        }
        TooManyTxRetries {
            description("Transaction failed too many times")
            display("Transaction failed too many times")
        }

        // Not a failure: resolution ran into a symlink and the caller must
        // rewrite the path with the link target and start over.
        UnresolvedPath(path: String, preceding: String,
                       remainder: String, target: String) {
            description("Path resolution stopped at a symlink")
            display("Path '{}' unresolved at symlink (preceding '{}', \
                     remainder '{}', target '{}')",
                    path, preceding, remainder, target)
        }

        // Block-token verification failures. Always rejected, never retried.
        TokenUserMismatch(user: String) {
            description("Block token does not belong to this user")
            display("Block token does not belong to user '{}'", user)
        }
        TokenBlockMismatch(expected: BlockId, actual: BlockId) {
            description("Block token does not apply to this block")
            display("Block token for block {} does not apply to block {}",
                    actual, expected)
        }
        TokenExpired(expiry: Timestamp) {
            description("Block token is expired")
            display("Block token expired at {}", expiry)
        }
        TokenAccessModeDenied(mode: String) {
            description("Block token does not grant the requested access")
            display("Block token does not grant {} access", mode)
        }
        TokenKeyNotFound(key_id: KeyId) {
            description("Block key referenced by the token no longer exists")
            display("Cannot recompute password: block key {} does not exist",
                    key_id)
        }
        TokenSignatureMismatch {
            description("Block token password does not match")
            display("Block token password does not match")
        }
        KeysNotInitialized {
            description("Block keys have not been initialised")
            display("Block keys have not been initialised")
        }

        InodeNotFound(id: InodeId) {
            description("Referenced inode does not exist")
            display("Inode {} does not exist", id)
        }
        NoReachableNamenode {
            description("Unable to connect to any namenode")
            display("Unable to connect to any namenode")
        }
    }
}

impl Error {
    /// Whether this failure is expected to clear up on its own, so that the
    /// surrounding unit of work should roll back and try again.
    pub fn is_transient(&self) -> bool {
        match *self.kind() {
            ErrorKind::LockTimeout(..)
            | ErrorKind::DeadlockAbort
            | ErrorKind::ConnectionLost(..)
            | ErrorKind::StaleResolve(..) => true,
            ErrorKind::Sqlite(ref e) => {
                Some(SQLITE_BUSY) == e.code || Some(SQLITE_LOCKED) == e.code
            }
            _ => false,
        }
    }
}
