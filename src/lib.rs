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

//! Metanode is the metadata-coordination core of a multi-writer filesystem
//! namenode: several namenode processes share one logically consistent
//! namespace and block map held in an external store, instead of each
//! process owning an in-memory single-writer namespace.
//!
//! The pieces fit together as follows. A namespace operation describes the
//! entities it touches as a [`lock::TransactionLocks`] specification and
//! hands its body to [`txn::run_transaction`]. The lock manager resolves
//! paths through [`resolve`], then asks the data-access layer — a
//! [`storage::Storage`] backend seen through a per-operation
//! [`context::TransactionContext`] — to acquire row locks in one fixed,
//! global order. The block-token key schedule ([`tokens`]) and the
//! client-side namenode selector ([`select`]) sit beside the namespace path
//! but share the same storage and retry machinery.

#![recursion_limit = "1024"]

extern crate chrono;
extern crate rand;
extern crate sqlite;
extern crate tiny_keccak;
extern crate toml;
#[macro_use]
extern crate fourleaf;
#[macro_use]
extern crate error_chain;

#[cfg(test)]
extern crate tempfile;

pub mod defs;
pub mod errors;
pub mod log;
pub mod model;
mod sql;

pub mod storage;

pub mod config;
pub mod context;
pub mod lock;
pub mod resolve;
pub mod select;
pub mod tokens;
pub mod txn;
