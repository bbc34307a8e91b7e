//-
// Copyright (c) 2016, Jason Lingle
//
// Permission to  use, copy,  modify, and/or distribute  this software  for any
// purpose  with or  without fee  is hereby  granted, provided  that the  above
// copyright notice and this permission notice appear in all copies.
//
// THE SOFTWARE  IS PROVIDED "AS  IS" AND  THE AUTHOR DISCLAIMS  ALL WARRANTIES
// WITH  REGARD   TO  THIS  SOFTWARE   INCLUDING  ALL  IMPLIED   WARRANTIES  OF
// MERCHANTABILITY AND FITNESS. IN NO EVENT  SHALL THE AUTHOR BE LIABLE FOR ANY
// SPECIAL,  DIRECT,   INDIRECT,  OR  CONSEQUENTIAL  DAMAGES   OR  ANY  DAMAGES
// WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN ACTION
// OF  CONTRACT, NEGLIGENCE  OR OTHER  TORTIOUS ACTION,  ARISING OUT  OF OR  IN
// CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.

//! Defines structured logs emitted by the transactional machinery.
//!
//! The intent is to immediately support normal "verbose" operation while
//! also providing useful output for tests. Callers that do not care pass a
//! `NullLogger`.

#![allow(dead_code)]

use crate::defs::KeyId;
use crate::errors::Error;

pub type LogLevel = u8;
/// Log level indicating an unrecoverable, non-localised error.
pub const FATAL: LogLevel = 0;
/// Log level indicating a localised error.
pub const ERROR: LogLevel = 1;
/// Log level indicating a somewhat surprising situation that can still be
/// handled reasonably, such as a transaction retry or a dead endpoint.
pub const WARN: LogLevel = 2;
/// Log level for informational messages not indicative of problems.
pub const INFO: LogLevel = 3;

#[derive(Clone, Copy, Debug)]
pub enum Log<'a> {
    /// A transactional unit of work started for the named operation.
    TxBegin(&'a str),
    /// The unit of work hit a transient failure on the given attempt and
    /// will be rolled back and retried.
    TxRetry(&'a str, u32, &'a Error),
    /// The unit of work committed.
    TxCommit(&'a str),
    /// The unit of work failed terminally.
    TxAbort(&'a str, &'a Error),
    /// The key schedule rotated: the first key retired, the second promoted.
    KeyRotation(KeyId, KeyId),
    /// A replica re-read the current/next keys after a rotation signal.
    KeysRefreshed(KeyId, KeyId),
    /// A namenode endpoint failed its liveness probe and was skipped.
    ProbeFailed(&'a str),
    /// Every candidate namenode failed its probe.
    SelectorExhausted,
}

pub trait Logger {
    fn log(&self, level: LogLevel, what: &Log);
}

/// A `Logger` which discards everything.
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _: LogLevel, _: &Log) {}
}

#[cfg(test)]
mod println_logger {
    use super::*;

    /// Trivial implementation of `Logger` which simply dumps everything (in
    /// debug format) to stdout.
    pub struct PrintlnLogger;

    impl Logger for PrintlnLogger {
        fn log(&self, level: LogLevel, what: &Log) {
            let level_str = match level {
                FATAL => "FATAL",
                ERROR => "ERROR",
                WARN => " WARN",
                INFO => " INFO",
                _ => "?????",
            };
            println!("[{}] {:?}", level_str, what);
        }
    }
}

#[cfg(test)]
pub use self::println_logger::PrintlnLogger;
