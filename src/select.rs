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

//! Client-side routing among the namenode endpoints of a horizontally
//! scaled cluster: readers go to any namenode, writers only to the writer
//! set, and a dead endpoint is skipped rather than failing the call.
//!
//! Selection never loops more than once around the candidate list, so a
//! fully unreachable cluster costs one probing pass and then fails the
//! call — the process keeps running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::errors::*;
use crate::log::{Log, Logger, WARN};

/// A namenode endpoint as the selector sees it: an identity for logging and
/// a liveness probe.
pub trait NamenodeEndpoint {
    fn id(&self) -> &str;
    /// Whether the namenode currently answers. Called on every selection,
    /// so implementations should keep it as cheap as a ping.
    fn ping(&self) -> bool;
}

/// The selection policies. A closed set, resolved when configuration is
/// parsed; an unrecognised identifier falls back to the default (round
/// robin) instead of failing startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorPolicy {
    RoundRobin,
    Random,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        SelectorPolicy::RoundRobin
    }
}

impl SelectorPolicy {
    /// Parses a configured policy name, falling back to the default for
    /// anything unrecognised.
    pub fn parse(name: &str) -> SelectorPolicy {
        match name {
            "round-robin" => SelectorPolicy::RoundRobin,
            "random" => SelectorPolicy::Random,
            _ => SelectorPolicy::default(),
        }
    }
}

/// Routes requests to reader and writer namenodes. Writers are also
/// eligible readers; dedicated readers never see writes.
///
/// The round-robin cursor is one shared counter. Under concurrent callers
/// the order interleaves, making selection approximately fair rather than
/// strictly sequential; strict sequencing is a non-goal.
pub struct NameNodeSelector<E> {
    readers: Vec<Arc<E>>,
    writers: Vec<Arc<E>>,
    policy: SelectorPolicy,
    cursor: AtomicUsize,
    logger: Arc<dyn Logger + Send + Sync>,
}

impl<E: NamenodeEndpoint> NameNodeSelector<E> {
    /// Builds a selector over the given endpoint lists. `readers` holds the
    /// dedicated readers; every writer is appended to the reader candidates
    /// as well.
    pub fn new(
        policy: SelectorPolicy,
        readers: Vec<Arc<E>>,
        writers: Vec<Arc<E>>,
        logger: Arc<dyn Logger + Send + Sync>,
    ) -> Self {
        let mut read_candidates = readers;
        read_candidates.extend(writers.iter().cloned());
        NameNodeSelector {
            readers: read_candidates,
            writers,
            policy,
            cursor: AtomicUsize::new(0),
            logger,
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// The next live namenode eligible for reads.
    pub fn next_reader(&self) -> Result<Arc<E>> {
        self.next_from(&self.readers)
    }

    /// The next live namenode eligible for writes.
    pub fn next_writer(&self) -> Result<Arc<E>> {
        self.next_from(&self.writers)
    }

    /// One pass around `candidates`, probing each pick: the first that
    /// responds wins. A failed probe advances to another candidate without
    /// disturbing how the cursor will move on future turns.
    fn next_from(&self, candidates: &[Arc<E>]) -> Result<Arc<E>> {
        for _ in 0..candidates.len() {
            let client = &candidates[self.pick(candidates.len())];
            if client.ping() {
                return Ok(Arc::clone(client));
            }
            self.logger.log(WARN, &Log::ProbeFailed(client.id()));
        }

        self.logger.log(WARN, &Log::SelectorExhausted);
        Err(ErrorKind::NoReachableNamenode.into())
    }

    fn pick(&self, len: usize) -> usize {
        match self.policy {
            SelectorPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % len
            }
            SelectorPolicy::Random => rand::thread_rng().gen_range(0..len),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::log::NullLogger;

    #[derive(Debug)]
    struct StubNode {
        id: String,
        alive: AtomicBool,
    }

    impl StubNode {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(StubNode {
                id: id.to_owned(),
                alive: AtomicBool::new(true),
            })
        }

        fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }
    }

    impl NamenodeEndpoint for StubNode {
        fn id(&self) -> &str {
            &self.id
        }

        fn ping(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn selector(
        policy: SelectorPolicy,
        nodes: &[Arc<StubNode>],
    ) -> NameNodeSelector<StubNode> {
        NameNodeSelector::new(
            policy,
            nodes.to_vec(),
            Vec::new(),
            Arc::new(NullLogger),
        )
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let nodes =
            [StubNode::new("a"), StubNode::new("b"), StubNode::new("c")];
        let selector = selector(SelectorPolicy::RoundRobin, &nodes);

        let picked: Vec<String> = (0..6)
            .map(|_| selector.next_reader().unwrap().id().to_owned())
            .collect();
        assert_eq!(vec!["a", "b", "c", "a", "b", "c"], picked);
    }

    #[test]
    fn dead_node_is_skipped_without_breaking_rotation() {
        let nodes =
            [StubNode::new("a"), StubNode::new("b"), StubNode::new("c")];
        let selector = selector(SelectorPolicy::RoundRobin, &nodes);

        assert_eq!("a", selector.next_reader().unwrap().id());
        nodes[1].set_alive(false);
        // B fails its probe; the same turn moves on to C.
        assert_eq!("c", selector.next_reader().unwrap().id());
        // The cursor advanced past C during the probe, so the next turn
        // wraps to A: rotation resumes where the probing left off.
        assert_eq!("a", selector.next_reader().unwrap().id());
    }

    #[test]
    fn exhausted_cluster_fails_but_recovers() {
        let nodes = [StubNode::new("a"), StubNode::new("b")];
        let selector = selector(SelectorPolicy::RoundRobin, &nodes);
        nodes[0].set_alive(false);
        nodes[1].set_alive(false);

        match *selector.next_reader().unwrap_err().kind() {
            ErrorKind::NoReachableNamenode => {}
            ref k => panic!("unexpected error: {:?}", k),
        }

        // A node coming back makes selection work again; the selector
        // never blacklists.
        nodes[1].set_alive(true);
        assert_eq!("b", selector.next_reader().unwrap().id());
    }

    #[test]
    fn writers_are_eligible_readers() {
        let readers = vec![StubNode::new("r1")];
        let writers = vec![StubNode::new("w1")];
        let selector = NameNodeSelector::new(
            SelectorPolicy::RoundRobin,
            readers,
            writers,
            Arc::new(NullLogger),
        );

        assert_eq!(2, selector.reader_count());
        assert_eq!(1, selector.writer_count());

        let mut seen: Vec<String> = (0..2)
            .map(|_| selector.next_reader().unwrap().id().to_owned())
            .collect();
        seen.sort();
        assert_eq!(vec!["r1", "w1"], seen);
        assert_eq!("w1", selector.next_writer().unwrap().id());
    }

    #[test]
    fn empty_writer_set_fails_cleanly() {
        let selector = NameNodeSelector::new(
            SelectorPolicy::RoundRobin,
            vec![StubNode::new("r1")],
            Vec::new(),
            Arc::new(NullLogger),
        );
        assert!(selector.next_writer().is_err());
        assert!(selector.next_reader().is_ok());
    }

    #[test]
    fn random_policy_stays_within_candidates() {
        let nodes = [StubNode::new("a"), StubNode::new("b")];
        let selector = selector(SelectorPolicy::Random, &nodes);
        for _ in 0..32 {
            let id = selector.next_reader().unwrap().id().to_owned();
            assert!("a" == id || "b" == id);
        }
    }

    #[test]
    fn unknown_policy_name_falls_back_to_default() {
        assert_eq!(SelectorPolicy::RoundRobin,
                   SelectorPolicy::parse("round-robin"));
        assert_eq!(SelectorPolicy::Random, SelectorPolicy::parse("random"));
        assert_eq!(SelectorPolicy::RoundRobin,
                   SelectorPolicy::parse("no-such-policy"));
    }

    #[test]
    fn shared_cursor_is_safe_under_concurrent_callers() {
        let nodes =
            [StubNode::new("a"), StubNode::new("b"), StubNode::new("c")];
        let selector =
            Arc::new(selector(SelectorPolicy::RoundRobin, &nodes));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let selector = Arc::clone(&selector);
            handles.push(std::thread::spawn(move || {
                for _ in 0..64 {
                    selector.next_reader().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
