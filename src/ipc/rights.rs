//! Port rights management (capabilities)

use bitflags::bitflags;
use std::collections::HashMap;

use crate::types::{PortId, TaskId};

bitflags! {
    /// Capability bits a task may hold on a port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        /// May enqueue messages.
        const SEND = 0b001;
        /// May receive. The SEND bit is included: receiving implies
        /// sending.
        const RECEIVE = 0b011;
        /// One-shot reply capability, consumed on use.
        const SERVER = 0b100;
    }
}

/// Table of held capabilities keyed by `(task, port)`.
///
/// SEND and RECEIVE are permanent until cleanup; SERVER is consumed the
/// first time it is exercised. The table itself never touches reference
/// counts — callers retain on entry creation and release on consumption.
#[derive(Debug, Default)]
pub struct RightsTable {
    entries: HashMap<(TaskId, PortId), Rights>,
}

impl RightsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `rights` into the entry for `(task, port)`. Returns true when
    /// the entry was created, in which case the caller retains the port
    /// once.
    pub fn grant(&mut self, task: TaskId, port: PortId, rights: Rights) -> bool {
        match self.entries.get_mut(&(task, port)) {
            Some(mask) => {
                *mask |= rights;
                false
            }
            None => {
                self.entries.insert((task, port), rights);
                true
            }
        }
    }

    /// Consume a SERVER right if one is held: clear the bit, drop the
    /// entry when the mask empties, and return true so the caller
    /// releases the port once. Without SERVER this is a no-op.
    pub fn consume_server(&mut self, task: TaskId, port: PortId) -> bool {
        let Some(mask) = self.entries.get_mut(&(task, port)) else {
            return false;
        };
        if !mask.contains(Rights::SERVER) {
            return false;
        }
        mask.remove(Rights::SERVER);
        if mask.is_empty() {
            self.entries.remove(&(task, port));
        }
        true
    }

    /// Are all bits of `required` present?
    pub fn check(&self, task: TaskId, port: PortId, required: Rights) -> bool {
        self.entries
            .get(&(task, port))
            .is_some_and(|mask| mask.contains(required))
    }

    /// The full mask held, empty when no entry exists.
    pub fn mask(&self, task: TaskId, port: PortId) -> Rights {
        self.entries
            .get(&(task, port))
            .copied()
            .unwrap_or(Rights::empty())
    }

    /// Every `(port, mask)` entry held by `task` (cleanup path).
    pub fn held_by(&self, task: TaskId) -> Vec<(PortId, Rights)> {
        self.entries
            .iter()
            .filter(|((t, _), _)| *t == task)
            .map(|((_, port), mask)| (*port, *mask))
            .collect()
    }

    pub fn remove(&mut self, task: TaskId, port: PortId) -> Option<Rights> {
        self.entries.remove(&(task, port))
    }

    /// Purge every entry referencing `port` (destroy path).
    pub fn purge_port(&mut self, port: PortId) {
        self.entries.retain(|&(_, p), _| p != port);
    }

    /// Number of distinct tasks holding any right on `port`.
    pub fn holders_of(&self, port: PortId) -> usize {
        self.entries.keys().filter(|(_, p)| *p == port).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_implies_send() {
        let mut table = RightsTable::new();
        table.grant(TaskId(1), PortId(5), Rights::RECEIVE);
        assert!(table.check(TaskId(1), PortId(5), Rights::SEND));
        assert!(table.check(TaskId(1), PortId(5), Rights::RECEIVE));
        assert!(!table.check(TaskId(1), PortId(5), Rights::SERVER));
    }

    #[test]
    fn test_grant_is_monotonic() {
        let mut table = RightsTable::new();
        assert!(table.grant(TaskId(1), PortId(5), Rights::SEND));
        // Re-granting never drops bits and never re-creates the entry.
        assert!(!table.grant(TaskId(1), PortId(5), Rights::SERVER));
        assert_eq!(table.mask(TaskId(1), PortId(5)), Rights::SEND | Rights::SERVER);
    }

    #[test]
    fn test_server_is_consumed_once() {
        let mut table = RightsTable::new();
        table.grant(TaskId(1), PortId(5), Rights::SERVER);
        assert!(table.consume_server(TaskId(1), PortId(5)));
        // The entry emptied and vanished.
        assert_eq!(table.mask(TaskId(1), PortId(5)), Rights::empty());
        assert!(!table.consume_server(TaskId(1), PortId(5)));
    }

    #[test]
    fn test_consume_keeps_other_bits() {
        let mut table = RightsTable::new();
        table.grant(TaskId(1), PortId(5), Rights::SEND | Rights::SERVER);
        assert!(table.consume_server(TaskId(1), PortId(5)));
        assert_eq!(table.mask(TaskId(1), PortId(5)), Rights::SEND);
    }

    #[test]
    fn test_purge_port() {
        let mut table = RightsTable::new();
        table.grant(TaskId(1), PortId(5), Rights::RECEIVE);
        table.grant(TaskId(2), PortId(5), Rights::SEND);
        table.grant(TaskId(2), PortId(6), Rights::SEND);
        table.purge_port(PortId(5));
        assert_eq!(table.holders_of(PortId(5)), 0);
        assert!(table.check(TaskId(2), PortId(6), Rights::SEND));
    }
}
