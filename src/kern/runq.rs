//! Run queue management
//!
//! Multi-level priority queues with active/expired rotation (the classic
//! O(1) design). A bitmask records which priorities hold runnable tasks,
//! so the next pick is a leading-zero scan away. Numerically *higher*
//! priorities win: priorities here are importance scores assigned by the
//! spawner.

use std::collections::{HashMap, VecDeque};

use log::{debug, trace};

use crate::types::TaskId;

/// Default number of priority levels (0..=DEFAULT_MAX_PRIO); the queue
/// arrays grow on demand past this.
pub const DEFAULT_MAX_PRIO: usize = 16;

/// Fresh time-slice budget handed to every task.
pub const DEFAULT_SLICE: i32 = 2;

/// Width of the occupancy masks; priorities must stay below this.
const MASK_BITS: usize = 64;

pub struct PrioSched {
    active: Vec<VecDeque<TaskId>>,
    expired: Vec<VecDeque<TaskId>>,
    active_mask: u64,
    expired_mask: u64,
    slices: HashMap<TaskId, i32>,
    /// Current priority per task, so IPC wake-ups can target "the
    /// owner's priority" without asking the kernel.
    priorities: HashMap<TaskId, usize>,
}

impl PrioSched {
    pub fn new() -> Self {
        Self::with_max_prio(DEFAULT_MAX_PRIO)
    }

    pub fn with_max_prio(max_prio: usize) -> Self {
        let levels = max_prio + 1;
        Self {
            active: vec![VecDeque::new(); levels],
            expired: vec![VecDeque::new(); levels],
            active_mask: 0,
            expired_mask: 0,
            slices: HashMap::new(),
            priorities: HashMap::new(),
        }
    }

    fn grow_to(&mut self, prio: usize) {
        debug_assert!(prio < MASK_BITS, "priority {} out of mask range", prio);
        while prio >= self.active.len() {
            self.active.push(VecDeque::new());
            self.expired.push(VecDeque::new());
        }
    }

    /// Register a task: fresh slice, back of the active queue for `prio`.
    pub fn create_proc(&mut self, task: TaskId, prio: usize) {
        self.slices.insert(task, DEFAULT_SLICE);
        self.priorities.insert(task, prio);
        self.grow_to(prio);
        self.active[prio].push_back(task);
        self.active_mask |= 1 << prio;
        debug!("task {} enters run queue at priority {}", task, prio);
    }

    /// Highest set bit of an occupancy mask, i.e. the best runnable
    /// priority.
    fn highest(mask: u64) -> Option<usize> {
        if mask == 0 {
            None
        } else {
            Some((MASK_BITS - 1) - mask.leading_zeros() as usize)
        }
    }

    /// Pick the next task to run. When the active set drains, the expired
    /// set rotates in. The picked task moves to the expired queue of its
    /// priority, consuming one round of eligibility.
    pub fn get_next(&mut self) -> Option<TaskId> {
        if self.active_mask == 0 {
            if self.expired_mask == 0 {
                return None;
            }
            std::mem::swap(&mut self.active, &mut self.expired);
            std::mem::swap(&mut self.active_mask, &mut self.expired_mask);
        }

        let prio = Self::highest(self.active_mask)?;
        let task = self.active[prio].pop_front()?;
        if self.active[prio].is_empty() {
            self.active_mask &= !(1 << prio);
        }
        self.expired[prio].push_back(task);
        self.expired_mask |= 1 << prio;
        Some(task)
    }

    /// Burn one slice. True means the quantum expired and the budget was
    /// reset: the task should yield.
    pub fn tick(&mut self, task: TaskId) -> bool {
        let slice = self.slices.entry(task).or_insert(DEFAULT_SLICE);
        *slice -= 1;
        if *slice <= 0 {
            *slice = DEFAULT_SLICE;
            true
        } else {
            false
        }
    }

    /// Make a blocked task runnable *ahead* of queued peers of the same
    /// priority: woken tasks preempt their equals.
    pub fn wake_up(&mut self, task: TaskId, prio: usize) {
        self.grow_to(prio);
        self.priorities.insert(task, prio);
        self.active[prio].push_front(task);
        self.active_mask |= 1 << prio;
        trace!("task {} woken at priority {}", task, prio);
    }

    pub fn priority_of(&self, task: TaskId) -> Option<usize> {
        self.priorities.get(&task).copied()
    }

    /// Drop a task from every queue and table (exit path).
    pub fn remove(&mut self, task: TaskId) {
        self.slices.remove(&task);
        self.priorities.remove(&task);
        for prio in 0..self.active.len() {
            self.active[prio].retain(|t| *t != task);
            if self.active[prio].is_empty() {
                self.active_mask &= !(1 << prio);
            }
            self.expired[prio].retain(|t| *t != task);
            if self.expired[prio].is_empty() {
                self.expired_mask &= !(1 << prio);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active_mask == 0 && self.expired_mask == 0
    }
}

impl Default for PrioSched {
    fn default() -> Self {
        Self::new()
    }
}
