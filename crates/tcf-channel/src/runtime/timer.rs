//! Deadline-ordered queue of delayed tasks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::Task;

struct Timer {
    deadline: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<Timer>,
    sequence: u64,
}

impl TimerQueue {
    pub(super) fn push(&mut self, deadline: Instant, task: Task) {
        self.sequence += 1;
        self.heap.push(Timer {
            deadline,
            sequence: self.sequence,
            task,
        });
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|timer| timer.deadline)
    }

    pub(super) fn pop_due(&mut self, now: Instant) -> Option<Task> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap.pop().map(|timer| timer.task)
    }

    pub(super) fn clear(&mut self) -> usize {
        let pending = self.heap.len();
        self.heap.clear();
        pending
    }
}
