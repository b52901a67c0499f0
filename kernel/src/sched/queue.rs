//! Ready queues and the sleepers set (spec 4.D).

extern crate alloc;

use alloc::collections::VecDeque;

use super::task::{PriorityClass, TaskId};

/// One circular FIFO ring per priority class. Pushing always goes to the
/// tail; popping always comes from the head, scanning classes highest first.
#[derive(Default)]
pub struct ReadyQueues {
    classes: [VecDeque<TaskId>; PriorityClass::COUNT],
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self {
            classes: Default::default(),
        }
    }

    pub fn push_tail(&mut self, class: PriorityClass, id: TaskId) {
        self.classes[class.index()].push_back(id);
    }

    /// Pop the head of the highest-priority non-empty ring.
    pub fn pop_highest(&mut self) -> Option<TaskId> {
        for class in PriorityClass::HIGHEST_FIRST {
            if let Some(id) = self.classes[class.index()].pop_front() {
                return Some(id);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    /// Remove `id` from wherever it sits in the rings, if present. Used when
    /// a ready task is blocked or killed before it gets a turn.
    pub fn remove(&mut self, id: TaskId) -> bool {
        for ring in &mut self.classes {
            if let Some(pos) = ring.iter().position(|&t| t == id) {
                ring.remove(pos);
                return true;
            }
        }
        false
    }
}

/// A sleeping task, recorded with the order it went to sleep in so that two
/// tasks waking at the same millisecond keep FIFO order between themselves.
struct Sleeper {
    id: TaskId,
    wake_ms: u64,
    sequence: u64,
}

/// Tasks blocked on `AwaitTimestamp`, ordered for "earliest wake, then
/// earliest insertion" extraction. Scale here is small (a hobbyist kernel's
/// task count), so a linear scan per tick is the right amount of machinery.
#[derive(Default)]
pub struct SleepQueue {
    sleepers: alloc::vec::Vec<Sleeper>,
    next_sequence: u64,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self {
            sleepers: alloc::vec::Vec::new(),
            next_sequence: 0,
        }
    }

    pub fn insert(&mut self, id: TaskId, wake_ms: u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.sleepers.push(Sleeper { id, wake_ms, sequence });
    }

    pub fn remove(&mut self, id: TaskId) {
        self.sleepers.retain(|s| s.id != id);
    }

    /// Drain every sleeper whose wake time has arrived, in (wake_ms,
    /// insertion order) order, removing them from the set.
    pub fn drain_due(&mut self, current_ms: u64) -> alloc::vec::Vec<TaskId> {
        let mut due: alloc::vec::Vec<usize> = self
            .sleepers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.wake_ms <= current_ms)
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by_key(|&idx| (self.sleepers[idx].wake_ms, self.sleepers[idx].sequence));

        let mut woken = alloc::vec::Vec::with_capacity(due.len());
        for &idx in &due {
            woken.push(self.sleepers[idx].id);
        }
        let due_set: alloc::collections::BTreeSet<usize> = due.into_iter().collect();
        let mut kept = alloc::vec::Vec::with_capacity(self.sleepers.len() - due_set.len());
        for (idx, sleeper) in self.sleepers.drain(..).enumerate() {
            if !due_set.contains(&idx) {
                kept.push(sleeper);
            }
        }
        self.sleepers = kept;
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_drains_highest_class_first() {
        let mut q = ReadyQueues::new();
        q.push_tail(PriorityClass::Normal, TaskId::from_raw_for_test(1));
        q.push_tail(PriorityClass::Kernel, TaskId::from_raw_for_test(2));
        assert_eq!(q.pop_highest(), Some(TaskId::from_raw_for_test(2)));
        assert_eq!(q.pop_highest(), Some(TaskId::from_raw_for_test(1)));
        assert!(q.is_empty());
    }

    #[test]
    fn ready_queue_fifo_within_class() {
        let mut q = ReadyQueues::new();
        q.push_tail(PriorityClass::Normal, TaskId::from_raw_for_test(1));
        q.push_tail(PriorityClass::Normal, TaskId::from_raw_for_test(2));
        assert_eq!(q.pop_highest(), Some(TaskId::from_raw_for_test(1)));
        assert_eq!(q.pop_highest(), Some(TaskId::from_raw_for_test(2)));
    }

    #[test]
    fn sleepers_wake_in_insertion_order_on_tie() {
        let mut sq = SleepQueue::new();
        sq.insert(TaskId::from_raw_for_test(1), 1000);
        sq.insert(TaskId::from_raw_for_test(2), 1000);
        sq.insert(TaskId::from_raw_for_test(3), 2000);
        let woken = sq.drain_due(1500);
        assert_eq!(
            woken,
            alloc::vec![TaskId::from_raw_for_test(1), TaskId::from_raw_for_test(2)]
        );
    }
}
