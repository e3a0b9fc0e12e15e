//! Priority-ordered run queues.
use crate::thread::{GuestThread, ThreadRef};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A queue of threads ordered by priority.
///
/// The queue is non-strictly sorted by priority ascending (a lower value is
/// a higher priority), with insertion order preserved within a band. The
/// head is the thread entitled to execute on the owning core.
///
/// Threads are compared by identity, not by field values, as the same
/// handle is tracked by the wider emulator while it moves through queues.
pub(crate) struct RunQueue {
    threads: VecDeque<ThreadRef>,
}

impl RunQueue {
    pub(crate) fn new() -> RunQueue {
        RunQueue { threads: VecDeque::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub(crate) fn front(&self) -> Option<&ThreadRef> {
        self.threads.front()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ThreadRef> {
        self.threads.get(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ThreadRef> {
        self.threads.iter()
    }

    pub(crate) fn is_front(&self, thread: &GuestThread) -> bool {
        self.threads
            .front()
            .is_some_and(|front| std::ptr::eq(Arc::as_ptr(front), thread))
    }

    pub(crate) fn position_of(&self, thread: &GuestThread) -> Option<usize> {
        self.threads
            .iter()
            .position(|queued| std::ptr::eq(Arc::as_ptr(queued), thread))
    }

    /// Returns the index of the first thread with a strictly lower priority
    /// (greater numeric value), i.e. the insertion point that keeps the
    /// queue sorted and a band FIFO.
    pub(crate) fn upper_bound(&self, priority: i8) -> usize {
        self.threads
            .iter()
            .position(|queued| priority < queued.priority.load(Ordering::Acquire))
            .unwrap_or_else(|| self.threads.len())
    }

    /// Returns the index range of the threads sharing the given priority.
    pub(crate) fn equal_range(&self, priority: i8) -> (usize, usize) {
        let lower = self
            .threads
            .iter()
            .position(|queued| {
                queued.priority.load(Ordering::Acquire) >= priority
            })
            .unwrap_or_else(|| self.threads.len());

        (lower, self.upper_bound(priority))
    }

    pub(crate) fn insert(&mut self, index: usize, thread: ThreadRef) {
        self.threads.insert(index, thread);
    }

    /// Inserts the thread at its priority-ordered position, returning the
    /// index it landed at.
    pub(crate) fn insert_ordered(&mut self, thread: ThreadRef) -> usize {
        let index = self.upper_bound(thread.priority.load(Ordering::Acquire));

        self.threads.insert(index, thread);
        index
    }

    pub(crate) fn push_front(&mut self, thread: ThreadRef) {
        self.threads.push_front(thread);
    }

    /// Removes the given thread, returning the index it occupied.
    pub(crate) fn remove(&mut self, thread: &GuestThread) -> Option<usize> {
        let index = self.position_of(thread)?;

        self.threads.remove(index);
        Some(index)
    }

    /// Splices the head back into its priority-ordered position, i.e.
    /// round-robins it to the tail of its own band.
    pub(crate) fn rotate_front(&mut self) {
        if self.threads.len() < 2 {
            return;
        }

        if let Some(thread) = self.threads.pop_front() {
            let index =
                self.upper_bound(thread.priority.load(Ordering::Acquire));

            self.threads.insert(index, thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::new_thread;

    #[test]
    fn test_insert_ordered_sorts_by_priority() {
        let mut queue = RunQueue::new();
        let t1 = new_thread(1, 40, 0);
        let t2 = new_thread(2, 30, 0);
        let t3 = new_thread(3, 50, 0);

        assert_eq!(queue.insert_ordered(t1.clone()), 0);
        assert_eq!(queue.insert_ordered(t2.clone()), 0);
        assert_eq!(queue.insert_ordered(t3.clone()), 2);

        assert!(queue.is_front(&t2));
        assert_eq!(queue.position_of(&t1), Some(1));
        assert_eq!(queue.position_of(&t3), Some(2));
    }

    #[test]
    fn test_insert_ordered_is_fifo_within_a_band() {
        let mut queue = RunQueue::new();
        let t1 = new_thread(1, 40, 0);
        let t2 = new_thread(2, 40, 0);
        let t3 = new_thread(3, 40, 0);

        queue.insert_ordered(t1.clone());
        queue.insert_ordered(t2.clone());
        queue.insert_ordered(t3.clone());

        assert_eq!(queue.position_of(&t1), Some(0));
        assert_eq!(queue.position_of(&t2), Some(1));
        assert_eq!(queue.position_of(&t3), Some(2));
    }

    #[test]
    fn test_equal_range() {
        let mut queue = RunQueue::new();

        queue.insert_ordered(new_thread(1, 30, 0));
        queue.insert_ordered(new_thread(2, 40, 0));
        queue.insert_ordered(new_thread(3, 40, 0));
        queue.insert_ordered(new_thread(4, 50, 0));

        assert_eq!(queue.equal_range(40), (1, 3));
        assert_eq!(queue.equal_range(35), (1, 1));
        assert_eq!(queue.equal_range(60), (4, 4));
    }

    #[test]
    fn test_rotate_front_round_robins_the_band() {
        let mut queue = RunQueue::new();
        let t1 = new_thread(1, 40, 0);
        let t2 = new_thread(2, 40, 0);
        let t3 = new_thread(3, 50, 0);

        queue.insert_ordered(t1.clone());
        queue.insert_ordered(t2.clone());
        queue.insert_ordered(t3.clone());

        queue.rotate_front();

        assert_eq!(queue.position_of(&t2), Some(0));
        assert_eq!(queue.position_of(&t1), Some(1));
        assert_eq!(queue.position_of(&t3), Some(2));
    }

    #[test]
    fn test_rotate_front_with_a_singleton() {
        let mut queue = RunQueue::new();
        let t1 = new_thread(1, 40, 0);

        queue.insert_ordered(t1.clone());
        queue.rotate_front();

        assert!(queue.is_front(&t1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut queue = RunQueue::new();
        let t1 = new_thread(1, 30, 0);
        let t2 = new_thread(2, 40, 0);

        queue.insert_ordered(t1.clone());
        queue.insert_ordered(t2.clone());

        assert_eq!(queue.remove(&t1), Some(0));
        assert_eq!(queue.remove(&t1), None);
        assert!(queue.is_front(&t2));
    }
}
