//! Virtual-time event queue.
//!
//! Every state change in the simulation happens inside a callback popped from
//! this queue in increasing time order. Events scheduled for the same instant
//! fire in the order they were scheduled. Scheduling returns an [`EventId`]
//! that can later be used to cancel the event; cancelled events are dropped
//! lazily when they reach the head of the heap.
//!
//! Time is a `std::time::Duration` measured from the start of the simulation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle returned for every scheduled event, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EventId(u64);

struct Scheduled<E> {
    time: Duration,
    id: EventId,
    event: E,
}

// BinaryHeap is a max-heap: invert the ordering so the earliest (time, seq) pops first.
impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.time.cmp(&self.time).then_with(|| other.id.cmp(&self.id))
    }
}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl<E> Eq for Scheduled<E> {}

pub(crate) struct EventQueue<E> {
    now: Duration,
    next_id: u64,
    heap: BinaryHeap<Scheduled<E>>,
    pending: HashSet<EventId>,
}

impl<E> EventQueue<E> {
    pub(crate) fn new() -> Self {
        EventQueue {
            now: Duration::ZERO,
            next_id: 0,
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
        }
    }

    /// Current virtual time.
    pub(crate) fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `event` to fire `delay` after the current time.
    pub(crate) fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let at = self.now + delay;
        self.schedule_at(at, event)
    }

    /// Schedule `event` at an absolute virtual time.
    ///
    /// Times in the past are clamped to `now` so the clock never runs backwards.
    pub(crate) fn schedule_at(&mut self, time: Duration, event: E) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.heap.push(Scheduled {
            time: time.max(self.now),
            id,
            event,
        });
        self.pending.insert(id);
        id
    }

    /// Cancel a scheduled event. Returns `true` if it was still pending.
    pub(crate) fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id)
    }

    /// Whether the event has neither fired nor been cancelled.
    pub(crate) fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id)
    }

    /// Number of events still pending.
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Time of the next live event, if any.
    pub(crate) fn peek_time(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|s| s.time)
    }

    /// Remove the next live event and advance the clock to its time.
    pub(crate) fn pop(&mut self) -> Option<(EventId, E)> {
        self.discard_cancelled();
        let scheduled = self.heap.pop()?;
        self.pending.remove(&scheduled.id);
        self.now = scheduled.time;
        Some((scheduled.id, scheduled.event))
    }

    /// Move the clock forward without firing anything. Used when a run stops
    /// before the next event.
    pub(crate) fn advance_to(&mut self, time: Duration) {
        if time > self.now {
            self.now = time;
        }
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.pending.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn events_pop_in_time_order() {
        let mut q = EventQueue::new();
        q.schedule(secs(3), "c");
        q.schedule(secs(1), "a");
        q.schedule(secs(2), "b");

        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(q.now(), secs(3));
    }

    #[test]
    fn ties_fire_first_scheduled_first() {
        let mut q = EventQueue::new();
        for i in 0..5 {
            q.schedule(secs(1), i);
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_events_never_fire() {
        let mut q = EventQueue::new();
        let a = q.schedule(secs(1), "a");
        let b = q.schedule(secs(2), "b");
        assert!(q.is_pending(a));
        assert!(q.cancel(a));
        assert!(!q.is_pending(a));
        assert!(!q.cancel(a));
        assert_eq!(q.len(), 1);

        assert_eq!(q.peek_time(), Some(secs(2)));
        let (id, e) = q.pop().unwrap();
        assert_eq!((id, e), (b, "b"));
        assert!(!q.is_pending(b));
        assert!(q.pop().is_none());
    }

    #[test]
    fn delays_are_relative_to_current_time() {
        let mut q = EventQueue::new();
        q.schedule(secs(5), 1);
        q.pop();
        q.schedule(secs(2), 2);
        assert_eq!(q.peek_time(), Some(secs(7)));
    }

    #[test]
    fn past_times_are_clamped_to_now() {
        let mut q = EventQueue::new();
        q.advance_to(secs(10));
        q.schedule_at(secs(4), ());
        assert_eq!(q.peek_time(), Some(secs(10)));
    }
}
