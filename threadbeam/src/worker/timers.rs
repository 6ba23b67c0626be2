//! Repeating-loop timer bookkeeping for a worker thread.
//!
//! Loop ids are handed out immediately by the worker handle; the timer
//! behind a loop only exists once the arm request has executed on the worker
//! thread. This table maps one to the other and tracks deadlines. Cancelled
//! timers are removed from the maps only; their stale heap entries are
//! skipped lazily when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::worker::LoopId;

pub(crate) type LoopBody = Arc<dyn Fn() + Send + Sync>;

struct LoopEntry {
    every: Duration,
    body: LoopBody,
}

#[derive(Default)]
pub(crate) struct LoopTimers {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    active: HashMap<u64, LoopEntry>,
    by_loop: HashMap<LoopId, u64>,
    next_timer_id: u64,
}

impl LoopTimers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms a repeating timer for `loop_id`, first due one interval from
    /// now. Returns the internal timer id.
    pub(crate) fn arm(&mut self, loop_id: LoopId, body: LoopBody, every: Duration) -> u64 {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.active.insert(timer_id, LoopEntry { every, body });
        self.by_loop.insert(loop_id, timer_id);
        self.deadlines.push(Reverse((Instant::now() + every, timer_id)));
        timer_id
    }

    /// Cancels the timer behind `loop_id`. False if the loop is unknown
    /// (never armed, already stopped, or cleared by shutdown).
    pub(crate) fn disarm(&mut self, loop_id: LoopId) -> bool {
        match self.by_loop.remove(&loop_id) {
            Some(timer_id) => {
                self.active.remove(&timer_id);
                true
            }
            None => false,
        }
    }

    /// Cancels every timer, returning how many were active.
    pub(crate) fn clear(&mut self) -> usize {
        let cancelled = self.by_loop.len();
        self.by_loop.clear();
        self.active.clear();
        self.deadlines.clear();
        cancelled
    }

    /// The next instant any live timer comes due, pruning stale entries of
    /// cancelled timers along the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, timer_id))) = self.deadlines.peek().copied() {
            if self.active.contains_key(&timer_id) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Pops every timer due at `now`, rescheduling each one interval out,
    /// and returns their bodies for the caller to run outside the lock.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<LoopBody> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, timer_id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(entry) = self.active.get(&timer_id) {
                due.push(entry.body.clone());
                self.deadlines.push(Reverse((now + entry.every, timer_id)));
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_body(counter: &Arc<AtomicUsize>) -> LoopBody {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn armed_timer_comes_due_and_reschedules() {
        let mut timers = LoopTimers::new();
        let count = Arc::new(AtomicUsize::new(0));
        timers.arm(LoopId(1), counting_body(&count), Duration::from_millis(10));
        let first = timers.next_deadline().expect("armed timer has a deadline");
        for body in timers.take_due(first) {
            body();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let second = timers.next_deadline().expect("timer rescheduled itself");
        assert!(second > first);
    }

    #[test]
    fn disarm_forgets_the_loop_and_prunes_lazily() {
        let mut timers = LoopTimers::new();
        let count = Arc::new(AtomicUsize::new(0));
        timers.arm(LoopId(1), counting_body(&count), Duration::from_millis(1));
        assert!(timers.disarm(LoopId(1)));
        assert!(!timers.disarm(LoopId(1)));
        assert!(timers.next_deadline().is_none());
        assert!(timers
            .take_due(Instant::now() + Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn clear_cancels_everything() {
        let mut timers = LoopTimers::new();
        let count = Arc::new(AtomicUsize::new(0));
        for id in 0..4 {
            timers.arm(LoopId(id), counting_body(&count), Duration::from_millis(5));
        }
        assert_eq!(timers.clear(), 4);
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let mut timers = LoopTimers::new();
        let count = Arc::new(AtomicUsize::new(0));
        timers.arm(LoopId(1), counting_body(&count), Duration::from_millis(30));
        timers.arm(LoopId(2), counting_body(&count), Duration::from_millis(10));
        let soonest = timers.next_deadline().unwrap();
        assert_eq!(timers.take_due(soonest).len(), 1);
    }
}
