//! Timer wheel backing `Core::setTimeout`/`setInterval`/`clearTimer`
//! (`spec.md` §4.4).
//!
//! Timers are kept in a min-heap ordered by absolute deadline. Ids are
//! recycled (`spec.md` §4.4: "ids are recycled") from a free list so a
//! long-running process doesn't leak a growing counter. Clearing an id that
//! doesn't exist — including one already fired and recycled — is a no-op,
//! never an error (`spec.md` §4.4 edge case).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Opaque timer identity; stable across `rebase` (`spec.md` §4.4).
pub type TimerId = u16;

struct Entry {
    id: TimerId,
    deadline: Instant,
    persistent: bool,
    delay: Duration,
    generation: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}

/// One fired timer, returned by [`TimerWheel::poll`].
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    /// The timer's id, still valid for `clearTimer` if persistent.
    pub id: TimerId,
}

/// Min-heap of armed timers plus an id free list.
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_id: TimerId,
    free_ids: Vec<TimerId>,
    /// Generation bumped by `rebase`; stale entries from before a rebase are
    /// dropped rather than fired (`spec.md` §4.4, `rebase`).
    generation: u64,
    live: std::collections::HashSet<TimerId>,
}

impl TimerWheel {
    /// Create an empty timer wheel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 1,
            free_ids: Vec::new(),
            generation: 0,
            live: std::collections::HashSet::new(),
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        if let Some(id) = self.free_ids.pop() {
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Arm a one-shot or persistent timer firing after `delay`.
    pub fn arm(&mut self, delay: Duration, persistent: bool) -> TimerId {
        let id = self.alloc_id();
        self.live.insert(id);
        self.heap.push(Entry {
            id,
            deadline: Instant::now() + delay,
            persistent,
            delay,
            generation: self.generation,
        });
        id
    }

    /// Clear a timer by id. A no-op if `id` doesn't exist or already fired
    /// and isn't persistent.
    pub fn clear(&mut self, id: TimerId) {
        if self.live.remove(&id) {
            self.free_ids.push(id);
        }
    }

    /// Drop every armed timer without firing it, bumping the generation so
    /// any in-flight heap entries from before this call are ignored when
    /// popped (`spec.md` §4.4 "rebase").
    pub fn rebase(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Next deadline, for sizing the dispatcher's blocking poll timeout.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every timer whose deadline has passed, re-arming persistent ones.
    pub fn poll(&mut self, now: Instant) -> Vec<Fired> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some above");
            if entry.generation != self.generation || !self.live.contains(&entry.id) {
                continue;
            }
            fired.push(Fired { id: entry.id });
            if entry.persistent {
                self.heap.push(Entry {
                    id: entry.id,
                    deadline: now + entry.delay,
                    persistent: true,
                    delay: entry.delay,
                    generation: self.generation,
                });
            } else {
                self.live.remove(&entry.id);
                self.free_ids.push(entry.id);
            }
        }
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let mut wheel = TimerWheel::new();
        let id = wheel.arm(Duration::from_millis(0), false);
        let fired = wheel.poll(Instant::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert!(wheel.poll(Instant::now()).is_empty());
    }

    #[test]
    fn persistent_rearms() {
        let mut wheel = TimerWheel::new();
        let id = wheel.arm(Duration::from_millis(0), true);
        let first = wheel.poll(Instant::now());
        assert_eq!(first.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        let second = wheel.poll(Instant::now());
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
    }

    #[test]
    fn clear_nonexistent_id_is_noop() {
        let mut wheel = TimerWheel::new();
        wheel.clear(999);
    }

    #[test]
    fn ids_are_recycled() {
        let mut wheel = TimerWheel::new();
        let id = wheel.arm(Duration::from_secs(5), false);
        wheel.clear(id);
        let id2 = wheel.arm(Duration::from_secs(5), false);
        assert_eq!(id, id2);
    }

    #[test]
    fn rebase_drops_pending_timers() {
        let mut wheel = TimerWheel::new();
        wheel.arm(Duration::from_millis(0), false);
        wheel.rebase();
        assert!(wheel.poll(Instant::now()).is_empty());
    }
}
