//! # Event Dispatcher
//!
//! A deterministic stand-in for the per-worker cooperative event loop. The
//! pool and discovery subsystems never spawn threads or block; they arm
//! one-shot timers here and park closed objects on the deferred-deletion
//! list, which the loop owner flushes at end of tick.
//!
//! Time is a monotonic offset. In simulated mode (the default for tests and
//! the only mode the core itself requires) the owner advances time explicitly
//! and dispatches the fired timer ids back into the interested component.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};
use tracing::trace;

/// Identifier for a one-shot timer armed on a [`Dispatcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Duration,
    id: TimerId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
enum TimeMode {
    /// Offset advanced explicitly by the loop owner
    Simulated(Duration),
    /// Offset derived from the process monotonic clock
    Monotonic(Instant),
}

/// Single-threaded cooperative dispatcher: timers plus deferred deletion.
///
/// Not `Sync` by contract even where it is by type: one dispatcher belongs to
/// one worker loop, and every component sharing it runs on that loop.
pub struct Dispatcher {
    mode: TimeMode,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    armed: HashSet<TimerId>,
    next_timer_id: u64,
    deferred: Vec<Box<dyn Any>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with simulated time starting at zero
    pub fn new() -> Self {
        Self {
            mode: TimeMode::Simulated(Duration::ZERO),
            timers: BinaryHeap::new(),
            armed: HashSet::new(),
            next_timer_id: 0,
            deferred: Vec::new(),
        }
    }

    /// Create a dispatcher tracking the process monotonic clock
    pub fn with_monotonic_time() -> Self {
        Self { mode: TimeMode::Monotonic(Instant::now()), ..Self::new() }
    }

    /// Current time as an offset from dispatcher start
    pub fn now(&self) -> Duration {
        match self.mode {
            TimeMode::Simulated(now) => now,
            TimeMode::Monotonic(start) => start.elapsed(),
        }
    }

    /// Arm a one-shot timer firing `delay` from now
    pub fn arm_timer(&mut self, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        let deadline = self.now() + delay;
        self.timers.push(Reverse(TimerEntry { deadline, id }));
        self.armed.insert(id);
        trace!(timer = id.0, delay_ms = delay.as_millis() as u64, "armed timer");
        id
    }

    /// Disarm a timer; a disarmed timer never fires
    pub fn disarm_timer(&mut self, id: TimerId) {
        self.armed.remove(&id);
    }

    /// Whether the timer is armed and has not fired
    pub fn timer_enabled(&self, id: TimerId) -> bool {
        self.armed.contains(&id)
    }

    /// Deadline of the next armed timer, if any
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse(entry)) = self.timers.peek() {
            if self.armed.contains(&entry.id) {
                return Some(entry.deadline);
            }
            self.timers.pop();
        }
        None
    }

    /// Advance simulated time by `delta` and return the timers that fired,
    /// in deadline order. With monotonic time the delta is ignored and only
    /// already-expired timers are drained.
    pub fn advance_time(&mut self, delta: Duration) -> Vec<TimerId> {
        if let TimeMode::Simulated(ref mut now) = self.mode {
            *now += delta;
        }
        self.drain_expired()
    }

    /// Return the timers whose deadline has passed, in deadline order
    pub fn drain_expired(&mut self) -> Vec<TimerId> {
        let now = self.now();
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = match self.timers.pop() {
                Some(Reverse(entry)) => entry,
                None => break,
            };
            if self.armed.remove(&entry.id) {
                fired.push(entry.id);
            }
        }
        fired
    }

    /// Park an object for destruction at end of tick. Objects closed during
    /// callback execution must stay alive until the call stack unwinds.
    pub fn defer_delete(&mut self, object: Box<dyn Any>) {
        self.deferred.push(object);
    }

    /// Number of objects awaiting deferred deletion
    pub fn deferred_delete_count(&self) -> usize {
        self.deferred.len()
    }

    /// Drop everything on the deferred-deletion list
    pub fn clear_deferred_delete_list(&mut self) {
        self.deferred.clear();
    }
}
