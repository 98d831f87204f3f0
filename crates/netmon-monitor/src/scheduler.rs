//! Delivery of self-addressed and delayed commands.
//!
//! The monitor never sleeps. It hands follow-up commands to a [`Scheduler`],
//! which feeds them back through the same ordered inbound queue as
//! orchestrator commands.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::machine::{Flow, NetworkMonitor};
use crate::Command;

/// Identifier of one pending delayed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Clock a delayed command is scheduled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fine-grained timer; suspended time may not count.
    Ordinary,
    /// Timer that must fire even if the host was suspended meanwhile.
    Wakeup,
}

/// Queue the monitor posts follow-up commands into.
pub trait Scheduler: Send + Sync {
    /// Appends `command` to the end of the inbound queue.
    fn post(&self, command: Command);

    /// Delivers `command` after `delay`.
    fn post_delayed(&self, command: Command, delay: Duration, kind: TimerKind) -> TimerId;

    /// Cancels a pending delayed command. Unknown or fired ids are ignored.
    fn cancel(&self, id: TimerId);

    /// Cancels every pending delayed command.
    fn cancel_all(&self);
}

/// Deterministic scheduler with a virtual clock, for tests and simulation.
///
/// Nothing runs on its own: callers advance the clock and drain the ready
/// queue into a monitor.
#[derive(Debug, Default)]
pub struct VirtualScheduler {
    inner: Mutex<VirtualQueue>,
}

#[derive(Debug, Default)]
struct VirtualQueue {
    now: Duration,
    next_id: u64,
    ready: VecDeque<Command>,
    timers: Vec<VirtualTimer>,
}

/// A pending delayed command as seen by [`VirtualScheduler::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTimer {
    /// Timer id.
    pub id: TimerId,
    /// Virtual time at which it fires.
    pub due: Duration,
    /// Requested clock.
    pub kind: TimerKind,
    /// Command to deliver.
    pub command: Command,
}

impl VirtualScheduler {
    /// Creates an empty scheduler at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Pops the next ready command.
    pub fn pop_ready(&self) -> Option<Command> {
        self.lock().ready.pop_front()
    }

    /// Returns pending delayed commands ordered by due time.
    pub fn pending(&self) -> Vec<VirtualTimer> {
        let mut timers = self.lock().timers.clone();
        timers.sort_by_key(|timer| (timer.due, timer.id));
        timers
    }

    /// Moves the clock forward, releasing every timer due by then in order.
    pub fn advance(&self, by: Duration) {
        let mut queue = self.lock();
        queue.now = queue.now.saturating_add(by);
        let now = queue.now;

        let mut due: Vec<VirtualTimer> = Vec::new();
        queue.timers.retain(|timer| {
            if timer.due <= now {
                due.push(timer.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|timer| (timer.due, timer.id));
        queue
            .ready
            .extend(due.into_iter().map(|timer| timer.command));
    }

    /// Advances straight to the earliest pending timer.
    ///
    /// Returns the time advanced, or `None` when nothing is pending.
    pub fn advance_to_next(&self) -> Option<Duration> {
        let now = self.now();
        let next_due = self.lock().timers.iter().map(|timer| timer.due).min()?;
        let step = next_due.saturating_sub(now);
        self.advance(step);
        Some(step)
    }

    /// Feeds ready commands into `monitor` until the queue is empty or the
    /// monitor stops. Returns the number of commands processed.
    pub fn drain(&self, monitor: &mut NetworkMonitor) -> usize {
        let mut processed = 0;
        while let Some(command) = self.pop_ready() {
            processed += 1;
            if monitor.handle(command) == Flow::Stopped {
                break;
            }
        }
        processed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualQueue> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for VirtualScheduler {
    fn post(&self, command: Command) {
        self.lock().ready.push_back(command);
    }

    fn post_delayed(&self, command: Command, delay: Duration, kind: TimerKind) -> TimerId {
        let mut queue = self.lock();
        queue.next_id += 1;
        let id = TimerId(queue.next_id);
        let due = queue.now.saturating_add(delay);
        queue.timers.push(VirtualTimer {
            id,
            due,
            kind,
            command,
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        self.lock().timers.retain(|timer| timer.id != id);
    }

    fn cancel_all(&self) {
        self.lock().timers.clear();
    }
}
