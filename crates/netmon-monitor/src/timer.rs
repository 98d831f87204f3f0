//! Thread-backed [`Scheduler`] used by the monitor runtime.

use std::collections::HashSet;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::scheduler::{Scheduler, TimerId, TimerKind};
use crate::{Command, MonitorError};

/// Longest sleep while a wake-up timer is pending, so time spent suspended is
/// noticed promptly after resume.
const BOOT_CLOCK_POLL: Duration = Duration::from_secs(1);

/// One message on the monitor's inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Posted for handling in queue order.
    Immediate(Command),
    /// Released by a due timer. Cancelling the timer before
    /// [`TimerService::accept`] still revokes it.
    Timer(TimerId, Command),
}

/// Posts commands into the monitor's inbound channel, now or later.
///
/// Ordinary timers run on the monotonic clock. Wake-up timers run on the
/// boot clock (`CLOCK_BOOTTIME` on Linux and Android), which keeps counting
/// while the host is suspended and ignores wall-clock adjustments. Elsewhere
/// they fall back to the monotonic clock.
///
/// A timer that came due sits in the channel until the consumer passes it
/// through [`TimerService::accept`]; [`Scheduler::cancel`] up to that point
/// drops it.
pub struct TimerService {
    commands: Sender<Delivery>,
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    timers: Vec<Timer>,
    released: HashSet<TimerId>,
    shutdown: bool,
}

struct Timer {
    id: TimerId,
    deadline: Deadline,
    command: Command,
}

#[derive(Clone, Copy)]
enum Deadline {
    Monotonic(Instant),
    Boot(Duration),
}

impl Deadline {
    /// Time left until the deadline, zero when due.
    fn remaining(self) -> Duration {
        match self {
            Self::Monotonic(at) => at.saturating_duration_since(Instant::now()),
            Self::Boot(at) => at.saturating_sub(boot_clock()),
        }
    }
}

impl TimerService {
    /// Starts the timer thread.
    ///
    /// # Errors
    /// Returns [`MonitorError::Spawn`] when the thread cannot be created.
    pub fn start(commands: Sender<Delivery>, name: impl Into<String>) -> Result<Self, MonitorError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_commands = commands.clone();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || run_timers(&worker_shared, &worker_commands))
            .map_err(|error| MonitorError::Spawn(error.to_string()))?;

        Ok(Self {
            commands,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Drops pending timers and joins the timer thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            state.timers.clear();
            state.released.clear();
        }
        self.shared.wake.notify_all();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker
            && worker.thread().id() != std::thread::current().id()
        {
            let _ = worker.join();
        }
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).timers.len()
    }

    /// Unwraps a delivery for handling. Returns `None` for a timer cancelled
    /// after it came due.
    pub fn accept(&self, delivery: Delivery) -> Option<Command> {
        match delivery {
            Delivery::Immediate(command) => Some(command),
            Delivery::Timer(id, command) => {
                if lock(&self.shared.state).released.remove(&id) {
                    Some(command)
                } else {
                    tracing::debug!(timer = id.0, ?command, "cancelled timer dropped");
                    None
                }
            }
        }
    }
}

impl Scheduler for TimerService {
    fn post(&self, command: Command) {
        // A closed channel means the monitor already stopped.
        let _ = self.commands.send(Delivery::Immediate(command));
    }

    fn post_delayed(&self, command: Command, delay: Duration, kind: TimerKind) -> TimerId {
        let deadline = match kind {
            TimerKind::Ordinary => Deadline::Monotonic(Instant::now() + delay),
            TimerKind::Wakeup => Deadline::Boot(boot_clock().saturating_add(delay)),
        };

        let mut state = lock(&self.shared.state);
        state.next_id += 1;
        let id = TimerId(state.next_id);
        if !state.shutdown {
            state.timers.push(Timer {
                id,
                deadline,
                command,
            });
            self.shared.wake.notify_all();
        }
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = lock(&self.shared.state);
        state.timers.retain(|timer| timer.id != id);
        state.released.remove(&id);
        drop(state);
        self.shared.wake.notify_all();
    }

    fn cancel_all(&self) {
        let mut state = lock(&self.shared.state);
        state.timers.clear();
        state.released.clear();
        drop(state);
        self.shared.wake.notify_all();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timers(shared: &TimerShared, commands: &Sender<Delivery>) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            return;
        }

        let mut due = Vec::new();
        let mut index = 0;
        while index < state.timers.len() {
            if state.timers[index].deadline.remaining().is_zero() {
                due.push(state.timers.swap_remove(index));
            } else {
                index += 1;
            }
        }

        if !due.is_empty() {
            state.released.extend(due.iter().map(|timer| timer.id));
            drop(state);
            due.sort_by_key(|timer| timer.id);
            for timer in due {
                if commands.send(Delivery::Timer(timer.id, timer.command)).is_err() {
                    return;
                }
            }
            state = lock(&shared.state);
            continue;
        }

        let wait = state
            .timers
            .iter()
            .map(|timer| match timer.deadline {
                Deadline::Monotonic(_) => timer.deadline.remaining(),
                Deadline::Boot(_) => timer.deadline.remaining().min(BOOT_CLOCK_POLL),
            })
            .min();

        state = match wait {
            Some(wait) => match shared.wake.wait_timeout(state, wait) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            },
            None => match shared.wake.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            },
        };
    }
}

/// Time on a clock that keeps counting while the host is suspended.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn boot_clock() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the whole call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        return monotonic_clock();
    }
    Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn boot_clock() -> Duration {
    monotonic_clock()
}

/// Monotonic time since this process first asked.
fn monotonic_clock() -> Duration {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
