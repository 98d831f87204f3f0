//! Single-consumer actor hosting one [`NetworkMonitor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use netmon_core::{NetworkProvider, Settings, TelemetrySink, ValidationLog};

use crate::machine::{Flow, MonitorConfig, MonitorDeps, NetworkMonitor};
use crate::scheduler::Scheduler;
use crate::signin::LaunchToken;
use crate::timer::{Delivery, TimerService};
use crate::{Command, EventSink, MonitorError};

/// Collaborators for [`spawn_monitor`]; the runtime supplies the scheduler.
#[derive(Clone)]
pub struct RuntimeDeps {
    /// Network the monitor validates.
    pub provider: Arc<dyn NetworkProvider>,
    /// Validation settings.
    pub settings: Arc<dyn Settings>,
    /// Metrics sink.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Outbound events.
    pub events: Arc<dyn EventSink>,
}

/// Starts a monitor on its own worker thread.
///
/// The worker drains the command channel in order until a disconnect stops
/// the machine, then shuts the timer thread down. Timers cancelled after
/// they came due are dropped on dequeue.
///
/// # Errors
/// Returns [`MonitorError::Spawn`] when a thread cannot be created, or any
/// error from [`NetworkMonitor::new`].
pub fn spawn_monitor(deps: RuntimeDeps, config: MonitorConfig) -> Result<MonitorHandle, MonitorError> {
    let net_id = deps.provider.snapshot().net_id;
    let (commands, inbox) = mpsc::channel::<Delivery>();

    let timers = Arc::new(TimerService::start(
        commands.clone(),
        format!("netmon-timer-{net_id}"),
    )?);
    let scheduler: Arc<dyn Scheduler> = timers.clone();

    let mut monitor = NetworkMonitor::new(
        MonitorDeps {
            provider: deps.provider,
            settings: deps.settings,
            telemetry: deps.telemetry,
            scheduler,
            events: deps.events,
        },
        config,
    )?;
    let log = monitor.validation_log().clone();

    let worker_timers = Arc::clone(&timers);
    let worker = std::thread::Builder::new()
        .name(format!("netmon-monitor-{net_id}"))
        .spawn(move || {
            while let Ok(delivery) = inbox.recv() {
                let Some(command) = worker_timers.accept(delivery) else {
                    continue;
                };
                if monitor.handle(command) == Flow::Stopped {
                    break;
                }
            }
            worker_timers.shutdown();
        })
        .map_err(|error| MonitorError::Spawn(error.to_string()))?;

    tracing::info!(net_id, "network monitor started");
    Ok(MonitorHandle {
        net_id,
        commands,
        log,
        stopped: AtomicBool::new(false),
        worker: Some(worker),
    })
}

/// Orchestrator-side handle to a running monitor.
///
/// Dropping the handle disconnects the monitor and joins its thread.
///
/// Only orchestrator commands are exposed; sign-in results and
/// self-addressed commands cannot be injected:
///
/// ```compile_fail
/// use netmon_monitor::{Command, MonitorHandle};
///
/// fn inject(handle: &MonitorHandle) {
///     let _ = handle.send(Command::Reevaluate { token: 1 });
/// }
/// ```
pub struct MonitorHandle {
    net_id: u32,
    commands: Sender<Delivery>,
    log: ValidationLog,
    stopped: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Network id of the monitored network.
    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    /// Queues an orchestrator command. Sign-in results travel through
    /// [`crate::SignInResponder`] and self-addressed commands through the
    /// scheduler, so neither is reachable from here.
    fn send(&self, command: Command) -> Result<(), MonitorError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MonitorError::Stopped);
        }
        if command == Command::Disconnected {
            self.stopped.store(true, Ordering::Release);
        }
        self.commands
            .send(Delivery::Immediate(command))
            .map_err(|_| MonitorError::Stopped)
    }

    /// Reports the network connected.
    ///
    /// # Errors
    /// Returns [`MonitorError::Stopped`] after a disconnect.
    pub fn connected(&self) -> Result<(), MonitorError> {
        self.send(Command::Connected)
    }

    /// Reports the network gone; the monitor stops.
    ///
    /// # Errors
    /// Returns [`MonitorError::Stopped`] if already disconnected.
    pub fn disconnected(&self) -> Result<(), MonitorError> {
        self.send(Command::Disconnected)
    }

    /// Reports the network superseded.
    ///
    /// # Errors
    /// Returns [`MonitorError::Stopped`] after a disconnect.
    pub fn linger(&self) -> Result<(), MonitorError> {
        self.send(Command::Linger)
    }

    /// Requests immediate re-validation, billing `requester` for the traffic.
    ///
    /// # Errors
    /// Returns [`MonitorError::Stopped`] after a disconnect.
    pub fn force_reevaluation(&self, requester: Option<u32>) -> Result<(), MonitorError> {
        self.send(Command::ForceReevaluation { requester })
    }

    /// Reports that the user tapped the sign-in notification.
    ///
    /// # Errors
    /// Returns [`MonitorError::Stopped`] after a disconnect.
    pub fn launch_sign_in(&self, token: LaunchToken) -> Result<(), MonitorError> {
        self.send(Command::LaunchSignIn(token))
    }

    /// Ordered snapshot of the validation log.
    pub fn validation_log(&self) -> Vec<String> {
        self.log.snapshot()
    }

    /// Disconnects (if still running) and waits for the worker to finish.
    ///
    /// # Errors
    /// Returns [`MonitorError::WorkerPanicked`] when the worker panicked.
    pub fn shutdown(mut self) -> Result<(), MonitorError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), MonitorError> {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Delivery::Immediate(Command::Disconnected));
        }
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| MonitorError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Err(error) = self.stop_and_join() {
            tracing::warn!(net_id = self.net_id, %error, "monitor worker did not stop cleanly");
        }
    }
}
