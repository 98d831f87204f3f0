#![warn(missing_docs)]
//! # netmon-monitor
//!
//! ## Purpose
//! Drives the validation lifecycle of one network: evaluation with backoff,
//! captive-portal notification and sign-in hand-off, re-validation, and
//! lingering before teardown.
//!
//! ## Responsibilities
//! - Run the hierarchical state machine ([`NetworkMonitor`]).
//! - Compute re-evaluation delays ([`BackoffPolicy`]).
//! - Schedule delayed commands ([`Scheduler`], [`TimerService`],
//!   [`VirtualScheduler`]).
//! - Hand sign-in requests to the orchestrator ([`SignInRequest`]).
//! - Host the machine on a single consumer thread ([`spawn_monitor`]).
//!
//! ## Data flow
//! Orchestrator -> [`Command`] -> inbound queue -> [`NetworkMonitor::handle`]
//! -> probe engine / scheduler -> [`MonitorEvent`] -> [`EventSink`].
//!
//! ## Ownership and lifetimes
//! The monitor owns its [`ValidationContext`] outright and is only ever
//! touched by the thread draining its queue. Everything it shares with other
//! threads (log, scheduler, sinks) sits behind `Arc`.
//!
//! ## Error model
//! Probe failures never surface here; they become retries. [`MonitorError`]
//! covers thread start-up, privilege violations, and commands sent to a
//! stopped monitor.
//!
//! ## Example
//! ```rust
//! use netmon_monitor::BackoffPolicy;
//! use std::time::Duration;
//!
//! let delays = BackoffPolicy::default().schedule(3);
//! assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
//! ```

mod backoff;
mod linger;
mod machine;
mod runtime;
mod scheduler;
mod signin;
mod stopwatch;
mod timer;

use std::sync::mpsc::Sender;

use netmon_core::{CoreError, Disposition, TestResult};
use thiserror::Error;

pub use backoff::{Backoff, BackoffPolicy};
pub use linger::{DEFAULT_LINGER_DELAY, default_linger_delay, set_default_linger_delay};
pub use machine::{
    CAPTIVE_PORTAL_RECHECK_DELAY, Flow, MonitorConfig, MonitorDeps, MonitorState, NetworkMonitor,
    ValidationContext,
};
pub use runtime::{MonitorHandle, RuntimeDeps, spawn_monitor};
pub use scheduler::{Scheduler, TimerId, TimerKind, VirtualScheduler, VirtualTimer};
pub use signin::{LaunchToken, SignInRequest, SignInResponder};
pub use timer::{Delivery, TimerService};

/// Inbound message processed by the monitor.
///
/// The first six variants come from the orchestrator; the rest are posted by
/// the monitor to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Network connected; start or resume validation.
    Connected,
    /// Network disconnected; stop for good.
    Disconnected,
    /// Network was superseded; count down to teardown.
    Linger,
    /// Re-validate now, attributing traffic to `requester` when set.
    ForceReevaluation {
        /// Party billed for probe traffic.
        requester: Option<u32>,
    },
    /// User tapped the sign-in notification carrying this token.
    LaunchSignIn(LaunchToken),
    /// Sign-in surface reported the user's disposition.
    SignInFinished(Disposition),
    /// Run one evaluation attempt if `token` is still current.
    Reevaluate {
        /// Re-evaluation token at scheduling time.
        token: u64,
    },
    /// Linger period elapsed if `token` is still current.
    LingerExpired {
        /// Linger token at scheduling time.
        token: u64,
    },
    /// Periodic re-test while a captive portal is in place, if `token` is
    /// still current.
    CaptivePortalRecheck {
        /// Re-check token at scheduling time.
        token: u64,
    },
}

/// Outbound notification to the orchestrator.
#[derive(Debug)]
pub enum MonitorEvent {
    /// Result of a validation pass.
    NetworkTested {
        /// Network id.
        net_id: u32,
        /// Verdict.
        result: TestResult,
        /// Where the probe was redirected, if anywhere.
        redirect_url: Option<String>,
    },
    /// Linger period is over; the orchestrator may tear the network down.
    LingerComplete {
        /// Network id.
        net_id: u32,
    },
    /// Show or clear the "sign in to network" notification.
    ProvisioningNotification {
        /// Network id.
        net_id: u32,
        /// Whether the notification should be visible.
        visible: bool,
        /// Token to send back in [`Command::LaunchSignIn`] when tapped.
        launch_token: Option<LaunchToken>,
    },
    /// Open the sign-in surface for this network.
    SignInRequested(SignInRequest),
}

impl MonitorEvent {
    /// Network the event refers to.
    pub fn net_id(&self) -> u32 {
        match self {
            Self::NetworkTested { net_id, .. }
            | Self::LingerComplete { net_id }
            | Self::ProvisioningNotification { net_id, .. } => *net_id,
            Self::SignInRequested(request) => request.net_id,
        }
    }
}

/// Consumer of monitor events.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Must not block on the monitor.
    fn emit(&self, event: MonitorEvent);
}

impl EventSink for Sender<MonitorEvent> {
    fn emit(&self, event: MonitorEvent) {
        if self.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

/// Monitor error type.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Caller lacks the privilege for a gated operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Sign-in responder was already used.
    #[error("sign-in response already delivered")]
    AlreadyResponded,
    /// Monitor no longer accepts commands.
    #[error("monitor stopped")]
    Stopped,
    /// Worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// OS random source unavailable for launch tokens.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
    /// Worker thread panicked.
    #[error("monitor worker panicked")]
    WorkerPanicked,
    /// Core model failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}
