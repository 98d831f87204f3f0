//! Hierarchical validation state machine.
//!
//! Each leaf [`MonitorState`] sits on a path of layers rooted at `Default`.
//! A command is offered to the leaf first and bubbles towards the root until
//! a layer handles it; `Default` handles everything. Transitions requested by
//! a handler are applied after it returns: layers below the common ancestor
//! are exited leaf-first, then the target's layers are entered root-first.
//! A transition to the current state exits and re-enters the leaf only.

use std::sync::Arc;
use std::time::Duration;

use netmon_core::{
    Disposition, NetworkEventKind, NetworkProvider, Settings, TelemetrySink, TestResult,
    ValidationLog, DEFAULT_LOG_CAPACITY,
};
use netmon_probe::{ProbeConfig, ProbeEngine};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::linger::default_linger_delay;
use crate::scheduler::{Scheduler, TimerId, TimerKind};
use crate::signin::{LaunchToken, SignInRequest, SignInResponder};
use crate::stopwatch::Stopwatch;
use crate::{Command, EventSink, MonitorError, MonitorEvent};

/// Interval between re-tests while sitting behind a captive portal.
pub const CAPTIVE_PORTAL_RECHECK_DELAY: Duration = Duration::from_secs(10 * 60);

/// Active leaf state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorState {
    /// Initial state; nothing known yet.
    Default,
    /// Network validated, accepted as-is, or exempt from validation.
    Validated,
    /// Probing with backoff.
    Evaluating,
    /// Portal confirmed; sign-in notification may be showing.
    CaptivePortal,
    /// Superseded network counting down to teardown.
    Lingering,
}

/// Layer of the state hierarchy. `MaybeNotify` is never a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Default,
    Validated,
    MaybeNotify,
    Evaluating,
    CaptivePortal,
    Lingering,
}

impl MonitorState {
    fn path(self) -> &'static [Layer] {
        match self {
            Self::Default => &[Layer::Default],
            Self::Validated => &[Layer::Default, Layer::Validated],
            Self::Evaluating => &[Layer::Default, Layer::MaybeNotify, Layer::Evaluating],
            Self::CaptivePortal => &[Layer::Default, Layer::MaybeNotify, Layer::CaptivePortal],
            Self::Lingering => &[Layer::Default, Layer::Lingering],
        }
    }

    /// Returns `true` while a sign-in notification may be visible.
    pub fn may_notify(self) -> bool {
        self.path().contains(&Layer::MaybeNotify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handling {
    Handled,
    NotHandled,
}

/// Whether the machine still accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep feeding commands.
    Running,
    /// Disconnected; further commands are ignored.
    Stopped,
}

/// Tuning for one monitor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Explicit linger delay; `None` uses the process-wide default.
    pub linger_delay: Option<Duration>,
    /// Re-evaluation backoff and attempt thresholds.
    pub backoff: BackoffPolicy,
    /// Re-test interval while behind a captive portal.
    pub captive_portal_recheck: Duration,
    /// Probe engine tuning.
    pub probe: ProbeConfig,
    /// Validation log capacity.
    pub log_capacity: usize,
    /// Fixed seed for launch tokens; `None` seeds from the OS.
    pub launch_token_seed: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            linger_delay: None,
            backoff: BackoffPolicy::default(),
            captive_portal_recheck: CAPTIVE_PORTAL_RECHECK_DELAY,
            probe: ProbeConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            launch_token_seed: None,
        }
    }
}

/// Collaborators injected into a monitor.
#[derive(Clone)]
pub struct MonitorDeps {
    /// Network the monitor validates.
    pub provider: Arc<dyn NetworkProvider>,
    /// Validation settings, re-read on every pass.
    pub settings: Arc<dyn Settings>,
    /// Metrics sink.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Inbound queue for self-posted and delayed commands.
    pub scheduler: Arc<dyn Scheduler>,
    /// Outbound events.
    pub events: Arc<dyn EventSink>,
}

/// Per-network validation bookkeeping, owned by the monitor.
#[derive(Debug)]
pub struct ValidationContext {
    attempts: u32,
    backoff: Backoff,
    reevaluate_token: u64,
    linger_token: u64,
    recheck_token: u64,
    use_https: bool,
    user_does_not_want: bool,
    suppress_notification: bool,
    requester: Option<u32>,
    launch_token: Option<LaunchToken>,
    portal_url: Option<String>,
    retry_timer: Option<TimerId>,
    recheck_timer: Option<TimerId>,
    linger_timer: Option<TimerId>,
    evaluation: Stopwatch,
}

impl ValidationContext {
    fn new(policy: BackoffPolicy, use_https: bool) -> Self {
        Self {
            attempts: 0,
            backoff: Backoff::new(policy),
            reevaluate_token: 0,
            linger_token: 0,
            recheck_token: 0,
            use_https,
            user_does_not_want: false,
            suppress_notification: false,
            requester: None,
            launch_token: None,
            portal_url: None,
            retry_timer: None,
            recheck_timer: None,
            linger_timer: None,
            evaluation: Stopwatch::default(),
        }
    }

    /// Probe attempts in the current evaluation run.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next failed attempt will schedule.
    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    /// Current re-evaluation token.
    pub fn reevaluate_token(&self) -> u64 {
        self.reevaluate_token
    }

    /// Current linger token.
    pub fn linger_token(&self) -> u64 {
        self.linger_token
    }

    /// Token a captive-portal re-check must carry to be acted on.
    pub fn recheck_token(&self) -> u64 {
        self.recheck_token
    }

    /// Whether passes still race HTTPS against HTTP.
    pub fn use_https(&self) -> bool {
        self.use_https
    }

    /// Whether the user rejected this network.
    pub fn user_does_not_want(&self) -> bool {
        self.user_does_not_want
    }

    /// Whether sign-in notifications are suppressed.
    pub fn suppress_notification(&self) -> bool {
        self.suppress_notification
    }

    /// Token of the live sign-in notification, if one was issued.
    pub fn launch_token(&self) -> Option<LaunchToken> {
        self.launch_token
    }

    /// Redirect target of the last portal determination.
    pub fn portal_url(&self) -> Option<&str> {
        self.portal_url.as_deref()
    }

    /// Whether an evaluation duration is being measured.
    pub fn evaluation_running(&self) -> bool {
        self.evaluation.is_running()
    }
}

/// Validation state machine for one network.
///
/// Not thread-safe by itself; the runtime drives it from one thread.
pub struct NetworkMonitor {
    net_id: u32,
    state: MonitorState,
    pending: Option<MonitorState>,
    quitting: bool,
    running: bool,
    context: ValidationContext,
    engine: ProbeEngine,
    deps: MonitorDeps,
    linger_delay: Duration,
    recheck_delay: Duration,
    rng: StdRng,
}

impl NetworkMonitor {
    /// Creates a monitor in [`MonitorState::Default`].
    ///
    /// # Errors
    /// Returns [`MonitorError::Core`] for a zero log capacity and
    /// [`MonitorError::Entropy`] when the OS random source is unavailable.
    pub fn new(deps: MonitorDeps, config: MonitorConfig) -> Result<Self, MonitorError> {
        let log = ValidationLog::new(config.log_capacity)?;
        let engine = ProbeEngine::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.settings),
            Arc::clone(&deps.telemetry),
            log,
            config.probe.clone(),
        );
        let rng = match config.launch_token_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::try_from_os_rng().map_err(|error| MonitorError::Entropy(error.to_string()))?,
        };
        let net_id = deps.provider.snapshot().net_id;
        let context = ValidationContext::new(config.backoff, deps.settings.use_https());

        tracing::debug!(net_id, "network monitor created");
        Ok(Self {
            net_id,
            state: MonitorState::Default,
            pending: None,
            quitting: false,
            running: true,
            context,
            engine,
            deps,
            linger_delay: config.linger_delay.unwrap_or_else(default_linger_delay),
            recheck_delay: config.captive_portal_recheck,
            rng,
        })
    }

    /// Network id reported in events.
    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    /// Active leaf state.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Read-only view of the validation context.
    pub fn context(&self) -> &ValidationContext {
        &self.context
    }

    /// Shared validation log.
    pub fn validation_log(&self) -> &ValidationLog {
        self.engine.log()
    }

    /// Returns `true` until the machine processed a disconnect.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Processes one command to completion, including any transition.
    pub fn handle(&mut self, command: Command) -> Flow {
        if !self.running {
            tracing::debug!(net_id = self.net_id, ?command, "monitor stopped, command ignored");
            return Flow::Stopped;
        }

        tracing::trace!(net_id = self.net_id, state = ?self.state, ?command, "dispatch");
        for layer in self.state.path().iter().rev() {
            if self.process(*layer, &command) == Handling::Handled {
                break;
            }
        }

        if self.quitting {
            self.quit();
            return Flow::Stopped;
        }
        while let Some(target) = self.pending.take() {
            self.perform_transition(target);
        }
        Flow::Running
    }

    fn transition_to(&mut self, target: MonitorState) {
        self.pending = Some(target);
    }

    fn perform_transition(&mut self, target: MonitorState) {
        let from = self.state.path();
        let to = target.path();
        let mut common = from
            .iter()
            .zip(to)
            .take_while(|(left, right)| left == right)
            .count();
        if common == to.len() {
            common -= 1;
        }

        tracing::debug!(net_id = self.net_id, from = ?self.state, to = ?target, "transition");
        for layer in from[common..].iter().rev() {
            self.exit(*layer);
        }
        self.state = target;
        for layer in &to[common..] {
            self.enter(*layer);
        }
    }

    fn quit(&mut self) {
        for layer in self.state.path().iter().rev() {
            self.exit(*layer);
        }
        self.pending = None;
        self.deps.scheduler.cancel_all();
        self.running = false;
        tracing::info!(net_id = self.net_id, "network monitor stopped");
    }

    fn process(&mut self, layer: Layer, command: &Command) -> Handling {
        match layer {
            Layer::Default => {
                self.process_default(command);
                Handling::Handled
            }
            Layer::Validated => self.process_validated(command),
            Layer::MaybeNotify => self.process_maybe_notify(command),
            Layer::Evaluating => self.process_evaluating(command),
            Layer::CaptivePortal => Handling::NotHandled,
            Layer::Lingering => self.process_lingering(command),
        }
    }

    fn enter(&mut self, layer: Layer) {
        match layer {
            Layer::Default | Layer::MaybeNotify => {}
            Layer::Validated => self.enter_validated(),
            Layer::Evaluating => self.enter_evaluating(),
            Layer::CaptivePortal => self.enter_captive_portal(),
            Layer::Lingering => self.enter_lingering(),
        }
    }

    fn exit(&mut self, layer: Layer) {
        match layer {
            Layer::Default | Layer::Validated => {}
            Layer::MaybeNotify => self.clear_notification(),
            Layer::Evaluating => {
                if let Some(timer) = self.context.retry_timer.take() {
                    self.deps.scheduler.cancel(timer);
                }
                self.deps.provider.attribute_traffic(None);
            }
            Layer::CaptivePortal => {
                self.context.recheck_token += 1;
                if let Some(timer) = self.context.recheck_timer.take() {
                    self.deps.scheduler.cancel(timer);
                }
            }
            Layer::Lingering => {
                if let Some(timer) = self.context.linger_timer.take() {
                    self.deps.scheduler.cancel(timer);
                }
            }
        }
    }

    // Default

    fn process_default(&mut self, command: &Command) {
        match command {
            Command::Linger => self.transition_to(MonitorState::Lingering),
            Command::Connected => {
                self.deps
                    .telemetry
                    .network_event(self.net_id, NetworkEventKind::Connected);
                self.transition_to(MonitorState::Evaluating);
            }
            Command::Disconnected => {
                self.deps
                    .telemetry
                    .network_event(self.net_id, NetworkEventKind::Disconnected);
                if self.context.launch_token.take().is_some() {
                    tracing::debug!(net_id = self.net_id, "sign-in launch token discarded");
                }
                self.quitting = true;
            }
            Command::ForceReevaluation { requester } => {
                tracing::info!(net_id = self.net_id, ?requester, "forcing reevaluation");
                self.context.requester = *requester;
                self.transition_to(MonitorState::Evaluating);
            }
            Command::CaptivePortalRecheck { token } if *token != self.context.recheck_token => {
                tracing::debug!(net_id = self.net_id, token, "stale captive portal recheck ignored");
            }
            Command::CaptivePortalRecheck { .. } => {
                tracing::info!(net_id = self.net_id, "rechecking captive portal");
                self.context.requester = None;
                self.transition_to(MonitorState::Evaluating);
            }
            Command::SignInFinished(disposition) => self.sign_in_finished(*disposition),
            Command::LaunchSignIn(_) | Command::Reevaluate { .. } | Command::LingerExpired { .. } => {}
        }
    }

    fn sign_in_finished(&mut self, disposition: Disposition) {
        tracing::info!(net_id = self.net_id, ?disposition, "sign-in app finished");

        // Once the user acted on a portal, HTTPS alone failing must not keep
        // the network unvalidated.
        self.context.use_https = false;

        match disposition {
            Disposition::Dismissed => {
                self.deps
                    .scheduler
                    .post(Command::ForceReevaluation { requester: None });
            }
            Disposition::WantedAsIs => {
                self.context.suppress_notification = true;
                self.transition_to(MonitorState::Validated);
            }
            Disposition::Unwanted => {
                self.context.suppress_notification = true;
                self.context.user_does_not_want = true;
                if self.state.may_notify() {
                    self.clear_notification();
                }
                self.emit_tested(TestResult::Invalid, None);
                self.context.requester = None;
                self.transition_to(MonitorState::Evaluating);
            }
        }
    }

    // Validated

    fn enter_validated(&mut self) {
        if let Some(elapsed) = self.context.evaluation.stop() {
            self.deps.telemetry.network_event(
                self.net_id,
                NetworkEventKind::Validated {
                    duration_ms: millis(elapsed),
                },
            );
        }
        self.emit_tested(TestResult::Valid, None);
    }

    fn process_validated(&mut self, command: &Command) -> Handling {
        match command {
            Command::Connected => {
                self.transition_to(MonitorState::Validated);
                Handling::Handled
            }
            _ => Handling::NotHandled,
        }
    }

    // MaybeNotify

    fn process_maybe_notify(&mut self, command: &Command) -> Handling {
        let Command::LaunchSignIn(token) = command else {
            return Handling::NotHandled;
        };

        if self.context.launch_token != Some(*token) {
            tracing::debug!(net_id = self.net_id, ?token, "stale sign-in launch ignored");
            return Handling::Handled;
        }

        tracing::info!(net_id = self.net_id, "launching sign-in app");
        self.deps
            .events
            .emit(MonitorEvent::SignInRequested(SignInRequest {
                net_id: self.net_id,
                portal_url: self.context.portal_url.clone(),
                responder: SignInResponder::new(self.net_id, Arc::clone(&self.deps.scheduler)),
            }));
        Handling::Handled
    }

    fn clear_notification(&self) {
        self.deps.events.emit(MonitorEvent::ProvisioningNotification {
            net_id: self.net_id,
            visible: false,
            launch_token: None,
        });
    }

    // Evaluating

    fn enter_evaluating(&mut self) {
        self.context.evaluation.start_if_idle();
        self.context.reevaluate_token += 1;
        self.deps.scheduler.post(Command::Reevaluate {
            token: self.context.reevaluate_token,
        });
        if let Some(requester) = self.context.requester.take() {
            self.deps.provider.attribute_traffic(Some(requester));
        }
        self.context.backoff.reset();
        self.context.attempts = 0;
    }

    fn process_evaluating(&mut self, command: &Command) -> Handling {
        match command {
            Command::Reevaluate { token } => {
                if *token == self.context.reevaluate_token && !self.context.user_does_not_want {
                    self.context.retry_timer = None;
                    self.reevaluate();
                }
                Handling::Handled
            }
            Command::ForceReevaluation { .. }
                if self.context.attempts < self.context.backoff.policy().ignore_reevaluate_attempts =>
            {
                tracing::debug!(
                    net_id = self.net_id,
                    attempts = self.context.attempts,
                    "forced reevaluation debounced"
                );
                Handling::Handled
            }
            _ => Handling::NotHandled,
        }
    }

    fn reevaluate(&mut self) {
        if !self.deps.provider.snapshot().satisfies_default_request {
            self.engine
                .log()
                .record("Network would not satisfy default request, not validating");
            self.transition_to(MonitorState::Validated);
            return;
        }

        self.context.attempts += 1;
        let result = self.engine.is_captive_portal(self.context.use_https);
        tracing::debug!(
            net_id = self.net_id,
            attempt = self.context.attempts,
            status = result.status,
            "probe pass finished"
        );

        if result.is_successful() {
            self.transition_to(MonitorState::Validated);
        } else if result.is_portal() {
            self.emit_tested(TestResult::Invalid, result.redirect_url.clone());
            self.context.portal_url = result.redirect_url;
            self.transition_to(MonitorState::CaptivePortal);
        } else {
            self.context.reevaluate_token += 1;
            let delay = self.context.backoff.current();
            self.context.retry_timer = Some(self.deps.scheduler.post_delayed(
                Command::Reevaluate {
                    token: self.context.reevaluate_token,
                },
                delay,
                TimerKind::Ordinary,
            ));
            self.deps
                .telemetry
                .network_event(self.net_id, NetworkEventKind::ValidationFailed);
            self.emit_tested(TestResult::Invalid, result.redirect_url);
            if self.context.attempts >= self.context.backoff.policy().blame_attempts {
                self.deps.provider.attribute_traffic(None);
            }
            self.context.backoff.advance();
            tracing::info!(
                net_id = self.net_id,
                retry_ms = millis(delay),
                "validation attempt failed"
            );
        }
    }

    // CaptivePortal

    fn enter_captive_portal(&mut self) {
        self.context.recheck_token += 1;
        if let Some(elapsed) = self.context.evaluation.stop() {
            self.deps.telemetry.network_event(
                self.net_id,
                NetworkEventKind::CaptivePortalFound {
                    duration_ms: millis(elapsed),
                },
            );
        }
        if self.context.suppress_notification {
            return;
        }

        let token = match self.context.launch_token {
            Some(token) => token,
            None => {
                let token = LaunchToken(self.rng.random());
                self.context.launch_token = Some(token);
                token
            }
        };
        self.deps.events.emit(MonitorEvent::ProvisioningNotification {
            net_id: self.net_id,
            visible: true,
            launch_token: Some(token),
        });
        self.context.recheck_timer = Some(self.deps.scheduler.post_delayed(
            Command::CaptivePortalRecheck {
                token: self.context.recheck_token,
            },
            self.recheck_delay,
            TimerKind::Ordinary,
        ));
    }

    // Lingering

    fn enter_lingering(&mut self) {
        self.context.evaluation.reset();
        self.context.linger_token += 1;
        self.context.linger_timer = Some(self.deps.scheduler.post_delayed(
            Command::LingerExpired {
                token: self.context.linger_token,
            },
            self.linger_delay,
            TimerKind::Wakeup,
        ));
    }

    fn process_lingering(&mut self, command: &Command) -> Handling {
        match command {
            Command::Connected if self.deps.provider.snapshot().last_validated => {
                self.transition_to(MonitorState::Validated);
                Handling::Handled
            }
            Command::LingerExpired { token } => {
                if *token == self.context.linger_token {
                    // Later copies of this expiry are stale.
                    self.context.linger_token += 1;
                    self.context.linger_timer = None;
                    tracing::info!(net_id = self.net_id, "linger complete");
                    self.deps
                        .events
                        .emit(MonitorEvent::LingerComplete { net_id: self.net_id });
                }
                Handling::Handled
            }
            Command::ForceReevaluation { .. }
            | Command::CaptivePortalRecheck { .. }
            | Command::SignInFinished(_) => Handling::Handled,
            _ => Handling::NotHandled,
        }
    }

    fn emit_tested(&self, result: TestResult, redirect_url: Option<String>) {
        self.deps.events.emit(MonitorEvent::NetworkTested {
            net_id: self.net_id,
            result,
            redirect_url,
        });
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
