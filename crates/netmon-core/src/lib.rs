#![warn(missing_docs)]
//! # netmon-core
//!
//! ## Purpose
//! Defines the data model shared by the probe engine and the per-network
//! validation monitor.
//!
//! ## Responsibilities
//! - Describe the monitored network as seen by the orchestrator
//!   ([`NetworkSnapshot`], [`ProxyInfo`]).
//! - Carry probe requests/responses across the [`NetworkProvider`] seam.
//! - Classify probe outcomes ([`ProbeResult`]).
//! - Keep the bounded, human-readable [`ValidationLog`].
//! - Define the write-only sinks the monitor calls into ([`Settings`],
//!   [`TelemetrySink`]).
//!
//! ## Data flow
//! Orchestrator owns the network -> [`NetworkProvider::snapshot`] exposes the
//! current view -> probe engine issues [`ProbeRequest`]s and folds the
//! [`ProbeResponse`]s into a [`ProbeResult`] -> monitor decides the next state.
//!
//! ## Ownership and lifetimes
//! Snapshots are owned values re-read on each evaluation. The validation log is
//! a cheap-clone handle over one shared ring buffer so probe worker threads and
//! diagnostic readers can reach it without borrowing the monitor.
//!
//! ## Error model
//! Provider failures (DNS, connect, timeout, I/O) are reported as
//! [`CoreError`] values. Callers are expected to fold them into the failure
//! sentinel rather than propagate them.
//!
//! ## Example
//! ```rust
//! use netmon_core::{ProbeResult, ValidationLog};
//!
//! assert!(ProbeResult::new(204, None).is_successful());
//! assert!(ProbeResult::new(302, Some("http://portal.test/".into())).is_portal());
//! assert!(!ProbeResult::failed().is_portal());
//!
//! let log = ValidationLog::new(2).unwrap();
//! log.record("one");
//! log.record("two");
//! log.record("three");
//! assert_eq!(log.len(), 2);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Default validation server host.
pub const DEFAULT_SERVER: &str = "connectivitycheck.gstatic.com";

/// Path fetched on the validation server; a healthy network answers 204.
pub const VALIDATION_PATH: &str = "/generate_204";

/// Status used for probes that never produced a usable HTTP response.
pub const FAILED_STATUS: u16 = 599;

/// Default number of lines retained by a [`ValidationLog`].
pub const DEFAULT_LOG_CAPACITY: usize = 20;

/// Link technology carrying the monitored network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// 802.11 wireless.
    Wifi,
    /// Mobile data.
    Cellular,
    /// Wired ethernet.
    Ethernet,
    /// Bluetooth tethering.
    Bluetooth,
    /// Virtual private network.
    Vpn,
    /// Anything else.
    Other,
}

/// Proxy configuration attached to a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInfo {
    /// Static proxy host, if any.
    pub host: Option<String>,
    /// Static proxy port.
    pub port: u16,
    /// Proxy auto-config script URL, if any.
    pub pac_url: Option<String>,
}

impl ProxyInfo {
    /// Returns the PAC URL when one is configured and non-blank.
    pub fn pac_url(&self) -> Option<&str> {
        self.pac_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Read-only view of the network the monitor is attached to.
///
/// The monitor never mutates this value; it asks the provider for a fresh one
/// before each evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Orchestrator-assigned network id.
    pub net_id: u32,
    /// Human-readable name used in diagnostics.
    pub name: String,
    /// Underlying link technology.
    pub transport: Transport,
    /// Current proxy/PAC configuration.
    pub proxy: Option<ProxyInfo>,
    /// Whether the network satisfies the default connectivity request.
    pub satisfies_default_request: bool,
    /// Whether the orchestrator already considers this network validated.
    pub last_validated: bool,
}

impl NetworkSnapshot {
    /// Creates a snapshot for a plain network with no proxy that satisfies the
    /// default request.
    pub fn new(net_id: u32, name: impl Into<String>, transport: Transport) -> Self {
        Self {
            net_id,
            name: name.into(),
            transport,
            proxy: None,
            satisfies_default_request: true,
            last_validated: false,
        }
    }
}

/// Kind of probe issued during an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Hostname pre-resolution.
    Dns,
    /// Plain HTTP fetch of the validation URL.
    Http,
    /// HTTPS fetch of the validation URL.
    Https,
    /// Fetch of the PAC script.
    Pac,
}

impl ProbeKind {
    /// Short upper-case name used in validation log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::Dns => "DNS",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Pac => "PAC",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One HTTP fetch issued against the monitored network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Absolute URL to fetch.
    pub url: String,
    /// Whether redirects are followed (PAC fetches only).
    pub follow_redirects: bool,
    /// Connect and read timeout.
    pub timeout: Duration,
}

/// Raw terminal response of a probe fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Location` header, if present.
    pub location: Option<String>,
    /// Declared `Content-Length`, if present.
    pub content_length: Option<u64>,
    /// Response headers in arrival order, for diagnostics only.
    pub headers: Vec<(String, String)>,
}

/// Folded outcome of one probe or probe race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Classified HTTP status (599 for failures).
    pub status: u16,
    /// Redirect destination reported by the probe.
    pub redirect_url: Option<String>,
}

impl ProbeResult {
    /// Creates a result from a status and optional redirect.
    pub fn new(status: u16, redirect_url: Option<String>) -> Self {
        Self {
            status,
            redirect_url,
        }
    }

    /// Failure sentinel: neither successful nor a portal.
    pub fn failed() -> Self {
        Self::new(FAILED_STATUS, None)
    }

    /// Returns `true` for a 204 response.
    pub fn is_successful(&self) -> bool {
        self.status == 204
    }

    /// Returns `true` for any other 2xx/3xx response.
    pub fn is_portal(&self) -> bool {
        !self.is_successful() && (200..=399).contains(&self.status)
    }
}

/// Result reported to the orchestrator after a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    /// Network should be used as a default internet connection.
    Valid,
    /// Network is broken, behind a portal, or rejected by the user.
    Invalid,
}

/// Outcome reported by the external sign-in surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// User finished signing in.
    Dismissed,
    /// User does not want this network.
    Unwanted,
    /// User wants to use the network despite the portal.
    WantedAsIs,
}

impl FromStr for Disposition {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dismissed" => Ok(Self::Dismissed),
            "unwanted" => Ok(Self::Unwanted),
            "wanted_as_is" | "wanted-as-is" | "as-is" => Ok(Self::WantedAsIs),
            other => Err(CoreError::UnknownDisposition(other.to_string())),
        }
    }
}

/// Privilege of the party invoking a gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    /// Internal, trusted caller.
    Privileged,
    /// Any external caller.
    Unprivileged,
}

/// Access to the monitored network, owned by the orchestrator.
///
/// All traffic issued through this trait must stay scoped to the network.
pub trait NetworkProvider: Send + Sync {
    /// Returns the current view of the network.
    fn snapshot(&self) -> NetworkSnapshot;

    /// Resolves `host` using the network's DNS servers.
    ///
    /// # Errors
    /// Returns [`CoreError::Dns`] when resolution fails.
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, CoreError>;

    /// Performs one HTTP fetch on the network.
    ///
    /// # Errors
    /// Returns [`CoreError::Timeout`] or [`CoreError::Io`] when no terminal
    /// response was received.
    fn fetch(&self, request: &ProbeRequest) -> Result<ProbeResponse, CoreError>;

    /// Attributes probe traffic to a requester, or clears attribution.
    fn attribute_traffic(&self, _requester: Option<u32>) {}
}

/// Validation settings, re-read as needed.
pub trait Settings: Send + Sync {
    /// Whether captive-portal detection runs at all.
    fn captive_portal_detection_enabled(&self) -> bool;

    /// Whether the HTTPS probe is raced against the HTTP probe.
    fn use_https(&self) -> bool;

    /// Validation server host, or `None` for [`DEFAULT_SERVER`].
    fn server_host(&self) -> Option<String>;

    /// Returns the validation URL for the configured host.
    fn validation_url(&self, https: bool) -> String {
        let host = self
            .server_host()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let scheme = if https { "https" } else { "http" };
        format!("{scheme}://{}{VALIDATION_PATH}", host.trim())
    }
}

/// In-memory settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSettings {
    /// Detection toggle.
    pub detection_enabled: bool,
    /// HTTPS toggle.
    pub use_https: bool,
    /// Server host override.
    pub server_host: Option<String>,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            use_https: true,
            server_host: None,
        }
    }
}

impl Settings for StaticSettings {
    fn captive_portal_detection_enabled(&self) -> bool {
        self.detection_enabled
    }

    fn use_https(&self) -> bool {
        self.use_https
    }

    fn server_host(&self) -> Option<String> {
        self.server_host.clone()
    }
}

/// Network lifecycle milestones reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEventKind {
    /// Orchestrator reported the network connected.
    Connected,
    /// Orchestrator reported the network disconnected.
    Disconnected,
    /// Validation succeeded after the given evaluation time.
    Validated {
        /// Time spent evaluating.
        duration_ms: u64,
    },
    /// Captive portal found after the given evaluation time.
    CaptivePortalFound {
        /// Time spent evaluating.
        duration_ms: u64,
    },
    /// One evaluation attempt failed.
    ValidationFailed,
}

/// Latency measurement of one probe pass, reported for Wi-Fi/cellular only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Transport of the measured network.
    pub transport: Transport,
    /// Whether any response was received.
    pub response_received: bool,
    /// Whether the pass concluded a captive portal.
    pub is_captive_portal: bool,
    /// Pass start in milliseconds since the Unix epoch.
    pub request_timestamp_ms: u64,
    /// Pass end in milliseconds since the Unix epoch.
    pub response_timestamp_ms: u64,
}

/// Write-only telemetry sink.
pub trait TelemetrySink: Send + Sync {
    /// Records a lifecycle milestone.
    fn network_event(&self, net_id: u32, kind: NetworkEventKind);

    /// Records one probe; DNS probes report status 1 for success, 0 for failure.
    fn probe_event(&self, net_id: u32, kind: ProbeKind, latency: Duration, status: u16);

    /// Records a network conditions measurement.
    fn network_conditions(&self, _net_id: u32, _conditions: &NetworkConditions) {}
}

/// Telemetry sink that emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn network_event(&self, net_id: u32, kind: NetworkEventKind) {
        tracing::info!(net_id, ?kind, "network event");
    }

    fn probe_event(&self, net_id: u32, kind: ProbeKind, latency: Duration, status: u16) {
        tracing::debug!(
            net_id,
            probe = kind.name(),
            latency_ms = latency.as_millis() as u64,
            status,
            "probe event"
        );
    }

    fn network_conditions(&self, net_id: u32, conditions: &NetworkConditions) {
        tracing::debug!(net_id, ?conditions, "network conditions measured");
    }
}

/// Bounded ring buffer of timestamped validation trace lines.
///
/// Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct ValidationLog {
    capacity: usize,
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl ValidationLog {
    /// Creates an empty log retaining at most `capacity` lines.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidLogCapacity`] when `capacity == 0`.
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::InvalidLogCapacity);
        }

        Ok(Self {
            capacity,
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        })
    }

    /// Appends one line, evicting the oldest on overflow.
    pub fn record(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::debug!(target: "netmon::validation", "{line}");

        let stamped = format!("{} - {line}", timestamp_utc());
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(stamped);
    }

    /// Returns the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Returns the number of retained lines.
    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Returns `true` when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ValidationLog {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(DEFAULT_LOG_CAPACITY))),
        }
    }
}

/// Returns milliseconds since the Unix epoch.
pub fn unix_timestamp_millis() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

fn timestamp_utc() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Error type for core model and provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Log capacity must be strictly positive.
    #[error("validation log capacity must be greater than zero")]
    InvalidLogCapacity,
    /// Disposition string is not recognised.
    #[error("unknown sign-in disposition: {0}")]
    UnknownDisposition(String),
    /// Hostname could not be resolved.
    #[error("dns resolution failed for {host}: {reason}")]
    Dns {
        /// Host that failed to resolve.
        host: String,
        /// Resolver error text.
        reason: String,
    },
    /// Connect or read did not complete in time.
    #[error("probe timed out")]
    Timeout,
    /// Any other transport failure.
    #[error("probe i/o failure: {0}")]
    Io(String),
}
