#![warn(missing_docs)]
//! # netmon-app
//!
//! ## Purpose
//! Wires the probe engine and monitor to the host's own network so one
//! network can be watched from the console.
//!
//! ## Responsibilities
//! - Read validation settings and run options from the environment.
//! - Install the `tracing` subscriber.
//! - Project monitor events into JSON lines for the console.
//!
//! ## Data flow
//! Environment -> [`EnvSettings`] / [`AppConfig`] -> host provider + monitor
//! config -> `spawn_monitor` -> events -> [`event_to_json`] -> stdout.
//!
//! ## Ownership and lifetimes
//! Settings are read from the environment on every call, so changes apply to
//! the next evaluation without restarting the monitor.
//!
//! ## Error model
//! Malformed run options, provider setup and monitor start-up failures are
//! wrapped in [`AppError`].

use std::net::IpAddr;
use std::time::Duration;

use netmon_core::{NetworkSnapshot, ProxyInfo, Settings, Transport};
use netmon_monitor::{MonitorConfig, MonitorError, MonitorEvent};
use netmon_probe::ProbeError;
use serde_json::{Value, json};
use thiserror::Error;

/// Build-time application version loaded from root `VERSION` file.
pub const APP_VERSION: &str = env!("NETMON_VERSION");

/// Captive portal detection toggle.
pub const ENV_DETECTION: &str = "NETMON_CAPTIVE_PORTAL_DETECTION";
/// HTTPS probing toggle.
pub const ENV_USE_HTTPS: &str = "NETMON_CAPTIVE_PORTAL_USE_HTTPS";
/// Validation server host override.
pub const ENV_SERVER: &str = "NETMON_CAPTIVE_PORTAL_SERVER";
/// Network id reported in events.
pub const ENV_NET_ID: &str = "NETMON_NET_ID";
/// PAC script URL; switches probing to PAC mode.
pub const ENV_PAC_URL: &str = "NETMON_PAC_URL";
/// Local address probes bind to.
pub const ENV_BIND_ADDRESS: &str = "NETMON_BIND_ADDRESS";
/// Seconds to run before disconnecting; unset runs until stdin closes.
pub const ENV_RUN_SECONDS: &str = "NETMON_RUN_SECONDS";
/// Linger delay override in milliseconds.
pub const ENV_LINGER_DELAY_MS: &str = "NETMON_LINGER_DELAY_MS";

/// Returns the app version sourced from root `VERSION`.
pub fn app_version() -> &'static str {
    APP_VERSION
}

/// User agent sent with every validation probe.
pub const PROBE_USER_AGENT: &str = concat!("netmon/", env!("NETMON_VERSION"));

/// Interprets an on/off environment value.
///
/// Semantics:
/// - Unset or unrecognized => `default`.
/// - `0`, `false`, `off`, `no` (case-insensitive) => `false`.
/// - `1`, `true`, `on`, `yes` (case-insensitive) => `true`.
pub fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        Some("0" | "false" | "off" | "no") => false,
        Some("1" | "true" | "on" | "yes") => true,
        _ => default,
    }
}

/// [`Settings`] backed by process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl Settings for EnvSettings {
    fn captive_portal_detection_enabled(&self) -> bool {
        parse_flag(std::env::var(ENV_DETECTION).ok().as_deref(), true)
    }

    fn use_https(&self) -> bool {
        parse_flag(std::env::var(ENV_USE_HTTPS).ok().as_deref(), true)
    }

    fn server_host(&self) -> Option<String> {
        std::env::var(ENV_SERVER)
            .ok()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
    }
}

/// Run options for the console binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Network id reported in events.
    pub net_id: u32,
    /// PAC script URL, if any.
    pub pac_url: Option<String>,
    /// Local address probes bind to.
    pub bind_address: Option<IpAddr>,
    /// How long to run; `None` runs until stdin closes.
    pub run_for: Option<Duration>,
    /// Linger delay override.
    pub linger_delay: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            net_id: 100,
            pac_url: None,
            bind_address: None,
            run_for: None,
            linger_delay: None,
        }
    }
}

impl AppConfig {
    /// Reads run options from the process environment.
    ///
    /// # Errors
    /// Returns [`AppError::InvalidEnv`] for values that do not parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads run options through `lookup`, which maps a variable name to its
    /// value.
    ///
    /// # Errors
    /// Returns [`AppError::InvalidEnv`] for values that do not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        Ok(Self {
            net_id: parse_var(ENV_NET_ID, value(ENV_NET_ID))?.unwrap_or(defaults.net_id),
            pac_url: value(ENV_PAC_URL),
            bind_address: parse_var(ENV_BIND_ADDRESS, value(ENV_BIND_ADDRESS))?,
            run_for: parse_var::<u64>(ENV_RUN_SECONDS, value(ENV_RUN_SECONDS))?
                .map(Duration::from_secs),
            linger_delay: parse_var::<u64>(ENV_LINGER_DELAY_MS, value(ENV_LINGER_DELAY_MS))?
                .map(Duration::from_millis),
        })
    }

    /// Snapshot of the host network as seen by the monitor.
    pub fn host_snapshot(&self) -> NetworkSnapshot {
        let mut snapshot = NetworkSnapshot::new(self.net_id, "host", Transport::Other);
        snapshot.proxy = self.pac_url.as_ref().map(|pac_url| ProxyInfo {
            pac_url: Some(pac_url.clone()),
            ..ProxyInfo::default()
        });
        snapshot
    }

    /// Monitor configuration derived from the run options.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            linger_delay: self.linger_delay,
            ..MonitorConfig::default()
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, AppError> {
    raw.map(|value| {
        value.parse::<T>().map_err(|_| AppError::InvalidEnv {
            key: key.to_string(),
            value,
        })
    })
    .transpose()
}

/// Installs the global fmt subscriber, filtered by `RUST_LOG` (default
/// `info`). Later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Projects one monitor event into a JSON object for console output.
pub fn event_to_json(event: &MonitorEvent) -> Value {
    match event {
        MonitorEvent::NetworkTested {
            net_id,
            result,
            redirect_url,
        } => json!({
            "event": "network_tested",
            "net_id": net_id,
            "result": result,
            "redirect_url": redirect_url,
        }),
        MonitorEvent::LingerComplete { net_id } => json!({
            "event": "linger_complete",
            "net_id": net_id,
        }),
        MonitorEvent::ProvisioningNotification {
            net_id,
            visible,
            launch_token,
        } => json!({
            "event": "provisioning_notification",
            "net_id": net_id,
            "visible": visible,
            "launch_token": launch_token.map(|token| token.0),
        }),
        MonitorEvent::SignInRequested(request) => json!({
            "event": "sign_in_requested",
            "net_id": request.net_id,
            "portal_url": request.portal_url,
        }),
    }
}

/// App integration error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Environment variable holds an unparsable value.
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Host provider setup failed.
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),
    /// Monitor start-up or command failure.
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

#[cfg(test)]
mod tests {
    //! Unit tests for flag parsing and event projection.

    use netmon_core::TestResult;

    use super::*;

    #[test]
    fn flag_parsing_falls_back_to_default() {
        assert!(!parse_flag(Some("OFF"), true));
        assert!(parse_flag(Some(" yes "), false));
        assert!(parse_flag(Some("maybe"), true));
        assert!(!parse_flag(None, false));
    }

    #[test]
    fn tested_event_projects_verdict_and_redirect() {
        let value = event_to_json(&MonitorEvent::NetworkTested {
            net_id: 4,
            result: TestResult::Invalid,
            redirect_url: Some("http://portal.test/".to_string()),
        });

        assert_eq!(value["event"], "network_tested");
        assert_eq!(value["result"], "invalid");
        assert_eq!(value["net_id"], 4);
        assert_eq!(value["redirect_url"], "http://portal.test/");
    }
}
