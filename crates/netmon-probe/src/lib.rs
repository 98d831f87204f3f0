#![warn(missing_docs)]
//! # netmon-probe
//!
//! ## Purpose
//! Decides, for one pass, whether a network reaches the validation server
//! unmodified, is intercepted by a captive portal, or is broken.
//!
//! ## Responsibilities
//! - Pick exactly one probing mode per pass: PAC fetch, HTTPS+HTTP race, or
//!   plain HTTP.
//! - Classify terminal responses into [`ProbeResult`] values.
//! - Pre-resolve the probed host for diagnostics.
//! - Provide the real [`HostNetwork`] provider backed by a blocking HTTP
//!   client.
//!
//! ## Data flow
//! Monitor calls [`ProbeEngine::is_captive_portal`] -> engine reads the
//! current [`NetworkSnapshot`](netmon_core::NetworkSnapshot) and settings ->
//! issues [`ProbeRequest`]s through the [`NetworkProvider`] -> folds the
//! responses with [`classify_response`].
//!
//! ## Ownership and lifetimes
//! The engine is a bundle of `Arc` handles and clones cheaply; race workers
//! each own a clone so a slow probe can outlive the pass that started it.
//!
//! ## Error model
//! Nothing here fails outward. Malformed URLs, DNS failures, timeouts and I/O
//! errors are written to the validation log and folded into the 599 sentinel
//! so the caller retries with backoff.

mod host;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use netmon_core::{
    NetworkConditions, NetworkProvider, ProbeKind, ProbeRequest, ProbeResponse, ProbeResult,
    Settings, TelemetrySink, Transport, ValidationLog, unix_timestamp_millis,
};
use thiserror::Error;
use url::Url;

pub use host::{HostNetwork, HostNetworkConfig};

/// Connect and read timeout applied to every probe.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Connect/read timeout per probe.
    pub socket_timeout: Duration,
    /// Emit network-conditions telemetry after each pass.
    pub report_network_conditions: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            socket_timeout: SOCKET_TIMEOUT,
            report_network_conditions: false,
        }
    }
}

/// Classifies one terminal probe response.
///
/// # Semantics
/// - 204 is successful.
/// - 200 with `Content-Length: 0` is treated as 204 (broken transparent proxy).
/// - 200 from a PAC fetch is treated as 204.
/// - Any other 2xx/3xx is a portal; `Location` becomes the redirect URL.
/// - Everything else is the failure sentinel.
pub fn classify_response(kind: ProbeKind, response: &ProbeResponse) -> ProbeResult {
    let status = match response.status {
        200 if response.content_length == Some(0) => 204,
        200 if kind == ProbeKind::Pac => 204,
        status => status,
    };

    match status {
        204 => ProbeResult::new(204, response.location.clone()),
        200..=399 => ProbeResult::new(status, response.location.clone()),
        _ => ProbeResult::failed(),
    }
}

/// Issues validation probes against one network.
#[derive(Clone)]
pub struct ProbeEngine {
    provider: Arc<dyn NetworkProvider>,
    settings: Arc<dyn Settings>,
    telemetry: Arc<dyn TelemetrySink>,
    log: ValidationLog,
    config: ProbeConfig,
}

impl ProbeEngine {
    /// Creates an engine bound to one provider.
    pub fn new(
        provider: Arc<dyn NetworkProvider>,
        settings: Arc<dyn Settings>,
        telemetry: Arc<dyn TelemetrySink>,
        log: ValidationLog,
        config: ProbeConfig,
    ) -> Self {
        Self {
            provider,
            settings,
            telemetry,
            log,
            config,
        }
    }

    /// Returns the shared validation log.
    pub fn log(&self) -> &ValidationLog {
        &self.log
    }

    /// Runs one full probe pass.
    ///
    /// Blocks for up to one socket timeout per sequential probe, or one socket
    /// timeout for the parallel race.
    pub fn is_captive_portal(&self, use_https: bool) -> ProbeResult {
        if !self.settings.captive_portal_detection_enabled() {
            return ProbeResult::new(204, None);
        }

        let snapshot = self.provider.snapshot();
        let proxy = snapshot.proxy.as_ref();

        let pac_url = match proxy.and_then(|proxy| proxy.pac_url()) {
            Some(raw) => match parse_probe_url(raw) {
                Ok(url) => Some(url),
                Err(error) => {
                    self.log.record(format!("Invalid PAC URL: {raw} ({error})"));
                    return ProbeResult::failed();
                }
            },
            None => None,
        };

        let validation_urls = if pac_url.is_none() {
            let http_raw = self.settings.validation_url(false);
            match (
                parse_probe_url(&http_raw),
                parse_probe_url(&self.settings.validation_url(true)),
            ) {
                (Ok(http), Ok(https)) => Some((http, https)),
                _ => {
                    self.log.record(format!("Bad validation URL: {http_raw}"));
                    return ProbeResult::failed();
                }
            }
        } else {
            None
        };

        let started_ms = unix_timestamp_millis();

        let host_to_resolve = match (&pac_url, proxy, &validation_urls) {
            (Some(pac), _, _) => pac.host_str().map(str::to_string),
            (None, Some(proxy), _) => proxy.host.clone(),
            (None, None, Some((http, _))) => http.host_str().map(str::to_string),
            (None, None, None) => None,
        };
        if let Some(host) = host_to_resolve.filter(|host| !host.is_empty()) {
            self.resolve_for_log(snapshot.net_id, &host);
        }

        let result = match (pac_url, validation_urls) {
            (Some(pac), _) => self.send_http_probe(&pac, ProbeKind::Pac),
            (None, Some((http, https))) if use_https => self.send_parallel_probes(https, http),
            (None, Some((http, _))) => self.send_http_probe(&http, ProbeKind::Http),
            (None, None) => ProbeResult::failed(),
        };

        if self.config.report_network_conditions
            && matches!(snapshot.transport, Transport::Wifi | Transport::Cellular)
        {
            self.telemetry.network_conditions(
                snapshot.net_id,
                &NetworkConditions {
                    transport: snapshot.transport,
                    response_received: result.status != netmon_core::FAILED_STATUS,
                    is_captive_portal: result.is_portal(),
                    request_timestamp_ms: started_ms,
                    response_timestamp_ms: unix_timestamp_millis(),
                },
            );
        }

        result
    }

    /// Fetches `url` once and classifies the terminal status.
    ///
    /// Redirects are followed only for [`ProbeKind::Pac`].
    pub fn send_http_probe(&self, url: &Url, kind: ProbeKind) -> ProbeResult {
        let request = ProbeRequest {
            url: url.to_string(),
            follow_redirects: kind == ProbeKind::Pac,
            timeout: self.config.socket_timeout,
        };

        let started = Instant::now();
        let (status, result) = match self.provider.fetch(&request) {
            Ok(response) => {
                self.log.record(format!(
                    "{kind} {url} time={}ms ret={} headers={:?}",
                    started.elapsed().as_millis(),
                    response.status,
                    response.headers
                ));
                let result = classify_response(kind, &response);
                if response.status == 200 && result.is_successful() {
                    if kind == ProbeKind::Pac {
                        self.log
                            .record("PAC fetch 200 response interpreted as 204 response.");
                    } else {
                        self.log.record("Empty 200 response interpreted as 204 response.");
                    }
                }
                (response.status, result)
            }
            Err(error) => {
                self.log
                    .record(format!("Probably not a portal: exception {error}"));
                (netmon_core::FAILED_STATUS, ProbeResult::failed())
            }
        };

        let net_id = self.provider.snapshot().net_id;
        self.telemetry
            .probe_event(net_id, kind, started.elapsed(), status);
        result
    }

    /// Races an HTTPS and an HTTP probe.
    ///
    /// # Semantics
    /// A successful HTTPS probe or an HTTP portal hit is adopted as soon as it
    /// arrives, without waiting for the other probe. Otherwise both probes are
    /// awaited and the HTTPS result is adopted. An interrupted wait yields the
    /// failure sentinel.
    pub fn send_parallel_probes(&self, https_url: Url, http_url: Url) -> ProbeResult {
        let race = Arc::new(Race::default());

        for (kind, url) in [(ProbeKind::Https, https_url), (ProbeKind::Http, http_url)] {
            let mut completion = Completion {
                race: Arc::clone(&race),
                kind,
                result: None,
            };
            let engine = self.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("netmon-probe-{}", kind.name().to_ascii_lowercase()))
                .spawn(move || {
                    completion.result = Some(engine.send_http_probe(&url, kind));
                });
            if let Err(error) = spawned {
                // The closure (and its completion guard) was dropped, which
                // already counted this probe down as failed.
                self.log
                    .record(format!("{kind} probe thread failed to start: {error}"));
            }
        }

        match race.wait() {
            Some(result) => result,
            None => {
                self.log.record("Error: probe wait interrupted!");
                ProbeResult::failed()
            }
        }
    }

    fn resolve_for_log(&self, net_id: u32, host: &str) {
        let started = Instant::now();
        match self.provider.resolve(host) {
            Ok(addresses) => {
                let latency = started.elapsed();
                self.telemetry
                    .probe_event(net_id, ProbeKind::Dns, latency, 1);
                let joined = addresses
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                self.log.record(format!(
                    "DNS OK {}ms, {host}={joined}",
                    latency.as_millis()
                ));
            }
            Err(error) => {
                let latency = started.elapsed();
                self.telemetry
                    .probe_event(net_id, ProbeKind::Dns, latency, 0);
                self.log.record(format!(
                    "DNS FAIL {}ms, {host} ({error})",
                    latency.as_millis()
                ));
            }
        }
    }
}

/// Shared slot for the two racing probes.
#[derive(Default)]
struct Race {
    state: Mutex<RaceState>,
    done: Condvar,
}

struct RaceState {
    pending: u8,
    decided: Option<ProbeResult>,
    https: Option<ProbeResult>,
}

impl Default for RaceState {
    fn default() -> Self {
        Self {
            pending: 2,
            decided: None,
            https: None,
        }
    }
}

impl Race {
    fn complete(&self, kind: ProbeKind, result: ProbeResult) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        let decisive = match kind {
            ProbeKind::Https => result.is_successful(),
            _ => result.is_portal(),
        };
        if kind == ProbeKind::Https {
            state.https = Some(result.clone());
        }
        if decisive && state.decided.is_none() {
            state.decided = Some(result);
        }
        state.pending = state.pending.saturating_sub(1);
        self.done.notify_all();
    }

    fn wait(&self) -> Option<ProbeResult> {
        let state = self.state.lock().ok()?;
        let mut state = self
            .done
            .wait_while(state, |state| state.pending > 0 && state.decided.is_none())
            .ok()?;

        Some(
            state
                .decided
                .take()
                .or_else(|| state.https.take())
                .unwrap_or_else(ProbeResult::failed),
        )
    }
}

/// Counts one probe down exactly once, even if the worker unwinds.
struct Completion {
    race: Arc<Race>,
    kind: ProbeKind,
    result: Option<ProbeResult>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(ProbeResult::failed);
        self.race.complete(self.kind, result);
    }
}

fn parse_probe_url(raw: &str) -> Result<Url, ProbeError> {
    let url = Url::parse(raw.trim()).map_err(|error| ProbeError::InvalidUrl {
        url: raw.to_string(),
        reason: error.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(ProbeError::InvalidUrl {
            url: raw.to_string(),
            reason: "expected an absolute http(s) url with a host".to_string(),
        }),
    }
}

/// Errors raised while configuring probes or the host provider.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// URL could not be parsed or is not http(s).
    #[error("invalid probe url {url}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser error text.
        reason: String,
    },
    /// HTTP client could not be built.
    #[error("http client setup failed: {0}")]
    Client(String),
}
