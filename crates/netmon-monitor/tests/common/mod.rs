//! Shared fixtures for monitor integration tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netmon_core::{
    CoreError, NetworkEventKind, NetworkProvider, NetworkSnapshot, ProbeKind, ProbeRequest,
    ProbeResponse, StaticSettings, TelemetrySink, TestResult, Transport,
};
use netmon_monitor::{
    EventSink, Flow, LaunchToken, MonitorConfig, MonitorDeps, MonitorEvent, NetworkMonitor,
    VirtualScheduler,
};

pub const NET_ID: u32 = 100;
#[allow(dead_code)]
pub const PORTAL_URL: &str = "http://portal.test/login";

/// Provider answering every probe with the same scripted outcome.
pub struct FakeNetwork {
    pub snapshot: Mutex<NetworkSnapshot>,
    pub reply: Mutex<Result<ProbeResponse, CoreError>>,
    pub fetches: Mutex<Vec<ProbeRequest>>,
    pub attribution: Mutex<Vec<Option<u32>>>,
}

impl FakeNetwork {
    pub fn new(reply: Result<ProbeResponse, CoreError>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(NetworkSnapshot::new(NET_ID, "test-wifi", Transport::Wifi)),
            reply: Mutex::new(reply),
            fetches: Mutex::new(Vec::new()),
            attribution: Mutex::new(Vec::new()),
        })
    }

    #[allow(dead_code)]
    pub fn set_reply(&self, reply: Result<ProbeResponse, CoreError>) {
        *self.reply.lock().expect("reply lock") = reply;
    }

    #[allow(dead_code)]
    pub fn update_snapshot(&self, update: impl FnOnce(&mut NetworkSnapshot)) {
        update(&mut self.snapshot.lock().expect("snapshot lock"));
    }

    #[allow(dead_code)]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().expect("fetches lock").len()
    }

    #[allow(dead_code)]
    pub fn attribution_calls(&self) -> Vec<Option<u32>> {
        self.attribution.lock().expect("attribution lock").clone()
    }
}

impl NetworkProvider for FakeNetwork {
    fn snapshot(&self) -> NetworkSnapshot {
        self.snapshot.lock().expect("snapshot lock").clone()
    }

    fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, CoreError> {
        Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))])
    }

    fn fetch(&self, request: &ProbeRequest) -> Result<ProbeResponse, CoreError> {
        self.fetches
            .lock()
            .expect("fetches lock")
            .push(request.clone());
        self.reply.lock().expect("reply lock").clone()
    }

    fn attribute_traffic(&self, requester: Option<u32>) {
        self.attribution
            .lock()
            .expect("attribution lock")
            .push(requester);
    }
}

#[allow(dead_code)]
pub fn status(status: u16) -> Result<ProbeResponse, CoreError> {
    Ok(ProbeResponse {
        status,
        ..ProbeResponse::default()
    })
}

#[allow(dead_code)]
pub fn portal() -> Result<ProbeResponse, CoreError> {
    Ok(ProbeResponse {
        status: 302,
        location: Some(PORTAL_URL.to_string()),
        content_length: None,
        headers: vec![("location".to_string(), PORTAL_URL.to_string())],
    })
}

#[allow(dead_code)]
pub fn unreachable() -> Result<ProbeResponse, CoreError> {
    Err(CoreError::Timeout)
}

/// Event sink that keeps everything it receives.
#[allow(dead_code)]
#[derive(Default)]
pub struct EventLog(Mutex<Vec<MonitorEvent>>);

impl EventLog {
    /// Removes and returns everything recorded so far.
    #[allow(dead_code)]
    pub fn take(&self) -> Vec<MonitorEvent> {
        std::mem::take(&mut *self.0.lock().expect("event lock"))
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: MonitorEvent) {
        self.0.lock().expect("event lock").push(event);
    }
}

/// Telemetry sink that keeps lifecycle events.
#[allow(dead_code)]
#[derive(Default)]
pub struct TelemetryLog(Mutex<Vec<NetworkEventKind>>);

impl TelemetryLog {
    #[allow(dead_code)]
    pub fn events(&self) -> Vec<NetworkEventKind> {
        self.0.lock().expect("telemetry lock").clone()
    }
}

impl TelemetrySink for TelemetryLog {
    fn network_event(&self, _net_id: u32, kind: NetworkEventKind) {
        self.0.lock().expect("telemetry lock").push(kind);
    }

    fn probe_event(&self, _net_id: u32, _kind: ProbeKind, _latency: Duration, _status: u16) {}
}

/// Monitor wired to a virtual clock.
#[allow(dead_code)]
pub struct Harness {
    pub monitor: NetworkMonitor,
    pub scheduler: Arc<VirtualScheduler>,
    pub network: Arc<FakeNetwork>,
    pub events: Arc<EventLog>,
    pub telemetry: Arc<TelemetryLog>,
}

#[allow(dead_code)]
impl Harness {
    /// HTTP-only probing so every pass issues exactly one fetch.
    pub fn new(reply: Result<ProbeResponse, CoreError>) -> Self {
        Self::with_settings(
            reply,
            StaticSettings {
                use_https: false,
                ..StaticSettings::default()
            },
        )
    }

    pub fn with_settings(reply: Result<ProbeResponse, CoreError>, settings: StaticSettings) -> Self {
        Self::with_config(
            reply,
            settings,
            MonitorConfig {
                linger_delay: Some(Duration::from_secs(30)),
                launch_token_seed: Some(7),
                ..MonitorConfig::default()
            },
        )
    }

    pub fn with_config(
        reply: Result<ProbeResponse, CoreError>,
        settings: StaticSettings,
        config: MonitorConfig,
    ) -> Self {
        let network = FakeNetwork::new(reply);
        let scheduler = Arc::new(VirtualScheduler::new());
        let events = Arc::new(EventLog::default());
        let telemetry = Arc::new(TelemetryLog::default());
        let monitor = NetworkMonitor::new(
            MonitorDeps {
                provider: network.clone(),
                settings: Arc::new(settings),
                telemetry: telemetry.clone(),
                scheduler: scheduler.clone(),
                events: events.clone(),
            },
            config,
        )
        .expect("monitor should build");

        Self {
            monitor,
            scheduler,
            network,
            events,
            telemetry,
        }
    }

    /// Handles `command` and everything it posts for immediate delivery.
    pub fn send(&mut self, command: netmon_monitor::Command) -> Flow {
        let flow = self.monitor.handle(command);
        self.drain();
        flow
    }

    pub fn drain(&mut self) {
        self.scheduler.drain(&mut self.monitor);
    }

    /// Jumps to the next timer and processes what it released.
    pub fn fire_next(&mut self) -> Option<Duration> {
        let step = self.scheduler.advance_to_next()?;
        self.drain();
        Some(step)
    }

    pub fn advance(&mut self, by: Duration) {
        self.scheduler.advance(by);
        self.drain();
    }
}

/// Verdicts carried by `NetworkTested` events, in order.
#[allow(dead_code)]
pub fn verdicts(events: &[MonitorEvent]) -> Vec<(TestResult, Option<String>)> {
    events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::NetworkTested {
                result,
                redirect_url,
                ..
            } => Some((*result, redirect_url.clone())),
            _ => None,
        })
        .collect()
}

/// Visibility flags and tokens of notification events, in order.
#[allow(dead_code)]
pub fn notifications(events: &[MonitorEvent]) -> Vec<(bool, Option<LaunchToken>)> {
    events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::ProvisioningNotification {
                visible,
                launch_token,
                ..
            } => Some((*visible, *launch_token)),
            _ => None,
        })
        .collect()
}
