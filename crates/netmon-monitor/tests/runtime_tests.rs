//! Integration tests for the threaded monitor runtime.

mod common;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use common::{EventLog, FakeNetwork, portal, status, unreachable};
use netmon_core::{Disposition, StaticSettings, TestResult, TracingTelemetry};
use netmon_monitor::{
    Command, Delivery, MonitorConfig, MonitorDeps, MonitorError, MonitorEvent, MonitorHandle,
    MonitorState, NetworkMonitor, RuntimeDeps, TimerService, spawn_monitor,
};

const WAIT: Duration = Duration::from_secs(5);

fn start(
    network: Arc<FakeNetwork>,
    config: MonitorConfig,
) -> (MonitorHandle, Receiver<MonitorEvent>) {
    let (tx, rx) = mpsc::channel();
    let handle = spawn_monitor(
        RuntimeDeps {
            provider: network,
            settings: Arc::new(StaticSettings {
                use_https: false,
                ..StaticSettings::default()
            }),
            telemetry: Arc::new(TracingTelemetry),
            events: Arc::new(tx),
        },
        MonitorConfig {
            launch_token_seed: Some(3),
            ..config
        },
    )
    .expect("monitor should start");
    (handle, rx)
}

#[test]
fn runtime_tests_validates_on_worker_thread() {
    let (handle, events) = start(FakeNetwork::new(status(204)), MonitorConfig::default());

    handle.connected().expect("monitor is running");

    match events.recv_timeout(WAIT).expect("validation result") {
        MonitorEvent::NetworkTested { net_id, result, .. } => {
            assert_eq!(net_id, common::NET_ID);
            assert_eq!(result, TestResult::Valid);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(handle.net_id(), common::NET_ID);
    handle.shutdown().expect("clean shutdown");
}

#[test]
fn runtime_tests_linger_timer_fires_in_real_time() {
    let (handle, events) = start(
        FakeNetwork::new(status(204)),
        MonitorConfig {
            linger_delay: Some(Duration::from_millis(50)),
            ..MonitorConfig::default()
        },
    );

    handle.connected().expect("monitor is running");
    handle.linger().expect("monitor is running");

    let completed = std::iter::from_fn(|| events.recv_timeout(WAIT).ok())
        .find(|event| matches!(event, MonitorEvent::LingerComplete { .. }));
    assert!(completed.is_some());
}

#[test]
fn runtime_tests_retries_until_network_recovers() {
    let network = FakeNetwork::new(unreachable());
    let (handle, events) = start(network.clone(), MonitorConfig::default());

    handle.connected().expect("monitor is running");
    match events.recv_timeout(WAIT).expect("first attempt result") {
        MonitorEvent::NetworkTested { result, .. } => assert_eq!(result, TestResult::Invalid),
        other => panic!("unexpected event {other:?}"),
    }

    network.set_reply(status(204));
    let validated = std::iter::from_fn(|| events.recv_timeout(WAIT).ok()).find(|event| {
        matches!(
            event,
            MonitorEvent::NetworkTested {
                result: TestResult::Valid,
                ..
            }
        )
    });
    assert!(validated.is_some(), "1 s retry should validate");
    assert!(
        handle
            .validation_log()
            .iter()
            .any(|line| line.contains("Probably not a portal"))
    );
}

#[test]
fn runtime_tests_commands_after_disconnect_are_rejected() {
    let (handle, _events) = start(FakeNetwork::new(status(204)), MonitorConfig::default());

    handle.disconnected().expect("first disconnect is accepted");

    assert!(matches!(handle.connected(), Err(MonitorError::Stopped)));
    assert!(matches!(handle.disconnected(), Err(MonitorError::Stopped)));
    handle.shutdown().expect("worker exits after disconnect");
}

#[test]
fn runtime_tests_dropping_handle_stops_worker() {
    let (handle, events) = start(FakeNetwork::new(status(204)), MonitorConfig::default());
    handle.connected().expect("monitor is running");
    events.recv_timeout(WAIT).expect("validation result");

    drop(handle);

    // The worker dropped its event sender on exit.
    assert!(matches!(
        events.recv_timeout(WAIT),
        Err(mpsc::RecvTimeoutError::Disconnected)
    ));
}

#[test]
fn runtime_tests_recheck_released_before_sign_in_result_is_dropped() {
    let network = FakeNetwork::new(portal());
    let (tx, inbox) = mpsc::channel();
    let timers = Arc::new(TimerService::start(tx, "netmon-timer-recheck").expect("timer thread"));
    let mut monitor = NetworkMonitor::new(
        MonitorDeps {
            provider: network.clone(),
            settings: Arc::new(StaticSettings {
                use_https: false,
                ..StaticSettings::default()
            }),
            telemetry: Arc::new(TracingTelemetry),
            scheduler: timers.clone(),
            events: Arc::new(EventLog::default()),
        },
        MonitorConfig {
            captive_portal_recheck: Duration::from_millis(50),
            launch_token_seed: Some(3),
            ..MonitorConfig::default()
        },
    )
    .expect("monitor should build");

    monitor.handle(Command::Connected);
    let first_attempt = inbox.recv_timeout(WAIT).expect("first attempt queued");
    monitor.handle(timers.accept(first_attempt).expect("immediate delivery"));
    assert_eq!(monitor.state(), MonitorState::CaptivePortal);

    // The re-check comes due while the user's answer is being handled.
    let recheck = inbox.recv_timeout(WAIT).expect("recheck released");
    assert!(matches!(
        recheck,
        Delivery::Timer(_, Command::CaptivePortalRecheck { .. })
    ));
    monitor.handle(Command::SignInFinished(Disposition::WantedAsIs));
    assert_eq!(monitor.state(), MonitorState::Validated);

    assert_eq!(timers.accept(recheck), None);
    assert!(inbox.try_recv().is_err());
    assert_eq!(monitor.state(), MonitorState::Validated);
    assert_eq!(network.fetch_count(), 1);
    timers.shutdown();
}

#[test]
fn runtime_tests_cancelled_recheck_never_reaches_worker() {
    let network = FakeNetwork::new(portal());
    let (handle, events) = start(
        network.clone(),
        MonitorConfig {
            captive_portal_recheck: Duration::from_millis(20),
            ..MonitorConfig::default()
        },
    );

    handle.connected().expect("monitor is running");
    let token = std::iter::from_fn(|| events.recv_timeout(WAIT).ok())
        .find_map(|event| match event {
            MonitorEvent::ProvisioningNotification {
                visible: true,
                launch_token,
                ..
            } => launch_token,
            _ => None,
        })
        .expect("portal notification");

    handle.launch_sign_in(token).expect("monitor is running");
    let mut request = std::iter::from_fn(|| events.recv_timeout(WAIT).ok())
        .find_map(|event| match event {
            MonitorEvent::SignInRequested(request) => Some(request),
            _ => None,
        })
        .expect("sign-in request");
    request
        .responder
        .respond(netmon_core::Caller::Privileged, Disposition::WantedAsIs)
        .expect("privileged caller may accept as-is");

    let valid = std::iter::from_fn(|| events.recv_timeout(WAIT).ok()).find(|event| {
        matches!(
            event,
            MonitorEvent::NetworkTested {
                result: TestResult::Valid,
                ..
            }
        )
    });
    assert!(valid.is_some());
    let fetches = network.fetch_count();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(network.fetch_count(), fetches, "no probe after accepting as-is");
    assert!(events.try_recv().is_err(), "no verdict after accepting as-is");
    handle.shutdown().expect("clean shutdown");
}
