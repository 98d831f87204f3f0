#![warn(missing_docs)]
//! # netmon binary
//!
//! Watches the host's network from the console. Monitor events are printed
//! to stdout as JSON lines; stdin accepts `force`, `linger`, `launch`,
//! `dismissed`, `unwanted`, `wanted-as-is`, `log` and `quit`.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use netmon_app::{
    AppConfig, AppError, EnvSettings, PROBE_USER_AGENT, app_version, event_to_json, init_tracing,
};
use netmon_core::{Caller, Disposition, TracingTelemetry};
use netmon_monitor::{
    EventSink, LaunchToken, MonitorEvent, MonitorHandle, RuntimeDeps, SignInRequest, spawn_monitor,
};
use netmon_probe::{HostNetwork, HostNetworkConfig};

const IDLE_POLL: Duration = Duration::from_millis(250);

enum Input {
    Event(MonitorEvent),
    Line(String),
    StdinClosed,
}

struct ConsoleSink(Sender<Input>);

impl EventSink for ConsoleSink {
    fn emit(&self, event: MonitorEvent) {
        let _ = self.0.send(Input::Event(event));
    }
}

/// CLI entry point.
fn main() {
    init_tracing();
    if let Err(error) = run() {
        tracing::error!(%error, "netmon failed");
        eprintln!("netmon: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let config = AppConfig::from_env()?;
    tracing::info!(version = app_version(), ?config, "starting netmon");

    let provider = HostNetwork::new(
        config.host_snapshot(),
        &HostNetworkConfig {
            bind_address: config.bind_address,
            user_agent: PROBE_USER_AGENT.to_string(),
            ..HostNetworkConfig::default()
        },
    )?;

    let (tx, rx) = mpsc::channel();
    spawn_stdin_reader(tx.clone());

    let handle = spawn_monitor(
        RuntimeDeps {
            provider: Arc::new(provider),
            settings: Arc::new(EnvSettings),
            telemetry: Arc::new(TracingTelemetry),
            events: Arc::new(ConsoleSink(tx)),
        },
        config.monitor_config(),
    )?;
    handle.connected()?;

    let deadline = config.run_for.map(|run_for| Instant::now() + run_for);
    let mut console = Console::default();
    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left.min(IDLE_POLL),
                None => break,
            },
            None => IDLE_POLL,
        };

        match rx.recv_timeout(wait) {
            Ok(Input::Event(event)) => console.on_event(event),
            Ok(Input::Line(line)) => {
                if !console.on_line(&handle, line.trim())? {
                    break;
                }
            }
            Ok(Input::StdinClosed) if deadline.is_none() => break,
            Ok(Input::StdinClosed) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    handle.shutdown()?;
    Ok(())
}

fn spawn_stdin_reader(tx: Sender<Input>) {
    let spawned = std::thread::Builder::new()
        .name("netmon-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::StdinClosed);
        });
    if let Err(error) = spawned {
        tracing::warn!(%error, "stdin commands unavailable");
    }
}

#[derive(Default)]
struct Console {
    launch_token: Option<LaunchToken>,
    sign_in: Option<SignInRequest>,
}

impl Console {
    fn on_event(&mut self, event: MonitorEvent) {
        println!("{}", event_to_json(&event));
        match event {
            MonitorEvent::ProvisioningNotification {
                visible,
                launch_token,
                ..
            } => {
                self.launch_token = if visible { launch_token } else { None };
            }
            MonitorEvent::SignInRequested(request) => {
                if let Some(url) = &request.portal_url {
                    eprintln!("open {url} to sign in, then type dismissed, unwanted or wanted-as-is");
                }
                self.sign_in = Some(request);
            }
            MonitorEvent::NetworkTested { .. } | MonitorEvent::LingerComplete { .. } => {}
        }
    }

    /// Returns `false` when the user asked to quit.
    fn on_line(&mut self, handle: &MonitorHandle, line: &str) -> Result<bool, AppError> {
        match line {
            "" => {}
            "quit" | "exit" => return Ok(false),
            "force" => handle.force_reevaluation(None)?,
            "linger" => handle.linger()?,
            "log" => {
                for entry in handle.validation_log() {
                    eprintln!("{entry}");
                }
            }
            "launch" => match self.launch_token {
                Some(token) => handle.launch_sign_in(token)?,
                None => eprintln!("no sign-in notification is showing"),
            },
            other => match (other.parse::<Disposition>(), self.sign_in.as_mut()) {
                (Ok(disposition), Some(request)) => {
                    // The console operator owns the machine.
                    if let Err(error) = request.responder.respond(Caller::Privileged, disposition) {
                        eprintln!("{error}");
                    }
                    if request.responder.is_spent() {
                        self.sign_in = None;
                    }
                }
                (Ok(_), None) => eprintln!("no sign-in in progress; type launch first"),
                (Err(_), _) => eprintln!("unknown command: {other}"),
            },
        }
        Ok(true)
    }
}
