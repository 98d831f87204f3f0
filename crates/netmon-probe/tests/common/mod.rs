//! Shared fixtures for probe engine integration tests.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netmon_core::{
    CoreError, NetworkProvider, NetworkSnapshot, ProbeRequest, ProbeResponse, StaticSettings,
    TracingTelemetry, Transport, ValidationLog,
};
use netmon_probe::{ProbeConfig, ProbeEngine};

pub const HTTP_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";
pub const HTTPS_URL: &str = "https://connectivitycheck.gstatic.com/generate_204";

/// Scripted reply for one URL.
#[derive(Clone)]
pub struct Reply {
    pub delay: Duration,
    pub outcome: Result<ProbeResponse, CoreError>,
}

#[allow(dead_code)]
pub fn status(status: u16) -> Reply {
    Reply {
        delay: Duration::ZERO,
        outcome: Ok(ProbeResponse {
            status,
            ..ProbeResponse::default()
        }),
    }
}

#[allow(dead_code)]
pub fn redirect(location: &str) -> Reply {
    Reply {
        delay: Duration::ZERO,
        outcome: Ok(ProbeResponse {
            status: 302,
            location: Some(location.to_string()),
            content_length: None,
            headers: vec![("location".to_string(), location.to_string())],
        }),
    }
}

#[allow(dead_code)]
pub fn timeout() -> Reply {
    Reply {
        delay: Duration::ZERO,
        outcome: Err(CoreError::Timeout),
    }
}

#[allow(dead_code)]
pub fn delayed(reply: Reply, delay: Duration) -> Reply {
    Reply { delay, ..reply }
}

/// Provider answering from a URL -> reply table.
pub struct ScriptedNetwork {
    pub snapshot: Mutex<NetworkSnapshot>,
    pub replies: Mutex<HashMap<String, Reply>>,
    pub requests: Mutex<Vec<ProbeRequest>>,
    pub resolved: Mutex<Vec<String>>,
    pub dns_fails: bool,
}

impl ScriptedNetwork {
    pub fn new(replies: Vec<(&str, Reply)>) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(NetworkSnapshot::new(100, "test-wifi", Transport::Wifi)),
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(url, reply)| (url.to_string(), reply))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
            resolved: Mutex::new(Vec::new()),
            dns_fails: false,
        })
    }

    #[allow(dead_code)]
    pub fn requested_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|request| request.url.clone())
            .collect()
    }
}

impl NetworkProvider for ScriptedNetwork {
    fn snapshot(&self) -> NetworkSnapshot {
        self.snapshot.lock().expect("snapshot lock").clone()
    }

    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, CoreError> {
        self.resolved.lock().expect("resolved lock").push(host.to_string());
        if self.dns_fails {
            return Err(CoreError::Dns {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            });
        }
        Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))])
    }

    fn fetch(&self, request: &ProbeRequest) -> Result<ProbeResponse, CoreError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get(&request.url)
            .cloned()
            .unwrap_or_else(timeout);
        std::thread::sleep(reply.delay);
        reply.outcome
    }
}

pub fn engine(network: Arc<ScriptedNetwork>, settings: StaticSettings) -> ProbeEngine {
    ProbeEngine::new(
        network,
        Arc::new(settings),
        Arc::new(TracingTelemetry),
        ValidationLog::default(),
        ProbeConfig::default(),
    )
}
