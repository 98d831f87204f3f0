//! Integration tests for the reqwest-backed host provider against a local
//! HTTP fixture.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

use netmon_core::{
    NetworkProvider, NetworkSnapshot, StaticSettings, TracingTelemetry, Transport, ValidationLog,
};
use netmon_probe::{HostNetwork, HostNetworkConfig, ProbeConfig, ProbeEngine};

/// Serves `responses` in order, one connection each, and returns the bound
/// `host:port`.
fn serve(responses: Vec<&'static str>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("fixture should bind");
    let address = listener.local_addr().expect("fixture address").to_string();

    let handle = std::thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buffer = [0_u8; 4096];
            let _ = stream.read(&mut buffer);
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });

    (address, handle)
}

fn probe_host(address: &str) -> ProbeEngine {
    let network = HostNetwork::new(
        NetworkSnapshot::new(7, "loopback", Transport::Ethernet),
        &HostNetworkConfig::default(),
    )
    .expect("host network should build");
    ProbeEngine::new(
        Arc::new(network),
        Arc::new(StaticSettings {
            detection_enabled: true,
            use_https: false,
            server_host: Some(address.to_string()),
        }),
        Arc::new(TracingTelemetry),
        ValidationLog::default(),
        ProbeConfig::default(),
    )
}

#[test]
fn host_network_tests_classifies_204_as_valid() {
    let (address, server) = serve(vec![
        "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
    ]);

    let result = probe_host(&address).is_captive_portal(false);
    server.join().expect("fixture should finish");

    assert!(result.is_successful());
}

#[test]
fn host_network_tests_does_not_follow_portal_redirect() {
    let (address, server) = serve(vec![
        "HTTP/1.1 302 Found\r\nLocation: http://portal.test/login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    ]);

    let result = probe_host(&address).is_captive_portal(false);
    server.join().expect("fixture should finish");

    assert!(result.is_portal());
    assert_eq!(result.redirect_url.as_deref(), Some("http://portal.test/login"));
}

#[test]
fn host_network_tests_empty_200_counts_as_valid() {
    let (address, server) = serve(vec![
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    ]);

    let result = probe_host(&address).is_captive_portal(false);
    server.join().expect("fixture should finish");

    assert!(result.is_successful());
}

#[test]
fn host_network_tests_refused_connection_is_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("address").to_string();
    drop(listener);

    let result = probe_host(&address).is_captive_portal(false);
    assert_eq!(result.status, 599);
}

#[test]
fn host_network_tests_resolves_loopback() {
    let network = HostNetwork::new(
        NetworkSnapshot::new(7, "loopback", Transport::Ethernet),
        &HostNetworkConfig::default(),
    )
    .expect("host network should build");

    let addresses = network.resolve("localhost").expect("localhost should resolve");
    assert!(addresses.iter().any(|address| address.is_loopback()));

    network.attribute_traffic(Some(1000));
    assert_eq!(network.attributed_requester(), Some(1000));
}
