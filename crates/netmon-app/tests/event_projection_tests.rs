//! Integration tests for console JSON projection of monitor events.

use netmon_app::event_to_json;
use netmon_core::TestResult;
use netmon_monitor::{LaunchToken, MonitorEvent};

#[test]
fn event_projection_tests_valid_result_has_null_redirect() {
    let value = event_to_json(&MonitorEvent::NetworkTested {
        net_id: 1,
        result: TestResult::Valid,
        redirect_url: None,
    });

    assert_eq!(value["result"], "valid");
    assert!(value["redirect_url"].is_null());
}

#[test]
fn event_projection_tests_notification_carries_token() {
    let shown = event_to_json(&MonitorEvent::ProvisioningNotification {
        net_id: 2,
        visible: true,
        launch_token: Some(LaunchToken(77)),
    });
    let cleared = event_to_json(&MonitorEvent::ProvisioningNotification {
        net_id: 2,
        visible: false,
        launch_token: None,
    });

    assert_eq!(shown["visible"], true);
    assert_eq!(shown["launch_token"], 77);
    assert_eq!(cleared["visible"], false);
    assert!(cleared["launch_token"].is_null());
}

#[test]
fn event_projection_tests_linger_complete_is_one_line() {
    let line = event_to_json(&MonitorEvent::LingerComplete { net_id: 9 }).to_string();

    assert!(!line.contains('\n'));
    assert!(line.contains("\"linger_complete\""));
}
