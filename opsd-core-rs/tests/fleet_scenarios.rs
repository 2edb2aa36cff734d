//! End-to-end scenarios over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use opsd_core::state::OPS_SET_TOPIC;
use opsd_core::transport::MemoryConnector;
use opsd_core::{ConnectionState, ControlListener, Daemon, DaemonConfig, Fleet};
use tokio::time::Instant;

async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

fn control(daemon: &Daemon, connector: &MemoryConnector) -> ControlListener {
    ControlListener::new(
        "local",
        Arc::new(daemon.config().bindings()),
        daemon.fleet().clone(),
        Arc::new(connector.clone()),
    )
}

fn member(fleet: &Fleet, host: &str) -> (ConnectionState, Duration) {
    fleet.with_registry(|r| {
        let member = r.member(r.find(host).unwrap()).unwrap();
        (member.state(), member.backoff())
    })
}

fn next_attempt(fleet: &Fleet, host: &str) -> Instant {
    fleet.with_registry(|r| r.member(r.find(host).unwrap()).unwrap().next_attempt_at())
}

#[tokio::test]
async fn two_inputs_two_members() {
    let connector = MemoryConnector::new();
    let config = DaemonConfig::from_items("local", ["/in/a@0x1", "/in/b@0x2", "m1", "m2"]).unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    let listener = control(&daemon, &connector);

    daemon.tick(Instant::now());
    until(|| daemon.fleet().status().connected == 2).await;

    // Nothing driven yet, so joining sends nothing
    assert!(connector.published("m1").is_empty());

    listener.handle_message("/in/a", b"1");
    listener.handle_message("/in/b", b"1");
    listener.handle_message("/in/a", b"0");

    for host in ["m1", "m2"] {
        assert_eq!(
            connector.payloads(host, OPS_SET_TOPIC),
            vec!["0x1 0x1", "0x3 0x3", "0x2 0x3"]
        );
    }
}

#[tokio::test]
async fn rejected_and_repeated_inputs_do_not_broadcast() {
    let connector = MemoryConnector::new();
    let config = DaemonConfig::from_items("local", ["/in/a@0x1", "m1"]).unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    let listener = control(&daemon, &connector);

    daemon.tick(Instant::now());
    until(|| daemon.fleet().status().connected == 1).await;

    listener.handle_message("/in/a", b"1");
    listener.handle_message("/in/a", b"1");
    listener.handle_message("/in/a", b"on");
    listener.handle_message("/in/nope", b"0");

    assert_eq!(connector.payloads("m1", OPS_SET_TOPIC), vec!["0x1 0x1"]);
    assert_eq!(daemon.fleet().state().encode(), "0x1 0x1");
}

#[tokio::test]
async fn pre_armed_bit_is_sent_on_first_refresh() {
    let connector = MemoryConnector::new();
    let config = DaemonConfig::from_items("local", ["/in/c@-0x4", "m1"])
        .unwrap()
        .with_refresh_secs(10.0)
        .unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    assert_eq!(daemon.fleet().state().encode(), "0x0 0x4");

    let start = Instant::now();
    daemon.tick(start);
    until(|| daemon.fleet().status().connected == 1).await;
    assert_eq!(connector.payloads("m1", OPS_SET_TOPIC), vec!["0x0 0x4"]);

    daemon.tick(start + Duration::from_secs(10));
    assert_eq!(connector.payloads("m1", OPS_SET_TOPIC), vec!["0x0 0x4", "0x0 0x4"]);
    assert!(connector.published("m1").iter().all(|p| p.durable));
}

#[tokio::test]
async fn failing_member_backs_off_then_resets() {
    let connector = MemoryConnector::new();
    connector.refuse("m3", 3);
    let config = DaemonConfig::from_items("local", ["/in/a@0x1", "m3"]).unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    let fleet = daemon.fleet().clone();

    let mut now = Instant::now();
    let mut before_attempt = Vec::new();
    for attempt in 1..=3 {
        before_attempt.push(member(&fleet, "m3").1.as_secs());
        assert_eq!(daemon.tick(now), 1);
        until(|| member(&fleet, "m3").0 == ConnectionState::Disconnected).await;
        assert_eq!(connector.attempts("m3"), attempt);

        // Still waiting just before the deadline
        let deadline = next_attempt(&fleet, "m3");
        assert_eq!(daemon.tick(deadline - Duration::from_millis(100)), 0);
        now = deadline;
    }
    assert_eq!(before_attempt, vec![1, 2, 4]);

    // Fourth attempt succeeds and resets the backoff
    daemon.tick(now);
    until(|| fleet.status().connected == 1).await;
    assert_eq!(member(&fleet, "m3"), (ConnectionState::Connected, Duration::from_secs(1)));

    // An unexpected drop starts the backoff over from the reset value
    connector.drop_connection("m3");
    until(|| fleet.status().connected == 0).await;
    assert_eq!(member(&fleet, "m3"), (ConnectionState::Disconnected, Duration::from_secs(2)));
}

#[tokio::test]
async fn reconnecting_member_gets_current_state() {
    let connector = MemoryConnector::new();
    let config = DaemonConfig::from_items("local", ["/in/a@0x1", "m1", "m2"]).unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    let listener = control(&daemon, &connector);
    let fleet = daemon.fleet().clone();

    let mut now = Instant::now();
    daemon.tick(now);
    until(|| fleet.status().connected == 2).await;

    connector.drop_connection("m2");
    until(|| fleet.connected_hosts() == vec!["m1".to_string()]).await;

    // Missed while away
    listener.handle_message("/in/a", b"1");
    assert_eq!(connector.payloads("m1", OPS_SET_TOPIC), vec!["0x1 0x1"]);
    assert!(connector.payloads("m2", OPS_SET_TOPIC).is_empty());

    assert_eq!(member(&fleet, "m2").1, Duration::from_secs(2));
    now = next_attempt(&fleet, "m2");
    assert_eq!(daemon.tick(now), 1);
    until(|| fleet.status().connected == 2).await;
    assert_eq!(connector.payloads("m2", OPS_SET_TOPIC), vec!["0x1 0x1"]);
    assert!(fleet.with_registry(|r| r.is_consistent()));
}

#[tokio::test]
async fn held_handshake_stays_pending() {
    let connector = MemoryConnector::new();
    connector.hold("m1", true);
    let config = DaemonConfig::from_items("local", ["m1"]).unwrap();
    let mut daemon = Daemon::new(config, Arc::new(connector.clone()));
    let fleet = daemon.fleet().clone();

    let now = Instant::now();
    daemon.tick(now);
    until(|| connector.attempts("m1") == 1).await;
    assert_eq!(member(&fleet, "m1").0, ConnectionState::Connecting);

    // Not rescheduled while the attempt is in flight
    assert_eq!(daemon.tick(now + Duration::from_secs(60)), 0);

    connector.accept("m1");
    until(|| fleet.status().connected == 1).await;
}
