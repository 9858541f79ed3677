use std::thread;
use std::time::Duration;
use tasknode::{
    boot, ConnectionState, FatalError, FencingToken, LeaderAddress, SettableLeaderRetrieval,
    StartupStep,
};
use tempfile::tempdir;

#[path = "support/worker.rs"]
mod worker_support;
use worker_support::{eventually, init_logging, local_config, Fixture, WAIT};

fn leader(token: u64) -> LeaderAddress {
    LeaderAddress::new(format!("rm-{token}:6123"), token)
}

#[test]
fn out_of_order_notifications_settle_on_highest_token() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    for token in [3, 1, 5, 4] {
        fixture.retrieval.notify(leader(token));
    }
    assert!(worker.connector().wait_for(WAIT, |status| {
        status.state == ConnectionState::Connected
            && status.connected_to.as_ref() == Some(&leader(5))
    }));
    thread::sleep(Duration::from_millis(50));

    let status = worker.connector().status();
    assert_eq!(status.accepted_history, vec![FencingToken(3), FencingToken(5)]);
    assert_eq!(status.accepted, Some(leader(5)));
    assert_eq!(status.connected_to, Some(leader(5)));
    assert!(eventually(WAIT, || fixture.gateway.open_tokens() == vec![5]));
}

#[test]
fn concurrent_notifications_never_move_backwards() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    let notifiers: Vec<_> = (0..4u64)
        .map(|lane| {
            let retrieval = fixture.retrieval.clone();
            thread::spawn(move || {
                for step in 0..10u64 {
                    retrieval.notify(leader(1 + (step * 7 + lane * 3) % 40));
                }
            })
        })
        .collect();
    for notifier in notifiers {
        notifier.join().unwrap();
    }
    fixture.retrieval.notify(leader(41));

    assert!(worker.connector().wait_for(WAIT, |status| {
        status.connected_to.as_ref().map(|l| l.token) == Some(FencingToken(41))
    }));
    let history = worker.connector().status().accepted_history;
    assert!(history.windows(2).all(|pair| pair[0] < pair[1]), "{history:?}");
    assert_eq!(history.last(), Some(&FencingToken(41)));
    assert!(eventually(WAIT, || fixture.gateway.open_tokens() == vec![41]));
}

#[test]
fn repeated_token_is_not_retried() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    fixture.retrieval.notify(leader(7));
    fixture.retrieval.notify(LeaderAddress::new("rm-elsewhere:6123", 7));
    assert!(worker
        .connector()
        .wait_for(WAIT, |status| status.state == ConnectionState::Connected));
    thread::sleep(Duration::from_millis(50));
    let status = worker.connector().status();
    assert_eq!(status.connection_attempts, 1);
    assert_eq!(status.connected_to, Some(leader(7)));
}

#[test]
fn slow_connection_to_superseded_leader_is_closed() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    fixture.gateway.delay_token(1, Duration::from_millis(200));
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    fixture.retrieval.notify(leader(1));
    fixture.retrieval.notify(leader(2));
    assert!(worker.connector().wait_for(WAIT, |status| {
        status.connected_to.as_ref() == Some(&leader(2))
    }));
    assert!(eventually(WAIT, || fixture.gateway.sessions().len() == 2));
    assert!(eventually(WAIT, || fixture.gateway.open_tokens() == vec![2]));
    assert_eq!(worker.connection_state(), ConnectionState::Connected);
}

#[test]
fn leader_known_before_boot_is_replayed() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::with_retrieval(SettableLeaderRetrieval::with_leader(leader(12)));
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();
    assert!(worker.connector().wait_for(WAIT, |status| {
        status.connected_to.as_ref() == Some(&leader(12))
    }));
}

#[test]
fn failing_heartbeats_trigger_reconnect_to_same_leader() {
    init_logging();
    let base = tempdir().unwrap();
    let mut config = local_config(base.path());
    config.heartbeat.interval_ms = 5;
    config.heartbeat.max_consecutive_failures = 2;
    let fixture = Fixture::new();
    fixture.gateway.fail_heartbeats();
    let worker = boot(&config, fixture.services()).unwrap();

    fixture.retrieval.notify(leader(3));
    assert!(worker
        .connector()
        .wait_for(WAIT, |status| status.connection_attempts >= 2));
    let sessions = fixture.gateway.sessions();
    assert!(sessions.iter().all(|session| session.token() == 3));
    assert!(sessions[0].heartbeats() >= 2);
    assert!(sessions[0].is_closed());
    assert!(worker.background_faults() >= 2);
    assert!(fixture.fatal.lock().is_empty());
}

#[test]
fn retrieval_failure_reaches_fatal_error_handler() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let _worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    fixture.retrieval.fail("ha backend unreachable");
    assert!(eventually(WAIT, || !fixture.fatal.lock().is_empty()));
    assert!(matches!(
        &fixture.fatal.lock()[0],
        FatalError::LeaderRetrieval(reason) if reason.contains("ha backend unreachable")
    ));
}

#[test]
fn shutdown_disconnects_and_closes_the_session() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let worker = boot(&local_config(base.path()), fixture.services()).unwrap();
    fixture.retrieval.notify(leader(4));
    assert!(worker
        .connector()
        .wait_for(WAIT, |status| status.state == ConnectionState::Connected));

    worker.shutdown().unwrap();
    assert_eq!(worker.connection_state(), ConnectionState::Disconnected);
    assert!(fixture.gateway.open_tokens().is_empty());
    assert!(!fixture.retrieval.is_started());

    fixture.retrieval.notify(leader(9));
    assert_eq!(worker.connector().status().connected_to, None);
}

#[test]
fn retrieval_service_rejects_a_second_subscriber() {
    init_logging();
    let base = tempdir().unwrap();
    let fixture = Fixture::new();
    let _worker = boot(&local_config(base.path()), fixture.services()).unwrap();

    let other = tempdir().unwrap();
    let err = boot(&local_config(other.path()), fixture.services())
        .err()
        .expect("retrieval already has a listener");
    assert_eq!(err.step(), StartupStep::LeaderSubscription);
    assert!(!other.path().join("work").exists());
    assert_eq!(fixture.registry.len(), 16);
}

#[test]
fn services_can_boot_a_new_worker_after_shutdown() {
    init_logging();
    let base = tempdir().unwrap();
    let config = local_config(base.path());
    let fixture = Fixture::new();
    fixture.retrieval.notify(leader(2));

    let first = boot(&config, fixture.services()).unwrap();
    assert!(first.connector().wait_for(WAIT, |status| {
        status.connected_to.as_ref() == Some(&leader(2))
    }));
    first.shutdown().unwrap();
    assert!(!fixture.retrieval.is_started());

    let second = boot(&config, fixture.services()).expect("retrieval was stopped");
    assert!(fixture.retrieval.is_started());
    assert!(second.connector().wait_for(WAIT, |status| {
        status.connected_to.as_ref() == Some(&leader(2))
    }));
    assert_eq!(first.connection_state(), ConnectionState::Disconnected);
}
