use crate::connection::errors::{
    ALREADY_CONNECTED, AUTH_FAILED, CONNECTION_TIMEOUT, INVALID_TRANSITION, NETWORK_UNREACHABLE,
    NOT_CONNECTED, PERMISSION_DENIED,
};
use crate::connection::state_machine::{
    FORCED_REASON_PREFIX, MAX_HISTORY_ENTRIES, MAX_RETRY_ATTEMPTS,
};
use crate::connection::*;
use crate::env::test as fixtures;
use crate::remote::{Credentials, FakeCluster, SshConnection};
use crate::session::{MemorySessionStore, SessionConfig, SessionInfo, SessionManager, SessionStore};
use crate::validation::ConnectivityValidator;
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ConnectionState::{Connected, Connecting, Disconnected, Expired};

fn machine_in(state: ConnectionState) -> ConnectionStateMachine {
    let machine = ConnectionStateMachine::new();
    machine.force_state(state, Some("test setup"));
    machine
}

fn network_error() -> ConnectionError {
    ConnectionError::from_template(&NETWORK_UNREACHABLE)
}

// State machine

#[test]
fn test_transition_table_for_all_pairs() {
    let legal = [
        (Disconnected, Connecting),
        (Connecting, Connected),
        (Connecting, Disconnected),
        (Connected, Disconnected),
        (Connected, Expired),
        (Expired, Connecting),
        (Expired, Disconnected),
    ];

    for from in ConnectionState::ALL {
        for to in ConnectionState::ALL {
            let machine = machine_in(from);
            let result = machine.transition_to(to, None);
            let expected = legal.contains(&(from, to));

            assert_eq!(result.is_ok(), expected, "{} -> {}", from, to);
            if expected {
                assert_eq!(machine.current_state(), to);
            } else {
                assert_eq!(machine.current_state(), from);
                assert!(result.unwrap_err().is(&INVALID_TRANSITION));
            }
        }
    }
}

#[test]
fn test_rejected_transition_is_recorded_as_failure() {
    let machine = ConnectionStateMachine::new();
    assert!(machine.transition_to(Connected, Some("skip ahead")).is_err());

    let history = machine.history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].from, Disconnected);
    assert_eq!(history[0].to, Connected);
}

#[test]
fn test_entering_connected_resets_retry_state() {
    let machine = ConnectionStateMachine::new();
    machine.transition_to(Connecting, None).unwrap();
    machine.set_last_error(network_error());
    machine.set_last_error(network_error());
    assert_eq!(machine.retry_count(), 2);
    assert!(machine.last_error().is_some());

    machine.transition_to(Connected, None).unwrap();
    assert_eq!(machine.retry_count(), 0);
    assert!(machine.last_error().is_none());

    // Forced entry resets as well
    let machine = machine_in(Expired);
    machine.set_last_error(network_error());
    machine.force_state(Connected, None);
    assert_eq!(machine.retry_count(), 0);
    assert!(machine.last_error().is_none());
}

#[test]
fn test_can_retry_rules() {
    assert!(!machine_in(Connected).can_retry());
    assert!(!machine_in(Connecting).can_retry());
    assert!(machine_in(Expired).can_retry());

    let machine = ConnectionStateMachine::new();
    assert!(machine.can_retry());
    for _ in 0..MAX_RETRY_ATTEMPTS {
        machine.set_last_error(network_error());
    }
    assert!(machine.can_retry());
    machine.set_last_error(network_error());
    assert!(!machine.can_retry());

    machine.reset_retry_count();
    assert!(machine.can_retry());
}

#[test]
fn test_forced_transition_is_tagged() {
    let machine = ConnectionStateMachine::new();
    machine.transition_to(Connecting, None).unwrap();
    machine.transition_to(Connected, None).unwrap();

    let transition = machine.force_state(Disconnected, Some("socket closed"));
    assert_eq!(transition.from, Connected);
    assert!(transition.reason.unwrap().starts_with(FORCED_REASON_PREFIX));

    // Force bypasses the table
    let transition = machine.force_state(Connected, None);
    assert_eq!(transition.reason.as_deref(), Some(FORCED_REASON_PREFIX));
    assert_eq!(machine.current_state(), Connected);

    let protocol = machine
        .history()
        .into_iter()
        .filter(|t| !t.reason.as_deref().unwrap_or("").starts_with(FORCED_REASON_PREFIX))
        .count();
    assert_eq!(protocol, 2);
}

#[test]
fn test_history_is_bounded() {
    let machine = ConnectionStateMachine::new();
    for _ in 0..40 {
        machine.transition_to(Connecting, None).unwrap();
        machine.transition_to(Disconnected, None).unwrap();
    }

    let history = machine.history();
    assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
    // Oldest entries were evicted; the newest is the last Disconnected
    assert_eq!(history.last().unwrap().to, Disconnected);
    assert_eq!(history.first().unwrap().to, Connecting);
}

#[test]
fn test_observers_notified_in_order() {
    let machine = ConnectionStateMachine::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = seen.clone();
    let _a = machine.on_state_change(move |state| first.lock().unwrap().push(("a", state)));
    let second = seen.clone();
    let _b = machine.on_state_change(move |state| second.lock().unwrap().push(("b", state)));

    machine.transition_to(Connecting, None).unwrap();
    assert!(machine.transition_to(Expired, None).is_err());

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("a", Connecting), ("b", Connecting)]
    );
}

#[test]
fn test_unsubscribe_stops_only_that_observer() {
    let machine = ConnectionStateMachine::new();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let counter = first_calls.clone();
    let first = machine.on_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = second_calls.clone();
    let _second = machine.on_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    machine.transition_to(Connecting, None).unwrap();
    assert!(first.unsubscribe());
    machine.transition_to(Connected, None).unwrap();

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 2);
    assert_eq!(machine.observer_count(), 1);
}

#[test]
fn test_unsubscribe_by_id_is_idempotent() {
    let machine = ConnectionStateMachine::new();
    let subscription = machine.on_state_change(|_| {});
    let id = subscription.id();

    assert!(machine.unsubscribe(id));
    assert!(!machine.unsubscribe(id));
    assert!(!subscription.unsubscribe());
}

#[test]
fn test_panicking_observer_is_isolated() {
    let machine = ConnectionStateMachine::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let _bad = machine.on_state_change(|_| panic!("observer failure"));
    let counter = calls.clone();
    let _good = machine.on_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    machine.transition_to(Connecting, None).unwrap();
    machine.transition_to(Disconnected, None).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(machine.observer_count(), 2);
    assert_eq!(machine.current_state(), Disconnected);
}

#[test]
fn test_observer_may_unsubscribe_during_notification() {
    let machine = Arc::new(ConnectionStateMachine::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

    let weak = Arc::downgrade(&machine);
    let own_id = slot.clone();
    let counter = calls.clone();
    let subscription = machine.on_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let (Some(machine), Some(id)) = (weak.upgrade(), *own_id.lock().unwrap()) {
            machine.unsubscribe(id);
        }
    });
    *slot.lock().unwrap() = Some(subscription.id());

    machine.transition_to(Connecting, None).unwrap();
    machine.transition_to(Disconnected, None).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(machine.observer_count(), 0);
}

#[test]
fn test_idle_check_only_while_connected() {
    let machine = ConnectionStateMachine::new();
    assert!(!machine.is_idle_too_long(Duration::ZERO));

    machine.transition_to(Connecting, None).unwrap();
    machine.transition_to(Connected, None).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert!(machine.is_idle_too_long(Duration::from_millis(1)));
    assert!(!machine.is_idle_too_long(Duration::from_secs(3600)));

    machine.transition_to(Expired, None).unwrap();
    assert!(!machine.is_idle_too_long(Duration::ZERO));
}

#[test]
fn test_diagnostics_snapshot() {
    let machine = ConnectionStateMachine::new();
    let _sub = machine.on_state_change(|_| {});
    machine.transition_to(Connecting, None).unwrap();
    machine.set_last_error(network_error());

    let diagnostics = machine.diagnostics();
    assert_eq!(diagnostics.current_state, Connecting);
    assert_eq!(diagnostics.retry_count, 1);
    assert_eq!(diagnostics.observer_count, 1);
    assert_eq!(diagnostics.history_length, 1);
    assert!(diagnostics.last_error.unwrap().is(&NETWORK_UNREACHABLE));
    assert_eq!(diagnostics.valid_transitions, vec![Connected, Disconnected]);
}

// Retry policy

fn no_jitter(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_attempts,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter: false,
    })
}

#[test]
fn test_backoff_per_category() {
    let policy = no_jitter(5);
    let network = network_error();
    let timeout = ConnectionError::from_template(&CONNECTION_TIMEOUT);

    assert_eq!(policy.delay_for(&network, 1), Some(Duration::from_millis(100)));
    assert_eq!(policy.delay_for(&network, 3), Some(Duration::from_millis(400)));
    assert_eq!(policy.delay_for(&network, 10), Some(Duration::from_millis(1_000)));
    assert_eq!(policy.delay_for(&timeout, 3), Some(Duration::from_millis(300)));
    assert_eq!(
        policy.delay_for(&ConnectionError::from_template(&AUTH_FAILED), 1),
        None
    );
    assert_eq!(
        policy.delay_for(&ConnectionError::from_template(&PERMISSION_DENIED), 1),
        None
    );
}

#[test]
fn test_jitter_stays_in_band() {
    let policy = RetryPolicy::new(RetryConfig {
        jitter: true,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        max_attempts: 5,
    });
    for _ in 0..50 {
        let delay = policy.delay_for(&network_error(), 1).unwrap();
        assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1_200));
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
    let machine = ConnectionStateMachine::new();
    let calls = AtomicUsize::new(0);

    let result = no_jitter(5)
        .execute_with_retry(&machine, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            let machine = &machine;
            async move {
                if attempt < 3 {
                    machine.set_last_error(network_error());
                    Err(network_error())
                } else {
                    Ok(attempt)
                }
            }
            .boxed()
        })
        .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_on_non_retryable_error() {
    let machine = ConnectionStateMachine::new();
    let calls = AtomicUsize::new(0);

    let error = no_jitter(5)
        .execute_with_retry(&machine, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ConnectionError::from_template(&AUTH_FAILED)) }.boxed()
        })
        .await
        .unwrap_err();

    assert!(error.is(&AUTH_FAILED));
    assert_eq!(error.context().unwrap().attempt, Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_respects_attempt_budget_and_ceiling() {
    let machine = ConnectionStateMachine::new();
    let calls = AtomicUsize::new(0);

    let error = no_jitter(3)
        .execute_with_retry(&machine, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(network_error()) }.boxed()
        })
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(error.context().unwrap().attempt, Some(3));

    // Exhausted ceiling on the machine stops the loop immediately
    let machine = ConnectionStateMachine::new();
    for _ in 0..=MAX_RETRY_ATTEMPTS {
        machine.set_last_error(network_error());
    }
    let calls = AtomicUsize::new(0);
    let _ = no_jitter(10)
        .execute_with_retry(&machine, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(network_error()) }.boxed()
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// Controller

struct Harness {
    cluster: Arc<FakeCluster>,
    store: Arc<MemorySessionStore>,
    controller: ConnectionController,
}

fn harness() -> Harness {
    let cluster = Arc::new(FakeCluster::new());
    let store = Arc::new(MemorySessionStore::new());
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        None,
        SessionConfig::default(),
    ));
    let controller = ConnectionController::new(cluster.clone(), cluster.clone(), sessions)
        .with_validator(ConnectivityValidator::new(cluster.clone()))
        .with_retry_policy(no_jitter(3));
    Harness {
        cluster,
        store,
        controller,
    }
}

fn credentials() -> Credentials {
    Credentials::new(fixtures::TEST_HOST, fixtures::TEST_USER)
}

#[tokio::test]
async fn test_connect_persists_session_and_enters_connected() {
    let h = harness();
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _sub = h
        .controller
        .state_machine()
        .on_state_change(move |state| sink.lock().unwrap().push(state));

    let session = h.controller.connect(&credentials()).await.unwrap();

    assert_eq!(session.host, fixtures::TEST_HOST);
    assert!(h.controller.state_machine().is_connected());
    assert_eq!(h.store.load().await.unwrap(), Some(session));
    assert_eq!(*states.lock().unwrap(), vec![Connecting, Connected]);
    h.controller.require_connected().unwrap();
}

#[tokio::test]
async fn test_connect_twice_fails() {
    let h = harness();
    h.controller.connect(&credentials()).await.unwrap();

    let error = h.controller.connect(&credentials()).await.unwrap_err();
    assert!(error.is(&ALREADY_CONNECTED));
    assert!(h.controller.state_machine().is_connected());
}

#[tokio::test]
async fn test_failed_connect_returns_to_disconnected() {
    let h = harness();
    h.cluster
        .fail_connect_with(ConnectionError::from_template(&AUTH_FAILED));

    let error = h.controller.connect(&credentials()).await.unwrap_err();

    assert!(error.is(&AUTH_FAILED));
    let machine = h.controller.state_machine();
    assert_eq!(machine.current_state(), Disconnected);
    assert_eq!(machine.retry_count(), 1);
    assert!(machine.last_error().unwrap().is(&AUTH_FAILED));
    assert_eq!(h.store.load().await.unwrap(), None);
    assert!(h.controller.require_connected().unwrap_err().is(&NOT_CONNECTED));
}

#[tokio::test]
async fn test_connect_rejects_unreachable_host() {
    let h = harness();
    let error = h
        .controller
        .connect(&Credentials::new("unreachable.cluster.edu", fixtures::TEST_USER))
        .await
        .unwrap_err();

    assert!(error.is(&NETWORK_UNREACHABLE));
    assert!(!h.cluster.is_connected());
}

#[tokio::test]
async fn test_connect_rejects_bad_credentials_without_transition() {
    let h = harness();
    assert!(
        h.controller
            .connect(&Credentials::new("", fixtures::TEST_USER))
            .await
            .is_err()
    );
    assert!(
        h.controller
            .connect(&Credentials::new(fixtures::TEST_HOST, "bob smith"))
            .await
            .is_err()
    );
    assert!(h.controller.state_machine().history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_retry_recovers_from_network_errors() {
    let h = harness();
    h.cluster.set_unreachable(true);

    // The link comes back after the second failed attempt
    let cluster = h.cluster.clone();
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    let _sub = h.controller.state_machine().on_state_change(move |state| {
        if state == Disconnected && seen.fetch_add(1, Ordering::SeqCst) >= 1 {
            cluster.set_unreachable(false);
        }
    });

    let session = h.controller.connect_with_retry(&credentials()).await.unwrap();
    assert_eq!(session.username, fixtures::TEST_USER);
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert!(h.controller.state_machine().is_connected());
    assert_eq!(h.controller.state_machine().retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_retry_gives_up_on_auth_failure() {
    let h = harness();
    h.cluster
        .fail_connect_with(ConnectionError::from_template(&AUTH_FAILED));

    let error = h
        .controller
        .connect_with_retry(&credentials())
        .await
        .unwrap_err();
    assert!(error.is(&AUTH_FAILED));
    assert_eq!(h.controller.state_machine().retry_count(), 1);
}

#[tokio::test]
async fn test_disconnect_clears_session() {
    let h = harness();
    h.controller.connect(&credentials()).await.unwrap();

    h.controller.disconnect().await.unwrap();

    assert_eq!(h.controller.state_machine().current_state(), Disconnected);
    assert_eq!(h.store.load().await.unwrap(), None);
    assert!(!h.cluster.is_connected());

    // Idempotent
    h.controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_health_check_forces_disconnect_on_dropped_link() {
    let h = harness();
    h.controller.connect(&credentials()).await.unwrap();
    h.cluster.set_connected(false);

    let state = h.controller.check_health().await.unwrap();

    assert_eq!(state, Disconnected);
    let history = h.controller.state_machine().history();
    assert!(
        history
            .last()
            .unwrap()
            .reason
            .as_deref()
            .unwrap()
            .starts_with(FORCED_REASON_PREFIX)
    );
    assert_eq!(h.store.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_health_check_expires_stale_session() {
    let h = harness();
    h.controller.connect(&credentials()).await.unwrap();
    h.store
        .save(&SessionInfo::started_at(
            fixtures::TEST_HOST,
            fixtures::TEST_USER,
            Utc::now() - ChronoDuration::hours(5),
        ))
        .await
        .unwrap();

    let state = h.controller.check_health().await.unwrap();

    assert_eq!(state, Expired);
    assert_eq!(h.controller.state_machine().current_state(), Expired);
    assert_eq!(h.store.load().await.unwrap(), None);

    // Expired may reconnect
    h.controller.connect(&credentials()).await.unwrap();
    assert!(h.controller.state_machine().is_connected());
}

#[tokio::test]
async fn test_health_check_keeps_healthy_connection() {
    let h = harness();
    assert_eq!(h.controller.check_health().await.unwrap(), Disconnected);

    h.controller.connect(&credentials()).await.unwrap();
    assert_eq!(h.controller.check_health().await.unwrap(), Connected);
}

#[tokio::test]
async fn test_status_and_restore() {
    let h = harness();
    let status = h.controller.status().await;
    assert_eq!(status.state, Disconnected);
    assert!(!status.session.has_session);
    assert_eq!(h.controller.restore_session().await.unwrap(), None);

    let session = h.controller.connect(&credentials()).await.unwrap();
    let status = h.controller.status().await;
    assert_eq!(status.state, Connected);
    assert!(status.ssh.connected);
    assert!(status.session.is_valid);
    assert_eq!(status.machine.current_state, Connected);
    assert_eq!(h.controller.restore_session().await.unwrap(), Some(session));
}

#[tokio::test]
async fn test_validate_uses_controller_ports() {
    let h = harness();
    h.controller.connect(&credentials()).await.unwrap();

    let result = h.controller.validate(&credentials()).await;
    assert!(result.overall_success, "{:?}", result.recommendations);
}
