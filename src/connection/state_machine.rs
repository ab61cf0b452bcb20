use super::errors::{self, ConnectionError};
use super::types::{ConnectionState, StateTransition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ceiling on recorded failures; `can_retry` is false once it is exceeded
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Transition records kept; oldest evicted first
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// Prefix marking transitions that bypassed the legal-transition table
pub const FORCED_REASON_PREFIX: &str = "FORCED:";

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Opaque handle identifying one observer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(SubscriptionId, StateCallback)>,
}

impl ObserverRegistry {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }
}

/// Returned by [`ConnectionStateMachine::on_state_change`]
///
/// Dropping the handle keeps the observer registered; call
/// [`Subscription::unsubscribe`] to stop notifications.
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<ObserverRegistry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove exactly this observer. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Point-in-time view for status displays
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineDiagnostics {
    pub current_state: ConnectionState,
    pub state_entered_at: DateTime<Utc>,
    pub retry_count: u32,
    pub observer_count: usize,
    pub history_length: usize,
    pub last_error: Option<ConnectionError>,
    pub valid_transitions: Vec<ConnectionState>,
}

struct MachineState {
    current: ConnectionState,
    entered_at: DateTime<Utc>,
    connected_since: Option<Instant>,
    history: VecDeque<StateTransition>,
    retry_count: u32,
    last_error: Option<ConnectionError>,
}

impl MachineState {
    fn record(&mut self, transition: StateTransition) {
        if self.history.len() == MAX_HISTORY_ENTRIES {
            self.history.pop_front();
        }
        self.history.push_back(transition);
    }

    fn enter(&mut self, target: ConnectionState) {
        self.current = target;
        self.entered_at = Utc::now();
        if target == ConnectionState::Connected {
            self.connected_since = Some(Instant::now());
            self.retry_count = 0;
            self.last_error = None;
        } else {
            self.connected_since = None;
        }
    }
}

/// Tracks the connection lifecycle and enforces legal transitions
///
/// | From         | To                        |
/// |--------------|---------------------------|
/// | Disconnected | Connecting                |
/// | Connecting   | Connected, Disconnected   |
/// | Connected    | Disconnected, Expired     |
/// | Expired      | Connecting, Disconnected  |
///
/// Observers are notified synchronously, in subscription order, after every
/// successful transition. A panicking observer is isolated and does not
/// affect delivery to the others.
pub struct ConnectionStateMachine {
    state: Mutex<MachineState>,
    observers: Arc<Mutex<ObserverRegistry>>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MachineState {
                current: ConnectionState::Disconnected,
                entered_at: Utc::now(),
                connected_since: None,
                history: VecDeque::with_capacity(MAX_HISTORY_ENTRIES),
                retry_count: 0,
                last_error: None,
            }),
            observers: Arc::new(Mutex::new(ObserverRegistry::default())),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        lock(&self.state).current
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    /// Move to `target` if the table allows it
    ///
    /// A rejected transition leaves the state untouched and is recorded in
    /// the history with `success = false`.
    pub fn transition_to(
        &self,
        target: ConnectionState,
        reason: Option<&str>,
    ) -> Result<StateTransition, ConnectionError> {
        let transition = {
            let mut state = lock(&self.state);
            let from = state.current;

            if !from.can_transition_to(target) {
                state.record(StateTransition {
                    from,
                    to: target,
                    timestamp: Utc::now(),
                    reason: reason.map(str::to_string),
                    success: false,
                });
                warn!("Rejected connection state transition {} -> {}", from, target);
                return Err(ConnectionError::from_template(&errors::INVALID_TRANSITION)
                    .with_message(format!("Invalid transition from {} to {}", from, target)));
            }

            let transition = StateTransition {
                from,
                to: target,
                timestamp: Utc::now(),
                reason: reason.map(str::to_string),
                success: true,
            };
            state.enter(target);
            state.record(transition.clone());
            transition
        };

        info!(
            "Connection state {} -> {}{}",
            transition.from,
            transition.to,
            transition
                .reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        self.notify(target);
        Ok(transition)
    }

    /// Move to `target` regardless of the table
    ///
    /// Reserved for conditions the machine cannot observe itself, such as a
    /// silently dropped socket. The recorded reason carries the `FORCED:` prefix.
    pub fn force_state(&self, target: ConnectionState, reason: Option<&str>) -> StateTransition {
        let transition = {
            let mut state = lock(&self.state);
            let transition = StateTransition {
                from: state.current,
                to: target,
                timestamp: Utc::now(),
                reason: Some(match reason {
                    Some(reason) => format!("{} {}", FORCED_REASON_PREFIX, reason),
                    None => FORCED_REASON_PREFIX.to_string(),
                }),
                success: true,
            };
            state.enter(target);
            state.record(transition.clone());
            transition
        };

        warn!(
            "Forced connection state {} -> {}",
            transition.from, transition.to
        );
        self.notify(target);
        transition
    }

    /// Record a failed attempt
    pub fn set_last_error(&self, error: ConnectionError) {
        let mut state = lock(&self.state);
        state.retry_count += 1;
        debug!(
            "Connection error recorded (attempt {}): {}",
            state.retry_count, error
        );
        state.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        lock(&self.state).last_error.clone()
    }

    pub fn retry_count(&self) -> u32 {
        lock(&self.state).retry_count
    }

    pub fn reset_retry_count(&self) {
        lock(&self.state).retry_count = 0;
    }

    /// Whether another connection attempt may be started
    pub fn can_retry(&self) -> bool {
        let state = lock(&self.state);
        match state.current {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            ConnectionState::Disconnected | ConnectionState::Expired => {
                state.retry_count <= MAX_RETRY_ATTEMPTS
            }
        }
    }

    /// Time spent in `Connected` exceeds `threshold`; always false elsewhere
    pub fn is_idle_too_long(&self, threshold: Duration) -> bool {
        let state = lock(&self.state);
        match (state.current, state.connected_since) {
            (ConnectionState::Connected, Some(since)) => since.elapsed() > threshold,
            _ => false,
        }
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.observers);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.observers.push((id, Arc::new(callback)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Remove an observer by id. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.observers).remove(id)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).observers.len()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn diagnostics(&self) -> StateMachineDiagnostics {
        let observer_count = self.observer_count();
        let state = lock(&self.state);
        StateMachineDiagnostics {
            current_state: state.current,
            state_entered_at: state.entered_at,
            retry_count: state.retry_count,
            observer_count,
            history_length: state.history.len(),
            last_error: state.last_error.clone(),
            valid_transitions: state.current.valid_targets().to_vec(),
        }
    }

    fn notify(&self, new_state: ConnectionState) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let observers: Vec<(SubscriptionId, StateCallback)> = lock(&self.observers)
            .observers
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        for (id, callback) in observers {
            if catch_unwind(AssertUnwindSafe(|| callback(new_state))).is_err() {
                warn!("State observer {:?} panicked while handling {}", id, new_state);
            }
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
