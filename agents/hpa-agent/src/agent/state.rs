//! Connection State Management
//!
//! The connection state machine and the current session. Only the reconnect
//! supervisor holds a [`ConnectionStateManager`]; the heartbeat and dispatch
//! workers get a read-only [`StateObserver`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Represents the possible states of the control-plane connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport; waiting to (re)connect
    Disconnected,
    /// Dialing the control plane
    Connecting,
    /// Transport ready, authenticate exchange in flight
    Authenticating,
    /// Session established, heartbeat and dispatch running
    Active,
    /// Shutting down; terminal
    Draining,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Authenticating => write!(f, "Authenticating"),
            ConnectionState::Active => write!(f, "Active"),
            ConnectionState::Draining => write!(f, "Draining"),
        }
    }
}

/// An authenticated session with the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub authenticated: bool,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, established_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            authenticated: true,
            established_at,
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

const MAX_TRANSITIONS: usize = 100;

/// Internal state data
struct StateInner {
    current: ConnectionState,
    session: Option<Session>,
    last_active: Option<DateTime<Utc>>,
    connection_attempts: u32,
    transitions: Vec<StateTransition>,
}

/// Owner of the connection state. Deliberately not `Clone`.
pub struct ConnectionStateManager {
    inner: Arc<RwLock<StateInner>>,
}

impl ConnectionStateManager {
    /// Create a new state manager starting in Disconnected state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                current: ConnectionState::Disconnected,
                session: None,
                last_active: None,
                connection_attempts: 0,
                transitions: Vec::new(),
            })),
        }
    }

    /// Read-only handle for concurrent observers
    pub fn observer(&self) -> StateObserver {
        StateObserver {
            inner: self.inner.clone(),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.read().current
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.read().session.clone()
    }

    /// Number of dial attempts since the last established session
    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Transition to a new state. Returns false if the transition is not
    /// allowed, in which case nothing changes.
    pub fn transition_to(&self, new_state: ConnectionState, reason: Option<String>) -> bool {
        self.apply(new_state, reason, None)
    }

    fn apply(
        &self,
        new_state: ConnectionState,
        reason: Option<String>,
        session: Option<Session>,
    ) -> bool {
        let mut inner = self.inner.write();

        if !is_valid_transition(inner.current, new_state) {
            tracing::warn!(
                from = %inner.current,
                to = %new_state,
                "Rejected invalid connection state transition"
            );
            return false;
        }

        let old_state = inner.current;
        inner.current = new_state;

        match new_state {
            ConnectionState::Connecting => {
                inner.connection_attempts += 1;
            }
            ConnectionState::Active => {
                inner.last_active = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            _ => {}
        }

        // A session only lives while the state is Active.
        if new_state == ConnectionState::Active {
            if session.is_some() {
                inner.session = session;
            }
        } else {
            inner.session = None;
        }

        inner.transitions.push(StateTransition {
            from: old_state,
            to: new_state,
            timestamp: Utc::now(),
            reason: reason.clone(),
        });
        if inner.transitions.len() > MAX_TRANSITIONS {
            inner.transitions.remove(0);
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            reason = reason.as_deref().unwrap_or(""),
            "Connection state transition"
        );

        true
    }

    pub fn set_connecting(&self) -> bool {
        self.transition_to(ConnectionState::Connecting, Some("Dialing control plane".to_string()))
    }

    pub fn set_authenticating(&self) -> bool {
        self.transition_to(ConnectionState::Authenticating, Some("Transport ready".to_string()))
    }

    /// Enter Active with a freshly established session
    pub fn activate(&self, session: Session) -> bool {
        let reason = format!("Session {} established", session.session_id);
        self.apply(ConnectionState::Active, Some(reason), Some(session))
    }

    pub fn set_disconnected(&self, reason: impl Into<String>) -> bool {
        self.transition_to(ConnectionState::Disconnected, Some(reason.into()))
    }

    pub fn set_draining(&self) -> bool {
        self.transition_to(ConnectionState::Draining, Some("Shutdown requested".to_string()))
    }

    /// Get recent state transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    if from == Draining {
        return false;
    }
    if from == to || to == Draining {
        return true;
    }

    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Connecting, Disconnected)
            | (Authenticating, Active)
            | (Authenticating, Disconnected)
            | (Active, Disconnected)
    )
}

/// Read-only view of the connection state, safe to share across tasks
#[derive(Clone)]
pub struct StateObserver {
    inner: Arc<RwLock<StateInner>>,
}

impl StateObserver {
    pub fn current_state(&self) -> ConnectionState {
        self.inner.read().current
    }

    pub fn is_active(&self) -> bool {
        self.current_state() == ConnectionState::Active
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session.as_ref().map(|s| s.session_id.clone())
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_active
    }
}
