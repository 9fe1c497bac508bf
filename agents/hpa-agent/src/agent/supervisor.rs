//! Reconnect Supervisor
//!
//! Drives the connection lifecycle:
//! Disconnected -> Connecting -> Authenticating -> Active -> Disconnected,
//! with Draining reachable from anywhere on shutdown. Owns the state
//! manager, the backoff delay and the transport; the session workers only
//! report back through their task results.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::backoff::BackoffPolicy;
use crate::agent::dispatch::{Handlers, InboundDispatcher};
use crate::agent::heartbeat::{HeartbeatScheduler, DEFAULT_HEARTBEAT_INTERVAL};
use crate::agent::state::{ConnectionState, ConnectionStateManager, Session, StateObserver};
use crate::connection::handshake::SessionHandshake;
use crate::connection::protocol::MessageFactory;
use crate::connection::transport::{Connector, SessionStream, Transport};
use crate::error::{HandshakeError, SessionError, SupervisorError};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A retry is scheduled after `delay`; `attempt` counts consecutive failures
    Reconnecting { attempt: u32, delay: Duration },
    SessionEstablished { session_id: String },
    SessionLost { reason: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    /// None waits for the auth result until shutdown
    pub handshake_timeout: Option<Duration>,
    /// Consecutive rejections before giving up; 0 retries forever
    pub max_auth_rejections: u32,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
            handshake_timeout: None,
            max_auth_rejections: 0,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// How an active session ended
enum SessionEnd {
    Lost(String),
    Shutdown,
}

pub struct ReconnectSupervisor<C: Connector> {
    connector: C,
    factory: MessageFactory,
    handlers: Handlers,
    config: SupervisorConfig,
    state: ConnectionStateManager,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl<C: Connector> ReconnectSupervisor<C> {
    /// Create a new supervisor in Disconnected state
    pub fn new(
        connector: C,
        factory: MessageFactory,
        handlers: Handlers,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            connector,
            factory,
            handlers,
            config,
            state: ConnectionStateManager::new(),
            events: None,
        }
    }

    /// Publish lifecycle events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn observer(&self) -> StateObserver {
        self.state.observer()
    }

    /// Keep a session up until `shutdown` fires. Only returns an error when
    /// the auth-rejection cap is reached.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let mut delay = self.config.backoff.reset();
        let mut failures: u32 = 0;
        let mut rejections: u32 = 0;

        info!(
            endpoint = %self.connector.endpoint(),
            cluster_id = %self.factory.identity().cluster_id,
            "Starting connection supervisor"
        );

        while !shutdown.is_cancelled() {
            self.enter(ConnectionState::Connecting, None);
            debug!(
                endpoint = %self.connector.endpoint(),
                attempt = self.state.connection_attempts(),
                "Dialing control plane"
            );

            let dialed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                dialed = self.connector.connect() => dialed,
            };
            let mut transport = match dialed {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(endpoint = %self.connector.endpoint(), error = %e, "Connection failed");
                    self.enter(ConnectionState::Disconnected, Some(e.to_string()));
                    failures += 1;
                    if !self.sleep_backoff(&mut delay, failures, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.enter(ConnectionState::Authenticating, None);
            let handshake = SessionHandshake::new(self.factory.clone())
                .with_timeout(self.config.handshake_timeout);
            let established = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = establish(transport.as_mut(), &handshake) => Some(result),
            };

            let (stream, session) = match established {
                None => {
                    transport.close();
                    break;
                }
                Some(Ok(established)) => established,
                Some(Err(e)) => {
                    transport.close();
                    warn!(error = %e, "Handshake failed");
                    self.enter(ConnectionState::Disconnected, Some(e.to_string()));

                    if let Some(reason) = e.rejection_reason() {
                        rejections += 1;
                        let cap = self.config.max_auth_rejections;
                        if cap > 0 && rejections >= cap {
                            error!(attempts = rejections, reason = %reason, "Giving up after repeated authentication rejections");
                            self.drain();
                            return Err(SupervisorError::AuthenticationExhausted {
                                attempts: rejections,
                                reason: reason.to_string(),
                            });
                        }
                    }

                    failures += 1;
                    if !self.sleep_backoff(&mut delay, failures, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            delay = self.config.backoff.reset();
            failures = 0;
            rejections = 0;
            let session_id = session.session_id.clone();
            self.activate(session);
            self.emit(ConnectionEvent::SessionEstablished {
                session_id: session_id.clone(),
            });
            info!(session_id = %session_id, "Connection established");

            let end = self.run_session(stream, &shutdown).await;
            transport.close();
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    warn!(session_id = %session_id, reason = %reason, "Connection lost");
                    self.enter(ConnectionState::Disconnected, Some(reason.clone()));
                    self.emit(ConnectionEvent::SessionLost { reason });
                    failures += 1;
                    if !self.sleep_backoff(&mut delay, failures, &shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain();
        info!("Connection supervisor stopped");
        Ok(())
    }

    /// Run heartbeat and dispatcher until one of them fails or shutdown
    async fn run_session(&self, stream: SessionStream, shutdown: &CancellationToken) -> SessionEnd {
        let (outbound, inbound) = stream.into_parts();
        let heartbeat_cancel = shutdown.child_token();
        // Not a child of shutdown: on shutdown the dispatcher keeps reading
        // until the server closes or the grace period runs out.
        let dispatch_cancel = CancellationToken::new();

        let heartbeat = HeartbeatScheduler::new(
            self.config.heartbeat_interval,
            self.factory.clone(),
            self.state.observer(),
        );
        let dispatcher = InboundDispatcher::new(self.handlers.clone(), shutdown.clone());

        let mut workers: JoinSet<(&'static str, Result<(), SessionError>)> = JoinSet::new();
        {
            let cancel = heartbeat_cancel.clone();
            workers.spawn(async move { ("heartbeat", heartbeat.run(outbound, cancel).await) });
        }
        {
            let cancel = dispatch_cancel.clone();
            workers.spawn(async move { ("dispatcher", dispatcher.run(inbound, cancel).await) });
        }

        let end = tokio::select! {
            biased;
            _ = shutdown.cancelled() => SessionEnd::Shutdown,
            joined = workers.join_next() => SessionEnd::Lost(match joined {
                Some(Ok((worker, Err(e)))) => format!("{}: {}", worker, e),
                Some(Ok((worker, Ok(())))) => format!("{} stopped", worker),
                Some(Err(e)) => format!("worker task failed: {}", e),
                None => "no workers running".to_string(),
            }),
        };

        if let SessionEnd::Shutdown = end {
            self.drain();
            // Dropping the heartbeat's sender half-closes the request stream.
            heartbeat_cancel.cancel();
            let grace = self.config.shutdown_grace;
            if tokio::time::timeout(grace, join_all(&mut workers)).await.is_err() {
                debug!(grace = ?grace, "Server did not close the stream in time");
            }
        }

        heartbeat_cancel.cancel();
        dispatch_cancel.cancel();
        if tokio::time::timeout(self.config.shutdown_grace, join_all(&mut workers))
            .await
            .is_err()
        {
            warn!("Session workers did not stop in time, aborting");
            workers.abort_all();
        }
        end
    }

    async fn sleep_backoff(
        &self,
        delay: &mut Duration,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> bool {
        info!(delay = ?*delay, attempt, "Reconnecting after backoff");
        self.emit(ConnectionEvent::Reconnecting {
            attempt,
            delay: *delay,
        });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(*delay) => {}
        }
        *delay = self.config.backoff.next(*delay);
        true
    }

    fn enter(&self, state: ConnectionState, reason: Option<String>) {
        let changed = match state {
            ConnectionState::Connecting => self.state.set_connecting(),
            ConnectionState::Authenticating => self.state.set_authenticating(),
            ConnectionState::Disconnected => self
                .state
                .set_disconnected(reason.unwrap_or_else(|| "Disconnected".to_string())),
            ConnectionState::Draining => self.state.set_draining(),
            ConnectionState::Active => self.state.transition_to(state, reason),
        };
        if changed {
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn activate(&self, session: Session) {
        if self.state.activate(session) {
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Active));
        }
    }

    /// Enter the terminal state once
    fn drain(&self) {
        if self.state.current_state() != ConnectionState::Draining {
            self.enter(ConnectionState::Draining, None);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn establish(
    transport: &mut dyn Transport,
    handshake: &SessionHandshake,
) -> Result<(SessionStream, Session), HandshakeError> {
    let mut stream = transport.open_stream().await?;
    let session = handshake.perform(&mut stream).await?;
    Ok((stream, session))
}

async fn join_all<T: 'static>(workers: &mut JoinSet<T>) {
    while workers.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::dispatch::AckObserver;
    use crate::connection::protocol::test_support::{factory, server_message};
    use crate::connection::protocol::{
        agent_message, server_message::Payload, Acknowledgment, AuthResponse, ServerMessage,
    };
    use crate::connection::transport::testing::{Dial, ScriptedConnector, ServerEnd};
    use crate::error::ConnectError;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn auth_result(authenticated: bool, session_id: &str, message: &str) -> ServerMessage {
        server_message(
            "srv-auth",
            Payload::Auth(AuthResponse {
                authenticated,
                session_id: session_id.to_string(),
                message: message.to_string(),
            }),
        )
    }

    /// Read the auth frame and answer it
    async fn answer_auth(server: &mut ServerEnd, reply: ServerMessage) {
        let auth = server.from_agent.recv().await.unwrap();
        assert!(matches!(auth.payload, Some(agent_message::Payload::Auth(_))));
        server.to_agent.send(Ok(reply)).await.unwrap();
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, mut pred: F) -> Vec<ConnectionEvent>
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event stream ended, saw {:?}", seen);
    }

    fn delays(events: &[ConnectionEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Reconnecting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_resets_after_session() {
        let (servers_tx, mut servers) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(vec![
            Dial::Fail,
            Dial::Fail,
            Dial::Fail,
            Dial::Serve(servers_tx),
        ]);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(connector, factory(), Handlers::default(), SupervisorConfig::default())
                .with_events(events_tx);
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let mut server = servers.recv().await.unwrap();
        answer_auth(&mut server, auth_result(true, "s-1", "ok")).await;
        let before = wait_for(&mut events, |e| {
            matches!(e, ConnectionEvent::SessionEstablished { .. })
        })
        .await;
        assert_eq!(
            delays(&before),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );

        // Server goes away; the next delay starts from the floor again.
        drop(server);
        let after = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
        assert!(after
            .iter()
            .any(|e| matches!(e, ConnectionEvent::SessionLost { .. })));
        assert_eq!(
            after.last(),
            Some(&ConnectionEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_acknowledged_end_to_end() {
        struct Acks(mpsc::UnboundedSender<Acknowledgment>);
        impl AckObserver for Acks {
            fn on_ack(&self, ack: &Acknowledgment) {
                let _ = self.0.send(ack.clone());
            }
        }

        let (servers_tx, mut servers) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(vec![Dial::Serve(servers_tx)]);
        let closes = connector.closes.clone();
        let (acks_tx, mut acks) = mpsc::unbounded_channel();
        let handlers = Handlers {
            acks: Some(Arc::new(Acks(acks_tx))),
            ..Handlers::default()
        };
        let shutdown = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(connector, factory(), handlers, SupervisorConfig::default());
        let observer = supervisor.observer();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let mut server = servers.recv().await.unwrap();
        answer_auth(&mut server, auth_result(true, "s-1", "Authentication successful")).await;

        let status = server.from_agent.recv().await.unwrap();
        assert!(matches!(status.payload, Some(agent_message::Payload::Status(_))));
        assert!(observer.is_active());
        assert_eq!(observer.session_id().as_deref(), Some("s-1"));

        let reply = Acknowledgment {
            message_id: status.message_id.clone(),
            success: true,
            message: "Status received".to_string(),
        };
        server
            .to_agent
            .send(Ok(server_message("srv-ack", Payload::Ack(reply))))
            .await
            .unwrap();
        let ack = acks.recv().await.unwrap();
        assert_eq!(ack.message_id, status.message_id);
        assert!(ack.success);

        // Graceful close: the request stream is half-closed, then the
        // server finishes its side.
        shutdown.cancel();
        assert!(server.from_agent.recv().await.is_none());
        drop(server.to_agent);

        handle.await.unwrap().unwrap();
        assert_eq!(observer.current_state(), ConnectionState::Draining);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_cap_is_fatal() {
        let (servers_tx, mut servers) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(vec![
            Dial::Serve(servers_tx.clone()),
            Dial::Serve(servers_tx),
        ]);
        let closes = connector.closes.clone();
        let config = SupervisorConfig {
            max_auth_rejections: 2,
            ..SupervisorConfig::default()
        };
        let supervisor = ReconnectSupervisor::new(connector, factory(), Handlers::default(), config);
        let handle = tokio::spawn(supervisor.run(CancellationToken::new()));

        for _ in 0..2 {
            let mut server = servers.recv().await.unwrap();
            answer_auth(&mut server, auth_result(false, "", "bad token")).await;
        }

        match handle.await.unwrap() {
            Err(SupervisorError::AuthenticationExhausted { attempts, reason }) => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, "bad token");
            }
            other => panic!("Expected AuthenticationExhausted, got {:?}", other),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_retried_by_default() {
        let (servers_tx, mut servers) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(vec![
            Dial::Serve(servers_tx.clone()),
            Dial::Serve(servers_tx),
        ]);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(connector, factory(), Handlers::default(), SupervisorConfig::default())
                .with_events(events_tx);
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let mut first = servers.recv().await.unwrap();
        answer_auth(&mut first, auth_result(false, "", "bad token")).await;
        let mut second = servers.recv().await.unwrap();
        answer_auth(&mut second, auth_result(true, "s-2", "ok")).await;

        let seen = wait_for(&mut events, |e| {
            matches!(e, ConnectionEvent::SessionEstablished { .. })
        })
        .await;
        assert_eq!(delays(&seen), vec![Duration::from_secs(1)]);

        shutdown.cancel();
        drop(second);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let connector = ScriptedConnector::new(vec![]);
        let dials = connector.dials.clone();
        let shutdown = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(connector, factory(), Handlers::default(), SupervisorConfig::default());
        let observer = supervisor.observer();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(observer.current_state(), ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_dial() {
        struct HangingConnector;

        #[async_trait]
        impl Connector for HangingConnector {
            async fn connect(&self) -> Result<Box<dyn Transport>, ConnectError> {
                std::future::pending().await
            }

            fn endpoint(&self) -> &str {
                "hanging"
            }
        }

        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            HangingConnector,
            factory(),
            Handlers::default(),
            SupervisorConfig::default(),
        );
        let observer = supervisor.observer();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(observer.current_state(), ConnectionState::Connecting);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(observer.current_state(), ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_handshake_closes_transport() {
        let (servers_tx, mut servers) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(vec![Dial::Serve(servers_tx)]);
        let closes = connector.closes.clone();
        let shutdown = CancellationToken::new();
        let supervisor =
            ReconnectSupervisor::new(connector, factory(), Handlers::default(), SupervisorConfig::default());
        let observer = supervisor.observer();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let _server = servers.recv().await.unwrap();
        assert_eq!(observer.current_state(), ConnectionState::Authenticating);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
