//! Heartbeat Scheduler
//!
//! Emits a status message on a fixed interval while the session is active.
//! This is the only writer on the stream once the handshake is done.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::agent::state::StateObserver;
use crate::connection::protocol::{AgentMessage, MessageFactory};
use crate::error::SessionError;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct HeartbeatScheduler {
    interval: Duration,
    factory: MessageFactory,
    state: StateObserver,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration, factory: MessageFactory, state: StateObserver) -> Self {
        Self {
            interval,
            factory,
            state,
        }
    }

    /// Run until cancelled (`Ok`) or until a send fails (`Err`). A failed
    /// send is never retried here; the supervisor tears the session down.
    pub async fn run(
        self,
        outbound: mpsc::Sender<AgentMessage>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sent, "Heartbeat stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if !self.state.is_active() {
                        trace!(state = %self.state.current_state(), "No active session, skipping heartbeat");
                        continue;
                    }

                    let message = self.factory.operational_status();
                    let message_id = message.message_id.clone();
                    // A full channel must not hold off cancellation.
                    let delivered = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(sent, "Heartbeat stopped");
                            return Ok(());
                        }
                        result = outbound.send(message) => result.is_ok(),
                    };
                    if !delivered {
                        warn!(message_id = %message_id, "Heartbeat failed: stream closed");
                        return Err(SessionError::Send("heartbeat"));
                    }
                    sent += 1;
                    debug!(
                        message_id = %message_id,
                        session_id = self.state.session_id().as_deref().unwrap_or(""),
                        "Heartbeat sent"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::{ConnectionStateManager, Session};
    use crate::connection::protocol::agent_message::Payload;
    use crate::connection::protocol::test_support::factory;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn active_state() -> ConnectionStateManager {
        let state = ConnectionStateManager::new();
        state.set_connecting();
        state.set_authenticating();
        state.activate(Session::new("s-1", chrono::Utc::now()));
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_status_while_not_active() {
        let state = ConnectionStateManager::new();
        state.set_connecting();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let scheduler = HeartbeatScheduler::new(INTERVAL, factory(), state.observer());
        let handle = tokio::spawn(scheduler.run(tx, cancel.clone()));

        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_status_each_tick_while_active() {
        let state = active_state();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let scheduler = HeartbeatScheduler::new(INTERVAL, factory(), state.observer());
        let handle = tokio::spawn(scheduler.run(tx, cancel.clone()));

        // Nothing before the first interval has elapsed.
        tokio::time::sleep(INTERVAL / 2).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(INTERVAL * 2).await;
        let mut ids = Vec::new();
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message.payload, Some(Payload::Status(_))));
            ids.push(message.message_id);
        }
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_terminates_loop() {
        let state = active_state();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let scheduler = HeartbeatScheduler::new(INTERVAL, factory(), state.observer());
        let result = scheduler.run(tx, CancellationToken::new()).await;
        assert_eq!(result, Err(SessionError::Send("heartbeat")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_outbound_is_full() {
        let state = active_state();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(factory().operational_status()).unwrap();
        let cancel = CancellationToken::new();

        let scheduler = HeartbeatScheduler::new(INTERVAL, factory(), state.observer());
        let handle = tokio::spawn(scheduler.run(tx, cancel.clone()));

        // The first tick blocks on the full channel.
        tokio::time::sleep(INTERVAL * 2).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(result.unwrap().unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_when_session_becomes_active() {
        let state = ConnectionStateManager::new();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let scheduler = HeartbeatScheduler::new(INTERVAL, factory(), state.observer());
        let handle = tokio::spawn(scheduler.run(tx, cancel.clone()));

        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;
        assert!(rx.try_recv().is_err());

        state.set_connecting();
        state.set_authenticating();
        state.activate(Session::new("s-2", chrono::Utc::now()));

        tokio::time::sleep(INTERVAL).await;
        assert!(rx.try_recv().is_ok());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
