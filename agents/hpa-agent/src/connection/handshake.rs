//! Session Handshake
//!
//! Upgrades a freshly opened stream into an authenticated session: one
//! auth frame out, one auth result back. Nothing else may be sent on the
//! stream until this completes.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::agent::state::Session;
use crate::connection::protocol::{server_message::Payload, MessageFactory, ServerMessage};
use crate::connection::transport::SessionStream;
use crate::error::HandshakeError;

pub struct SessionHandshake {
    factory: MessageFactory,
    timeout: Option<Duration>,
}

impl SessionHandshake {
    pub fn new(factory: MessageFactory) -> Self {
        Self {
            factory,
            timeout: None,
        }
    }

    /// Bound the wait for the auth result. Without this the wait is only
    /// bounded by the caller's cancellation.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn perform(&self, stream: &mut SessionStream) -> Result<Session, HandshakeError> {
        let identity = self.factory.identity();
        let auth = self.factory.auth();
        debug!(
            message_id = %auth.message_id,
            cluster_id = %identity.cluster_id,
            token = %identity.token_fingerprint(),
            "Sending authentication"
        );
        stream
            .outbound()
            .send(auth)
            .await
            .map_err(|_| HandshakeError::Send)?;

        let first = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, stream.inbound_mut().next())
                .await
                .map_err(|_| HandshakeError::Timeout(limit))?,
            None => stream.inbound_mut().next().await,
        };

        match first {
            None => Err(HandshakeError::StreamClosed),
            Some(Err(status)) => Err(HandshakeError::Receive(status.to_string())),
            Some(Ok(message)) => self.accept(message),
        }
    }

    fn accept(&self, message: ServerMessage) -> Result<Session, HandshakeError> {
        match message.payload {
            Some(Payload::Auth(result)) if result.authenticated => {
                info!(session_id = %result.session_id, "Authentication successful");
                Ok(Session::new(result.session_id, self.factory.now()))
            }
            Some(Payload::Auth(result)) => {
                warn!(reason = %result.message, "Authentication rejected");
                Err(HandshakeError::AuthenticationRejected(result.message))
            }
            Some(other) => Err(HandshakeError::ProtocolViolation(other.kind())),
            None => Err(HandshakeError::ProtocolViolation("unknown payload")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::protocol::test_support::{factory, server_message};
    use crate::connection::protocol::{agent_message, AuthResponse, Command, CommandType};
    use crate::connection::transport::testing::stream_pair;

    fn auth_result(authenticated: bool, session_id: &str, message: &str) -> ServerMessage {
        server_message(
            "srv-1",
            Payload::Auth(AuthResponse {
                authenticated,
                session_id: session_id.to_string(),
                message: message.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let (mut stream, mut server) = stream_pair();
        server
            .to_agent
            .send(Ok(auth_result(true, "s-1", "Authentication successful")))
            .await
            .unwrap();

        let session = SessionHandshake::new(factory())
            .perform(&mut stream)
            .await
            .unwrap();
        assert_eq!(session.session_id, "s-1");
        assert!(session.authenticated);

        // Exactly one frame, and it is the auth request.
        let sent = server.from_agent.try_recv().unwrap();
        assert!(matches!(sent.payload, Some(agent_message::Payload::Auth(_))));
        assert!(server.from_agent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejection_carries_server_reason() {
        let (mut stream, server) = stream_pair();
        server
            .to_agent
            .send(Ok(auth_result(false, "", "bad token")))
            .await
            .unwrap();

        let result = SessionHandshake::new(factory()).perform(&mut stream).await;
        match result {
            Err(HandshakeError::AuthenticationRejected(reason)) => assert_eq!(reason, "bad token"),
            other => panic!("Expected AuthenticationRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_auth_first_frame_is_protocol_violation() {
        let (mut stream, server) = stream_pair();
        let command = Command {
            command_id: "c-1".to_string(),
            r#type: CommandType::SyncState as i32,
            parameters: Default::default(),
        };
        server
            .to_agent
            .send(Ok(server_message("srv-1", Payload::Command(command))))
            .await
            .unwrap();

        let result = SessionHandshake::new(factory()).perform(&mut stream).await;
        assert!(matches!(result, Err(HandshakeError::ProtocolViolation("command"))));
    }

    #[tokio::test]
    async fn test_stream_closed_before_reply() {
        let (mut stream, server) = stream_pair();
        drop(server.to_agent);

        let result = SessionHandshake::new(factory()).perform(&mut stream).await;
        assert!(matches!(result, Err(HandshakeError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_receive_error() {
        let (mut stream, server) = stream_pair();
        server
            .to_agent
            .send(Err(tonic::Status::unauthenticated("missing bearer")))
            .await
            .unwrap();

        let result = SessionHandshake::new(factory()).perform(&mut stream).await;
        match result {
            Err(HandshakeError::Receive(reason)) => assert!(reason.contains("missing bearer")),
            other => panic!("Expected Receive error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_timeout() {
        let (mut stream, _server) = stream_pair();

        let result = SessionHandshake::new(factory())
            .with_timeout(Some(Duration::from_secs(5)))
            .perform(&mut stream)
            .await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }
}
