//! Inbound Dispatch
//!
//! Reads the receive side of the session stream and routes every directive
//! to the handler for its payload. Handlers run on their own tasks so a
//! slow handler never holds up the next read.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::protocol::{
    server_message::Payload, Acknowledgment, Command, ConfigUpdate, ScalingIntent, ServerMessage,
};
use crate::connection::transport::InboundStream;
use crate::error::SessionError;

/// Applies scaling intents decided by the control plane
#[async_trait]
pub trait ScalingIntentHandler: Send + Sync {
    async fn handle_scaling_intent(&self, intent: ScalingIntent) -> Result<()>;
}

/// Applies configuration pushed by the control plane
#[async_trait]
pub trait ConfigUpdateHandler: Send + Sync {
    async fn apply_config_update(&self, update: ConfigUpdate) -> Result<()>;
}

/// Executes operational commands
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute_command(&self, command: Command) -> Result<()>;
}

/// Observes acknowledgements of messages this agent sent. Called inline on
/// the receive loop, so implementations must not block.
pub trait AckObserver: Send + Sync {
    fn on_ack(&self, ack: &Acknowledgment);
}

/// Default handler: records the directive in the log and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl ScalingIntentHandler for LoggingHandler {
    async fn handle_scaling_intent(&self, intent: ScalingIntent) -> Result<()> {
        warn!(
            intent_id = %intent.intent_id,
            workload = %format!("{}/{}", intent.workload_namespace, intent.workload_name),
            target_replicas = intent.target_replicas,
            "No scaling handler configured, intent not applied"
        );
        Ok(())
    }
}

#[async_trait]
impl ConfigUpdateHandler for LoggingHandler {
    async fn apply_config_update(&self, update: ConfigUpdate) -> Result<()> {
        warn!(
            config_id = %update.config_id,
            version = %update.version,
            settings = update.settings.len(),
            "No config handler configured, update not applied"
        );
        Ok(())
    }
}

#[async_trait]
impl CommandExecutor for LoggingHandler {
    async fn execute_command(&self, command: Command) -> Result<()> {
        warn!(
            command_id = %command.command_id,
            command_type = ?command.command_type(),
            "No command executor configured, command not executed"
        );
        Ok(())
    }
}

/// The external collaborators directives are routed to
#[derive(Clone)]
pub struct Handlers {
    pub scaling: Arc<dyn ScalingIntentHandler>,
    pub config: Arc<dyn ConfigUpdateHandler>,
    pub commands: Arc<dyn CommandExecutor>,
    pub acks: Option<Arc<dyn AckObserver>>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            scaling: Arc::new(LoggingHandler),
            config: Arc::new(LoggingHandler),
            commands: Arc::new(LoggingHandler),
            acks: None,
        }
    }
}

#[derive(Clone)]
pub struct InboundDispatcher {
    handlers: Handlers,
    /// Process-wide shutdown; in-flight handlers stop when it fires
    shutdown: CancellationToken,
}

impl InboundDispatcher {
    pub fn new(handlers: Handlers, shutdown: CancellationToken) -> Self {
        Self { handlers, shutdown }
    }

    /// Receive until the stream fails or `cancel` fires. Returning an error
    /// means the connection is gone.
    pub async fn run(
        &self,
        mut inbound: InboundStream,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        info!("Listening for server messages");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Dispatcher stopped");
                    return Ok(());
                }
                next = inbound.next() => next,
            };

            match next {
                Some(Ok(message)) => self.dispatch(message),
                Some(Err(status)) => {
                    warn!(code = ?status.code(), error = %status.message(), "Error receiving message");
                    return Err(SessionError::Receive(status.to_string()));
                }
                None => {
                    info!("Server closed the stream");
                    return Err(SessionError::StreamClosed);
                }
            }
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        let message_id = message.message_id;
        match message.payload {
            Some(Payload::Ack(ack)) => {
                debug!(
                    message_id = %ack.message_id,
                    success = ack.success,
                    detail = %ack.message,
                    "Received ack"
                );
                if let Some(observer) = &self.handlers.acks {
                    observer.on_ack(&ack);
                }
            }
            Some(Payload::ScalingIntent(intent)) => {
                info!(message_id = %message_id, intent_id = %intent.intent_id, "Received scaling intent");
                let handler = self.handlers.scaling.clone();
                let intent_id = intent.intent_id.clone();
                self.spawn_handler("scaling_intent", intent_id, async move {
                    handler.handle_scaling_intent(intent).await
                });
            }
            Some(Payload::ConfigUpdate(update)) => {
                info!(message_id = %message_id, config_id = %update.config_id, "Received config update");
                let handler = self.handlers.config.clone();
                let config_id = update.config_id.clone();
                self.spawn_handler("config_update", config_id, async move {
                    handler.apply_config_update(update).await
                });
            }
            Some(Payload::Command(command)) => {
                info!(
                    message_id = %message_id,
                    command_id = %command.command_id,
                    command_type = ?command.command_type(),
                    "Received command"
                );
                let handler = self.handlers.commands.clone();
                let command_id = command.command_id.clone();
                self.spawn_handler("command", command_id, async move {
                    handler.execute_command(command).await
                });
            }
            Some(Payload::Auth(_)) => {
                warn!(message_id = %message_id, "Unexpected auth result on an established session, ignoring");
            }
            None => {
                warn!(message_id = %message_id, "Received unrecognized message type, ignoring");
            }
        }
    }

    fn spawn_handler<F>(&self, kind: &'static str, id: String, work: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(kind, id = %id, "Handler abandoned on shutdown");
                }
                result = work => {
                    if let Err(e) = result {
                        error!(kind, id = %id, error = %e, "Handler failed");
                    }
                }
            }
        });
    }
}
