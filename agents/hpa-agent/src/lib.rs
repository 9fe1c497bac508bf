//! HPA Cluster Agent Library
//!
//! Keeps a single authenticated, bidirectional gRPC session open between a
//! Kubernetes cluster and the HPA control plane. Scaling intents, config
//! updates and commands received on the session are handed to injected
//! handlers; a status heartbeat keeps the session alive.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod error;

// Re-exports for convenience
pub use agent::dispatch::{AckObserver, CommandExecutor, ConfigUpdateHandler, Handlers, ScalingIntentHandler};
pub use agent::identity::AgentIdentity;
pub use agent::state::{ConnectionState, ConnectionStateManager, StateObserver};
pub use agent::supervisor::{ConnectionEvent, ReconnectSupervisor, SupervisorConfig};
pub use cli::config::Config;
pub use connection::protocol::{AgentMessage, MessageFactory, ServerMessage};
pub use connection::transport::{TlsSettings, TransportManager};
pub use error::{ConfigError, ConnectError, HandshakeError, SessionError, SupervisorError};
