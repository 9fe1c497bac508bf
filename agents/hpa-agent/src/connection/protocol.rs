//! Message Protocol
//!
//! Protobuf messages exchanged with the control plane over the
//! `agent.v1.AgentService/Connect` stream. The schema is owned by the
//! control plane; these definitions mirror it field-for-field.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::agent::identity::AgentIdentity;

/// Messages sent from the agent to the control plane
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentMessage {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(oneof = "agent_message::Payload", tags = "10, 11, 12, 13")]
    pub payload: Option<agent_message::Payload>,
}

pub mod agent_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Agent authentication, always the first frame on a stream
        #[prost(message, tag = "10")]
        Auth(super::AuthRequest),
        /// Heartbeat / cluster status
        #[prost(message, tag = "11")]
        Status(super::StatusUpdate),
        #[prost(message, tag = "12")]
        Metrics(super::MetricsReport),
        #[prost(message, tag = "13")]
        Events(super::EventReport),
    }
}

/// Messages sent from the control plane to the agent
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    /// `None` when the server sent a payload this agent does not know
    #[prost(oneof = "server_message::Payload", tags = "10, 11, 12, 13, 14")]
    pub payload: Option<server_message::Payload>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Auth(super::AuthResponse),
        #[prost(message, tag = "11")]
        Ack(super::Acknowledgment),
        #[prost(message, tag = "12")]
        ScalingIntent(super::ScalingIntent),
        #[prost(message, tag = "13")]
        ConfigUpdate(super::ConfigUpdate),
        #[prost(message, tag = "14")]
        Command(super::Command),
    }

    impl Payload {
        /// Short name of the variant, for logs and protocol errors
        pub fn kind(&self) -> &'static str {
            match self {
                Payload::Auth(_) => "auth_result",
                Payload::Ack(_) => "ack",
                Payload::ScalingIntent(_) => "scaling_intent",
                Payload::ConfigUpdate(_) => "config_update",
                Payload::Command(_) => "command",
            }
        }
    }
}

// Agent Message Payloads

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub agent_token: String,
    #[prost(string, tag = "3")]
    pub agent_version: String,
    #[prost(message, optional, tag = "4")]
    pub cluster_info: Option<ClusterInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterInfo {
    #[prost(string, tag = "1")]
    pub kubernetes_version: String,
    #[prost(string, tag = "2")]
    pub provider: String,
    #[prost(string, tag = "3")]
    pub region: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusUpdate {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(enumeration = "ClusterStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(message, optional, tag = "4")]
    pub health: Option<ClusterHealth>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClusterStatus {
    Unspecified = 0,
    Healthy = 1,
    Degraded = 2,
    Unhealthy = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterHealth {
    #[prost(bool, tag = "1")]
    pub api_server_healthy: bool,
    #[prost(bool, tag = "2")]
    pub etcd_healthy: bool,
    #[prost(bool, tag = "3")]
    pub controller_manager_healthy: bool,
    #[prost(bool, tag = "4")]
    pub scheduler_healthy: bool,
    #[prost(message, optional, tag = "5")]
    pub last_check: Option<prost_types::Timestamp>,
    #[prost(message, repeated, tag = "6")]
    pub component_health: Vec<HealthCheck>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheck {
    #[prost(string, tag = "1")]
    pub component: String,
    #[prost(bool, tag = "2")]
    pub healthy: bool,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(message, optional, tag = "4")]
    pub timestamp: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricsReport {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(message, repeated, tag = "3")]
    pub workload_metrics: Vec<WorkloadMetrics>,
    #[prost(message, optional, tag = "4")]
    pub cluster_metrics: Option<ClusterMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkloadMetrics {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(message, optional, tag = "4")]
    pub usage: Option<ResourceUsage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceUsage {
    #[prost(double, tag = "1")]
    pub cpu_percentage: f64,
    #[prost(double, tag = "2")]
    pub memory_percentage: f64,
    #[prost(double, tag = "3")]
    pub storage_percentage: f64,
    #[prost(int32, tag = "4")]
    pub pods_running: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterMetrics {
    #[prost(message, optional, tag = "1")]
    pub overall_usage: Option<ResourceUsage>,
    #[prost(int32, tag = "2")]
    pub total_nodes: i32,
    #[prost(int32, tag = "3")]
    pub ready_nodes: i32,
    #[prost(int32, tag = "4")]
    pub total_pods: i32,
    #[prost(int32, tag = "5")]
    pub running_pods: i32,
    #[prost(map = "string, double", tag = "6")]
    pub custom_metrics: HashMap<String, f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventReport {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(message, repeated, tag = "2")]
    pub events: Vec<KubernetesEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KubernetesEvent {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(string, tag = "4")]
    pub r#type: String,
    #[prost(string, tag = "5")]
    pub reason: String,
    #[prost(string, tag = "6")]
    pub message: String,
    #[prost(message, optional, tag = "7")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "8")]
    pub source_component: String,
    #[prost(map = "string, string", tag = "9")]
    pub labels: HashMap<String, String>,
}

// Control Plane Message Payloads

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthResponse {
    #[prost(bool, tag = "1")]
    pub authenticated: bool,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acknowledgment {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScalingIntent {
    #[prost(string, tag = "1")]
    pub intent_id: String,
    #[prost(string, tag = "2")]
    pub workload_namespace: String,
    #[prost(string, tag = "3")]
    pub workload_name: String,
    #[prost(string, tag = "4")]
    pub workload_type: String,
    #[prost(int32, tag = "5")]
    pub target_replicas: i32,
    #[prost(string, tag = "6")]
    pub reason: String,
    #[prost(message, optional, tag = "7")]
    pub strategy: Option<ScalingStrategy>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScalingStrategy {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(int32, tag = "2")]
    pub max_surge: i32,
    #[prost(int32, tag = "3")]
    pub max_unavailable: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigUpdate {
    #[prost(string, tag = "1")]
    pub config_id: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(map = "string, string", tag = "3")]
    pub settings: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(enumeration = "CommandType", tag = "2")]
    pub r#type: i32,
    #[prost(map = "string, string", tag = "3")]
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandType {
    Unspecified = 0,
    RestartAgent = 1,
    CollectDiagnostics = 2,
    RefreshMetrics = 3,
    SyncState = 4,
}

impl Command {
    /// Decoded command type; unknown values map to `Unspecified`
    pub fn command_type(&self) -> CommandType {
        CommandType::try_from(self.r#type).unwrap_or(CommandType::Unspecified)
    }
}

// Cluster registration (unary RPC)

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterClusterRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub tenant_id: String,
    #[prost(string, tag = "3")]
    pub region: String,
    #[prost(string, tag = "4")]
    pub provider: String,
    #[prost(map = "string, string", tag = "5")]
    pub labels: HashMap<String, String>,
    #[prost(message, optional, tag = "6")]
    pub cluster_info: Option<ClusterInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterClusterResponse {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub agent_token: String,
}

/// Convert a wall-clock time into a protobuf timestamp
pub fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// Source of wall-clock time for message timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Generates message ids, unique within one agent process
pub trait MessageIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Counter-based ids prefixed with the process start time, e.g.
/// `msg-1718000000000000000-42`
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Ids prefixed with the current time in nanoseconds
    pub fn from_clock(clock: &dyn Clock) -> Self {
        let nanos = clock.now().timestamp_nanos_opt().unwrap_or_default();
        Self::new(format!("msg-{}", nanos))
    }
}

impl MessageIdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, seq)
    }
}

/// Builds outbound messages stamped with a fresh id and timestamp
#[derive(Clone)]
pub struct MessageFactory {
    identity: Arc<AgentIdentity>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn MessageIdGenerator>,
}

impl MessageFactory {
    pub fn new(
        identity: Arc<AgentIdentity>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn MessageIdGenerator>,
    ) -> Self {
        Self {
            identity,
            clock,
            ids,
        }
    }

    /// Factory using the system clock and time-prefixed sequential ids
    pub fn system(identity: Arc<AgentIdentity>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids = Arc::new(SequentialIds::from_clock(clock.as_ref()));
        Self::new(identity, clock, ids)
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn envelope(&self, payload: agent_message::Payload) -> AgentMessage {
        AgentMessage {
            message_id: self.ids.next_id(),
            timestamp: Some(to_timestamp(self.clock.now())),
            payload: Some(payload),
        }
    }

    /// Create the authentication message sent at the start of every stream
    pub fn auth(&self) -> AgentMessage {
        let identity = &self.identity;
        self.envelope(agent_message::Payload::Auth(AuthRequest {
            cluster_id: identity.cluster_id.clone(),
            agent_token: identity.token.clone(),
            agent_version: identity.agent_version.clone(),
            cluster_info: Some(identity.cluster_info()),
        }))
    }

    /// Create a heartbeat status message
    pub fn status(&self, status: ClusterStatus, message: &str, health: ClusterHealth) -> AgentMessage {
        self.envelope(agent_message::Payload::Status(StatusUpdate {
            cluster_id: self.identity.cluster_id.clone(),
            status: status as i32,
            message: message.to_string(),
            health: Some(health),
        }))
    }

    /// Status for an agent that is up and able to reach its cluster
    pub fn operational_status(&self) -> AgentMessage {
        let health = ClusterHealth {
            api_server_healthy: true,
            etcd_healthy: true,
            controller_manager_healthy: true,
            scheduler_healthy: true,
            last_check: Some(to_timestamp(self.clock.now())),
            component_health: Vec::new(),
        };
        self.status(ClusterStatus::Healthy, "Agent operational", health)
    }

    pub fn metrics(
        &self,
        workload_metrics: Vec<WorkloadMetrics>,
        cluster_metrics: Option<ClusterMetrics>,
    ) -> AgentMessage {
        self.envelope(agent_message::Payload::Metrics(MetricsReport {
            cluster_id: self.identity.cluster_id.clone(),
            timestamp: Some(to_timestamp(self.clock.now())),
            workload_metrics,
            cluster_metrics,
        }))
    }

    pub fn events(&self, events: Vec<KubernetesEvent>) -> AgentMessage {
        self.envelope(agent_message::Payload::Events(EventReport {
            cluster_id: self.identity.cluster_id.clone(),
            events,
        }))
    }
}
