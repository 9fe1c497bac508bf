//! Agent Identity
//!
//! Who this agent is, as presented to the control plane during the
//! handshake. Built once from configuration and shared read-only.

use sha2::{Digest, Sha256};

use crate::connection::protocol::ClusterInfo;

#[derive(Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub cluster_id: String,
    pub tenant_id: String,
    /// Bearer token issued at cluster registration
    pub token: String,
    pub agent_version: String,
    pub kubernetes_version: String,
    pub provider: Option<String>,
    pub region: Option<String>,
}

impl AgentIdentity {
    /// Cluster metadata attached to the auth request
    pub fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo {
            kubernetes_version: self.kubernetes_version.clone(),
            provider: self.provider.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
        }
    }

    /// Short, non-reversible fingerprint of the token, safe to log
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..6])
    }
}

// The token must never end up in logs through a stray `?identity`.
impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("cluster_id", &self.cluster_id)
            .field("tenant_id", &self.tenant_id)
            .field("token", &format_args!("sha256:{}", self.token_fingerprint()))
            .field("agent_version", &self.agent_version)
            .field("kubernetes_version", &self.kubernetes_version)
            .field("provider", &self.provider)
            .field("region", &self.region)
            .finish()
    }
}
