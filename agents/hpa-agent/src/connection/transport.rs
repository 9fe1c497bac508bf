//! Transport Management
//!
//! Dials the control plane and hands out bidirectional streams over the
//! resulting channel. One [`Transport`] lives for exactly one connection
//! attempt; retrying is the supervisor's job.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

use crate::connection::grpc::AgentServiceClient;
use crate::connection::protocol::{AgentMessage, ServerMessage};
use crate::error::{ConnectError, HandshakeError};

/// Outbound frames buffered ahead of the RPC request stream
const OUTBOUND_BUFFER: usize = 64;

/// Keepalive settings for the underlying HTTP/2 connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive side of a session stream
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<ServerMessage, tonic::Status>> + Send>>;

/// Both halves of one bidirectional stream
pub struct SessionStream {
    outbound: mpsc::Sender<AgentMessage>,
    inbound: InboundStream,
}

impl SessionStream {
    pub fn new(outbound: mpsc::Sender<AgentMessage>, inbound: InboundStream) -> Self {
        Self { outbound, inbound }
    }

    pub fn outbound(&self) -> &mpsc::Sender<AgentMessage> {
        &self.outbound
    }

    pub fn inbound_mut(&mut self) -> &mut InboundStream {
        &mut self.inbound
    }

    pub fn into_parts(self) -> (mpsc::Sender<AgentMessage>, InboundStream) {
        (self.outbound, self.inbound)
    }
}

/// How the channel to the control plane is secured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSettings {
    /// Plaintext; only for local development
    Disabled,
    /// TLS verified against the system trust roots
    SystemRoots { server_name: Option<String> },
    /// TLS verified against a specific CA
    ServerVerified {
        ca_file: PathBuf,
        server_name: Option<String>,
    },
    /// Mutual TLS with a client certificate
    Mutual {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
        server_name: Option<String>,
    },
}

impl TlsSettings {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsSettings::Disabled)
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            TlsSettings::Disabled => "insecure",
            TlsSettings::SystemRoots { .. } => "tls-system-roots",
            TlsSettings::ServerVerified { .. } => "tls",
            TlsSettings::Mutual { .. } => "mtls",
        }
    }
}

/// Produces a fresh transport for every connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial and wait until the transport is usable
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectError>;

    /// Endpoint being dialed, for logs
    fn endpoint(&self) -> &str;
}

/// A dialed transport able to open session streams
#[async_trait]
pub trait Transport: Send {
    async fn open_stream(&mut self) -> Result<SessionStream, HandshakeError>;

    /// Release the transport. Safe to call more than once.
    fn close(&mut self);
}

/// Dials the control plane over gRPC
#[derive(Debug, Clone)]
pub struct TransportManager {
    endpoint: String,
    tls: TlsSettings,
    dial_timeout: Duration,
    token: String,
}

impl TransportManager {
    pub fn new(endpoint: &str, tls: TlsSettings, dial_timeout: Duration, token: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint, tls.is_enabled()),
            tls,
            dial_timeout,
            token: token.to_string(),
        }
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    /// Dial a raw channel, bounded by the dial timeout
    pub async fn channel(&self) -> Result<Channel, ConnectError> {
        let endpoint = self.build_endpoint().await?;
        match tokio::time::timeout(self.dial_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(ConnectError::Dial {
                endpoint: self.endpoint.clone(),
                reason: error_chain(&e),
            }),
            Err(_) => Err(ConnectError::ConnectTimeout {
                endpoint: self.endpoint.clone(),
                timeout: self.dial_timeout,
            }),
        }
    }

    /// Build the TLS client config, reading any certificate files
    async fn client_tls_config(&self) -> Result<Option<ClientTlsConfig>, ConnectError> {
        let (config, server_name) = match &self.tls {
            TlsSettings::Disabled => return Ok(None),
            TlsSettings::SystemRoots { server_name } => {
                info!("TLS enabled, using system trust roots");
                (ClientTlsConfig::new(), server_name)
            }
            TlsSettings::ServerVerified {
                ca_file,
                server_name,
            } => {
                info!(ca = %ca_file.display(), "Loading TLS credentials");
                let ca = read_pem(ca_file).await?;
                (
                    ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)),
                    server_name,
                )
            }
            TlsSettings::Mutual {
                ca_file,
                cert_file,
                key_file,
                server_name,
            } => {
                info!(
                    ca = %ca_file.display(),
                    cert = %cert_file.display(),
                    "Loading mTLS credentials"
                );
                let ca = read_pem(ca_file).await?;
                let cert = read_pem(cert_file).await?;
                let key = read_pem(key_file).await?;
                (
                    ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(ca))
                        .identity(Identity::from_pem(cert, key)),
                    server_name,
                )
            }
        };

        Ok(Some(match server_name {
            Some(name) => config.domain_name(name.clone()),
            None => config,
        }))
    }

    async fn build_endpoint(&self) -> Result<Endpoint, ConnectError> {
        // tonic ignores the TLS config for http:// URIs.
        if self.tls.is_enabled() && is_plaintext_url(&self.endpoint) {
            return Err(ConnectError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "http:// scheme with TLS enabled, use https:// or host:port".to_string(),
            });
        }

        // No connect_timeout here: the whole dial is bounded in `channel`.
        let endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| ConnectError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        match self.client_tls_config().await? {
            Some(tls) => endpoint
                .tls_config(tls)
                .map_err(|e| ConnectError::Tls(e.to_string())),
            None => {
                warn!(endpoint = %self.endpoint, "Running without TLS (insecure)");
                Ok(endpoint)
            }
        }
    }
}

#[async_trait]
impl Connector for TransportManager {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectError> {
        info!(
            endpoint = %self.endpoint,
            tls = self.tls.mode_name(),
            timeout = ?self.dial_timeout,
            "Connecting to control plane"
        );

        let channel = self.channel().await?;
        info!(endpoint = %self.endpoint, "gRPC connection established");
        Ok(Box::new(GrpcTransport {
            endpoint: self.endpoint.clone(),
            channel: Some(channel),
            token: self.token.clone(),
        }))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// A connected gRPC channel
pub struct GrpcTransport {
    endpoint: String,
    channel: Option<Channel>,
    token: String,
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn open_stream(&mut self) -> Result<SessionStream, HandshakeError> {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| HandshakeError::OpenStream("transport closed".to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut request = tonic::Request::new(ReceiverStream::new(outbound_rx));
        let bearer = MetadataValue::try_from(format!("Bearer {}", self.token))
            .map_err(|e| HandshakeError::OpenStream(format!("invalid token metadata: {}", e)))?;
        request.metadata_mut().insert("authorization", bearer);

        // The call is started lazily on the first receive so that the auth
        // frame is already queued when the server answers the headers.
        let mut client = AgentServiceClient::new(channel);
        let response = async move { client.connect(request).await };
        let inbound = stream::once(response)
            .flat_map(|result| match result {
                Ok(response) => response.into_inner().boxed(),
                Err(status) => stream::once(async move { Err(status) }).boxed(),
            })
            .boxed();

        debug!(endpoint = %self.endpoint, "Stream created");
        Ok(SessionStream::new(outbound_tx, inbound))
    }

    fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!(endpoint = %self.endpoint, "Transport closed");
        }
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether an endpoint explicitly asks for plaintext
pub(crate) fn is_plaintext_url(endpoint: &str) -> bool {
    endpoint.trim().to_ascii_lowercase().starts_with("http://")
}

/// Add a scheme to bare `host:port` endpoints
fn normalize_endpoint(endpoint: &str, tls: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if tls {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ConnectError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Flatten an error and its sources; tonic hides the useful part in the chain
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("localhost:50051", false), "http://localhost:50051");
        assert_eq!(normalize_endpoint("cp.example.com:443", true), "https://cp.example.com:443");
        assert_eq!(
            normalize_endpoint("https://cp.example.com", false),
            "https://cp.example.com"
        );
    }

    #[test]
    fn test_tls_mode_names() {
        assert!(!TlsSettings::Disabled.is_enabled());
        assert_eq!(TlsSettings::Disabled.mode_name(), "insecure");
        let mtls = TlsSettings::Mutual {
            ca_file: "ca.pem".into(),
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            server_name: None,
        };
        assert!(mtls.is_enabled());
        assert_eq!(mtls.mode_name(), "mtls");
    }

    #[tokio::test]
    async fn test_missing_ca_file_fails_attempt() {
        let manager = TransportManager::new(
            "localhost:50051",
            TlsSettings::ServerVerified {
                ca_file: "/nonexistent/hpa-agent/ca.pem".into(),
                server_name: None,
            },
            Duration::from_secs(1),
            "token",
        );

        match manager.connect().await {
            Err(ConnectError::TlsFile { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/hpa-agent/ca.pem"));
            }
            Err(other) => panic!("Expected TlsFile error, got {}", other),
            Ok(_) => panic!("Expected TlsFile error, got a transport"),
        }
    }

    #[tokio::test]
    async fn test_mtls_does_not_downgrade_when_key_missing() {
        let dir = std::env::temp_dir().join(format!("hpa-agent-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = dir.join("ca.pem");
        let cert = dir.join("cert.pem");
        std::fs::write(&ca, "ca").unwrap();
        std::fs::write(&cert, "cert").unwrap();

        let manager = TransportManager::new(
            "localhost:50051",
            TlsSettings::Mutual {
                ca_file: ca,
                cert_file: cert,
                key_file: dir.join("missing-key.pem"),
                server_name: Some("control-plane".to_string()),
            },
            Duration::from_secs(1),
            "token",
        );

        match manager.connect().await {
            Err(ConnectError::TlsFile { path, .. }) => {
                assert!(path.ends_with("missing-key.pem"));
            }
            Err(other) => panic!("Expected TlsFile error, got {}", other),
            Ok(_) => panic!("Expected TlsFile error, got a transport"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_refused_connection_fails_without_retry() {
        // Reserve a port, then free it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = TransportManager::new(
            &addr.to_string(),
            TlsSettings::Disabled,
            Duration::from_secs(2),
            "token",
        );
        let result = manager.connect().await;
        assert!(matches!(result, Err(ConnectError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_stalled_dial_reports_connect_timeout() {
        // Accepts TCP but never answers the TLS handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let manager = TransportManager::new(
            &format!("https://{}", addr),
            TlsSettings::SystemRoots { server_name: None },
            Duration::from_millis(300),
            "token",
        );
        match manager.connect().await {
            Err(ConnectError::ConnectTimeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(300));
            }
            Err(other) => panic!("Expected ConnectTimeout, got {}", other),
            Ok(_) => panic!("Expected ConnectTimeout, got a transport"),
        }
    }

    #[tokio::test]
    async fn test_tls_refuses_plaintext_scheme() {
        let manager = TransportManager::new(
            "http://127.0.0.1:50051",
            TlsSettings::SystemRoots { server_name: None },
            Duration::from_secs(1),
            "token",
        );
        match manager.connect().await {
            Err(ConnectError::InvalidEndpoint { endpoint, reason }) => {
                assert_eq!(endpoint, "http://127.0.0.1:50051");
                assert!(reason.contains("TLS enabled"));
            }
            Err(other) => panic!("Expected InvalidEndpoint, got {}", other),
            Ok(_) => panic!("TLS endpoint with http:// must not connect"),
        }

        assert!(is_plaintext_url("HTTP://cp.local:443"));
        assert!(!is_plaintext_url("https://cp.local:443"));
        assert!(!is_plaintext_url("cp.local:443"));
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let manager =
            TransportManager::new("http://bad host", TlsSettings::Disabled, Duration::from_secs(1), "t");
        assert!(matches!(
            manager.connect().await,
            Err(ConnectError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_grpc_transport_close_is_idempotent() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let mut transport = GrpcTransport {
            endpoint: "http://127.0.0.1:1".to_string(),
            channel: Some(channel),
            token: "t".to_string(),
        };
        transport.close();
        transport.close();
        assert!(matches!(
            transport.open_stream().await,
            Err(HandshakeError::OpenStream(_))
        ));
    }
}
