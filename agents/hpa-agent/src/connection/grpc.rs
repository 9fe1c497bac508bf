//! gRPC client for `agent.v1.AgentService`

use tonic::codegen::{http, Body, Bytes, StdError};

use crate::connection::protocol::{
    AgentMessage, RegisterClusterRequest, RegisterClusterResponse, ServerMessage,
};

const SERVICE: &str = "agent.v1.AgentService";

#[derive(Debug, Clone)]
pub struct AgentServiceClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> AgentServiceClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::new(
                tonic::Code::Unknown,
                format!("Service was not ready: {}", e.into()),
            )
        })
    }

    /// Open the bidirectional agent stream
    pub async fn connect(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = AgentMessage>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<ServerMessage>>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/agent.v1.AgentService/Connect");
        tracing::trace!(service = SERVICE, method = "Connect", "Opening stream");
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }

    /// Register a new cluster and obtain its agent token
    pub async fn register_cluster(
        &mut self,
        request: impl tonic::IntoRequest<RegisterClusterRequest>,
    ) -> Result<tonic::Response<RegisterClusterResponse>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/agent.v1.AgentService/RegisterCluster");
        tracing::trace!(service = SERVICE, method = "RegisterCluster", "Sending request");
        self.inner.unary(request.into_request(), path, codec).await
    }
}
