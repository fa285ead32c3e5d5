//! Outbound transport
//!
//! [`Uplink`] is the seam between a session and the network: one call streams
//! one batch of encoded requests and resolves when the server has answered the
//! whole client stream. [`GrpcUplink`] is the tonic implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

use super::proto;
use crate::config::{defaults, ServerConfig};
use crate::identity::DeviceIdentity;

/// Encoded requests fed lazily into one RPC.
pub type PayloadStream = BoxStream<'static, Vec<u8>>;

/// The two outbound streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    State,
    Event,
}

impl StreamKind {
    pub fn rpc_path(self) -> &'static str {
        match self {
            Self::State => proto::STREAM_DEVICE_STATE_PATH,
            Self::Event => proto::STREAM_EVENT_PATH,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// Transport failures. Always recoverable: the session backs off and retries.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("rpc failed: {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),
    #[error("access token is not valid call metadata")]
    InvalidMetadata,
}

impl TransportError {
    /// Server unreachable or restarting (expected during deploys).
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Status(status) => status.code() == Code::Unavailable,
            Self::Connect(_) | Self::ConnectTimeout(_) => true,
            Self::InvalidMetadata => false,
        }
    }
}

#[async_trait]
pub trait Uplink: Send + Sync + 'static {
    /// Check the remote endpoint is reachable.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Stream `items` as one client-streaming call of `kind`.
    ///
    /// Resolves `Ok` only once the server has acknowledged the complete stream.
    async fn stream(&self, kind: StreamKind, items: PayloadStream) -> Result<(), TransportError>;
}

// ============================================================================
// gRPC
// ============================================================================

pub struct GrpcUplink {
    endpoint: Endpoint,
    channel: Channel,
    identity: Arc<DeviceIdentity>,
    connect_timeout: Duration,
}

impl GrpcUplink {
    /// Build a lazily-connecting channel to the device service.
    pub fn new(
        server: &ServerConfig,
        identity: Arc<DeviceIdentity>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut endpoint = Endpoint::from_shared(server.uri())?
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(defaults::TCP_KEEPALIVE_SECS)))
            .http2_keep_alive_interval(Duration::from_secs(defaults::TCP_KEEPALIVE_SECS))
            .keep_alive_while_idle(true);
        if server.tls {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().domain_name(server.host.clone()))?;
        }

        let channel = endpoint.connect_lazy();
        debug!(uri = %server.uri(), tls = server.tls, "Device service channel configured");
        Ok(Self {
            endpoint,
            channel,
            identity,
            connect_timeout,
        })
    }

    fn authorization(&self) -> Result<MetadataValue<Ascii>, TransportError> {
        MetadataValue::try_from(self.identity.bearer()).map_err(|_| TransportError::InvalidMetadata)
    }

    async fn client_stream<Req, Resp>(
        &self,
        kind: StreamKind,
        items: PayloadStream,
    ) -> Result<(), TransportError>
    where
        Req: prost::Message + Default + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        // Queue entries are our own encodings; a corrupt one is dropped rather
        // than poisoning the stream forever.
        let requests = items.filter_map(move |payload| {
            let decoded = Req::decode(payload.as_slice());
            async move {
                match decoded {
                    Ok(request) => Some(request),
                    Err(e) => {
                        warn!(stream = %kind, error = %e, "Dropping undecodable queue entry");
                        None
                    }
                }
            }
        });

        let mut request = tonic::Request::new(requests);
        request
            .metadata_mut()
            .insert("authorization", self.authorization()?);

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;
        grpc.client_streaming(
            request,
            PathAndQuery::from_static(kind.rpc_path()),
            tonic::codec::ProstCodec::<Req, Resp>::default(),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Uplink for GrpcUplink {
    async fn connect(&self) -> Result<(), TransportError> {
        info!(uri = %self.endpoint.uri(), "Connecting to device service");
        tokio::time::timeout(self.connect_timeout, self.endpoint.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;
        info!("Connected to device service");
        Ok(())
    }

    async fn stream(&self, kind: StreamKind, items: PayloadStream) -> Result<(), TransportError> {
        match kind {
            StreamKind::State => {
                self.client_stream::<proto::StreamDeviceStateRequest, proto::StreamDeviceStateResponse>(
                    kind, items,
                )
                .await
            }
            StreamKind::Event => {
                self.client_stream::<proto::StreamEventRequest, proto::StreamEventResponse>(kind, items)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(TransportError::Status(tonic::Status::unavailable("deploy")).is_unavailable());
        assert!(TransportError::ConnectTimeout(Duration::from_secs(1)).is_unavailable());
        assert!(!TransportError::Status(tonic::Status::unauthenticated("bad token")).is_unavailable());
        assert!(!TransportError::InvalidMetadata.is_unavailable());
    }

    #[test]
    fn test_rpc_paths() {
        assert_eq!(
            StreamKind::State.rpc_path(),
            "/sora.device.v1beta.DeviceService/StreamDeviceState"
        );
        assert!(StreamKind::Event.rpc_path().starts_with(&format!("/{}/", proto::SERVICE_NAME)));
        assert_eq!(StreamKind::Event.to_string(), "event");
    }
}
