// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Authenticated sessions to the gateway.
//!
//! Every session is a fresh TCP connection wrapped in mutual TLS. Sessions are
//! never pooled; callers own each one and close it when their exchange ends.

use std::{fmt, io, str::FromStr, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
};
use tokio_rustls::{rustls::ServerName, TlsConnector};
use tracing_futures::Instrument;

use super::identity::{IdentityError, TlsIdentity};

/// A mutually authenticated session with the gateway
pub type TunnelConnection = tokio_rustls::client::TlsStream<TcpStream>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("timed out after {0:?} connecting to the gateway")]
  Timeout(Duration),
  #[error("gateway refused the connection: {0}")]
  Refused(#[source] io::Error),
  #[error("TLS handshake with the gateway failed: {0}")]
  Handshake(#[source] io::Error),
  #[error("unable to resolve gateway host {host:?}: {source}")]
  Resolve {
    host: String,
    #[source]
    source: io::Error,
  },
  #[error("gateway connection failed: {0}")]
  Io(#[source] io::Error),
  #[error("{0:?} is not a valid TLS server name")]
  InvalidServerName(String),
  #[error(transparent)]
  Identity(#[from] IdentityError),
}

impl SessionError {
  fn from_connect_error(error: io::Error) -> Self {
    match error.kind() {
      io::ErrorKind::ConnectionRefused => SessionError::Refused(error),
      _ => SessionError::Io(error),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
  #[error("gateway address must be of the form host:port")]
  MissingPort,
  #[error("gateway address has an empty host")]
  EmptyHost,
  #[error("{0:?} is not a valid port")]
  InvalidPort(String),
}

/// The gateway's `host:port`, resolved once at startup and immutable after
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayEndpoint {
  host: String,
  port: u16,
}

impl GatewayEndpoint {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }
}

impl FromStr for GatewayEndpoint {
  type Err = EndpointParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let (host, port) = s.rsplit_once(':').ok_or(EndpointParseError::MissingPort)?;
    // Bracketed IPv6 literals, e.g. [::1]:3100
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .unwrap_or(host);
    if host.is_empty() {
      return Err(EndpointParseError::EmptyHost);
    }
    let port = port
      .parse::<u16>()
      .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;
    Ok(Self::new(host, port))
  }
}

impl fmt::Display for GatewayEndpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Opens sessions to the gateway.
///
/// Everything that talks to the gateway goes through this seam, one fresh
/// session per exchange; implementations keep no per-session state.
pub trait GatewayConnector: Send + Sync + 'static {
  type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

  fn connect(&self) -> BoxFuture<'_, Result<Self::Stream, SessionError>>;

  fn endpoint(&self) -> &GatewayEndpoint;
}

/// Dials the gateway over TCP and negotiates mutual TLS with a [TlsIdentity]
#[derive(Clone)]
pub struct TlsGatewayConnector {
  endpoint: GatewayEndpoint,
  server_name: ServerName,
  connector: TlsConnector,
  connect_timeout: Duration,
}

impl fmt::Debug for TlsGatewayConnector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TlsGatewayConnector")
      .field("endpoint", &self.endpoint)
      .field("server_name", &self.server_name)
      .field("connect_timeout", &self.connect_timeout)
      .finish_non_exhaustive()
  }
}

impl TlsGatewayConnector {
  /// The endpoint's host doubles as the TLS server name
  pub fn new(
    endpoint: GatewayEndpoint,
    identity: &TlsIdentity,
    connect_timeout: Duration,
  ) -> Result<Self, SessionError> {
    let server_name = parse_server_name(endpoint.host())?;
    Ok(Self {
      endpoint,
      server_name,
      connector: TlsConnector::from(Arc::new(identity.client_config()?)),
      connect_timeout,
    })
  }

  /// Verify the gateway certificate against `name` instead of the endpoint host
  pub fn with_server_name(mut self, name: &str) -> Result<Self, SessionError> {
    self.server_name = parse_server_name(name)?;
    Ok(self)
  }

  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }

  async fn establish(&self) -> Result<TunnelConnection, SessionError> {
    let host = self.endpoint.host();
    let addrs = tokio::net::lookup_host((host, self.endpoint.port()))
      .await
      .map_err(|source| SessionError::Resolve {
        host: host.to_string(),
        source,
      })?
      .collect::<Vec<_>>();
    let tcp = TcpStream::connect(addrs.as_slice())
      .await
      .map_err(SessionError::from_connect_error)?;
    tcp.set_nodelay(true).map_err(SessionError::Io)?;
    self
      .connector
      .connect(self.server_name.clone(), tcp)
      .await
      .map_err(SessionError::Handshake)
  }
}

fn parse_server_name(name: &str) -> Result<ServerName, SessionError> {
  ServerName::try_from(name).map_err(|_| SessionError::InvalidServerName(name.to_string()))
}

impl GatewayConnector for TlsGatewayConnector {
  type Stream = TunnelConnection;

  fn connect(&self) -> BoxFuture<'_, Result<Self::Stream, SessionError>> {
    let span = tracing::debug_span!("gateway_connect", gateway = %self.endpoint);
    async move {
      let res = match tokio::time::timeout(self.connect_timeout, self.establish()).await {
        Ok(res) => res,
        Err(_elapsed) => Err(SessionError::Timeout(self.connect_timeout)),
      };
      match &res {
        Ok(_) => tracing::info!("Connected to gateway"),
        Err(error) => tracing::warn!(%error, "Failed connecting to gateway"),
      }
      res
    }
    .instrument(span)
    .boxed()
  }

  fn endpoint(&self) -> &GatewayEndpoint {
    &self.endpoint
  }
}
