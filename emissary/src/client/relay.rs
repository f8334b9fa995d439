// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
  common::{
    protocol::{Command, ServiceDescriptor},
    retry::{RetryError, RetryPolicy},
    session::{GatewayConnector, SessionError},
  },
  config::DEFAULT_RELAY_LINGER,
  util::proxy_generic_tokio_streams,
};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
  #[error("could not open a tunnel to the gateway: {0}")]
  Dial(#[from] RetryError<SessionError>),
  #[error("failed requesting the protected service: {0}")]
  ConnectCommand(#[source] std::io::Error),
  #[error("relay ended with an I/O error: {0}")]
  Io(#[source] std::io::Error),
}

/// Byte counts for one finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
  /// Local client to gateway
  pub sent: u64,
  /// Gateway to local client
  pub received: u64,
}

/// Pairs each accepted local connection with a dedicated gateway tunnel.
///
/// Tunnels are never shared between local connections. Shutdown only stops
/// the dial phase; once bytes are flowing a relay runs until either peer
/// closes or errors. After one peer closes, the other direction is given
/// `linger` of idleness before the relay ends it.
pub struct RelayEngine<C> {
  connector: Arc<C>,
  dial_retry: RetryPolicy,
  linger: Duration,
  shutdown: CancellationToken,
}

impl<C> std::fmt::Debug for RelayEngine<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RelayEngine")
      .field("dial_retry", &self.dial_retry)
      .field("linger", &self.linger)
      .finish_non_exhaustive()
  }
}

impl<C: GatewayConnector> RelayEngine<C> {
  pub fn new(connector: Arc<C>, dial_retry: RetryPolicy, shutdown: CancellationToken) -> Self {
    Self {
      connector,
      dial_retry,
      linger: DEFAULT_RELAY_LINGER,
      shutdown,
    }
  }

  pub fn with_linger(mut self, linger: Duration) -> Self {
    self.linger = linger;
    self
  }

  pub fn connector(&self) -> &Arc<C> {
    &self.connector
  }

  /// Relays `local` to `service` through a fresh tunnel.
  ///
  /// Consumes `local`; both it and the tunnel are closed when this returns,
  /// whichever way it returns.
  pub async fn relay<L>(&self, local: L, service: &ServiceDescriptor) -> Result<RelayStats, RelayError>
  where
    L: AsyncRead + AsyncWrite + Send + Unpin,
  {
    let connector = &self.connector;
    let mut tunnel = self
      .dial_retry
      .run("relay_dial", &self.shutdown, move |attempt| {
        tracing::trace!(attempt, "dialing gateway for relay");
        connector.connect()
      })
      .await?;

    Command::Connect(service)
      .write_to(&mut tunnel)
      .await
      .map_err(RelayError::ConnectCommand)?;
    tracing::debug!(token = %service.token(), "requested protected service");

    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel);
    let (sent, received) = proxy_generic_tokio_streams(
      (&mut local_w, &mut local_r),
      (&mut tunnel_w, &mut tunnel_r),
      self.linger,
    )
    .await
    .map_err(RelayError::Io)?;
    Ok(RelayStats { sent, received })
  }
}
