// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Exposes a locally-running service to the gateway over one long-lived session.
//!
//! The session moves through `Disconnected -> Registering -> Forwarding` and
//! back to `Disconnected` when the gateway closes or the session breaks.
//! While forwarding, each message from the gateway is handed to a fresh
//! connection to the local service and the local service's reply is written
//! back on the session.

use std::sync::Arc;

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpStream,
  sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    protocol::{Command, OUTBOUND_ACK},
    retry::{RetryError, RetryPolicy},
    session::{GatewayConnector, SessionError},
  },
  config::EmissaryConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
  Disconnected,
  Registering,
  Forwarding,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
  #[error(transparent)]
  Session(#[from] SessionError),
  #[error("failed to register service with Drawbridge: {0}")]
  RegisterWrite(#[source] std::io::Error),
  #[error("failed to receive acknowledgement from Drawbridge: {0}")]
  AckRead(#[source] std::io::Error),
  #[error("Drawbridge did not acknowledge the registration (replied {0:?})")]
  Rejected(String),
  #[error("outbound session read failed: {0}")]
  GatewayRead(#[source] std::io::Error),
  #[error("failed returning a local response to Drawbridge: {0}")]
  ResponseWrite(#[source] std::io::Error),
}

pub struct OutboundClient<C> {
  connector: Arc<C>,
  service_name: String,
  local_service: String,
  registration_retry: RetryPolicy,
  registration_buffer_size: usize,
  message_buffer_size: usize,
  state: watch::Sender<OutboundState>,
}

impl<C> std::fmt::Debug for OutboundClient<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OutboundClient")
      .field("service_name", &self.service_name)
      .field("local_service", &self.local_service)
      .field("state", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}

impl<C: GatewayConnector> OutboundClient<C> {
  /// `local_service` is a `host:port` resolved on every forwarded message
  pub fn new(
    connector: Arc<C>,
    service_name: impl Into<String>,
    local_service: impl Into<String>,
    config: &EmissaryConfig,
  ) -> Self {
    let (state, _) = watch::channel(OutboundState::Disconnected);
    Self {
      connector,
      service_name: service_name.into(),
      local_service: local_service.into(),
      registration_retry: config.registration_retry,
      registration_buffer_size: config.registration_buffer_size,
      message_buffer_size: config.outbound_buffer_size,
      state,
    }
  }

  pub fn state(&self) -> OutboundState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<OutboundState> {
    self.state.subscribe()
  }

  fn set_state(&self, next: OutboundState) {
    let previous = self.state.send_replace(next);
    if previous != next {
      tracing::debug!(?previous, ?next, "outbound state changed");
    }
  }

  /// One registration and forwarding pass, without retrying.
  ///
  /// Returns the number of gateway messages handled once the gateway closes
  /// the session.
  pub async fn run_session(&self) -> Result<u64, OutboundError> {
    let session = self.register().await?;
    self.forward(session).await
  }

  /// Keeps the service registered until `shutdown` fires.
  ///
  /// Registration failures wait out the retry delay; a session that reached
  /// forwarding reconnects immediately once it ends. Cancellation also tears
  /// down a forwarding session.
  pub async fn run(&self, shutdown: &CancellationToken) -> Result<(), RetryError<OutboundError>> {
    let mut sessions = 0u64;
    loop {
      let registered = self
        .registration_retry
        .run("outbound_register", shutdown, move |attempt| {
          tracing::debug!(attempt, "registering outbound service");
          self.register()
        })
        .await;
      let session = match registered {
        Ok(session) => session,
        Err(RetryError::Cancelled) => {
          self.set_state(OutboundState::Disconnected);
          return Ok(());
        }
        Err(error) => return Err(error),
      };
      sessions += 1;
      let span = tracing::info_span!("outbound_session", session = sessions);
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
          self.set_state(OutboundState::Disconnected);
          tracing::info!("Outbound session cancelled");
          return Ok(());
        }
        res = self.forward(session).instrument(span) => match res {
          Ok(messages) => tracing::info!(messages, "Drawbridge closed the outbound session; reconnecting"),
          Err(error) => tracing::warn!(%error, "Outbound session failed; reconnecting"),
        },
      }
    }
  }

  async fn register(&self) -> Result<C::Stream, OutboundError> {
    self.set_state(OutboundState::Registering);
    let res = self.try_register().await;
    if res.is_err() {
      self.set_state(OutboundState::Disconnected);
    }
    res
  }

  async fn try_register(&self) -> Result<C::Stream, OutboundError> {
    let mut session = self.connector.connect().await?;
    Command::RegisterOutbound(&self.service_name)
      .write_to(&mut session)
      .await
      .map_err(OutboundError::RegisterWrite)?;
    let mut reply = vec![0u8; self.registration_buffer_size];
    let read = session
      .read(&mut reply)
      .await
      .map_err(OutboundError::AckRead)?;
    if &reply[..read] != OUTBOUND_ACK {
      // The session is dropped, and with it closed, on the way out
      return Err(OutboundError::Rejected(
        String::from_utf8_lossy(&reply[..read]).into_owned(),
      ));
    }
    tracing::info!(
      service = %self.service_name,
      local_service = %self.local_service,
      "Registered outbound service"
    );
    Ok(session)
  }

  async fn forward(&self, mut session: C::Stream) -> Result<u64, OutboundError> {
    self.set_state(OutboundState::Forwarding);
    let res = self.forward_messages(&mut session).await;
    self.set_state(OutboundState::Disconnected);
    if let Err(error) = session.shutdown().await {
      tracing::trace!(%error, "outbound session shutdown failed");
    }
    res
  }

  async fn forward_messages<S>(&self, session: &mut S) -> Result<u64, OutboundError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut message = vec![0u8; self.message_buffer_size];
    let mut handled = 0u64;
    loop {
      let read = session
        .read(&mut message)
        .await
        .map_err(OutboundError::GatewayRead)?;
      if read == 0 {
        return Ok(handled);
      }
      handled += 1;
      let response = match exchange_with_local(
        &self.local_service,
        &message[..read],
        self.message_buffer_size,
      )
      .await
      {
        Ok(response) => response,
        Err(error) => {
          tracing::error!(
            local_service = %self.local_service,
            %error,
            "Failed to reach local service; dropping message"
          );
          continue;
        }
      };
      tracing::debug!(
        request = read,
        response = response.len(),
        "forwarded message to local service"
      );
      if !response.is_empty() {
        session
          .write_all(&response)
          .await
          .map_err(OutboundError::ResponseWrite)?;
        session.flush().await.map_err(OutboundError::ResponseWrite)?;
      }
    }
  }
}

/// Sends `message` over a new connection to `target` and collects the reply.
///
/// The reply is complete at end-of-stream or at the first read shorter than
/// `chunk_size`.
async fn exchange_with_local(
  target: &str,
  message: &[u8],
  chunk_size: usize,
) -> std::io::Result<Vec<u8>> {
  let mut local = TcpStream::connect(target).await?;
  local.write_all(message).await?;
  let mut response = Vec::new();
  let mut chunk = vec![0u8; chunk_size];
  loop {
    let read = local.read(&mut chunk).await?;
    response.extend_from_slice(&chunk[..read]);
    if read < chunk_size {
      return Ok(response);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::session::TlsGatewayConnector;
  use crate::test_support::{expect_bytes, unused_port, TestGateway, TestPki};
  use std::time::Duration;
  use tokio::net::TcpListener;

  fn fast_config() -> EmissaryConfig {
    EmissaryConfig {
      registration_retry: RetryPolicy::unbounded(Duration::from_millis(10)),
      ..Default::default()
    }
  }

  async fn wait_for_state(rx: &mut watch::Receiver<OutboundState>, wanted: OutboundState) {
    tokio::time::timeout(Duration::from_secs(10), async {
      while *rx.borrow_and_update() != wanted {
        rx.changed().await.unwrap();
      }
    })
    .await
    .expect("outbound client never reached the expected state");
  }

  fn client(
    gateway: &TestGateway,
    pki: &TestPki,
    local_service: String,
  ) -> Arc<OutboundClient<TlsGatewayConnector>> {
    Arc::new(OutboundClient::new(
      Arc::new(gateway.connector(pki)),
      "my-app",
      local_service,
      &fast_config(),
    ))
  }

  #[tokio::test]
  async fn registers_and_forwards_to_local_service() {
    let pki = TestPki::generate();
    let mut gateway = TestGateway::spawn(&pki).await;
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    let client = client(&gateway, &pki, local_addr.to_string());
    let mut states = client.subscribe();

    let local_side = tokio::spawn(async move {
      let (mut conn, _) = local.accept().await.unwrap();
      expect_bytes(&mut conn, b"SELECT 1;").await;
      conn.write_all(b"1 row").await.unwrap();
      conn.shutdown().await.unwrap();
    });

    let session = tokio::spawn({
      let client = Arc::clone(&client);
      async move { client.run_session().await }
    });

    let mut tunnel = gateway.next_session().await;
    expect_bytes(&mut tunnel, b"OB_CR8T my-app").await;
    tunnel.write_all(b"ACK").await.unwrap();
    wait_for_state(&mut states, OutboundState::Forwarding).await;

    tunnel.write_all(b"SELECT 1;").await.unwrap();
    expect_bytes(&mut tunnel, b"1 row").await;
    local_side.await.unwrap();

    tunnel.shutdown().await.unwrap();
    let handled = tokio::time::timeout(Duration::from_secs(10), session)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(handled, 1);
    assert_eq!(client.state(), OutboundState::Disconnected);
  }

  #[tokio::test]
  async fn anything_but_ack_is_a_failed_registration() {
    let pki = TestPki::generate();
    let mut gateway = TestGateway::spawn(&pki).await;
    let client = client(&gateway, &pki, String::from("127.0.0.1:1"));

    let gateway_side = async {
      let mut tunnel = gateway.next_session().await;
      expect_bytes(&mut tunnel, b"OB_CR8T my-app").await;
      tunnel.write_all(b"ACKNOWLEDGED").await.unwrap();
      tunnel
    };
    let (res, _tunnel) = futures::future::join(client.run_session(), gateway_side).await;
    match res {
      Err(OutboundError::Rejected(reply)) => assert_eq!(reply, "ACKNOWLEDGED"),
      other => panic!("expected a rejected registration, got {:?}", other),
    }
    assert_eq!(client.state(), OutboundState::Disconnected);
  }

  #[tokio::test]
  async fn standing_loop_retries_until_acknowledged() {
    let pki = TestPki::generate();
    let mut gateway = TestGateway::spawn(&pki).await;
    let client = client(&gateway, &pki, String::from("127.0.0.1:1"));
    let mut states = client.subscribe();
    let shutdown = CancellationToken::new();

    let running = tokio::spawn({
      let client = Arc::clone(&client);
      let shutdown = shutdown.clone();
      async move { client.run(&shutdown).await }
    });

    let mut rejected = gateway.next_session().await;
    expect_bytes(&mut rejected, b"OB_CR8T my-app").await;
    rejected.write_all(b"NO").await.unwrap();

    let mut accepted = gateway.next_session().await;
    expect_bytes(&mut accepted, b"OB_CR8T my-app").await;
    accepted.write_all(b"ACK").await.unwrap();
    wait_for_state(&mut states, OutboundState::Forwarding).await;

    shutdown.cancel();
    let res = tokio::time::timeout(Duration::from_secs(10), running)
      .await
      .unwrap()
      .unwrap();
    assert!(res.is_ok());
    assert_eq!(client.state(), OutboundState::Disconnected);
  }

  #[tokio::test]
  async fn standing_loop_reconnects_after_gateway_close() {
    let pki = TestPki::generate();
    let mut gateway = TestGateway::spawn(&pki).await;
    let client = client(&gateway, &pki, String::from("127.0.0.1:1"));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
      let client = Arc::clone(&client);
      let shutdown = shutdown.clone();
      async move { client.run(&shutdown).await }
    });

    let mut first = gateway.next_session().await;
    expect_bytes(&mut first, b"OB_CR8T my-app").await;
    first.write_all(b"ACK").await.unwrap();
    first.shutdown().await.unwrap();

    let mut second = gateway.next_session().await;
    expect_bytes(&mut second, b"OB_CR8T my-app").await;

    shutdown.cancel();
    let res = tokio::time::timeout(Duration::from_secs(10), running)
      .await
      .unwrap()
      .unwrap();
    assert!(res.is_ok());
  }

  #[tokio::test]
  async fn unreachable_local_service_only_drops_that_message() {
    let pki = TestPki::generate();
    let mut gateway = TestGateway::spawn(&pki).await;
    let local_port = unused_port().await;
    let client = client(&gateway, &pki, format!("127.0.0.1:{}", local_port));
    let mut states = client.subscribe();
    let session = tokio::spawn({
      let client = Arc::clone(&client);
      async move { client.run_session().await }
    });

    let mut tunnel = gateway.next_session().await;
    expect_bytes(&mut tunnel, b"OB_CR8T my-app").await;
    tunnel.write_all(b"ACK").await.unwrap();
    wait_for_state(&mut states, OutboundState::Forwarding).await;

    // Nothing listens yet, so this one is dropped
    tunnel.write_all(b"lost").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let local = TcpListener::bind(("127.0.0.1", local_port)).await.unwrap();
    tunnel.write_all(b"ping").await.unwrap();
    let (mut conn, _) = tokio::time::timeout(Duration::from_secs(10), local.accept())
      .await
      .unwrap()
      .unwrap();
    expect_bytes(&mut conn, b"ping").await;
    conn.write_all(b"pong").await.unwrap();
    conn.shutdown().await.unwrap();
    expect_bytes(&mut tunnel, b"pong").await;

    tunnel.shutdown().await.unwrap();
    let handled = tokio::time::timeout(Duration::from_secs(10), session)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(handled, 2);
  }

  #[tokio::test]
  async fn local_reply_is_read_until_short_read() {
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = local.local_addr().unwrap();
    let local_side = tokio::spawn(async move {
      let (mut conn, _) = local.accept().await.unwrap();
      expect_bytes(&mut conn, b"req").await;
      conn.write_all(b"0123456789").await.unwrap();
      conn.shutdown().await.unwrap();
    });
    let reply = exchange_with_local(&addr.to_string(), b"req", 4)
      .await
      .unwrap();
    assert_eq!(reply, b"0123456789");
    local_side.await.unwrap();
  }
}
