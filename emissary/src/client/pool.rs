// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One loopback listener per protected service.
//!
//! Local ports are `base_port + offset`, using the offset embedded in each
//! service's directory token so assignments survive directory reordering.

use std::{
  collections::HashSet,
  net::{IpAddr, SocketAddr},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::{pin_mut, Stream, StreamExt};
use tokio::{
  net::{TcpListener, TcpStream},
  sync::oneshot,
  task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::relay::RelayEngine;
use crate::common::{protocol::ServiceDescriptor, session::GatewayConnector};

/// Pause after a failed accept, so persistent failures such as descriptor
/// exhaustion do not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum BindError {
  #[error("port offset {offset} for {service:?} overflows base port {base_port}")]
  PortOutOfRange {
    service: String,
    base_port: u16,
    offset: u8,
  },
  #[error("Emissary was unable to start the local proxy for {service:?} on {addr}: {source}")]
  Bind {
    service: String,
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("{service:?} already has a local proxy")]
  Duplicate { service: String },
}

impl BindError {
  pub fn service(&self) -> &str {
    match self {
      BindError::PortOutOfRange { service, .. }
      | BindError::Bind { service, .. }
      | BindError::Duplicate { service } => service,
    }
  }
}

/// A service's local listener, exclusively owning its socket
#[derive(Debug)]
pub struct ProxyBinding {
  service: ServiceDescriptor,
  local_addr: SocketAddr,
  listener: TcpListener,
}

impl ProxyBinding {
  pub async fn bind(
    service: ServiceDescriptor,
    listen_ip: IpAddr,
    base_port: u16,
  ) -> Result<Self, BindError> {
    let port = base_port
      .checked_add(service.offset().into())
      .ok_or_else(|| BindError::PortOutOfRange {
        service: service.name().to_string(),
        base_port,
        offset: service.offset(),
      })?;
    let addr = SocketAddr::new(listen_ip, port);
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|source| BindError::Bind {
        service: service.name().to_string(),
        addr,
        source,
      })?;
    let local_addr = listener.local_addr().unwrap_or(addr);
    Ok(Self {
      service,
      local_addr,
      listener,
    })
  }

  pub fn service(&self) -> &ServiceDescriptor {
    &self.service
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Accepts until `stop_accepting` fires, spawning an independent relay per connection.
  ///
  /// Accept errors are logged and skipped after a short pause. Relays
  /// already running are not stopped by cancellation.
  pub async fn serve<C: GatewayConnector>(
    self,
    relay: Arc<RelayEngine<C>>,
    stop_accepting: CancellationToken,
  ) {
    serve_incoming(
      TcpListenerStream::new(self.listener),
      self.service,
      self.local_addr,
      relay,
      stop_accepting,
    )
    .await
  }
}

async fn serve_incoming<S, C>(
  incoming: S,
  service: ServiceDescriptor,
  local_addr: SocketAddr,
  relay: Arc<RelayEngine<C>>,
  stop_accepting: CancellationToken,
) where
  S: Stream<Item = std::io::Result<TcpStream>>,
  C: GatewayConnector,
{
  let service = Arc::new(service);
  let connection_ids = AtomicU64::new(0);
  let incoming = incoming.take_until(stop_accepting.cancelled());
  pin_mut!(incoming);
  while let Some(accepted) = incoming.next().await {
    let stream = match accepted {
      Ok(stream) => stream,
      Err(error) => {
        tracing::warn!(service = %service, %local_addr, %error, "Local proxy accept failed");
        tokio::select! {
          _ = stop_accepting.cancelled() => {}
          _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
        }
        continue;
      }
    };
    let peer = stream
      .peer_addr()
      .map(|p| p.to_string())
      .unwrap_or_else(|_| String::from("<unknown>"));
    let connection_id = connection_ids.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
      "relay",
      service = %service,
      %peer,
      connection_id
    );
    let relay = Arc::clone(&relay);
    let service = Arc::clone(&service);
    tokio::task::spawn(
      async move {
        tracing::debug!("accepted local connection");
        match relay.relay(stream, &service).await {
          Ok(stats) => tracing::info!(
            sent = stats.sent,
            received = stats.received,
            "relay closed"
          ),
          Err(error) => tracing::warn!(%error, "relay failed"),
        }
      }
      .instrument(span),
    );
  }
  tracing::info!(service = %service, %local_addr, "Local proxy stopped accepting");
}

/// Registry of the running local proxies, at most one per service
pub struct ListenerPool {
  bindings: Arc<DashMap<ServiceDescriptor, SocketAddr>>,
  accept_loops: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ListenerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ListenerPool")
      .field("bindings", &self.bindings())
      .finish_non_exhaustive()
  }
}

impl ListenerPool {
  /// Binds every service concurrently and starts its accept loop.
  ///
  /// Returns once every bind attempt has settled. Failures are per service and
  /// never prevent the others from binding.
  pub async fn start<C: GatewayConnector>(
    services: Vec<ServiceDescriptor>,
    listen_ip: IpAddr,
    base_port: u16,
    relay: Arc<RelayEngine<C>>,
    stop_accepting: CancellationToken,
  ) -> (ListenerPool, Vec<BindError>) {
    let bindings = Arc::new(DashMap::new());
    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    let mut accept_loops = Vec::with_capacity(services.len());
    let mut pending = Vec::with_capacity(services.len());

    for service in services {
      if !seen.insert(service.clone()) {
        tracing::warn!(service = %service, "Directory lists a service twice; ignoring the repeat");
        failures.push(BindError::Duplicate {
          service: service.name().to_string(),
        });
        continue;
      }
      let (ready, ready_rx) = oneshot::channel::<Result<(), BindError>>();
      let bindings = Arc::clone(&bindings);
      let relay = Arc::clone(&relay);
      let stop_accepting = stop_accepting.clone();
      let span = tracing::info_span!("local_proxy", service = %service);
      let task = async move {
        let binding = match ProxyBinding::bind(service, listen_ip, base_port).await {
          Ok(binding) => binding,
          Err(error) => {
            let _ = ready.send(Err(error));
            return;
          }
        };
        let key = binding.service().clone();
        match bindings.entry(key.clone()) {
          Entry::Occupied(_) => {
            let _ = ready.send(Err(BindError::Duplicate {
              service: key.name().to_string(),
            }));
            return;
          }
          Entry::Vacant(slot) => {
            slot.insert(binding.local_addr());
          }
        }
        tracing::info!(port = binding.local_addr().port(), "Local proxy listening");
        let _ = ready.send(Ok(()));
        binding.serve(relay, stop_accepting).await;
        bindings.remove(&key);
      };
      accept_loops.push(tokio::task::spawn(task.instrument(span)));
      pending.push(ready_rx);
    }

    for outcome in futures::future::join_all(pending).await {
      match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
          tracing::error!(service = error.service(), %error, "Local proxy setup failed");
          failures.push(error);
        }
        Err(_dropped) => tracing::error!("Local proxy setup task ended without reporting"),
      }
    }

    (
      ListenerPool {
        bindings,
        accept_loops,
      },
      failures,
    )
  }

  /// Running proxies, ordered by local port
  pub fn bindings(&self) -> Vec<(ServiceDescriptor, SocketAddr)> {
    let mut bindings = self
      .bindings
      .iter()
      .map(|entry| (entry.key().clone(), *entry.value()))
      .collect::<Vec<_>>();
    bindings.sort_by_key(|(_, addr)| addr.port());
    bindings
  }

  pub fn local_addr(&self, service: &ServiceDescriptor) -> Option<SocketAddr> {
    self.bindings.get(service).map(|entry| *entry.value())
  }

  pub fn len(&self) -> usize {
    self.bindings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bindings.is_empty()
  }

  /// Waits for every accept loop to exit, i.e. after `stop_accepting` fires
  pub async fn join(self) {
    for accept_loop in self.accept_loops {
      if let Err(error) = accept_loop.await {
        tracing::error!(%error, "Local proxy task panicked");
      }
    }
  }
}
