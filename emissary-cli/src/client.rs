// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use emissary::{
  client::{fetch_services_with_retry, ListenerPool, OutboundClient, RelayEngine},
  common::{
    identity::TlsIdentity,
    retry::RetryError,
    session::{GatewayEndpoint, TlsGatewayConnector},
  },
  config::EmissaryConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::bundle::IdentityPaths;

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Mode {
  /// Expose every protected service on a local port
  Inbound,
  /// Publish one local service through Drawbridge
  Outbound {
    local_service: String,
    service_name: String,
  },
}

impl Mode {
  pub fn name(&self) -> &'static str {
    match self {
      Mode::Inbound => "inbound",
      Mode::Outbound { .. } => "outbound",
    }
  }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub gateway: GatewayEndpoint,
  pub gateway_san: Option<String>,
  pub identity: IdentityPaths,
  pub trust_system_roots: bool,
  pub base_port: u16,
  pub mode: Mode,
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let config = EmissaryConfig::default().with_base_port(args.base_port);
  let mut identity =
    TlsIdentity::from_files(&args.identity.cert, &args.identity.key, &args.identity.ca)
      .context("Failed loading the Emissary Bundle certificates")?;
  if args.trust_system_roots {
    identity = identity
      .with_native_roots()
      .context("Failed loading system trust roots")?;
  }
  tracing::debug!(roots = identity.trusted_root_count(), "Loaded mTLS identity");

  let mut connector = TlsGatewayConnector::new(
    args.gateway.clone(),
    &identity,
    config.connect_timeout,
  )?;
  if let Some(san) = &args.gateway_san {
    connector = connector.with_server_name(san)?;
  }
  let connector = Arc::new(connector);

  let shutdown = CancellationToken::new();
  tokio::task::spawn({
    let shutdown = shutdown.clone();
    async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received, shutting down"),
        Err(error) => tracing::warn!(%error, "Unable to listen for interrupts"),
      }
      shutdown.cancel();
    }
  });

  let span = tracing::info_span!("emissary", mode = args.mode.name(), gateway = %args.gateway);
  match args.mode {
    Mode::Inbound => run_inbound(connector, &config, shutdown).instrument(span).await,
    Mode::Outbound {
      local_service,
      service_name,
    } => {
      run_outbound(connector, &config, service_name, local_service, shutdown)
        .instrument(span)
        .await
    }
  }
}

async fn run_inbound(
  connector: Arc<TlsGatewayConnector>,
  config: &EmissaryConfig,
  shutdown: CancellationToken,
) -> Result<()> {
  let directory = match fetch_services_with_retry(
    &*connector,
    config.directory_buffer_size,
    &config.directory_retry,
    &shutdown,
  )
  .await
  {
    Ok(directory) => directory,
    Err(RetryError::Cancelled) => return Ok(()),
    Err(error) => {
      return Err(AnyErr::new(error).context("Failed fetching Protected Services from Drawbridge"))
    }
  };

  let relay = Arc::new(
    RelayEngine::new(connector, config.relay_retry, shutdown.clone())
      .with_linger(config.relay_linger),
  );
  let (pool, failures) = ListenerPool::start(
    directory.services,
    config.listen_ip,
    config.base_port,
    relay,
    shutdown.clone(),
  )
  .await;

  for rejected in &directory.rejected {
    eprintln!("Skipping a Protected Service Drawbridge advertised: {}", rejected);
  }
  for failure in &failures {
    eprintln!("{}", failure);
  }
  if pool.is_empty() && failures.is_empty() && directory.rejected.is_empty() {
    println!("Drawbridge is not advertising any Protected Services right now.");
  } else {
    println!("The following Protected Services are available:");
    for (service, addr) in pool.bindings() {
      println!("• \"{}\" on localhost:{}", service.name(), addr.port());
    }
  }
  println!("\nPress Ctrl-C to stop Emissary.");

  pool.join().await;
  Ok(())
}

async fn run_outbound(
  connector: Arc<TlsGatewayConnector>,
  config: &EmissaryConfig,
  service_name: String,
  local_service: String,
  shutdown: CancellationToken,
) -> Result<()> {
  tracing::info!(service = %service_name, %local_service, "Attempting Outbound Mode...");
  let client = OutboundClient::new(connector, service_name, local_service, config);
  client
    .run(&shutdown)
    .await
    .context("Outbound Proxy Failed: connection to Drawbridge has ceased")
}
