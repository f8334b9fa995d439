// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use emissary::{
  config::DEFAULT_BASE_PORT,
  util::validators::{
    parse_gateway_endpoint, validate_gateway_endpoint, validate_local_target, validate_port,
    validate_service_name,
  },
};

mod bundle;
mod client;

use bundle::{InstallLayout, SetupError};

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rustls=warn,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  if let Err(error) = tracing::subscriber::set_global_default(collector) {
    bundle::fatal("Logger init failed", Some(&error.into()));
  }
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("gateway")
        .help("Drawbridge address, skipping the bundle file and the prompt")
        .long("gateway")
        .short('g')
        .validator(validate_gateway_endpoint)
        .takes_value(true),
    )
    .arg(
      Arg::new("gateway-san")
        .help("Name to verify on Drawbridge's certificate instead of the gateway host")
        .long("gateway-san")
        .visible_alias("san")
        .takes_value(true),
    )
    .arg(
      Arg::new("base-port")
        .help("Protected Services are exposed on this port plus their offset [default: 3200]")
        .long("base-port")
        .short('p')
        .validator(validate_port)
        .takes_value(true),
    )
    .arg(
      Arg::new("trust-system-roots")
        .help("Also trust the platform's root certificates when verifying Drawbridge")
        .long("trust-system-roots"),
    )
    .arg(
      Arg::new("outbound")
        .help("Local service to publish through Drawbridge (e.g. localhost:5432)")
        .long("outbound")
        .short('o')
        .validator(validate_local_target)
        .takes_value(true),
    )
    .arg(
      Arg::new("service-name")
        .help("Name to register the outbound service under")
        .long("service-name")
        .short('n')
        .validator(validate_service_name)
        .takes_value(true),
    );
  let matches = app.get_matches();

  let layout = match InstallLayout::from_current_exe() {
    Ok(layout) => layout,
    Err(error) => bundle::fatal("Emissary could not locate its install folder", Some(&error.into())),
  };
  let args = match client_arg_handling(&matches, &layout) {
    Ok(args) => args,
    Err(error) => {
      if let Some(SetupError::MissingIdentityDir { .. }) = error.downcast_ref::<SetupError>() {
        bundle::print_onboarding();
        bundle::fatal("Reach out to your Drawbridge admin and ask for one :)", None);
      }
      bundle::fatal("Emissary could not start", Some(&error));
    }
  };

  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(error) => bundle::fatal("Tokio Runtime setup failure", Some(&error.into())),
  };
  let mode = args.mode.name();
  match rt.block_on(client::client_main(args)) {
    Err(error) => {
      tracing::error!(mode, err = ?error, "emissary_failure");
      bundle::fatal(&format!("Emissary {} mode failed", mode), Some(&error));
    }
    Ok(_) => tracing::info!("{} mode exited successfully", mode),
  }
}

fn client_arg_handling(args: &ArgMatches, layout: &InstallLayout) -> Result<client::ClientArgs> {
  let mode = match (args.value_of("outbound"), args.value_of("service-name")) {
    (Some(local_service), Some(service_name)) => client::Mode::Outbound {
      local_service: local_service.to_string(),
      service_name: service_name.trim().to_string(),
    },
    (Some(_), None) => {
      anyhow::bail!("Service name must be provided when using outbound mode (--service-name)")
    }
    (None, _) => client::Mode::Inbound,
  };
  let base_port = args
    .value_of("base-port")
    .map(str::parse::<u16>)
    .transpose()
    .context("Invalid base port")?
    .unwrap_or(DEFAULT_BASE_PORT);

  // Identity problems are reported before asking the operator for anything
  let identity = layout.identity_paths()?;

  let gateway = match args.value_of("gateway") {
    Some(gateway) => gateway.to_string(),
    None => match layout.read_bundle() {
      Some(gateway) => {
        println!(
          "Connecting to Drawbridge server from local Emissary Bundle at {}...\n",
          gateway
        );
        gateway
      }
      None => bundle::prompt_gateway_address(&mut std::io::stdin().lock(), &mut std::io::stdout())
        .context("Failed reading the Drawbridge address")?,
    },
  };
  let gateway = parse_gateway_endpoint(&gateway)
    .with_context(|| format!("{:?} is not a valid Drawbridge address", gateway))?;

  Ok(client::ClientArgs {
    gateway,
    gateway_san: args.value_of("gateway-san").map(String::from),
    identity,
    trust_system_roots: args.is_present("trust-system-roots"),
    base_port,
    mode,
  })
}
