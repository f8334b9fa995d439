// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use crate::common::session::{EndpointParseError, GatewayEndpoint};

pub fn parse_gateway_endpoint(v: &str) -> Result<GatewayEndpoint, EndpointParseError> {
  v.parse()
}

pub fn validate_gateway_endpoint(v: &str) -> Result<(), String> {
  parse_gateway_endpoint(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

/// Local outbound targets are `host:port`; hosts are resolved at dial time
pub fn validate_local_target(v: &str) -> Result<(), String> {
  if v.parse::<SocketAddr>().is_ok() {
    return Ok(());
  }
  parse_gateway_endpoint(v)
    .map(|_| ())
    .map_err(|e| format!("Local service must be host:port ({})", e))
}

pub fn validate_port(v: &str) -> Result<(), String> {
  v.parse::<u16>()
    .map(|_| ())
    .map_err(|_| String::from("Port must be an integer between 0 and 65535"))
}

/// Service names travel as the argument of a single text command
pub fn validate_service_name(v: &str) -> Result<(), String> {
  if v.trim().is_empty() {
    Err(String::from("Service name must not be empty"))
  } else if v.chars().any(|c| c.is_control()) {
    Err(String::from("Service name must not contain control characters"))
  } else {
    Ok(())
  }
}
