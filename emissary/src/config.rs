// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  net::{IpAddr, Ipv4Addr},
  time::Duration,
};

use crate::common::retry::RetryPolicy;

pub const DEFAULT_BASE_PORT: u16 = 3200;
/// Idle time a relay allows one direction after the other has closed
pub const DEFAULT_RELAY_LINGER: Duration = Duration::from_secs(2);
/// Port the gateway conventionally accepts Emissary sessions on
pub const DEFAULT_GATEWAY_PORT: u16 = 3100;

/// Tunables shared by every mode; defaults match the gateway's expectations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmissaryConfig {
  /// Bounds TCP connect plus TLS handshake for every gateway session
  pub connect_timeout: Duration,
  pub directory_retry: RetryPolicy,
  pub relay_retry: RetryPolicy,
  pub relay_linger: Duration,
  pub registration_retry: RetryPolicy,
  /// The directory response must arrive in a single read of this size
  pub directory_buffer_size: usize,
  pub registration_buffer_size: usize,
  /// Bounds one gateway message, and each read of a local service response, in outbound mode
  pub outbound_buffer_size: usize,
  pub listen_ip: IpAddr,
  pub base_port: u16,
}

impl Default for EmissaryConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(15),
      directory_retry: RetryPolicy::unbounded(Duration::from_secs(5)),
      relay_retry: RetryPolicy::bounded(Duration::from_secs(1), 999),
      relay_linger: DEFAULT_RELAY_LINGER,
      registration_retry: RetryPolicy::unbounded(Duration::from_secs(5)),
      directory_buffer_size: 2000,
      registration_buffer_size: 1024,
      outbound_buffer_size: 4096,
      listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
      base_port: DEFAULT_BASE_PORT,
    }
  }
}

impl EmissaryConfig {
  pub fn with_base_port(mut self, base_port: u16) -> Self {
    self.base_port = base_port;
    self
  }
}
