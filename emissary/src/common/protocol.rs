// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Text command vocabulary spoken with the gateway.
//!
//! Every command is a single write on the session: a case-sensitive token,
//! optionally followed by a space and an argument. There is no length framing;
//! the gateway's responses are expected to fit within a single read.

use std::{fmt, str::FromStr};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Requests the full protected service directory
pub const PROTECTED_SERVICE_LIST: &str = "PS_LIST";
/// Requests a tunnel to one protected service, e.g. `PS_CONN A01Database`
pub const PROTECTED_SERVICE_CONNECT: &str = "PS_CONN";
/// Registers a locally-running service for inbound routing by the gateway
pub const OUTBOUND_CREATE: &str = "OB_CR8T";
/// The gateway's only acceptable reply to [`OUTBOUND_CREATE`]
pub const OUTBOUND_ACK: &[u8] = b"ACK";

const DIRECTORY_PREFIX_SEPARATOR: char = ':';
const DIRECTORY_TOKEN_SEPARATOR: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
  ListServices,
  Connect(&'a ServiceDescriptor),
  RegisterOutbound(&'a str),
}

impl<'a> Command<'a> {
  pub fn encode(&self) -> Vec<u8> {
    match self {
      Command::ListServices => PROTECTED_SERVICE_LIST.as_bytes().to_vec(),
      Command::Connect(service) => {
        format!("{} {}", PROTECTED_SERVICE_CONNECT, service.token()).into_bytes()
      }
      Command::RegisterOutbound(name) => format!("{} {}", OUTBOUND_CREATE, name).into_bytes(),
    }
  }

  /// Writes the command as one message and flushes it through any TLS buffering
  pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, w: &mut W) -> std::io::Result<()> {
    w.write_all(&self.encode()).await?;
    w.flush().await
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
  #[error("service token {token:?} is shorter than 3 characters")]
  TokenTooShort { token: String },
  #[error("service token {token:?} has a non-numeric port offset")]
  InvalidOffset { token: String },
  #[error("directory response is not valid UTF-8")]
  NotUtf8,
  #[error("directory response has no ':' separating its prefix")]
  MissingPrefix,
  #[error("directory response was truncated after {trailing:?}")]
  Truncated { trailing: String },
}

/// A protected service as advertised by the gateway.
///
/// Decoded once from its wire token `<marker><2-digit offset><name>`, for
/// example `A01Database`. The offset selects the local port relative to the
/// pool's base port. The trimmed token is kept exactly as advertised and sent
/// back verbatim in `PS_CONN`; the name is for display only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceDescriptor {
  marker: char,
  offset: u8,
  name: String,
  token: String,
}

impl ServiceDescriptor {
  pub const MAX_OFFSET: u8 = 99;

  /// Builds a descriptor, rejecting offsets that would not fit in two digits
  pub fn new(marker: char, offset: u8, name: impl AsRef<str>) -> Option<Self> {
    if offset > Self::MAX_OFFSET {
      return None;
    }
    let name = strip_control(name.as_ref());
    Some(Self {
      marker,
      offset,
      token: format!("{}{:02}{}", marker, offset, name),
      name,
    })
  }

  pub fn marker(&self) -> char {
    self.marker
  }

  pub fn offset(&self) -> u8 {
    self.offset
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Wire form of this descriptor, as sent in `PS_CONN`
  pub fn token(&self) -> &str {
    &self.token
  }
}

impl fmt::Display for ServiceDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

impl FromStr for ServiceDescriptor {
  type Err = DecodeError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let token = raw.trim();
    let mut chars = token.chars();
    let (marker, tens, ones) = match (chars.next(), chars.next(), chars.next()) {
      (Some(marker), Some(tens), Some(ones)) => (marker, tens, ones),
      _ => {
        return Err(DecodeError::TokenTooShort {
          token: token.to_string(),
        })
      }
    };
    let offset = match (tens.to_digit(10), ones.to_digit(10)) {
      (Some(tens), Some(ones)) => (tens * 10 + ones) as u8,
      _ => {
        return Err(DecodeError::InvalidOffset {
          token: token.to_string(),
        })
      }
    };
    Ok(Self {
      marker,
      offset,
      name: strip_control(chars.as_str()),
      token: token.to_string(),
    })
  }
}

fn strip_control(name: &str) -> String {
  name.chars().filter(|c| !c.is_control()).collect()
}

/// A decoded directory: the services that parsed, and the tokens that did not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
  pub services: Vec<ServiceDescriptor>,
  pub rejected: Vec<DecodeError>,
}

/// Decodes a directory response of the form `PREFIX:tok1,tok2,...,tokN,`.
///
/// The trailing comma is mandatory; a response whose final element is not
/// empty was cut short by the single bounded read and is rejected instead of
/// yielding a half-decoded service. Blank elements are skipped, so `PS_LIST:,`
/// is an empty directory rather than an error.
///
/// Tokens are decoded independently: a malformed token lands in
/// [`Directory::rejected`] and the rest of the directory is still usable.
pub fn decode_directory(response: &[u8]) -> Result<Directory, DecodeError> {
  let response = std::str::from_utf8(response).map_err(|_| DecodeError::NotUtf8)?;
  let (_prefix, listing) = response
    .split_once(DIRECTORY_PREFIX_SEPARATOR)
    .ok_or(DecodeError::MissingPrefix)?;
  let mut elements = listing.split(DIRECTORY_TOKEN_SEPARATOR).collect::<Vec<_>>();
  match elements.pop() {
    Some(trailing) if !trailing.trim().is_empty() => {
      return Err(DecodeError::Truncated {
        trailing: trailing.to_string(),
      })
    }
    _ => {}
  }
  let mut directory = Directory::default();
  for element in elements.into_iter().filter(|e| !e.trim().is_empty()) {
    match element.parse() {
      Ok(service) => directory.services.push(service),
      Err(error) => directory.rejected.push(error),
    }
  }
  Ok(directory)
}
