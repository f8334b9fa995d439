// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  io::BufRead,
  path::{Path, PathBuf},
};

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
  #[error("failed reading {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed parsing PEM content of {what}: {source}")]
  Pem {
    what: &'static str,
    #[source]
    source: std::io::Error,
  },
  #[error("no certificates found in the client certificate PEM")]
  NoCertificates,
  #[error("no PKCS#8, RSA or EC private key found in the key PEM")]
  NoPrivateKey,
  #[error("invalid cert in CA PEM")]
  InvalidCaPem,
  #[error("failed loading platform trust roots: {0}")]
  NativeRoots(#[source] std::io::Error),
  #[error("certificate and key were rejected by the TLS stack: {0}")]
  Tls(#[from] rustls::Error),
}

/// Client certificate chain, its private key, and the CAs trusted to sign the gateway.
///
/// Immutable once loaded and shared read-only by every session.
#[derive(Clone)]
pub struct TlsIdentity {
  cert_chain: Vec<Certificate>,
  key: PrivateKey,
  roots: RootCertStore,
}

impl std::fmt::Debug for TlsIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsIdentity")
      .field("certificates", &self.cert_chain.len())
      .field("trusted_roots", &self.roots.len())
      .finish_non_exhaustive()
  }
}

impl TlsIdentity {
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self, IdentityError> {
    let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
      .map_err(|source| IdentityError::Pem {
        what: "client certificate",
        source,
      })?
      .into_iter()
      .map(Certificate)
      .collect::<Vec<_>>();
    if cert_chain.is_empty() {
      return Err(IdentityError::NoCertificates);
    }

    let key = read_private_key(&mut &key_pem[..])?;

    let ca_certs = rustls_pemfile::certs(&mut &ca_pem[..]).map_err(|source| IdentityError::Pem {
      what: "CA certificate",
      source,
    })?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&ca_certs[..]);
    if added == 0 {
      return Err(IdentityError::InvalidCaPem);
    }
    if ignored > 0 {
      tracing::warn!(ignored, "some CA certificates could not be parsed and were skipped");
    }

    Ok(Self {
      cert_chain,
      key,
      roots,
    })
  }

  pub fn from_files(cert: &Path, key: &Path, ca: &Path) -> Result<Self, IdentityError> {
    let read = |path: &Path| {
      std::fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
      })
    };
    Self::from_pem(&read(cert)?, &read(key)?, &read(ca)?)
  }

  /// Additionally trust the platform's root certificates
  pub fn with_native_roots(mut self) -> Result<Self, IdentityError> {
    let native = rustls_native_certs::load_native_certs().map_err(IdentityError::NativeRoots)?;
    let native = native.into_iter().map(|c| c.0).collect::<Vec<_>>();
    let (added, ignored) = self.roots.add_parsable_certificates(&native[..]);
    tracing::debug!(added, ignored, "loaded platform trust roots");
    Ok(self)
  }

  pub fn trusted_root_count(&self) -> usize {
    self.roots.len()
  }

  /// Builds a rustls client configuration presenting this identity and
  /// verifying the gateway against the trusted roots only
  pub fn client_config(&self) -> Result<ClientConfig, IdentityError> {
    Ok(
      ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(self.roots.clone())
        .with_client_auth_cert(self.cert_chain.clone(), self.key.clone())?,
    )
  }
}

fn read_private_key(reader: &mut dyn BufRead) -> Result<PrivateKey, IdentityError> {
  use rustls_pemfile::Item;
  loop {
    let item = rustls_pemfile::read_one(reader).map_err(|source| IdentityError::Pem {
      what: "private key",
      source,
    })?;
    match item {
      Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
        return Ok(PrivateKey(key))
      }
      Some(_) => continue,
      None => return Err(IdentityError::NoPrivateKey),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::TestPki;

  #[test]
  fn loads_generated_identity() {
    let pki = TestPki::generate();
    let identity = TlsIdentity::from_pem(
      pki.client_cert_pem.as_bytes(),
      pki.client_key_pem.as_bytes(),
      pki.ca_cert_pem.as_bytes(),
    )
    .unwrap();
    assert_eq!(identity.trusted_root_count(), 1);
    identity.client_config().unwrap();
  }

  #[test]
  fn key_may_follow_other_pem_items() {
    let pki = TestPki::generate();
    let combined = format!("{}{}", pki.client_cert_pem, pki.client_key_pem);
    TlsIdentity::from_pem(
      pki.client_cert_pem.as_bytes(),
      combined.as_bytes(),
      pki.ca_cert_pem.as_bytes(),
    )
    .unwrap();
  }

  #[test]
  fn ca_without_certificates_is_rejected() {
    let pki = TestPki::generate();
    let res = TlsIdentity::from_pem(
      pki.client_cert_pem.as_bytes(),
      pki.client_key_pem.as_bytes(),
      b"not a certificate",
    );
    assert!(matches!(res, Err(IdentityError::InvalidCaPem)));
  }

  #[test]
  fn missing_key_is_rejected() {
    let pki = TestPki::generate();
    let res = TlsIdentity::from_pem(
      pki.client_cert_pem.as_bytes(),
      pki.client_cert_pem.as_bytes(),
      pki.ca_cert_pem.as_bytes(),
    );
    assert!(matches!(res, Err(IdentityError::NoPrivateKey)));
  }

  #[test]
  fn missing_certificate_is_rejected() {
    let pki = TestPki::generate();
    let res = TlsIdentity::from_pem(
      b"",
      pki.client_key_pem.as_bytes(),
      pki.ca_cert_pem.as_bytes(),
    );
    assert!(matches!(res, Err(IdentityError::NoCertificates)));
  }

  #[test]
  fn missing_file_names_the_path() {
    let missing = Path::new("/definitely/not/here/emissary-mtls-tcp.crt");
    match TlsIdentity::from_files(missing, missing, missing) {
      Err(IdentityError::Read { path, .. }) => assert_eq!(path, missing),
      other => panic!("unexpected result {:?}", other),
    }
  }
}
