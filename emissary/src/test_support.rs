// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Loopback PKI and a scriptable mutual-TLS gateway for tests

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rcgen::{
  BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DnType,
  ExtendedKeyUsagePurpose, IsCa,
};
use tokio::{
  net::{TcpListener, TcpStream},
  sync::mpsc,
};
use tokio_rustls::{
  rustls::{server::AllowAnyAuthenticatedClient, Certificate, PrivateKey, RootCertStore, ServerConfig},
  TlsAcceptor,
};

use crate::common::{
  identity::TlsIdentity,
  session::{GatewayEndpoint, TlsGatewayConnector},
};

pub type GatewaySession = tokio_rustls::server::TlsStream<TcpStream>;

pub struct TestPki {
  pub ca_cert_pem: String,
  pub client_cert_pem: String,
  pub client_key_pem: String,
  ca_cert_der: Vec<u8>,
  server_cert_der: Vec<u8>,
  server_key_der: Vec<u8>,
}

fn leaf_params(common_name: &str, purpose: ExtendedKeyUsagePurpose) -> CertificateParams {
  let mut params = CertificateParams::new(vec!["localhost".to_string()]);
  params.distinguished_name.push(DnType::CommonName, common_name);
  params.extended_key_usages = vec![purpose];
  params
}

impl TestPki {
  pub fn generate() -> Self {
    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
      .distinguished_name
      .push(DnType::CommonName, "emissary test authority");
    let ca = RcgenCertificate::from_params(ca_params).unwrap();

    let server = RcgenCertificate::from_params(leaf_params(
      "drawbridge test gateway",
      ExtendedKeyUsagePurpose::ServerAuth,
    ))
    .unwrap();
    let client = RcgenCertificate::from_params(leaf_params(
      "emissary test client",
      ExtendedKeyUsagePurpose::ClientAuth,
    ))
    .unwrap();

    Self {
      ca_cert_pem: ca.serialize_pem().unwrap(),
      client_cert_pem: client.serialize_pem_with_signer(&ca).unwrap(),
      client_key_pem: client.serialize_private_key_pem(),
      ca_cert_der: ca.serialize_der().unwrap(),
      server_cert_der: server.serialize_der_with_signer(&ca).unwrap(),
      server_key_der: server.serialize_private_key_der(),
    }
  }

  pub fn client_identity(&self) -> TlsIdentity {
    TlsIdentity::from_pem(
      self.client_cert_pem.as_bytes(),
      self.client_key_pem.as_bytes(),
      self.ca_cert_pem.as_bytes(),
    )
    .unwrap()
  }

  fn server_config(&self) -> ServerConfig {
    let mut client_roots = RootCertStore::empty();
    client_roots
      .add(&Certificate(self.ca_cert_der.clone()))
      .unwrap();
    ServerConfig::builder()
      .with_safe_defaults()
      .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(client_roots).boxed())
      .with_single_cert(
        vec![Certificate(self.server_cert_der.clone())],
        PrivateKey(self.server_key_der.clone()),
      )
      .unwrap()
  }
}

/// Accepts mutual-TLS sessions on loopback and hands each one to the test body
pub struct TestGateway {
  pub addr: SocketAddr,
  sessions: mpsc::UnboundedReceiver<GatewaySession>,
}

impl TestGateway {
  pub async fn spawn(pki: &TestPki) -> Self {
    init_test_logging();
    let acceptor = TlsAcceptor::from(Arc::new(pki.server_config()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sessions_tx, sessions) = mpsc::unbounded_channel();
    tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        let acceptor = acceptor.clone();
        let sessions_tx = sessions_tx.clone();
        tokio::spawn(async move {
          // Handshake failures are the client's concern in these tests
          if let Ok(session) = acceptor.accept(stream).await {
            let _ = sessions_tx.send(session);
          }
        });
      }
    });
    Self { addr, sessions }
  }

  pub async fn next_session(&mut self) -> GatewaySession {
    tokio::time::timeout(Duration::from_secs(10), self.sessions.recv())
      .await
      .expect("no session reached the test gateway in time")
      .expect("test gateway stopped accepting")
  }

  /// A connector that trusts `pki`'s authority and presents its client certificate
  pub fn connector(&self, pki: &TestPki) -> TlsGatewayConnector {
    TlsGatewayConnector::new(
      GatewayEndpoint::new(self.addr.ip().to_string(), self.addr.port()),
      &pki.client_identity(),
      Duration::from_secs(5),
    )
    .unwrap()
    .with_server_name("localhost")
    .unwrap()
  }
}

/// Routes library logs through the test harness; `RUST_LOG` selects levels
pub fn init_test_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// A loopback port with nothing listening on it, at least momentarily
pub async fn unused_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap().port()
}

/// Reads from `stream` until it yields exactly `expected.len()` bytes
pub async fn expect_bytes<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, expected: &[u8]) {
  use tokio::io::AsyncReadExt;
  let mut buf = vec![0u8; expected.len()];
  tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
    .await
    .expect("timed out waiting for bytes")
    .unwrap();
  assert_eq!(
    String::from_utf8_lossy(&buf),
    String::from_utf8_lossy(expected)
  );
}
