// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::common::{
  protocol::{decode_directory, Command, DecodeError, Directory},
  retry::{RetryError, RetryPolicy},
  session::{GatewayConnector, SessionError},
};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
  #[error(transparent)]
  Session(#[from] SessionError),
  #[error("failed sending directory request: {0}")]
  Request(#[source] std::io::Error),
  #[error("failed reading directory response: {0}")]
  Response(#[source] std::io::Error),
  #[error("gateway closed the session without sending a directory")]
  NoResponse,
  #[error("malformed directory response: {0}")]
  Decode(#[from] DecodeError),
}

/// Fetches the protected service directory over one fresh session.
///
/// An empty list is a valid answer. Individually malformed tokens are logged
/// and returned in [`Directory::rejected`] without failing the fetch.
/// Failures are returned to the caller, who owns any retrying; see
/// [fetch_services_with_retry].
pub async fn fetch_services<C: GatewayConnector + ?Sized>(
  connector: &C,
  buffer_size: usize,
) -> Result<Directory, DirectoryError> {
  let mut session = connector.connect().await?;
  let res = request_directory(&mut session, buffer_size).await;
  if let Err(error) = session.shutdown().await {
    tracing::trace!(%error, "directory session shutdown failed");
  }
  let directory = res?;
  for rejected in &directory.rejected {
    tracing::warn!(error = %rejected, "Skipping malformed Protected Service");
  }
  tracing::info!(
    count = directory.services.len(),
    rejected = directory.rejected.len(),
    "Fetched protected service directory"
  );
  Ok(directory)
}

async fn request_directory<S>(
  session: &mut S,
  buffer_size: usize,
) -> Result<Directory, DirectoryError>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
  Command::ListServices
    .write_to(session)
    .await
    .map_err(DirectoryError::Request)?;
  let mut buffer = vec![0u8; buffer_size];
  let read = session
    .read(&mut buffer)
    .await
    .map_err(DirectoryError::Response)?;
  if read == 0 {
    return Err(DirectoryError::NoResponse);
  }
  tracing::debug!(bytes = read, "directory response received");
  Ok(decode_directory(&buffer[..read])?)
}

/// Repeats [fetch_services] on `policy`'s fixed delay until it succeeds.
///
/// A response malformed as a whole is retried like any session failure.
pub async fn fetch_services_with_retry<C: GatewayConnector + ?Sized>(
  connector: &C,
  buffer_size: usize,
  policy: &RetryPolicy,
  shutdown: &CancellationToken,
) -> Result<Directory, RetryError<DirectoryError>> {
  policy
    .run("fetch_services", shutdown, move |_attempt| {
      fetch_services(connector, buffer_size)
    })
    .await
}
