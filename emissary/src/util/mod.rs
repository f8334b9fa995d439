// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Copies `reader` into `writer` until end-of-stream, then shuts `writer` down
/// so the far peer observes the half-close.
///
/// Once `opposite_done` fires, this direction only keeps going while data
/// arrives; a read idle for `linger` ends it as if end-of-stream was reached.
/// `done` fires when this direction stops, however it stops.
async fn copy_then_shutdown<R, W>(
  reader: &mut R,
  writer: &mut W,
  linger: Duration,
  done: &CancellationToken,
  opposite_done: &CancellationToken,
) -> Result<u64, std::io::Error>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  let _done = done.clone().drop_guard();
  let mut buffer = vec![0u8; PROXY_BUFFER_CAPACITY];
  let mut copied = 0u64;
  loop {
    let read = if opposite_done.is_cancelled() {
      match tokio::time::timeout(linger, reader.read(&mut buffer)).await {
        Ok(read) => read?,
        Err(_idle) => {
          tracing::trace!(?linger, "opposite direction closed and this one went idle");
          break;
        }
      }
    } else {
      tokio::select! {
        read = reader.read(&mut buffer) => read?,
        // Re-enter the loop to start lingering; `read` is cancel-safe
        _ = opposite_done.cancelled() => continue,
      }
    };
    if read == 0 {
      break;
    }
    writer.write_all(&buffer[..read]).await?;
    writer.flush().await?;
    copied += read as u64;
  }
  if let Err(error) = writer.shutdown().await {
    // The peer already went away; the opposite direction will see it too
    tracing::trace!(%error, "shutdown after end-of-stream failed");
  }
  Ok(copied)
}

/// Proxies two duplex streams, each given as its (sender, reader) halves.
///
/// End-of-stream in one direction half-closes the opposite sender. The other
/// direction keeps flowing for as long as bytes arrive within `linger` of
/// each other, then is shut down as well, so a peer that never closes its
/// side cannot hold the proxy open. An error in either direction ends the
/// whole proxy; the caller drops both streams, which unblocks the far peers.
///
/// Returns bytes copied `(a -> b, b -> a)`.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_generic_tokio_streams<
  SenderA: AsyncWrite + Unpin,
  ReaderA: AsyncRead + Unpin,
  SenderB: AsyncWrite + Unpin,
  ReaderB: AsyncRead + Unpin,
>(
  a: (&mut SenderA, &mut ReaderA),
  b: (&mut SenderB, &mut ReaderB),
  linger: Duration,
) -> Result<(u64, u64), std::io::Error> {
  let (sender_a, reader_a) = a;
  let (sender_b, reader_b) = b;
  let a2b_done = CancellationToken::new();
  let b2a_done = CancellationToken::new();
  let proxy_a2b = copy_then_shutdown(reader_a, sender_b, linger, &a2b_done, &b2a_done);
  let proxy_b2a = copy_then_shutdown(reader_b, sender_a, linger, &b2a_done, &a2b_done);
  tracing::trace!("polling");
  match futures::future::try_join(proxy_a2b, proxy_b2a).await {
    Ok((a_to_b, b_to_a)) => Ok((a_to_b, b_to_a)),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}
