//! Reader and writer loops for one live connection.
//!
//! ```text
//!   socket ──read()──► FrameDecoder ──► handler(envelope)     (reader task)
//!   outbound queue ──► write_all() ──► socket                 (writer task)
//! ```

use std::future::Future;

use chat_core::{Envelope, FrameDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::application::connection_state::ConnectionError;

const READ_CHUNK: usize = 16 * 1024;

/// Reads envelopes until the stream ends, fails, or `handle` returns an error.
///
/// Returns the reason the loop stopped.  Frames rejected with a recoverable
/// protocol error (checksum mismatch, unknown type) are dropped and reading
/// continues; a corrupt stream stops the loop.
pub async fn read_loop<R, F, Fut>(mut reader: R, mut handle: F) -> ConnectionError
where
    R: AsyncRead + Unpin,
    F: FnMut(Envelope) -> Fut,
    Fut: Future<Output = Result<(), ConnectionError>>,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("peer closed the connection");
                return ConnectionError::Closed;
            }
            Ok(n) => n,
            Err(e) => return ConnectionError::Io(e.to_string()),
        };
        trace!("read {n} bytes");
        decoder.extend(&chunk[..n]);

        loop {
            match decoder.next_envelope() {
                Ok(Some(env)) => {
                    if let Err(e) = handle(env).await {
                        return e;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return ConnectionError::Framing(e),
            }
        }
    }
}

/// Writes queued frames in order until the queue closes or a write fails.
///
/// # Errors
///
/// Returns the I/O error that stopped the loop.
pub async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
