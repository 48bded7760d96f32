//! Output stream multiplexer
//!
//! One pump task per backend stream, feeding a single chunk channel. A
//! stream that exhausts its byte budget stops producing chunks but is still
//! read to EOF: the backend must never block on a full pipe, and truncation
//! alone never kills it.

use crucible_core::protocol::{CHUNK_SIZE, OutputChunk, STREAM_BUDGET, StreamKind};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_DEPTH: usize = 32;

/// Handles to the two pump tasks of a running backend.
pub struct StreamMultiplexer {
    stdout: JoinHandle<bool>,
    stderr: JoinHandle<bool>,
}

impl StreamMultiplexer {
    /// Start pumping both streams, returning the chunk channel.
    ///
    /// The channel closes once both streams reach EOF and every buffered
    /// chunk has been received.
    pub fn spawn<O, E>(stdout: O, stderr: E) -> (Self, mpsc::Receiver<OutputChunk>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let stdout = tokio::spawn(pump(StreamKind::Stdout, stdout, tx.clone(), STREAM_BUDGET));
        let stderr = tokio::spawn(pump(StreamKind::Stderr, stderr, tx, STREAM_BUDGET));
        (Self { stdout, stderr }, rx)
    }

    /// Wait for both pumps and report `(stdout_truncated, stderr_truncated)`.
    pub async fn join(self) -> (bool, bool) {
        let stdout = self.stdout.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "stdout pump task failed");
            false
        });
        let stderr = self.stderr.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "stderr pump task failed");
            false
        });
        (stdout, stderr)
    }
}

/// Read `reader` to EOF in chunks of at most [`CHUNK_SIZE`], emitting each
/// chunk until the next one would push the emitted total past `budget`.
/// Returns whether the stream was truncated.
async fn pump<R>(
    stream: StreamKind,
    mut reader: R,
    tx: mpsc::Sender<OutputChunk>,
    budget: usize,
) -> bool
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut emitted = 0usize;
    let mut truncated = false;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "backend stream read failed");
                break;
            }
        };
        if truncated {
            continue;
        }
        if emitted + n > budget {
            truncated = true;
            continue;
        }
        emitted += n;
        let chunk = OutputChunk {
            stream,
            bytes: buf[..n].to_vec(),
        };
        if tx.send(chunk).await.is_err() {
            // receiver gone, the session is already tearing down
            break;
        }
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(rx: &mut mpsc::Receiver<OutputChunk>) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn reads_are_chunked() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 100];
        let len = data.len();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(pump(StreamKind::Stdout, Cursor::new(data), tx, STREAM_BUDGET));
        let chunks = collect(&mut rx).await;
        assert!(!handle.await.unwrap());
        assert!(chunks.iter().all(|c| c.bytes.len() <= CHUNK_SIZE));
        let total: usize = chunks.iter().map(|c| c.bytes.len()).sum();
        assert_eq!(total, len);
    }

    #[tokio::test]
    async fn output_on_the_budget_boundary_is_not_truncated() {
        let data = vec![1u8; 64];
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(pump(StreamKind::Stdout, Cursor::new(data), tx, 64));
        let chunks = collect(&mut rx).await;
        assert!(!handle.await.unwrap());
        assert_eq!(chunks.iter().map(|c| c.bytes.len()).sum::<usize>(), 64);
    }

    #[tokio::test]
    async fn output_past_the_budget_is_truncated_but_drained() {
        // a writer that keeps going long after the budget is spent
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(pump(StreamKind::Stderr, reader, tx, 64));
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for _ in 0..100 {
                writer.write_all(&[0u8; 16]).await.unwrap();
            }
            // writer drops here, closing the stream
        });
        let chunks = collect(&mut rx).await;
        feeder.await.unwrap();
        assert!(handle.await.unwrap());
        let total: usize = chunks.iter().map(|c| c.bytes.len()).sum();
        assert!(total <= 64, "emitted {total} bytes past the budget");
    }

    #[tokio::test]
    async fn both_streams_are_tagged_and_complete() {
        let out = b"to stdout".to_vec();
        let err = b"to stderr".to_vec();
        let (mux, mut rx) =
            StreamMultiplexer::spawn(Cursor::new(out.clone()), Cursor::new(err.clone()));
        let chunks = collect(&mut rx).await;
        assert_eq!(mux.join().await, (false, false));
        let stdout: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .flat_map(|c| c.bytes.clone())
            .collect();
        let stderr: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stderr)
            .flat_map(|c| c.bytes.clone())
            .collect();
        assert_eq!(stdout, out);
        assert_eq!(stderr, err);
    }
}
