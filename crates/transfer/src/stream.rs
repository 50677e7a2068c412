use std::io::Read;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use shipyard_content_hash::{IgnoreRuleSet, Overlay};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ArchiveReader, STREAM_CHUNK_SIZE, TransferError};

/// One piece of the compressed archive, or the error that ended it.
pub type ArchiveChunk = Result<Vec<u8>, std::io::Error>;

/// Async byte stream of a tar.gz archive.
///
/// A blocking worker drives an [`ArchiveReader`] and hands chunks over a
/// channel with room for a single chunk, so packaging runs only as fast as
/// the consumer (usually an HTTP upload body) pulls. Dropping the stream
/// stops the worker at its next chunk.
pub struct ArchiveStream {
    rx: mpsc::Receiver<ArchiveChunk>,
    bytes_sent: Arc<AtomicU64>,
}

impl ArchiveStream {
    /// Compressed bytes handed to the consumer so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Shared counter that keeps reporting after the stream is moved into a request body.
    pub fn bytes_sent_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_sent)
    }
}

impl Stream for ArchiveStream {
    type Item = ArchiveChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        polled
    }
}

/// Starts packaging `roots` in the background and returns the archive as a stream.
///
/// Roots are validated before anything is spawned. Cancelling `cancel`
/// ends the stream with an error wrapping [`TransferError::Cancelled`].
/// Must be called from within a tokio runtime.
pub fn open_archive_stream(
    roots: Vec<PathBuf>,
    ignore: IgnoreRuleSet,
    cancel: CancellationToken,
) -> Result<ArchiveStream, TransferError> {
    let overlay = Overlay::new(roots, ignore)?;
    let (tx, rx) = mpsc::channel(1);

    tokio::task::spawn_blocking(move || produce(ArchiveReader::new(overlay), tx, cancel));

    Ok(ArchiveStream {
        rx,
        bytes_sent: Arc::new(AtomicU64::new(0)),
    })
}

fn produce(mut reader: ArchiveReader, tx: mpsc::Sender<ArchiveChunk>, cancel: CancellationToken) {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            debug!("archive packaging cancelled");
            let _ = tx.blocking_send(Err(TransferError::Cancelled.into()));
            return;
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(
                    files = reader.files_written(),
                    bytes = reader.bytes_out(),
                    "archive stream finished"
                );
                return;
            }
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    debug!("archive consumer went away");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "archive packaging failed");
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}
