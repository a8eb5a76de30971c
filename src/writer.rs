//! Dedicated writer task for outbound frames.
//!
//! Each open channel gets one writer task that owns the transport sink and
//! receives frames via an mpsc channel. The request queue dispatches while
//! holding its lock, so handing a frame off must never await; the unbounded
//! sender gives us that.
//!
//! # Architecture
//!
//! ```text
//! RequestQueue ─► mpsc::UnboundedSender<String> ─► Writer Task ─► FrameSink
//! ```
//!
//! Frames that are ready together are fed to the sink back to back and
//! flushed once.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use tokio::sync::mpsc;

use crate::error::{DspError, Result};
use crate::transport::FrameSink;

/// Maximum frames to feed before a flush.
const MAX_BATCH_SIZE: usize = 16;

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. Sending never waits.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::UnboundedSender<String>,
    /// Frames handed off but not yet flushed.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Hand a frame to the writer task.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the writer task has stopped.
    pub fn send(&self, frame: String) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            DspError::Transport("writer task stopped".to_string())
        })
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create the writer task for `sink`.
///
/// Returns the handle and the task future; the caller decides where to spawn
/// it and what to do when it fails. The future completes with `Ok(())` once
/// every handle is dropped, or with the first sink error.
pub fn writer_task(sink: FrameSink) -> (WriterHandle, impl Future<Output = Result<()>> + Send) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };

    (handle, writer_loop(rx, sink, pending))
}

/// Main writer loop - receives frames and writes them to the sink.
async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut sink: FrameSink,
    pending: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        // Wait for first frame
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                // All handles dropped, clean shutdown
                let _ = sink.close().await;
                return Ok(());
            }
        };

        sink.feed(first).await?;
        let mut batch_size = 1;

        // Collect additional ready frames (non-blocking)
        while batch_size < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    sink.feed(frame).await?;
                    batch_size += 1;
                }
                Err(_) => break,
            }
        }

        sink.flush().await?;
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}
