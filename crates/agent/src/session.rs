//! StreamSession: the live network state behind one in-flight request.
//!
//! A background task connects and reads the provider stream, surfacing
//! chunks and transport errors through two separate channels. The owner
//! polls both without blocking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshtalk_core::error::ProviderError;
use meshtalk_core::provider::{Provider, ProviderRequest, StreamChunk};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const CHUNK_CAPACITY: usize = 256;

/// Result of one non-blocking poll.
#[derive(Debug, Clone)]
pub enum SessionPoll {
    Chunk(StreamChunk),
    Failed(ProviderError),
    /// The chunk source closed and no error was pending.
    Closed,
    /// Nothing available yet.
    Pending,
}

pub struct StreamSession {
    id: u64,
    chunks: mpsc::Receiver<StreamChunk>,
    errors: mpsc::Receiver<ProviderError>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started: Instant,
}

impl StreamSession {
    /// Start the background task for `request`. Must be called from within
    /// a tokio runtime.
    pub fn open(id: u64, provider: Arc<dyn Provider>, request: ProviderRequest) -> Self {
        let (chunk_tx, chunks) = mpsc::channel(CHUNK_CAPACITY);
        let (error_tx, errors) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut rx = match provider.stream(request, token.clone()).await {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = error_tx.send(e).await;
                    return;
                }
            };
            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    item = rx.recv() => item,
                };
                match item {
                    Some(Ok(chunk)) => {
                        if chunk_tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        // Sent before the chunk sender drops, so a closed
                        // chunk source always finds it.
                        let _ = error_tx.send(e).await;
                        return;
                    }
                    None => return,
                }
            }
        });
        debug!(session = id, "Stream session opened");

        Self {
            id,
            chunks,
            errors,
            cancel,
            task,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the request was dispatched.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Poll both sources without waiting, chunks first.
    ///
    /// When the chunk source has closed, the error source is drained once
    /// so a transport failure is never reported as a clean finish.
    pub fn poll(&mut self) -> SessionPoll {
        match self.chunks.try_recv() {
            Ok(chunk) => SessionPoll::Chunk(chunk),
            Err(TryRecvError::Empty) => match self.errors.try_recv() {
                Ok(e) => SessionPoll::Failed(e),
                Err(_) => SessionPoll::Pending,
            },
            Err(TryRecvError::Disconnected) => match self.errors.try_recv() {
                Ok(e) => SessionPoll::Failed(e),
                Err(_) => SessionPoll::Closed,
            },
        }
    }

    /// Stop the background task; pending frames are discarded.
    pub fn cancel(self) {
        trace!(
            session = self.id,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Stream session cancelled"
        );
        // Drop does the work.
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
