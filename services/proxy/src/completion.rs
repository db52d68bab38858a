//! Completion tracking for asynchronously propagated changes.
//!
//! Backends that apply a change out of band (xDS pushes, DNS rule updates)
//! register a [`Completion`] on the caller's [`WaitGroup`] and signal it once
//! the change has been accepted. The redirect coordinator only passes the
//! wait group along; waiting is up to the caller.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

/// Completion errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The backend rejected the change.
    #[error("completion failed: {0}")]
    Failed(String),

    /// The completion was dropped without being signalled.
    #[error("completion dropped without a result")]
    Abandoned,

    /// Not every completion was signalled in time.
    #[error("timed out waiting for completions")]
    Timeout,
}

/// A single pending acknowledgement.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<(), CompletionError>>,
}

impl Completion {
    /// Signal the outcome. A waiter that already gave up is ignored.
    pub fn complete(self, result: Result<(), CompletionError>) {
        let _ = self.tx.send(result);
    }
}

/// Set of pending completions shared between a caller and the backends.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    pending: Arc<Mutex<Vec<oneshot::Receiver<Result<(), CompletionError>>>>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending completion.
    pub async fn add_completion(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push(rx);
        Completion { tx }
    }

    /// Number of completions registered and not yet waited for.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Wait for every registered completion.
    ///
    /// All completions are awaited; the first failure is returned.
    pub async fn wait(&self) -> Result<(), CompletionError> {
        let receivers = mem::take(&mut *self.pending.lock().await);

        let mut first: Option<CompletionError> = None;
        for rx in receivers {
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(CompletionError::Abandoned),
            };
            if let Err(e) = result {
                first.get_or_insert(e);
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// [`wait`](Self::wait) with an upper bound.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), CompletionError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(CompletionError::Timeout))
    }
}
