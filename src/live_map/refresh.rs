//! Trailing-edge reload queue.
//!
//! Bursts of change notifications collapse into one reload. The queue holds
//! at most one pending request: requests that arrive while a reload is in
//! flight mark a single trailing run, which starts once the current one
//! finishes and the debounce window passes again. Reloads never overlap.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Cloneable request side of a [`RefreshQueue`].
#[derive(Clone, Debug)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Ask for a reload. Returns false when one is already pending.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Owns the reload task; dropping the queue stops it.
#[derive(Debug)]
pub struct RefreshQueue {
    handle: RefreshHandle,
    task: JoinHandle<()>,
}

impl RefreshQueue {
    pub fn spawn<F, Fut>(debounce: Duration, mut reload: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                // Anything queued during the window is covered by this run.
                while rx.try_recv().is_ok() {}
                trace!("refresh queue running reload");
                reload().await;
            }
        });
        Self { handle: RefreshHandle { tx }, task }
    }

    #[must_use]
    pub fn handle(&self) -> RefreshHandle {
        self.handle.clone()
    }

    pub fn request(&self) -> bool {
        self.handle.request()
    }
}

impl Drop for RefreshQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "refresh_test.rs"]
mod tests;
