// SPDX-License-Identifier: GPL-2.0-or-later

use std::{future::Future, sync::Mutex as StdMutex};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Supervisor for background tasks bound to a single cancellation scope.
///
/// The first error returned by any task is kept and can be awaited with
/// `first_error`. Errors raised after the scope was cancelled are discarded
/// so that shutdown does not report spurious failures.
pub struct RoutinePool<E> {
    token: CancellationToken,
    err_tx: mpsc::UnboundedSender<E>,
    err_rx: Mutex<mpsc::UnboundedReceiver<E>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl<E: Send + 'static> RoutinePool<E> {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            token,
            err_tx,
            err_rx: Mutex::new(err_rx),
            handles: StdMutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns a task that receives the scope's cancellation handle.
    pub fn add<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let token = self.token.clone();
        let err_tx = self.err_tx.clone();
        let fut = task(token.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                if !token.is_cancelled() {
                    _ = err_tx.send(e);
                }
            }
        });
        self.handles
            .lock()
            .expect("mutex poisoned")
            .push(handle);
    }

    /// Yields the first error raised by any added task.
    /// Returns `None` if the pool was closed without an error.
    pub async fn first_error(&self) -> Option<E> {
        self.err_rx.lock().await.recv().await
    }

    /// Cancels the scope and waits for all added tasks.
    pub async fn close(&self) {
        self.token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().expect("mutex poisoned"));
        for handle in handles {
            _ = handle.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_error() {
        let pool: RoutinePool<String> = RoutinePool::new(CancellationToken::new());

        pool.add(|token| async move {
            token.cancelled().await;
            Ok(())
        });
        pool.add(|_| async move { Err("failed".to_owned()) });

        assert_eq!(Some("failed".to_owned()), pool.first_error().await);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_errors_after_cancel_are_discarded() {
        let pool: RoutinePool<String> = RoutinePool::new(CancellationToken::new());

        pool.add(|token| async move {
            token.cancelled().await;
            Err("shutdown noise".to_owned())
        });

        pool.close().await;

        let mut err_rx = pool.err_rx.lock().await;
        assert!(err_rx.try_recv().is_err());
    }
}
