// SPDX-License-Identifier: GPL-2.0-or-later

use bytes::Bytes;
use common::Cancelled;
use std::{collections::VecDeque, sync::Mutex as StdMutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Bounded FIFO of raw segment bytes between the downloader and the
/// processor. Back-pressure comes from the downloader waiting for the
/// queue to drain before fetching the next segment.
pub struct SegmentQueue {
    queue: StdMutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl SegmentQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, segment: Bytes) {
        self.queue
            .lock()
            .expect("mutex poisoned")
            .push_back(segment);
        self.notify.notify_waiters();
    }

    pub async fn pull(&self, token: &CancellationToken) -> Result<Bytes, Cancelled> {
        loop {
            let notified = self.notify.notified();
            if let Some(segment) = self.queue.lock().expect("mutex poisoned").pop_front() {
                self.notify.notify_waiters();
                return Ok(segment);
            }
            tokio::select! {
                () = notified => {}
                () = token.cancelled() => return Err(Cancelled),
            }
        }
    }

    pub async fn wait_until_size_below(
        &self,
        n: usize,
        token: &CancellationToken,
    ) -> Result<(), Cancelled> {
        loop {
            let notified = self.notify.notified();
            if self.queue.lock().expect("mutex poisoned").len() <= n {
                return Ok(());
            }
            tokio::select! {
                () = notified => {}
                () = token.cancelled() => return Err(Cancelled),
            }
        }
    }
}

impl Default for SegmentQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_push_pull() {
        let queue = SegmentQueue::new();
        let token = CancellationToken::new();

        queue.push(Bytes::from_static(b"a"));
        queue.push(Bytes::from_static(b"b"));

        assert_eq!(Bytes::from_static(b"a"), queue.pull(&token).await.unwrap());
        assert_eq!(Bytes::from_static(b"b"), queue.pull(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_blocks_until_push() {
        let queue = Arc::new(SegmentQueue::new());
        let token = CancellationToken::new();

        let queue2 = queue.clone();
        let token2 = token.clone();
        let pending = tokio::spawn(async move { queue2.pull(&token2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        queue.push(Bytes::from_static(b"x"));
        assert_eq!(Bytes::from_static(b"x"), pending.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_pull_cancelled() {
        let queue = SegmentQueue::new();
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(Err(Cancelled), queue.pull(&token).await);
    }

    #[tokio::test]
    async fn test_wait_until_size_below() {
        let queue = Arc::new(SegmentQueue::new());
        let token = CancellationToken::new();

        queue.push(Bytes::from_static(b"a"));
        queue.push(Bytes::from_static(b"b"));

        // Two entries, so a threshold of one blocks.
        let queue2 = queue.clone();
        let token2 = token.clone();
        let pending =
            tokio::spawn(async move { queue2.wait_until_size_below(1, &token2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        _ = queue.pull(&token).await.unwrap();
        pending.await.unwrap().unwrap();
    }
}
