use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::snapshot::IngressSnapshot;

pub type SnapshotSender = watch::Sender<Arc<IngressSnapshot>>;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("snapshot source is closed")]
    Closed,
}

/// Subscription to the desired-state snapshots.
///
/// Owns the receiving side of the snapshot channel and, when it was spawned by
/// [`spawn_ingress_watch`](crate::watch::spawn_ingress_watch), the task feeding it.
pub struct SnapshotFeed {
    receiver: watch::Receiver<Arc<IngressSnapshot>>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotFeed {
    pub fn new(receiver: watch::Receiver<Arc<IngressSnapshot>>) -> Self {
        Self {
            receiver,
            task: None,
        }
    }

    /// Create a channel whose sender publishes snapshots into the returned feed.
    pub fn channel() -> (SnapshotSender, Self) {
        let (sender, receiver) = watch::channel(Arc::new(IngressSnapshot::default()));

        (sender, Self::new(receiver))
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);

        self
    }

    pub fn latest(&self) -> Arc<IngressSnapshot> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next snapshot to reconcile.
    ///
    /// Returns as soon as a new snapshot is published, or the cached one when `resync`
    /// ticks first. Unsynced snapshots are never returned.
    pub async fn next(&mut self, resync: &mut Interval) -> Result<Arc<IngressSnapshot>, FeedError> {
        loop {
            tokio::select! {
                changed = self.receiver.changed() => {
                    if changed.is_err() {
                        warn!("snapshot sender is gone");

                        // keep the caller on its resync schedule instead of spinning
                        resync.tick().await;

                        return Err(FeedError::Closed);
                    }

                    resync.reset();
                }

                _ = resync.tick() => {}
            }

            let snapshot = self.receiver.borrow_and_update().clone();

            if snapshot.is_synced() {
                return Ok(snapshot);
            }

            debug!("snapshot source has not synced yet");
        }
    }

    /// Stop the task feeding this subscription.
    pub fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();

            info!("snapshot watch released");
        }
    }
}

impl Drop for SnapshotFeed {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::snapshot::{IngressEntry, Scheme};

    fn snapshot(version: u64) -> Arc<IngressSnapshot> {
        Arc::new(IngressSnapshot::new(
            version,
            vec![IngressEntry::new("a.example.com", Scheme::Internal, "frontend")],
        ))
    }

    #[tokio::test]
    async fn skip_unsynced_snapshot() {
        let (sender, mut feed) = SnapshotFeed::channel();
        let mut resync = time::interval(Duration::from_millis(20));

        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;

            sender.send(snapshot(1)).unwrap();

            // keep the sender alive until the feed has read it
            time::sleep(Duration::from_millis(200)).await;
        });

        let got = feed.next(&mut resync).await.unwrap();

        assert_eq!(got.version(), 1);
    }

    #[tokio::test]
    async fn resync_returns_cached() {
        let (sender, mut feed) = SnapshotFeed::channel();
        sender.send(snapshot(1)).unwrap();

        let mut resync = time::interval(Duration::from_millis(10));

        let first = feed.next(&mut resync).await.unwrap();
        let second = feed.next(&mut resync).await.unwrap();

        assert_eq!(first.version(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn closed_sender() {
        let (sender, mut feed) = SnapshotFeed::channel();
        drop(sender);

        let mut resync = time::interval(Duration::from_millis(10));

        assert!(matches!(feed.next(&mut resync).await, Err(FeedError::Closed)));
    }
}
