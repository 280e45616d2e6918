//! Deferred, cancellable deletion of stored artifacts.
//!
//! Each scheduled deletion is a lightweight tokio task parked on a timer, so
//! any number of pending expirations can coexist without tying up threads.
//! A deletion can be cancelled until its timer fires; from then on it runs to
//! completion.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact_store::{ArtifactId, ArtifactStore, StoreError};

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug)]
struct PendingDeletion {
    generation: u64,
    fire_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    store: Arc<ArtifactStore>,
    pending: Arc<Mutex<HashMap<ArtifactId, PendingDeletion>>>,
    generations: Arc<AtomicU64>,
}

impl ExpiryScheduler {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arranges for `id` to be deleted at `fire_at`, replacing any deletion
    /// already pending for it. A `fire_at` in the past fires right away.
    ///
    /// Callers that delete artifacts must remove them from the store before
    /// calling [`cancel`](Self::cancel); with that ordering an artifact deleted
    /// while this call runs never leaves a timer behind.
    pub async fn schedule(&self, id: ArtifactId, fire_at: DateTime<Utc>) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut pending = self.pending.lock().await;
            let replaced = pending.insert(
                id,
                PendingDeletion {
                    generation,
                    fire_at,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = replaced {
                previous.cancel.cancel();
            }
        }

        if !self.store.contains(&id).await {
            self.discard(&id, generation).await;
            debug!(artifact_id = %id, "Artifact gone before its deletion was scheduled");
            return;
        }

        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        debug!(artifact_id = %id, delay_ms = delay.as_millis() as u64, "Deletion scheduled");

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            scheduler.fire(id, generation).await;
        });
    }

    /// Returns `true` when a pending deletion was cancelled before it fired.
    pub async fn cancel(&self, id: &ArtifactId) -> bool {
        let removed = self.pending.lock().await.remove(id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(artifact_id = %id, "Scheduled deletion cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn fire_time(&self, id: &ArtifactId) -> Option<DateTime<Utc>> {
        self.pending.lock().await.get(id).map(|entry| entry.fire_at)
    }

    /// Cancels every pending deletion. Files stay on disk until the next
    /// startup sweep.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        info!(cancelled = drained.len(), "Expiry scheduler stopped");
    }

    async fn discard(&self, id: &ArtifactId, generation: u64) {
        let mut pending = self.pending.lock().await;
        if pending.get(id).is_some_and(|entry| entry.generation == generation) {
            if let Some(entry) = pending.remove(id) {
                entry.cancel.cancel();
            }
        }
    }

    async fn fire(&self, id: ArtifactId, generation: u64) {
        {
            let mut pending = self.pending.lock().await;
            match pending.get(&id) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&id);
                }
                // Cancelled or superseded after the timer elapsed.
                _ => return,
            }
        }

        match self.store.delete(&id).await {
            Ok(artifact) => {
                info!(
                    artifact_id = %id,
                    file_name = %artifact.file_name,
                    "Expired artifact removed"
                );
            }
            Err(StoreError::NotFound) => {
                debug!(artifact_id = %id, "Expired artifact already gone");
            }
            Err(err) => {
                warn!(artifact_id = %id, "Failed to remove expired artifact: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    async fn setup(root: &std::path::Path) -> (Arc<ArtifactStore>, ExpiryScheduler) {
        let store = Arc::new(ArtifactStore::open(root, 1024).await.expect("open store"));
        let scheduler = ExpiryScheduler::new(Arc::clone(&store));
        (store, scheduler)
    }

    async fn put(store: &ArtifactStore, retention: Duration) -> ArtifactId {
        store
            .put_bytes("a.txt", retention, b"0123456789".to_vec())
            .await
            .expect("put")
            .id
    }

    #[tokio::test]
    async fn deletes_at_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_millis(300)).await;
        let expires_at = store.metadata(&id).await.expect("metadata").expires_at;

        scheduler.schedule(id, expires_at).await;
        assert_eq!(scheduler.pending_count().await, 1);
        assert_eq!(scheduler.fire_time(&id).await, Some(expires_at));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(store.len().await, 0);
        assert_eq!(scheduler.pending_count().await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn past_fire_time_deletes_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_secs(60)).await;

        scheduler
            .schedule(id, Utc::now() - ChronoDuration::seconds(30))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn cancelled_deletion_never_fires() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_secs(60)).await;

        scheduler
            .schedule(id, Utc::now() + ChronoDuration::milliseconds(200))
            .await;
        assert!(scheduler.cancel(&id).await);
        assert!(!scheduler.cancel(&id).await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.metadata(&id).await.is_ok());
    }

    #[tokio::test]
    async fn firing_after_explicit_delete_is_harmless() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_secs(60)).await;

        scheduler
            .schedule(id, Utc::now() + ChronoDuration::milliseconds(100))
            .await;
        store.delete(&id).await.expect("delete");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.pending_count().await, 0);
        assert!(matches!(store.delete(&id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn scheduling_a_deleted_artifact_leaves_nothing_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_secs(60)).await;
        let expires_at = store.metadata(&id).await.expect("metadata").expires_at;

        store.delete(&id).await.expect("delete");
        scheduler.cancel(&id).await;
        scheduler.schedule(id, expires_at).await;

        assert_eq!(scheduler.pending_count().await, 0);
        assert!(scheduler.fire_time(&id).await.is_none());
    }

    #[tokio::test]
    async fn rescheduling_keeps_one_pending_deletion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;
        let id = put(&store, Duration::from_secs(60)).await;

        scheduler
            .schedule(id, Utc::now() + ChronoDuration::milliseconds(100))
            .await;
        let later = Utc::now() + ChronoDuration::seconds(60);
        scheduler.schedule(id, later).await;
        assert_eq!(scheduler.pending_count().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.metadata(&id).await.is_ok());
        assert_eq!(scheduler.fire_time(&id).await, Some(later));
    }

    #[tokio::test]
    async fn many_pending_expirations_coexist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, scheduler) = setup(dir.path()).await;

        let far = Utc::now() + ChronoDuration::hours(24);
        for i in 0..200 {
            let id = store
                .put_bytes(&format!("{i}.txt"), Duration::from_secs(86_400), vec![1])
                .await
                .expect("put")
                .id;
            scheduler.schedule(id, far).await;
        }
        assert_eq!(scheduler.pending_count().await, 200);

        scheduler.shutdown().await;
        assert_eq!(scheduler.pending_count().await, 0);
        assert_eq!(store.len().await, 200);
    }
}
