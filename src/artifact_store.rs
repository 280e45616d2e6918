use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PARTIAL_SUFFIX: &str = ".part";
const MAX_FILE_NAME_CHARS: usize = 255;
const FALLBACK_FILE_NAME: &str = "upload.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: ArtifactId,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    path: PathBuf,
}

impl Artifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found")]
    NotFound,
    #[error("content exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("upload interrupted: {0}")]
    Upload(String),
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry of stored artifacts. Content lives in one file per artifact under
/// `root`, named by its id; metadata lives only in memory.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    max_bytes: u64,
    entries: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl ArtifactStore {
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        ensure_storage_root(&root).await?;
        let swept = sweep_orphans(&root).await?;
        if swept > 0 {
            info!(root = %root.display(), swept, "Removed orphaned artifact files");
        }
        Ok(Self {
            root,
            max_bytes,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Streams `content` to disk and registers it once fully written. Nothing
    /// is registered, and no file is left behind, when the stream fails.
    pub async fn put_stream<S, B, E>(
        &self,
        file_name: &str,
        retention: Duration,
        content: S,
    ) -> Result<Artifact, StoreError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let id = ArtifactId::generate();
        let final_path = self.root.join(id.to_string());
        let part_path = self.root.join(format!("{id}{PARTIAL_SUFFIX}"));

        let size_bytes = match write_stream(&part_path, content, self.max_bytes).await {
            Ok(size) => size,
            Err(err) => {
                discard_partial(&part_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&part_path, &final_path).await {
            discard_partial(&part_path).await;
            return Err(err.into());
        }

        let created_at = Utc::now();
        let expires_at = ChronoDuration::from_std(retention)
            .ok()
            .and_then(|retention| created_at.checked_add_signed(retention))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let artifact = Artifact {
            id,
            file_name: sanitize_file_name(file_name),
            created_at,
            expires_at,
            size_bytes,
            path: final_path,
        };

        {
            let mut entries = self.entries.write().await;
            entries.insert(id, artifact.clone());
        }

        info!(
            artifact_id = %id,
            file_name = %artifact.file_name,
            size_bytes,
            expires_at = %expires_at,
            "Artifact stored"
        );
        Ok(artifact)
    }

    pub async fn put_bytes(
        &self,
        file_name: &str,
        retention: Duration,
        content: Vec<u8>,
    ) -> Result<Artifact, StoreError> {
        let chunks = tokio_stream::once(Ok::<_, Infallible>(content));
        self.put_stream(file_name, retention, chunks).await
    }

    pub async fn metadata(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|artifact| !artifact.is_expired_at(Utc::now()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Returns the artifact with an open handle on its content. The registry
    /// lock is released before the handle is returned, so callers may stream
    /// for as long as they like.
    pub async fn get(&self, id: &ArtifactId) -> Result<(Artifact, fs::File), StoreError> {
        let artifact = self.metadata(id).await?;
        match fs::File::open(&artifact.path).await {
            Ok(file) => Ok((artifact, file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Registry membership, regardless of expiry.
    pub async fn contains(&self, id: &ArtifactId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Unregisters the artifact and removes its file. When the file cannot be
    /// removed the entry is restored, so a later delete can retry.
    pub async fn delete(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        let mut entries = self.entries.write().await;
        let artifact = entries.remove(id).ok_or(StoreError::NotFound)?;

        if let Err(err) = delete_file_if_exists(&artifact.path).await {
            warn!(artifact_id = %id, "Failed to remove artifact file: {err}");
            entries.insert(*id, artifact);
            return Err(err.into());
        }
        drop(entries);

        debug!(artifact_id = %id, "Artifact deleted");
        Ok(artifact)
    }
}

async fn write_stream<S, B, E>(path: &Path, content: S, limit: u64) -> Result<u64, StoreError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut file = fs::File::create(path).await?;
    let mut written: u64 = 0;

    tokio::pin!(content);
    while let Some(chunk) = content.next().await {
        let chunk = chunk.map_err(|err| StoreError::Upload(err.to_string()))?;
        let bytes = chunk.as_ref();
        written += bytes.len() as u64;
        if written > limit {
            return Err(StoreError::TooLarge { limit });
        }
        file.write_all(bytes).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn discard_partial(path: &Path) {
    if let Err(err) = delete_file_if_exists(path).await {
        warn!("Failed to remove partial upload {}: {err}", path.display());
    }
}

pub async fn ensure_storage_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create storage root at {}", path.display()))
}

async fn sweep_orphans(root: &Path) -> Result<usize> {
    let mut swept = 0;
    let mut dir = fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to list storage root {}", root.display()))?;

    while let Some(entry) = dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        if !file_type.is_file() || !is_artifact_file_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        delete_file_if_exists(&entry.path())
            .await
            .with_context(|| format!("Failed to delete {}", entry.path().display()))?;
        swept += 1;
    }

    Ok(swept)
}

fn is_artifact_file_name(name: &str) -> bool {
    let stem = name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(name);
    stem.parse::<ArtifactId>().is_ok()
}

pub async fn delete_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;

    async fn open_store(root: &Path) -> ArtifactStore {
        ArtifactStore::open(root, 1024).await.expect("open store")
    }

    async fn read_all(mut file: fs::File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.expect("read");
        buf
    }

    fn file_count(root: &Path) -> usize {
        std::fs::read_dir(root).expect("read dir").count()
    }

    #[tokio::test]
    async fn put_then_get_returns_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let artifact = store
            .put_bytes("a.txt", Duration::from_secs(60), b"0123456789".to_vec())
            .await
            .expect("put");
        assert_eq!(artifact.size_bytes, 10);
        assert_eq!(artifact.file_name, "a.txt");
        assert!(artifact.expires_at > artifact.created_at);

        let (meta, file) = store.get(&artifact.id).await.expect("get");
        assert_eq!(meta.id, artifact.id);
        assert_eq!(read_all(file).await, b"0123456789");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let artifact = store
            .put_bytes("a.txt", Duration::from_secs(60), b"hello".to_vec())
            .await
            .expect("put");

        store.delete(&artifact.id).await.expect("first delete");
        assert!(matches!(store.delete(&artifact.id).await, Err(StoreError::NotFound)));
        assert!(matches!(store.get(&artifact.id).await, Err(StoreError::NotFound)));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn failed_unlink_keeps_artifact_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let artifact = store
            .put_bytes("a.txt", Duration::from_secs(60), b"hello".to_vec())
            .await
            .expect("put");

        // A directory in place of the file makes the unlink fail.
        std::fs::remove_file(&artifact.path).expect("remove file");
        std::fs::create_dir(&artifact.path).expect("create dir");

        assert!(matches!(store.delete(&artifact.id).await, Err(StoreError::Io(_))));
        assert!(store.contains(&artifact.id).await);
        assert!(store.metadata(&artifact.id).await.is_ok());

        std::fs::remove_dir_all(&artifact.path).expect("clear dir");
        store.delete(&artifact.id).await.expect("retry delete");
        assert!(!store.contains(&artifact.id).await);
    }

    #[tokio::test]
    async fn expired_artifact_is_not_found_before_removal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let artifact = store
            .put_bytes("a.txt", Duration::from_millis(100), b"hello".to_vec())
            .await
            .expect("put");

        assert!(store.get(&artifact.id).await.is_ok());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(store.get(&artifact.id).await, Err(StoreError::NotFound)));
        assert!(matches!(store.metadata(&artifact.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn oversized_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path(), 8).await.expect("open");

        let chunks = tokio_stream::iter(vec![
            Ok::<_, Infallible>(vec![1u8; 5]),
            Ok(vec![2u8; 5]),
        ]);
        let result = store.put_stream("big.bin", Duration::from_secs(60), chunks).await;

        assert!(matches!(result, Err(StoreError::TooLarge { limit: 8 })));
        assert_eq!(store.len().await, 0);
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn interrupted_upload_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let chunks = tokio_stream::iter(vec![
            Ok(b"first half".to_vec()),
            Err("client went away"),
        ]);
        let result = store.put_stream("a.txt", Duration::from_secs(60), chunks).await;

        assert!(matches!(result, Err(StoreError::Upload(msg)) if msg == "client went away"));
        assert_eq!(store.len().await, 0);
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn concurrent_puts_get_distinct_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(dir.path()).await);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .put_bytes(&format!("{i}.txt"), Duration::from_secs(60), vec![i as u8])
                        .await
                        .expect("put")
                        .id
                })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.expect("join"));
        }
        assert_eq!(ids.len(), 32);
        assert_eq!(store.len().await, 32);
    }

    #[tokio::test]
    async fn concurrent_gets_see_identical_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(dir.path()).await);
        let id = store
            .put_bytes("a.txt", Duration::from_secs(60), b"shared payload".to_vec())
            .await
            .expect("put")
            .id;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let (_, file) = store.get(&id).await.expect("get");
                    read_all(file).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.expect("join"), b"shared payload");
        }
    }

    #[tokio::test]
    async fn open_handle_survives_concurrent_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let artifact = store
            .put_bytes("a.txt", Duration::from_secs(60), b"still readable".to_vec())
            .await
            .expect("put");

        let (_, file) = store.get(&artifact.id).await.expect("get");
        store.delete(&artifact.id).await.expect("delete");

        assert_eq!(read_all(file).await, b"still readable");
        assert!(matches!(store.get(&artifact.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn open_sweeps_orphans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = ArtifactId::generate();
        std::fs::write(dir.path().join(stale.to_string()), b"old").expect("write");
        std::fs::write(dir.path().join(format!("{stale}.part")), b"old").expect("write");
        std::fs::write(dir.path().join("README"), b"keep me").expect("write");

        let store = open_store(dir.path()).await;

        assert_eq!(store.len().await, 0);
        assert_eq!(file_count(dir.path()), 1);
        assert!(dir.path().join("README").exists());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\report.csv"), "report.csv");
        assert_eq!(sanitize_file_name("we\"ird\nname.txt"), "weirdname.txt");
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("dir/.."), FALLBACK_FILE_NAME);
    }

    #[test]
    fn artifact_id_round_trips_through_display() {
        let id = ArtifactId::generate();
        assert_eq!(id.to_string().parse::<ArtifactId>().expect("parse"), id);
        assert!("not-a-uuid".parse::<ArtifactId>().is_err());
    }
}
