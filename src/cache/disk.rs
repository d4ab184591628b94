//! On-disk overflow tier.
//!
//! Large responses spill to a flat directory of `<fingerprint>.cache` files,
//! each one serialized JSON. Writes go through a temp file and rename so a
//! reader sees the old record or the new one, never a torn file. A byte
//! budget is enforced before every write by evicting the oldest files
//! (last-modified order) until the new record fits.

use super::fingerprint::Fingerprint;
use super::StoredEntry;
use crate::time::epoch_millis;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskError(pub String);

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk tier error: {}", self.0)
    }
}

impl std::error::Error for DiskError {}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for DiskError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

pub struct DiskTier {
    root: PathBuf,
    max_bytes: u64,
    bytes: AtomicU64,
}

impl DiskTier {
    /// Open (creating if needed) the tier directory.
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, DiskError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let tier = Self { root, max_bytes, bytes: AtomicU64::new(0) };
        tier.bytes.store(tier.scan_sync()?, Ordering::Relaxed);
        Ok(tier)
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{fingerprint}.cache"))
    }

    /// Read a record, dropping it if expired. Missing files are a miss, not
    /// an error.
    pub async fn read(&self, fingerprint: &Fingerprint) -> Result<Option<StoredEntry>, DiskError> {
        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: StoredEntry = serde_json::from_slice(&bytes)?;

        if record.created_at + record.ttl_ms <= epoch_millis() {
            let _ = tokio::fs::remove_file(&path).await;
            self.bytes.fetch_sub(bytes.len() as u64, Ordering::Relaxed);
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Persist a record, evicting oldest files first if the budget needs
    /// room. The write lands via temp-file + rename.
    pub async fn write(&self, record: &StoredEntry) -> Result<(), DiskError> {
        let serialized = serde_json::to_vec(record)?;
        self.ensure_budget(serialized.len() as u64).await?;

        let fingerprint = Fingerprint::from_hex(record.fingerprint.clone());
        let path = self.entry_path(&fingerprint);
        let tmp = self.root.join(format!("{}.cache.tmp", record.fingerprint));
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.bytes.fetch_add(serialized.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Remove records whose stringified request matches the predicate.
    pub async fn remove_matching(
        &self,
        predicate: impl Fn(&StoredEntry) -> bool,
    ) -> Result<usize, DiskError> {
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().map_or(true, |ext| ext != "cache") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(record) = serde_json::from_slice::<StoredEntry>(&bytes) else {
                continue;
            };
            if predicate(&record) {
                tokio::fs::remove_file(&path).await?;
                self.bytes.fetch_sub(bytes.len() as u64, Ordering::Relaxed);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), DiskError> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == "cache") {
                tokio::fs::remove_file(&path).await?;
            }
        }
        self.bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Evict oldest-modified files until `incoming` bytes fit the budget.
    async fn ensure_budget(&self, incoming: u64) -> Result<(), DiskError> {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total: u64 = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().map_or(true, |ext| ext != "cache") {
                continue;
            }
            let meta = file.metadata().await?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            files.push((path, meta.len(), modified));
        }

        files.sort_by_key(|(_, _, modified)| *modified);
        let mut files = files.into_iter();
        while total + incoming > self.max_bytes {
            let Some((path, len, _)) = files.next() else { break };
            tokio::fs::remove_file(&path).await?;
            total -= len;
        }
        self.bytes.store(total, Ordering::Relaxed);
        Ok(())
    }

    fn scan_sync(&self) -> Result<u64, DiskError> {
        let mut total = 0;
        for file in std::fs::read_dir(&self.root)? {
            let file = file?;
            if file.path().extension().is_some_and(|ext| ext == "cache") {
                total += file.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl fmt::Debug for DiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskTier")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .field("bytes", &self.bytes())
            .finish()
    }
}

impl DiskTier {
    /// Byte budget ceiling, for the stats surface.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}
