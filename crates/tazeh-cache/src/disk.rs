use crate::entry::{CacheEntry, CacheKey, EntryMeta, Generation, Response};
use crate::error::StorageError;
use crate::store::{CacheStore, MetaPredicate, SweepSummary};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";

/// Header line of an entry file. The raw body follows the `\n`.
#[derive(Serialize, Deserialize)]
struct DiskMeta {
    key: CacheKey,
    generation: Generation,
    stored_at_ms: u64,
    status: u16,
    headers: Vec<(String, String)>,
}

/// Durable store with one file per entry.
///
/// Files are named by the SHA-256 of the key. Each holds a single line of
/// compact JSON metadata followed by the raw body. Writes land in a unique
/// temporary file first and are renamed into place, so a reader sees either
/// the old entry or the new one.
pub struct DiskStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Temporary files left behind by a crash mid-write are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut dir = fs::read_dir(&root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if has_ext(&path, TMP_EXT) {
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!(error = %e, path = %path.display(), "failed to remove stale temp file");
                }
            }
        }

        tracing::info!(root = %root.display(), "disk store opened");
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{ENTRY_EXT}", digest_hex(key)))
    }

    fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}.{}.{n}.{TMP_EXT}",
            digest_hex(key),
            std::process::id()
        ))
    }
}

fn digest_hex(key: &CacheKey) -> String {
    let digest = Sha256::digest(key.as_str().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn encode(entry: &CacheEntry) -> Result<Vec<u8>, StorageError> {
    let stored_at_ms = entry
        .stored_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let meta = DiskMeta {
        key: entry.key.clone(),
        generation: entry.generation.clone(),
        stored_at_ms,
        status: entry.response.status,
        headers: entry.response.headers.clone(),
    };

    // Compact JSON escapes newlines, so the first `\n` always ends the header.
    let mut buf = serde_json::to_vec(&meta)?;
    buf.push(b'\n');
    buf.extend_from_slice(&entry.response.body);
    Ok(buf)
}

fn corrupt(path: &Path, reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_meta(path: &Path, line: &[u8]) -> Result<DiskMeta, StorageError> {
    serde_json::from_slice(line).map_err(|e| corrupt(path, e))
}

fn decode(path: &Path, raw: Bytes) -> Result<CacheEntry, StorageError> {
    let split = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| corrupt(path, "missing metadata terminator"))?;
    let meta = parse_meta(path, &raw[..split])?;

    Ok(CacheEntry {
        key: meta.key,
        response: Response {
            status: meta.status,
            headers: meta.headers,
            body: raw.slice(split + 1..),
        },
        stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_ms),
        generation: meta.generation,
    })
}

/// Read only the header line of an entry file. `Ok(None)` if it vanished.
async fn read_meta(path: &Path) -> Result<Option<EntryMeta>, StorageError> {
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len() as usize;

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    if line.pop() != Some(b'\n') {
        return Err(corrupt(path, "missing metadata terminator"));
    }
    let meta = parse_meta(path, &line)?;

    Ok(Some(EntryMeta {
        key: meta.key,
        generation: meta.generation,
        stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_ms),
        size,
    }))
}

enum Walk {
    Start(PathBuf),
    Reading(fs::ReadDir),
    Done,
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StorageError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = decode(&path, raw)?;
        if &entry.key != key {
            tracing::warn!(key = %key, stored = %entry.key, "disk entry key mismatch");
            return Ok(None);
        }
        Ok(Some(Arc::new(entry)))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let buf = encode(&entry)?;
        let tmp = self.tmp_path(&entry.key);
        let path = self.entry_path(&entry.key);

        if let Err(e) = fs::write(&tmp, &buf).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StorageError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_where(&self, predicate: MetaPredicate<'_>) -> Result<SweepSummary, StorageError> {
        let mut summary = SweepSummary::default();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if !has_ext(&path, ENTRY_EXT) {
                continue;
            }

            match read_meta(&path).await {
                Ok(Some(meta)) if predicate(&meta) => {}
                Ok(_) => continue,
                // Unreadable entries can never be served, drop them too.
                Err(StorageError::Corrupt { reason, .. }) => {
                    tracing::warn!(path = %path.display(), reason = %reason, "removing corrupt cache entry");
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to read cache entry, skipping");
                    summary.failed += 1;
                    continue;
                }
            }

            match fs::remove_file(&path).await {
                Ok(()) => summary.removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to delete cache entry, skipping");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    fn keys(&self) -> BoxStream<'_, Result<EntryMeta, StorageError>> {
        stream::unfold(Walk::Start(self.root.clone()), |state| async move {
            let mut dir = match state {
                Walk::Start(root) => match fs::read_dir(&root).await {
                    Ok(dir) => dir,
                    Err(e) => return Some((Err(e.into()), Walk::Done)),
                },
                Walk::Reading(dir) => dir,
                Walk::Done => return None,
            };

            loop {
                let path = match dir.next_entry().await {
                    Ok(Some(dirent)) => dirent.path(),
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), Walk::Done)),
                };
                if !has_ext(&path, ENTRY_EXT) {
                    continue;
                }
                match read_meta(&path).await {
                    Ok(Some(meta)) => return Some((Ok(meta), Walk::Reading(dir))),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), Walk::Reading(dir))),
                }
            }
        })
        .boxed()
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
