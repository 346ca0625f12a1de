//! Bounded on-disk content cache
//!
//! Media referenced by snapshots is downloaded once, verified against its
//! declared SHA-256 when known, and served to the renderer from local
//! files. The cache is bounded by a byte capacity with least-recently-used
//! eviction; entries currently on screen are pinned and never evicted.
//!
//! Concurrent `add` calls for the same media id collapse onto one shared
//! in-flight future, so a playlist referencing the same media from several
//! items downloads it exactly once.

pub mod download;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hexmon_common::model::TimelineItem;
use hexmon_common::{Error, Result};

use download::{extension_from_url, sanitize_media_id, DownloadError};

type DownloadFuture = Shared<BoxFuture<'static, std::result::Result<PathBuf, DownloadError>>>;

/// Entry lifecycle in the cache index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// File present and verified (or verification not requested)
    Ready,
    /// File failed integrity verification; kept aside for diagnosis and
    /// evicted before any ready entry
    Quarantined,
}

/// One cached media object
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub media_id: String,
    pub sha256: Option<String>,
    pub size: u64,
    pub last_used_at: DateTime<Utc>,
    pub local_path: PathBuf,
    pub status: EntryStatus,
}

/// Aggregate cache counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

/// Content cache manager
///
/// The in-memory index is the single source of truth at runtime; it is
/// rebuilt from a directory scan on startup.
pub struct CacheManager {
    media_dir: PathBuf,
    max_bytes: u64,
    prefetch_concurrency: usize,
    client: reqwest::Client,
    index: Mutex<HashMap<String, CacheEntry>>,
    now_playing: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, DownloadFuture>>,
}

impl CacheManager {
    pub fn new(cache_dir: &Path, max_bytes: u64, prefetch_concurrency: usize) -> Result<Self> {
        let media_dir = cache_dir.join("media");
        std::fs::create_dir_all(&media_dir)?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        let index = scan_media_dir(&media_dir)?;
        info!(
            "Cache index rebuilt: {} entries, {} bytes",
            index.len(),
            index.values().map(|e| e.size).sum::<u64>()
        );

        Ok(Self {
            media_dir,
            max_bytes,
            prefetch_concurrency,
            client,
            index: Mutex::new(index),
            now_playing: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Cache file path for a media id and its source URL
    fn file_path(&self, media_id: &str, url: &str) -> PathBuf {
        self.media_dir.join(format!(
            "{}.{}",
            sanitize_media_id(media_id),
            extension_from_url(url)
        ))
    }

    /// Download and register a media object.
    ///
    /// Returns the local path. Concurrent calls for the same `media_id`
    /// share one in-progress download.
    pub async fn add(
        self: &Arc<Self>,
        media_id: &str,
        url: &str,
        sha256: Option<&str>,
    ) -> std::result::Result<PathBuf, DownloadError> {
        if let Some(path) = self.lookup_ready(media_id).await {
            return Ok(path);
        }

        let future = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(media_id) {
                debug!("Joining in-flight download for {media_id}");
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let media_id = media_id.to_string();
                let url = url.to_string();
                let sha256 = sha256.map(str::to_string);
                let key = media_id.clone();
                let future: DownloadFuture = async move {
                    let result = this
                        .perform_download(&media_id, &url, sha256.as_deref())
                        .await;
                    this.in_flight.lock().await.remove(&media_id);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key, future.clone());
                future
            }
        };

        future.await
    }

    async fn perform_download(
        &self,
        media_id: &str,
        url: &str,
        sha256: Option<&str>,
    ) -> std::result::Result<PathBuf, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::classify_status(status.as_u16(), url));
        }

        // Items that cannot fit even into an empty cache are skipped
        // before any bytes are transferred.
        if let Some(expected) = response.content_length() {
            if expected > self.max_bytes {
                warn!(
                    "Skipping oversize media {media_id}: {expected} bytes exceeds \
                     cache capacity {}",
                    self.max_bytes
                );
                return Err(DownloadError::CacheFull {
                    needed: expected,
                    max_bytes: self.max_bytes,
                });
            }
            self.ensure_capacity(expected).await?;
        }

        let final_path = self.file_path(media_id, url);
        let part_path = final_path.with_extension("part");
        let downloaded = download::stream_to_part(response, &part_path).await?;

        if let Some(expected_hash) = sha256 {
            if !downloaded.sha256.eq_ignore_ascii_case(expected_hash) {
                return self
                    .quarantine(media_id, &part_path, expected_hash, &downloaded.sha256)
                    .await;
            }
        }

        if downloaded.size > self.max_bytes {
            // Length header was absent or wrong
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(DownloadError::CacheFull {
                needed: downloaded.size,
                max_bytes: self.max_bytes,
            });
        }
        self.ensure_capacity(downloaded.size).await?;

        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| DownloadError::Other(format!("rename failed: {e}")))?;

        let entry = CacheEntry {
            media_id: media_id.to_string(),
            sha256: Some(downloaded.sha256),
            size: downloaded.size,
            last_used_at: Utc::now(),
            local_path: final_path.clone(),
            status: EntryStatus::Ready,
        };
        self.index.lock().await.insert(media_id.to_string(), entry);
        debug!("Cached {media_id} ({} bytes)", downloaded.size);

        Ok(final_path)
    }

    /// Keep the failing bytes aside for diagnosis; the entry is excluded
    /// from lookups and evicted before any ready entry.
    async fn quarantine(
        &self,
        media_id: &str,
        part_path: &Path,
        expected: &str,
        actual: &str,
    ) -> std::result::Result<PathBuf, DownloadError> {
        let bad_path = part_path.with_extension("bad");
        let size = tokio::fs::metadata(part_path).await.map(|m| m.len()).unwrap_or(0);
        if let Err(e) = tokio::fs::rename(part_path, &bad_path).await {
            warn!("Failed to quarantine {media_id}: {e}");
        } else {
            self.index.lock().await.insert(
                media_id.to_string(),
                CacheEntry {
                    media_id: media_id.to_string(),
                    sha256: None,
                    size,
                    last_used_at: Utc::now(),
                    local_path: bad_path,
                    status: EntryStatus::Quarantined,
                },
            );
        }
        warn!("Integrity mismatch for {media_id}: expected {expected}, got {actual}");
        Err(DownloadError::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }

    async fn lookup_ready(&self, media_id: &str) -> Option<PathBuf> {
        let mut index = self.index.lock().await;
        let present = match index.get(media_id) {
            Some(entry) if entry.status == EntryStatus::Ready => entry.local_path.exists(),
            _ => return None,
        };
        if !present {
            // Someone removed the file underneath us; drop the stale entry
            index.remove(media_id);
            return None;
        }
        let entry = index.get_mut(media_id)?;
        entry.last_used_at = Utc::now();
        Some(entry.local_path.clone())
    }

    /// True only when the media file is actually present; touches the
    /// entry's recency on a hit.
    pub async fn has(&self, media_id: &str) -> bool {
        self.lookup_ready(media_id).await.is_some()
    }

    /// Local path of a cached media object
    pub async fn get(&self, media_id: &str) -> Option<PathBuf> {
        self.lookup_ready(media_id).await
    }

    /// Download every item that carries both a media id and a remote URL,
    /// at most `prefetch_concurrency` at a time.
    ///
    /// Individual failures are warnings, except URL expiry which aborts
    /// the prefetch so the caller can refetch the snapshot.
    pub async fn prefetch(self: &Arc<Self>, items: &[TimelineItem]) -> Result<()> {
        let jobs: Vec<(String, String, Option<String>)> = items
            .iter()
            .filter_map(|item| {
                let media_id = item.media_id.clone()?;
                let url = item.remote_url.clone()?;
                Some((media_id, url, item.sha256.clone()))
            })
            .collect();

        let mut stream = futures::stream::iter(jobs.into_iter().map(|(media_id, url, sha)| {
            let this = Arc::clone(self);
            async move {
                let result = this.add(&media_id, &url, sha.as_deref()).await;
                (media_id, result)
            }
        }))
        .buffer_unordered(self.prefetch_concurrency.max(1));

        while let Some((media_id, result)) = stream.next().await {
            match result {
                Ok(_) => {}
                Err(DownloadError::UrlExpired { status }) => {
                    return Err(Error::UrlExpired { status });
                }
                Err(e) => warn!("Prefetch of {media_id} failed: {e}"),
            }
        }
        Ok(())
    }

    /// Pin an entry against eviction while it is on screen
    pub async fn mark_now_playing(&self, media_id: &str) {
        self.now_playing.lock().await.insert(media_id.to_string());
    }

    pub async fn unmark_now_playing(&self, media_id: &str) {
        self.now_playing.lock().await.remove(media_id);
    }

    /// Remove cached media. Non-force leaves now-playing entries in place.
    pub async fn clear(&self, force: bool) -> Result<()> {
        let now_playing = self.now_playing.lock().await.clone();
        let mut index = self.index.lock().await;

        let victims: Vec<String> = index
            .keys()
            .filter(|id| force || !now_playing.contains(*id))
            .cloned()
            .collect();

        for media_id in &victims {
            if let Some(entry) = index.remove(media_id) {
                if let Err(e) = tokio::fs::remove_file(&entry.local_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {e}", entry.local_path.display());
                    }
                }
            }
        }
        info!("Cache cleared ({} entries removed, force={force})", victims.len());
        Ok(())
    }

    /// Evict least-recently-used entries until `needed` additional bytes
    /// fit, skipping now-playing entries. Quarantined entries go first.
    async fn ensure_capacity(&self, needed: u64) -> std::result::Result<(), DownloadError> {
        if needed > self.max_bytes {
            return Err(DownloadError::CacheFull {
                needed,
                max_bytes: self.max_bytes,
            });
        }

        loop {
            let victim = {
                let now_playing = self.now_playing.lock().await;
                let index = self.index.lock().await;
                let total: u64 = index.values().map(|e| e.size).sum();
                if total + needed <= self.max_bytes {
                    return Ok(());
                }

                index
                    .values()
                    .filter(|e| !now_playing.contains(&e.media_id))
                    .min_by_key(|e| (e.status == EntryStatus::Ready, e.last_used_at))
                    .map(|e| e.media_id.clone())
            };

            let Some(victim) = victim else {
                return Err(DownloadError::CacheFull {
                    needed,
                    max_bytes: self.max_bytes,
                });
            };

            if let Some(entry) = self.index.lock().await.remove(&victim) {
                debug!("Evicting {} ({} bytes)", entry.media_id, entry.size);
                if let Err(e) = tokio::fs::remove_file(&entry.local_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Eviction of {} failed: {e}", entry.local_path.display());
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.len(),
            total_bytes: index.values().map(|e| e.size).sum(),
            max_bytes: self.max_bytes,
        }
    }

    /// Index entry for a media id (diagnostics)
    pub async fn entry(&self, media_id: &str) -> Option<CacheEntry> {
        self.index.lock().await.get(media_id).cloned()
    }
}

/// Rebuild the index from the media directory.
///
/// `.part` leftovers from interrupted downloads are deleted; `.bad`
/// quarantine files are dropped as well since their hashes are unknown.
fn scan_media_dir(media_dir: &Path) -> Result<HashMap<String, CacheEntry>> {
    let mut index = HashMap::new();
    for entry in std::fs::read_dir(media_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".part") || name.ends_with(".bad") {
            debug!("Removing stale download artifact {name}");
            let _ = std::fs::remove_file(&path);
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let metadata = entry.metadata()?;
        let last_used_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        index.insert(
            stem.to_string(),
            CacheEntry {
                media_id: stem.to_string(),
                sha256: None,
                size: metadata.len(),
                last_used_at,
                local_path: path,
                status: EntryStatus::Ready,
            },
        );
    }
    Ok(index)
}
