//! Persistent tile store on the local filesystem.
//!
//! Raw tile bytes are kept exactly as fetched, next to a small JSON sidecar
//! recording when they were fetched and when the server said they expire:
//!
//! ```text
//! <root>/<source>/<zoom>/<column>/<row>.tile
//! <root>/<source>/<zoom>/<column>/<row>.json
//! ```
//!
//! `<source>` is the source id with every byte outside `[A-Za-z0-9-]`
//! escaped as `_xx`, so `a.b` lives in `a_2eb` and `a_b` in `a_5fb`.
//!
//! The loader reads through this store before going to the network and
//! writes through it after every successful fetch. Errors here never fail a
//! tile load; callers log them and fall back to the network.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::fetcher::FetchResponse;
use crate::error::DiskCacheError;
use crate::projection::TileId;

/// Sidecar metadata stored next to each cached tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EntryMetadata {
    /// Seconds since the Unix epoch
    fetched_at: u64,
    /// Seconds since the Unix epoch
    expires_at: Option<u64>,
    /// Response headers, names lowercased
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn to_epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn from_epoch_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Encode a source id as one path component.
///
/// ASCII letters, digits and `-` pass through; every other byte becomes `_`
/// followed by two lowercase hex digits. Distinct ids never share a
/// directory.
fn encode_component(source_id: &str) -> String {
    if source_id.is_empty() {
        return "_".to_string();
    }

    let mut encoded = String::with_capacity(source_id.len());
    for byte in source_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "_{byte:02x}");
        }
    }
    encoded
}

/// Directory-backed cache of raw tile payloads.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    max_age: Duration,
}

impl DiskCache {
    /// Use `root` as the cache directory. It is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Path of the payload file for `id`.
    pub fn tile_path(&self, id: &TileId) -> PathBuf {
        self.tile_dir(id).join(format!("{}.tile", id.row()))
    }

    fn metadata_path(&self, id: &TileId) -> PathBuf {
        self.tile_dir(id).join(format!("{}.json", id.row()))
    }

    fn tile_dir(&self, id: &TileId) -> PathBuf {
        self.root
            .join(encode_component(id.source_id()))
            .join(id.zoom().to_string())
            .join(id.column().to_string())
    }

    /// Read a cached payload if it is younger than the configured max-age and
    /// not past its server expiry.
    ///
    /// Missing entries are `Ok(None)`; unreadable ones are errors.
    pub async fn read_fresh(&self, id: &TileId) -> Result<Option<FetchResponse>, DiskCacheError> {
        self.read_fresh_at(id, SystemTime::now()).await
    }

    async fn read_fresh_at(
        &self,
        id: &TileId,
        now: SystemTime,
    ) -> Result<Option<FetchResponse>, DiskCacheError> {
        let raw_metadata = match tokio::fs::read(self.metadata_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: EntryMetadata = serde_json::from_slice(&raw_metadata)?;

        let fetched_at = from_epoch_secs(metadata.fetched_at);
        let age = now.duration_since(fetched_at).unwrap_or(Duration::ZERO);
        if age > self.max_age {
            trace!(tile = %id, age_secs = age.as_secs(), "disk cache entry too old");
            return Ok(None);
        }

        let expires_at = metadata.expires_at.map(from_epoch_secs);
        if expires_at.is_some_and(|expires| now >= expires) {
            trace!(tile = %id, "disk cache entry past server expiry");
            return Ok(None);
        }

        let body = match tokio::fs::read(self.tile_path(id)).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(FetchResponse {
            expires_at,
            headers: metadata.headers,
            ..FetchResponse::from_body(body)
        }))
    }

    /// Store a freshly fetched payload.
    ///
    /// The payload is written to a temporary file and renamed into place so a
    /// concurrent reader never sees a partial tile.
    pub async fn write(&self, id: &TileId, response: &FetchResponse) -> Result<(), DiskCacheError> {
        let dir = self.tile_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let tile_path = self.tile_path(id);
        let temp_path = dir.join(format!("{}.tile.tmp", id.row()));
        tokio::fs::write(&temp_path, &response.body).await?;
        tokio::fs::rename(&temp_path, &tile_path).await?;

        let metadata = EntryMetadata {
            fetched_at: to_epoch_secs(SystemTime::now()),
            expires_at: response.expires_at.map(to_epoch_secs),
            headers: response.headers.clone(),
        };
        tokio::fs::write(self.metadata_path(id), serde_json::to_vec(&metadata)?).await?;

        trace!(tile = %id, bytes = response.body.len(), "wrote tile to disk cache");
        Ok(())
    }

    /// Remove the cached payload for `id`, if any.
    pub async fn remove(&self, id: &TileId) -> Result<(), DiskCacheError> {
        for path in [self.tile_path(id), self.metadata_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
