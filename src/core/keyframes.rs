//! Keyframe index - sorted keyframe timestamps for accurate seek targets.
//!
//! Built once per file by scanning every packet of the video stream, then
//! persisted so repeat opens skip the scan.
//!
//! # Cache file
//!
//! `<cache_dir>/<fingerprint>.kfi`, little-endian:
//! ```text
//! [i32 count][i64 x count]   // ascending, stream time-base units
//! ```
//! The fingerprint is a SHA-256 over (absolute path, size, mtime), so an
//! edited file gets a fresh index. Unreadable or truncated files are
//! silently regenerated.

use log::{debug, info, warn};
use playa_ffmpeg as ffmpeg;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{EngineError, Result};

const INDEX_EXT: &str = "kfi";

/// Sorted keyframe timestamps of one video stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyframeIndex {
    timestamps: Vec<i64>,
}

impl KeyframeIndex {
    /// Sort and dedup raw timestamps
    pub fn from_timestamps(mut timestamps: Vec<i64>) -> Self {
        timestamps.sort_unstable();
        timestamps.dedup();
        Self { timestamps }
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Greatest keyframe timestamp <= `target` (binary search)
    pub fn seek_target(&self, target: i64) -> Option<i64> {
        let idx = self.timestamps.partition_point(|&ts| ts <= target);
        if idx == 0 {
            None
        } else {
            Some(self.timestamps[idx - 1])
        }
    }

    /// Serialize as `[i32 count][i64 x count]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.timestamps.len() * 8);
        out.extend_from_slice(&(self.timestamps.len() as i32).to_le_bytes());
        for ts in &self.timestamps {
            out.extend_from_slice(&ts.to_le_bytes());
        }
        out
    }

    /// Parse the cache format; `None` on any inconsistency
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let count_bytes: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
        let count = i32::from_le_bytes(count_bytes);
        if count < 0 {
            return None;
        }
        let count = count as usize;
        if bytes.len() != 4 + count * 8 {
            return None;
        }
        let timestamps: Vec<i64> = bytes[4..]
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                i64::from_le_bytes(raw)
            })
            .collect();
        if timestamps.windows(2).any(|w| w[0] > w[1]) {
            return None;
        }
        Some(Self { timestamps })
    }
}

/// Content fingerprint of a media file: SHA-256 of path, size and mtime
pub fn fingerprint(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    let abs = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(abs.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    let digest = hasher.finalize();
    Ok(digest[..16].iter().map(|b| format!("{:02x}", b)).collect())
}

/// Index file location for a media file
pub fn index_file(cache_dir: &Path, media: &Path) -> Result<PathBuf> {
    Ok(cache_dir.join(format!("{}.{}", fingerprint(media)?, INDEX_EXT)))
}

/// Read a persisted index; `None` if missing or corrupt
pub fn load_index(file: &Path) -> Option<KeyframeIndex> {
    let bytes = std::fs::read(file).ok()?;
    let index = KeyframeIndex::from_bytes(&bytes);
    if index.is_none() {
        debug!("Keyframe index {} unreadable, will rebuild", file.display());
    }
    index
}

/// Persist an index (write to temp + rename so readers never see partial files)
pub fn save_index(file: &Path, index: &KeyframeIndex) -> Result<()> {
    if let Some(dir) = file.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = file.with_extension(format!("{}.tmp", INDEX_EXT));
    std::fs::write(&tmp, index.to_bytes())?;
    std::fs::rename(&tmp, file)?;
    Ok(())
}

/// Load the cached index for `media`, or scan and persist it.
///
/// A failure to persist is logged, not returned: the index is still usable.
pub fn build_keyframe_index(media: &Path, cache_dir: Option<&Path>) -> Result<KeyframeIndex> {
    let file = match cache_dir {
        Some(dir) => match index_file(dir, media) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Cannot fingerprint {}: {}", media.display(), e);
                None
            }
        },
        None => None,
    };

    if let Some(index) = file.as_deref().and_then(load_index) {
        debug!("Keyframe index cache hit: {} keyframes", index.len());
        return Ok(index);
    }

    let index = scan_keyframes(media)?;
    info!("Keyframe index built: {} keyframes in {}", index.len(), media.display());

    if let Some(file) = file {
        if let Err(e) = save_index(&file, &index) {
            warn!("Failed to persist keyframe index {}: {}", file.display(), e);
        }
    }
    Ok(index)
}

/// Read every packet of the best video stream and collect keyframe timestamps.
///
/// Uses its own demuxer so it never disturbs a decoder's read position.
pub fn scan_keyframes(media: &Path) -> Result<KeyframeIndex> {
    let mut ictx = ffmpeg::format::input(media)
        .map_err(|e| EngineError::MediaOpen(format!("Failed to open {}: {}", media.display(), e)))?;
    let stream_idx = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| EngineError::MediaOpen("No video stream found".to_string()))?
        .index();

    let mut timestamps = Vec::new();
    for (stream, packet) in ictx.packets() {
        if stream.index() != stream_idx || !packet.is_key() {
            continue;
        }
        if let Some(ts) = packet.pts().or(packet.dts()) {
            timestamps.push(ts);
        }
    }
    Ok(KeyframeIndex::from_timestamps(timestamps))
}
