//! Engine configuration persisted as `cuepoint.json`.
//!
//! Every field has a default so partial files (or none at all) are valid.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result as EngineResult};
use crate::paths::{self, PathConfig, CONFIG_FILE};

/// Presentation back-end selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresenterBackend {
    #[default]
    Cpu,
    Gpu,
}

/// Tunables for one engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max frames held by the scrub cache
    pub cache_capacity: usize,
    /// Decode-ahead window past the master clock
    pub lookahead_ms: u64,
    /// Distance ahead of the master clock at which the worker idles
    pub backoff_ms: u64,
    pub backend: PresenterBackend,
    /// How long after GPU init the corruption probe runs
    pub gpu_probe_window_ms: u64,
    /// Pixels sampled per probe
    pub gpu_probe_points: usize,
    /// Consecutive black probes before falling back to CPU
    pub gpu_probe_failures: u32,
    /// Override for the keyframe index directory
    pub keyframe_cache_dir: Option<PathBuf>,
    pub use_keyframe_index: bool,
    pub audio_sample_rate: u32,
    /// Decoded audio kept queued ahead of the sink
    pub audio_buffer_ms: u64,
    /// Event channel capacity
    pub event_queue: usize,
    /// FFmpeg decoder threads (0 = auto)
    pub decoder_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 90,
            lookahead_ms: 200,
            backoff_ms: 80,
            backend: PresenterBackend::Cpu,
            gpu_probe_window_ms: 3000,
            gpu_probe_points: 5,
            gpu_probe_failures: 3,
            keyframe_cache_dir: None,
            use_keyframe_index: true,
            audio_sample_rate: 48000,
            audio_buffer_ms: 500,
            event_queue: 256,
            decoder_threads: 0,
        }
    }
}

impl EngineConfig {
    /// Load from the config dir; a missing file yields defaults
    pub fn load(paths: &PathConfig) -> Result<Self> {
        let path = paths::config_file(CONFIG_FILE, paths);
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write pretty JSON into the config dir
    pub fn save(&self, paths: &PathConfig) -> Result<PathBuf> {
        let path = paths::config_file(CONFIG_FILE, paths);
        if let Some(dir) = path.parent() {
            paths::ensure_dir(dir)?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(path)
    }

    /// Resolved keyframe index directory
    pub fn keyframe_dir(&self, paths: &PathConfig) -> PathBuf {
        self.keyframe_cache_dir
            .clone()
            .unwrap_or_else(|| paths::keyframe_cache_dir(paths))
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn gpu_probe_window(&self) -> Duration {
        Duration::from_millis(self.gpu_probe_window_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.cache_capacity == 0 {
            return Err(EngineError::Config("cache_capacity must be at least 1".to_string()));
        }
        if self.event_queue == 0 {
            return Err(EngineError::Config("event_queue must be at least 1".to_string()));
        }
        if !(8_000..=384_000).contains(&self.audio_sample_rate) {
            return Err(EngineError::Config(format!(
                "audio_sample_rate {} outside 8000..=384000",
                self.audio_sample_rate
            )));
        }
        if self.gpu_probe_failures == 0 {
            return Err(EngineError::Config("gpu_probe_failures must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> PathConfig {
        PathConfig {
            config_dir: Some(std::env::temp_dir().join(format!("cuepoint_cfg_{}", uuid::Uuid::new_v4()))),
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let paths = temp_paths();
        let config = EngineConfig::load(&paths).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cache_capacity, 90);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let paths = temp_paths();
        let dir = paths.config_dir.clone().unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), r#"{ "lookahead_ms": 120, "backend": "Gpu" }"#).unwrap();

        let config = EngineConfig::load(&paths).unwrap();
        assert_eq!(config.lookahead_ms, 120);
        assert_eq!(config.backend, PresenterBackend::Gpu);
        assert_eq!(config.backoff_ms, 80);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_save_then_load() {
        let paths = temp_paths();
        let config = EngineConfig { cache_capacity: 12, ..Default::default() };
        let path = config.save(&paths).unwrap();
        assert!(path.exists());
        assert_eq!(EngineConfig::load(&paths).unwrap().cache_capacity, 12);

        let _ = std::fs::remove_dir_all(paths.config_dir.unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig { cache_capacity: 0, ..Default::default() };
        assert!(matches!(bad.validate(), Err(EngineError::Config(_))));
        let bad = EngineConfig { audio_sample_rate: 100, ..Default::default() };
        assert!(matches!(bad.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let paths = temp_paths();
        let dir = paths.config_dir.clone().unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "{ not json").unwrap();

        assert!(EngineConfig::load(&paths).is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
