use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Name of the engine config file
pub const CONFIG_FILE: &str = "cuepoint.json";

/// Overrides for default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Create PathConfig from CLI arguments and environment variables
    ///
    /// Priority: CLI args → ENV var (CUEPOINT_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| {
            std::env::var("CUEPOINT_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        });

        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. CUEPOINT_CONFIG_DIR environment variable
/// 3. Local folder IF it already holds cuepoint.json
/// 4. Platform-specific config directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.config/cuepoint/{name}
/// - macOS: ~/Library/Application Support/cuepoint/{name}
/// - Windows: %APPDATA%\cuepoint\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Directory holding keyframe index files.
///
/// Custom config dir wins (keeps everything in one place for portable setups),
/// otherwise the platform cache dir:
/// - Linux: ~/.cache/cuepoint/keyframes
/// - macOS: ~/Library/Caches/cuepoint/keyframes
/// - Windows: %LOCALAPPDATA%\cuepoint\keyframes
pub fn keyframe_cache_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.join("keyframes");
    }

    if let Some(dir) = dirs_next::cache_dir() {
        return dir.join("cuepoint").join("keyframes");
    }

    std::env::temp_dir().join("cuepoint").join("keyframes")
}

/// Ensure that a directory exists
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}

/// Get the configuration directory
fn get_config_dir(config: &PathConfig) -> PathBuf {
    // Priority 1: Custom directory from CLI or ENV
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    // Priority 2: Local folder IF config file exists there
    if let Ok(current_dir) = std::env::current_dir() {
        if current_dir.join(CONFIG_FILE).exists() {
            return current_dir;
        }
    }

    // Priority 3: Platform-specific config directory
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("cuepoint");
    }

    // Fallback: "." if everything else fails
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };

        let path = config_file("test.json", &config);
        assert_eq!(path, PathBuf::from("/custom/test.json"));
    }

    #[test]
    fn test_keyframe_dir_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };

        assert_eq!(keyframe_cache_dir(&config), PathBuf::from("/custom/keyframes"));
    }

    #[test]
    fn test_keyframe_dir_uses_platform_defaults() {
        let config = PathConfig { config_dir: None };

        let path = keyframe_cache_dir(&config);
        assert!(path.to_string_lossy().contains("cuepoint"));
        assert!(path.ends_with("keyframes"));
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let dir = std::env::temp_dir()
            .join(format!("cuepoint_paths_{}", uuid::Uuid::new_v4()))
            .join("a")
            .join("b");
        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(dir.parent().unwrap().parent().unwrap());
    }
}
