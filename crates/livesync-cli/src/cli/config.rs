use std::path::{Path, PathBuf};

use anyhow::Result;
use livesync_core::SyncConfig;
use tracing::debug;

/// `<config dir>/livesync/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("livesync").join("config.json"))
}

/// An explicit `--config` must load; the default location is used only if
/// the file exists. Otherwise built-in defaults apply.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    if let Some(path) = explicit {
        return SyncConfig::load(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            debug!(path = %path.display(), "using default config");
            SyncConfig::load(&path)
        }
        _ => Ok(SyncConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_config_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pageSize": 4, "order": "ascending"}}"#).unwrap();

        let config = resolve_config(Some(file.path())).unwrap();
        assert_eq!(config.page_size, 4);
        assert_eq!(
            config.max_resubscribe_attempts,
            SyncConfig::default().max_resubscribe_attempts
        );
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_default_path_is_under_livesync() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("livesync/config.json"));
        }
    }
}
