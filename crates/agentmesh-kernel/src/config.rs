//! Configuration loading from `~/.agentmesh/config.toml` with defaults.
//!
//! A missing or unreadable file never aborts startup: every failure is
//! logged and the built-in defaults are used instead.

use agentmesh_types::config::MeshConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load mesh configuration from a TOML file, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MeshConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return MeshConfig::default();
        }
    };

    match toml::from_str::<MeshConfig>(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// `~/.agentmesh/config.toml`, or `./.agentmesh/config.toml` without a home dir.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agentmesh"))
        .unwrap_or_else(|| PathBuf::from(".agentmesh"))
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config.bus.history_size, 1000);
        assert_eq!(config.tracing.slow_operation_ms, 5000.0);
    }

    #[test]
    fn test_partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "log_level = \"debug\"").unwrap();
        writeln!(f, "[improvement]").unwrap();
        writeln!(f, "min_feedback_for_analysis = 4").unwrap();
        drop(f);

        let config = load_config(Some(&path));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.improvement.min_feedback_for_analysis, 4);
        assert_eq!(config.improvement.min_feedback_for_degradation, 20);
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.log_level, "info");
    }
}
