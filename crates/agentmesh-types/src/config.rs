//! Configuration for the AgentMesh substrate.
//!
//! Every section defaults independently so a partial `config.toml` is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Directory for the database and logs.
    pub data_dir: PathBuf,
    /// SQLite file. Relative paths resolve against `data_dir`.
    pub db_path: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
    pub bus: BusConfig,
    pub tracing: TracingConfig,
    pub memory: MemoryConfig,
    pub improvement: ImprovementConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".agentmesh"))
            .unwrap_or_else(|| PathBuf::from(".agentmesh"));
        Self {
            data_dir,
            db_path: PathBuf::from("agentmesh.db"),
            log_level: "info".to_string(),
            log_json: false,
            bus: BusConfig::default(),
            tracing: TracingConfig::default(),
            memory: MemoryConfig::default(),
            improvement: ImprovementConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Absolute location of the database file.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.data_dir.join(&self.db_path)
        }
    }
}

/// Message bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Messages retained in the history ring buffer.
    pub history_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { history_size: 1000 }
    }
}

/// Tracer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Spans longer than this raise a `slow_operation` warning.
    pub slow_operation_ms: f64,
    /// Spans longer than this raise a `very_slow_operation` critical alert.
    pub very_slow_operation_ms: f64,
    /// Latency histogram bucket width.
    pub histogram_bucket_ms: f64,
    /// Spans still running after this long are reaped as abandoned.
    pub abandon_after_secs: u64,
    /// How often the reaper runs.
    pub reap_interval_secs: u64,
    /// How often a metrics snapshot is persisted.
    pub snapshot_interval_secs: u64,
    /// Alerts kept in memory for `recent_alerts`.
    pub alert_history_size: usize,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            slow_operation_ms: 5_000.0,
            very_slow_operation_ms: 30_000.0,
            histogram_bucket_ms: 100.0,
            abandon_after_secs: 3_600,
            reap_interval_secs: 300,
            snapshot_interval_secs: 300,
            alert_history_size: 500,
        }
    }
}

/// Agent memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Occurrences of one event type needed before consolidation distills it.
    pub consolidation_min_occurrences: usize,
    /// Smoothing factor for skill success rate and duration updates.
    pub skill_update_weight: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_min_occurrences: 3,
            skill_update_weight: 0.2,
        }
    }
}

/// Self-improvement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    /// Records needed inside the window before any analysis runs.
    pub min_feedback_for_analysis: usize,
    /// Trailing analysis window.
    pub analysis_window_days: i64,
    /// Records needed inside the window for degradation detection.
    pub min_feedback_for_degradation: usize,
    /// Success rate below this yields `low_success_rate`.
    pub success_rate_threshold: f64,
    /// Mean execution time above this yields `slow_execution`.
    pub slow_execution_ms: f64,
    /// Mean quality below this yields `low_quality`.
    pub quality_threshold: f64,
    /// Newer success rate below `ratio * older` counts as a regression.
    pub success_regression_ratio: f64,
    /// Newer latency above `ratio * older` counts as a regression.
    pub latency_regression_ratio: f64,
    /// Minimum gap before the same regression is re-emitted for an agent.
    pub opportunity_cooldown_secs: u64,
    /// Background re-analysis period.
    pub analysis_interval_secs: u64,
    /// Background purge period.
    pub cleanup_interval_secs: u64,
    /// Feedback older than this is purged.
    pub retention_days: i64,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            min_feedback_for_analysis: 10,
            analysis_window_days: 7,
            min_feedback_for_degradation: 20,
            success_rate_threshold: 0.7,
            slow_execution_ms: 5_000.0,
            quality_threshold: 0.7,
            success_regression_ratio: 0.8,
            latency_regression_ratio: 1.5,
            opportunity_cooldown_secs: 3_600,
            analysis_interval_secs: 3_600,
            cleanup_interval_secs: 86_400,
            retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.tracing.slow_operation_ms, 5_000.0);
        assert_eq!(config.improvement.min_feedback_for_analysis, 10);
        assert_eq!(config.improvement.retention_days, 90);
        assert_eq!(config.bus.history_size, 1000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            log_level = "debug"

            [improvement]
            min_feedback_for_analysis = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.improvement.min_feedback_for_analysis, 5);
        assert_eq!(config.improvement.analysis_window_days, 7);
        assert_eq!(config.tracing.histogram_bucket_ms, 100.0);
    }

    #[test]
    fn test_relative_db_path_resolves_under_data_dir() {
        let config = MeshConfig {
            data_dir: PathBuf::from("/var/lib/mesh"),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_db_path(),
            PathBuf::from("/var/lib/mesh/agentmesh.db")
        );
    }
}
