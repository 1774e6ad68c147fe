//! Process-wide `tracing` subscriber setup.

use agentmesh_types::config::MeshConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `config.log_level`.
///
/// Returns `false` if a subscriber was already installed (common in tests).
pub fn init_logging(config: &MeshConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let result = if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected_not_fatal() {
        let config = MeshConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
