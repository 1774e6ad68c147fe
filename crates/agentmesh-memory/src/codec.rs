//! Column encoding helpers shared by the stores.

use agentmesh_types::error::MeshError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Format a timestamp with full precision so reloads compare equal.
pub(crate) fn fmt_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp, falling back to now for corrupt values.
pub(crate) fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            tracing::warn!(value = %s, "Unparseable timestamp in storage, using now");
            Utc::now()
        })
}

pub(crate) fn parse_opt_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_time)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, MeshError> {
    serde_json::to_string(value).map_err(|e| MeshError::Serialization(e.to_string()))
}

/// Decode a JSON column, logging and defaulting on corrupt data.
pub(crate) fn from_json_or_default<T: DeserializeOwned + Default>(column: &str, raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(column, "Corrupt JSON column, using default: {e}");
        T::default()
    })
}

pub(crate) fn storage_err(e: rusqlite::Error) -> MeshError {
    MeshError::Storage(e.to_string())
}

pub(crate) fn lock_err<T>(e: std::sync::PoisonError<T>) -> MeshError {
    MeshError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_roundtrip_keeps_nanos() {
        let now = Utc::now();
        assert_eq!(parse_time(&fmt_time(&now)), now);
    }

    #[test]
    fn test_corrupt_json_defaults() {
        let v: Vec<String> = from_json_or_default("tags", "not json");
        assert!(v.is_empty());
    }
}
