//! Agent identity.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};

/// Name under which an agent is registered with the bus and keyed in every store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Build an agent ID, rejecting empty or whitespace-only names.
    pub fn parse(id: impl Into<String>) -> MeshResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MeshError::InvalidInput("agent_id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_empty() {
        assert!(AgentId::parse("").is_err());
        assert!(AgentId::parse("   ").is_err());
        assert_eq!(AgentId::parse("finance").unwrap().as_str(), "finance");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = AgentId::from("hr");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"hr\"");
    }
}
