//! Agent memory types: the three memory tiers, recall queries, and the
//! pluggable `MemoryBackend` trait.

use crate::agent::AgentId;
use crate::error::MeshResult;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Identifier for a memory record, derived from its owner, creation time and
/// discriminating fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub String);

impl MemoryId {
    /// Derive an ID from `agent_id`, `timestamp` and any number of
    /// discriminating fields. Fields are separated so `["ab", "c"]` and
    /// `["a", "bc"]` hash differently.
    pub fn derive(agent_id: &AgentId, timestamp: DateTime<Utc>, discriminators: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(agent_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(
            timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        for d in discriminators {
            hasher.update([0u8]);
            hasher.update(d.as_bytes());
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remembered experience. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicMemory {
    pub id: MemoryId,
    pub agent_id: AgentId,
    /// Kind of event, e.g. "task_success" or "message_received".
    pub event_type: String,
    pub description: String,
    pub context: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// How much the experience matters (0.0 - 1.0).
    pub importance: f64,
    /// Negative for bad experiences, positive for good ones (-1.0 - 1.0).
    pub emotional_valence: f64,
    pub outcome: Option<String>,
    /// Whether a consolidation pass has already distilled this experience.
    pub learned_from: bool,
}

/// A learned fact. Only `access_count` and `last_accessed` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub id: MemoryId,
    pub agent_id: AgentId,
    pub category: String,
    pub concept: String,
    pub knowledge: HashMap<String, serde_json::Value>,
    /// Confidence score (0.0 - 1.0).
    pub confidence: f64,
    /// Where the knowledge came from.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// A learned skill: an ordered procedure plus usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralMemory {
    pub id: MemoryId,
    pub agent_id: AgentId,
    pub skill_name: String,
    /// Ordered step descriptors.
    pub procedure_steps: Vec<serde_json::Value>,
    /// Fraction of successful uses (0.0 - 1.0).
    pub success_rate: f64,
    /// Mean execution time in milliseconds.
    pub average_duration: f64,
    pub timestamp: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: u64,
}

/// Default number of records returned by a recall.
pub const DEFAULT_RECALL_LIMIT: usize = 10;

/// Filter for episodic recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceQuery {
    pub event_type: Option<String>,
    /// Inclusive lower bound.
    pub min_importance: Option<f64>,
    pub limit: usize,
}

impl Default for ExperienceQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            min_importance: None,
            limit: DEFAULT_RECALL_LIMIT,
        }
    }
}

/// Filter for semantic recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub category: Option<String>,
    /// Case-insensitive substring match on `concept`.
    pub concept: Option<String>,
    /// Inclusive lower bound.
    pub min_confidence: Option<f64>,
    pub limit: usize,
}

impl Default for KnowledgeQuery {
    fn default() -> Self {
        Self {
            category: None,
            concept: None,
            min_confidence: None,
            limit: DEFAULT_RECALL_LIMIT,
        }
    }
}

/// Filter for procedural recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillQuery {
    pub skill_name: Option<String>,
    /// Inclusive lower bound.
    pub min_success_rate: Option<f64>,
    pub limit: usize,
}

impl Default for SkillQuery {
    fn default() -> Self {
        Self {
            skill_name: None,
            min_success_rate: None,
            limit: DEFAULT_RECALL_LIMIT,
        }
    }
}

/// Report from one consolidation pass over an agent's experiences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub id: MemoryId,
    pub agent_id: AgentId,
    /// Experiences examined (not yet learned from).
    pub episodes_reviewed: u64,
    /// Event types that repeated often enough to become knowledge.
    pub patterns_found: u64,
    /// Semantic records created or refreshed.
    pub knowledge_ids: Vec<MemoryId>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Per-agent overview across the three tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub agent_id: AgentId,
    pub episodic_count: usize,
    pub semantic_count: usize,
    pub procedural_count: usize,
    pub average_importance: f64,
    pub most_recent_experience: Option<DateTime<Utc>>,
    /// Skill names ordered by success rate.
    pub top_skills: Vec<String>,
}

/// Storage behind the agent memory system.
///
/// Implementations persist each tier independently so a relational store can
/// be swapped for a similarity-search store without touching call sites.
/// `store_*` calls are upserts keyed by [`MemoryId`].
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Persist an experience.
    async fn store_episodic(&self, memory: &EpisodicMemory) -> MeshResult<()>;

    /// Load every experience for an agent, most recent first.
    async fn retrieve_episodic(&self, agent_id: &AgentId) -> MeshResult<Vec<EpisodicMemory>>;

    /// Persist (or update) a knowledge record.
    async fn store_semantic(&self, memory: &SemanticMemory) -> MeshResult<()>;

    /// Load every knowledge record for an agent.
    async fn retrieve_semantic(&self, agent_id: &AgentId) -> MeshResult<Vec<SemanticMemory>>;

    /// Persist (or update) a skill.
    async fn store_procedural(&self, memory: &ProceduralMemory) -> MeshResult<()>;

    /// Load every skill for an agent.
    async fn retrieve_procedural(&self, agent_id: &AgentId) -> MeshResult<Vec<ProceduralMemory>>;

    /// Record a consolidation pass. Backends without a log may ignore it.
    async fn record_consolidation(&self, _report: &ConsolidationReport) -> MeshResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_id_is_deterministic() {
        let agent = AgentId::from("finance");
        let ts = Utc::now();
        let a = MemoryId::derive(&agent, ts, &["episodic", "task_success", "closed books"]);
        let b = MemoryId::derive(&agent, ts, &["episodic", "task_success", "closed books"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_memory_id_separates_fields() {
        let agent = AgentId::from("finance");
        let ts = Utc::now();
        let a = MemoryId::derive(&agent, ts, &["ab", "c"]);
        let b = MemoryId::derive(&agent, ts, &["a", "bc"]);
        assert_ne!(a, b);
        let other = MemoryId::derive(&AgentId::from("hr"), ts, &["ab", "c"]);
        assert_ne!(a, other);
    }

    #[test]
    fn test_query_defaults() {
        let q = KnowledgeQuery::default();
        assert_eq!(q.limit, DEFAULT_RECALL_LIMIT);
        assert!(q.concept.is_none());
    }
}
