//! Per-agent memory: experiences (episodic), knowledge (semantic) and skills
//! (procedural).
//!
//! In-process state is authoritative. Every write is forwarded to the
//! [`MemoryBackend`]; a failed write is logged and the in-process record kept.

use agentmesh_types::agent::AgentId;
use agentmesh_types::config::MemoryConfig;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::memory::{
    ConsolidationReport, EpisodicMemory, ExperienceQuery, KnowledgeQuery, MemoryBackend, MemoryId,
    MemorySummary, ProceduralMemory, SemanticMemory, SkillQuery,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Category given to knowledge distilled from repeated experiences.
pub const EXPERIENCE_PATTERN_CATEGORY: &str = "experience_pattern";

/// Input for [`AgentMemorySystem::remember_experience`].
#[derive(Debug, Clone)]
pub struct Experience {
    pub event_type: String,
    pub description: String,
    pub context: HashMap<String, Value>,
    pub importance: f64,
    pub emotional_valence: f64,
    pub outcome: Option<String>,
}

impl Experience {
    pub fn new(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            description: description.into(),
            context: HashMap::new(),
            importance: 0.5,
            emotional_valence: 0.0,
            outcome: None,
        }
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_valence(mut self, valence: f64) -> Self {
        self.emotional_valence = valence;
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

/// Input for [`AgentMemorySystem::learn_knowledge`].
#[derive(Debug, Clone)]
pub struct Knowledge {
    pub category: String,
    pub concept: String,
    pub knowledge: HashMap<String, Value>,
    pub confidence: f64,
    pub source: String,
}

impl Knowledge {
    pub fn new(
        category: impl Into<String>,
        concept: impl Into<String>,
        knowledge: HashMap<String, Value>,
    ) -> Self {
        Self {
            category: category.into(),
            concept: concept.into(),
            knowledge,
            confidence: 0.5,
            source: "experience".to_string(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Input for [`AgentMemorySystem::learn_skill`].
#[derive(Debug, Clone)]
pub struct Skill {
    pub skill_name: String,
    pub procedure_steps: Vec<Value>,
    pub success_rate: f64,
    pub average_duration: f64,
}

impl Skill {
    pub fn new(skill_name: impl Into<String>, procedure_steps: Vec<Value>) -> Self {
        Self {
            skill_name: skill_name.into(),
            procedure_steps,
            success_rate: 0.0,
            average_duration: 0.0,
        }
    }

    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate;
        self
    }

    pub fn with_average_duration(mut self, average_duration_ms: f64) -> Self {
        self.average_duration = average_duration_ms;
        self
    }
}

#[derive(Default)]
struct AgentMemories {
    episodic: Vec<EpisodicMemory>,
    semantic: Vec<SemanticMemory>,
    procedural: Vec<ProceduralMemory>,
}

impl AgentMemories {
    fn contains(&self, id: &MemoryId) -> bool {
        self.episodic.iter().any(|m| &m.id == id)
            || self.semantic.iter().any(|m| &m.id == id)
            || self.procedural.iter().any(|m| &m.id == id)
    }
}

/// The memory system shared by every agent in the mesh.
pub struct AgentMemorySystem {
    backend: Arc<dyn MemoryBackend>,
    config: MemoryConfig,
    agents: DashMap<AgentId, AgentMemories>,
    sequence: AtomicU64,
}

impl AgentMemorySystem {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: MemoryConfig) -> Self {
        Self {
            backend,
            config,
            agents: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Record an experience. Importance is clamped to [0, 1] and valence to [-1, 1].
    pub async fn remember_experience(
        &self,
        agent_id: &AgentId,
        experience: Experience,
    ) -> MeshResult<MemoryId> {
        require_agent(agent_id)?;
        if experience.event_type.is_empty() {
            return Err(MeshError::InvalidInput("event_type must not be empty".into()));
        }
        let timestamp = Utc::now();

        let memory = {
            let mut entry = self.agents.entry(agent_id.clone()).or_default();
            let id = self.unique_id(
                &entry,
                agent_id,
                timestamp,
                &["episodic", experience.event_type.as_str()],
            );
            let memory = EpisodicMemory {
                id,
                agent_id: agent_id.clone(),
                event_type: experience.event_type,
                description: experience.description,
                context: experience.context,
                timestamp,
                importance: experience.importance.clamp(0.0, 1.0),
                emotional_valence: experience.emotional_valence.clamp(-1.0, 1.0),
                outcome: experience.outcome,
                learned_from: false,
            };
            entry.episodic.push(memory.clone());
            memory
        };

        if let Err(e) = self.backend.store_episodic(&memory).await {
            warn!(
                agent = %agent_id,
                memory_id = %memory.id,
                error = %e,
                "Failed to persist experience"
            );
        }
        debug!(agent = %agent_id, event_type = %memory.event_type, "Experience remembered");
        Ok(memory.id)
    }

    /// Record a piece of knowledge. Confidence is clamped to [0, 1].
    pub async fn learn_knowledge(
        &self,
        agent_id: &AgentId,
        knowledge: Knowledge,
    ) -> MeshResult<MemoryId> {
        require_agent(agent_id)?;
        let timestamp = Utc::now();

        let memory = {
            let mut entry = self.agents.entry(agent_id.clone()).or_default();
            let id = self.unique_id(
                &entry,
                agent_id,
                timestamp,
                &["semantic", knowledge.category.as_str(), knowledge.concept.as_str()],
            );
            let memory = SemanticMemory {
                id,
                agent_id: agent_id.clone(),
                category: knowledge.category,
                concept: knowledge.concept,
                knowledge: knowledge.knowledge,
                confidence: knowledge.confidence.clamp(0.0, 1.0),
                source: knowledge.source,
                timestamp,
                last_accessed: timestamp,
                access_count: 0,
            };
            entry.semantic.push(memory.clone());
            memory
        };

        self.persist_semantic(&memory).await;
        Ok(memory.id)
    }

    /// Record a skill. Success rate is clamped to [0, 1].
    pub async fn learn_skill(&self, agent_id: &AgentId, skill: Skill) -> MeshResult<MemoryId> {
        require_agent(agent_id)?;
        if skill.skill_name.is_empty() {
            return Err(MeshError::InvalidInput("skill_name must not be empty".into()));
        }
        let timestamp = Utc::now();

        let memory = {
            let mut entry = self.agents.entry(agent_id.clone()).or_default();
            let id = self.unique_id(
                &entry,
                agent_id,
                timestamp,
                &["procedural", skill.skill_name.as_str()],
            );
            let memory = ProceduralMemory {
                id,
                agent_id: agent_id.clone(),
                skill_name: skill.skill_name,
                procedure_steps: skill.procedure_steps,
                success_rate: skill.success_rate.clamp(0.0, 1.0),
                average_duration: skill.average_duration.max(0.0),
                timestamp,
                last_used: None,
                use_count: 0,
            };
            entry.procedural.push(memory.clone());
            memory
        };

        self.persist_procedural(&memory).await;
        Ok(memory.id)
    }

    /// Experiences matching `query`, most recent first.
    pub fn recall_experiences(
        &self,
        agent_id: &AgentId,
        query: &ExperienceQuery,
    ) -> Vec<EpisodicMemory> {
        let Some(entry) = self.agents.get(agent_id) else {
            return Vec::new();
        };
        let mut matches: Vec<EpisodicMemory> = entry
            .episodic
            .iter()
            .filter(|m| {
                query
                    .event_type
                    .as_deref()
                    .is_none_or(|t| m.event_type == t)
            })
            .filter(|m| query.min_importance.is_none_or(|min| m.importance >= min))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matches.truncate(query.limit);
        matches
    }

    /// Knowledge matching `query`, highest confidence first, then most accessed.
    ///
    /// Every returned record has its `access_count` incremented and
    /// `last_accessed` refreshed, both in memory and in the backend.
    pub async fn recall_knowledge(
        &self,
        agent_id: &AgentId,
        query: &KnowledgeQuery,
    ) -> Vec<SemanticMemory> {
        let needle = query.concept.as_ref().map(|c| c.to_lowercase());
        let recalled = {
            let Some(mut entry) = self.agents.get_mut(agent_id) else {
                return Vec::new();
            };
            let mut matches: Vec<usize> = entry
                .semantic
                .iter()
                .enumerate()
                .filter(|(_, m)| query.category.as_deref().is_none_or(|c| m.category == c))
                .filter(|(_, m)| {
                    needle
                        .as_deref()
                        .is_none_or(|n| m.concept.to_lowercase().contains(n))
                })
                .filter(|(_, m)| query.min_confidence.is_none_or(|min| m.confidence >= min))
                .map(|(i, _)| i)
                .collect();
            matches.sort_by(|&a, &b| {
                let (a, b) = (&entry.semantic[a], &entry.semantic[b]);
                cmp_desc(a.confidence, b.confidence)
                    .then_with(|| b.access_count.cmp(&a.access_count))
            });
            matches.truncate(query.limit);

            let now = Utc::now();
            matches
                .into_iter()
                .map(|i| {
                    let memory = &mut entry.semantic[i];
                    memory.access_count += 1;
                    memory.last_accessed = now;
                    memory.clone()
                })
                .collect::<Vec<_>>()
        };

        for memory in &recalled {
            self.persist_semantic(memory).await;
        }
        recalled
    }

    /// Skills matching `query`, best success rate first, then most used.
    pub fn recall_skills(&self, agent_id: &AgentId, query: &SkillQuery) -> Vec<ProceduralMemory> {
        let Some(entry) = self.agents.get(agent_id) else {
            return Vec::new();
        };
        let mut matches: Vec<ProceduralMemory> = entry
            .procedural
            .iter()
            .filter(|m| {
                query
                    .skill_name
                    .as_deref()
                    .is_none_or(|name| m.skill_name == name)
            })
            .filter(|m| query.min_success_rate.is_none_or(|min| m.success_rate >= min))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            cmp_desc(a.success_rate, b.success_rate).then_with(|| b.use_count.cmp(&a.use_count))
        });
        matches.truncate(query.limit);
        matches
    }

    /// Record one use of a skill and blend the outcome into its statistics.
    pub async fn use_skill(
        &self,
        agent_id: &AgentId,
        skill_id: &MemoryId,
        success: bool,
        duration_ms: f64,
    ) -> MeshResult<ProceduralMemory> {
        let weight = self.config.skill_update_weight.clamp(0.0, 1.0);
        let updated = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| {
                    MeshError::InvalidInput(format!("no memories for agent {agent_id}"))
                })?;
            let skill = entry
                .procedural
                .iter_mut()
                .find(|m| &m.id == skill_id)
                .ok_or_else(|| MeshError::InvalidInput(format!("unknown skill {skill_id}")))?;

            let outcome = if success { 1.0 } else { 0.0 };
            skill.success_rate =
                ((1.0 - weight) * skill.success_rate + weight * outcome).clamp(0.0, 1.0);
            let duration_ms = duration_ms.max(0.0);
            skill.average_duration = if skill.use_count == 0 && skill.average_duration == 0.0 {
                duration_ms
            } else {
                (1.0 - weight) * skill.average_duration + weight * duration_ms
            };
            skill.use_count += 1;
            skill.last_used = Some(Utc::now());
            skill.clone()
        };

        self.persist_procedural(&updated).await;
        Ok(updated)
    }

    /// Counts and highlights across an agent's three memory tiers.
    pub fn get_memory_summary(&self, agent_id: &AgentId) -> MemorySummary {
        let Some(entry) = self.agents.get(agent_id) else {
            return MemorySummary {
                agent_id: agent_id.clone(),
                episodic_count: 0,
                semantic_count: 0,
                procedural_count: 0,
                average_importance: 0.0,
                most_recent_experience: None,
                top_skills: Vec::new(),
            };
        };

        let average_importance = if entry.episodic.is_empty() {
            0.0
        } else {
            entry.episodic.iter().map(|m| m.importance).sum::<f64>() / entry.episodic.len() as f64
        };
        let mut skills: Vec<&ProceduralMemory> = entry.procedural.iter().collect();
        skills.sort_by(|a, b| cmp_desc(a.success_rate, b.success_rate));

        MemorySummary {
            agent_id: agent_id.clone(),
            episodic_count: entry.episodic.len(),
            semantic_count: entry.semantic.len(),
            procedural_count: entry.procedural.len(),
            average_importance,
            most_recent_experience: entry.episodic.iter().map(|m| m.timestamp).max(),
            top_skills: skills.iter().take(5).map(|s| s.skill_name.clone()).collect(),
        }
    }

    /// Distill repeated experiences into knowledge.
    ///
    /// Experiences not yet learned from are grouped by event type. Each group
    /// with at least `consolidation_min_occurrences` members creates (or
    /// refreshes) an `experience_pattern` knowledge record for that event type
    /// and marks its members as learned.
    pub async fn consolidate_memories(
        &self,
        agent_id: &AgentId,
    ) -> MeshResult<ConsolidationReport> {
        require_agent(agent_id)?;
        let started = Instant::now();
        let now = Utc::now();
        let min_occurrences = self.config.consolidation_min_occurrences.max(1);

        let (report, knowledge, learned) = {
            let mut entry = self.agents.entry(agent_id.clone()).or_default();

            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, m) in entry.episodic.iter().enumerate() {
                if !m.learned_from {
                    groups.entry(m.event_type.clone()).or_default().push(i);
                }
            }
            let episodes_reviewed: usize = groups.values().map(Vec::len).sum();

            let mut knowledge = Vec::new();
            let mut learned = Vec::new();
            for (event_type, members) in groups.iter().filter(|(_, m)| m.len() >= min_occurrences) {
                let stats = PatternStats::collect(members.iter().map(|&i| &entry.episodic[i]));
                let existing = entry.semantic.iter().position(|k| {
                    k.category == EXPERIENCE_PATTERN_CATEGORY && &k.concept == event_type
                });
                let record = match existing {
                    Some(pos) => {
                        let record = &mut entry.semantic[pos];
                        let prior = record
                            .knowledge
                            .get("occurrences")
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                        record.knowledge = stats.to_knowledge(prior);
                        record.confidence = stats.confidence(prior);
                        record.timestamp = now;
                        record.clone()
                    }
                    None => {
                        let id = self.unique_id(
                            &entry,
                            agent_id,
                            now,
                            &["semantic", EXPERIENCE_PATTERN_CATEGORY, event_type.as_str()],
                        );
                        let record = SemanticMemory {
                            id,
                            agent_id: agent_id.clone(),
                            category: EXPERIENCE_PATTERN_CATEGORY.to_string(),
                            concept: event_type.clone(),
                            knowledge: stats.to_knowledge(0),
                            confidence: stats.confidence(0),
                            source: "consolidation".to_string(),
                            timestamp: now,
                            last_accessed: now,
                            access_count: 0,
                        };
                        entry.semantic.push(record.clone());
                        record
                    }
                };
                knowledge.push(record);

                for &i in members {
                    entry.episodic[i].learned_from = true;
                    learned.push(entry.episodic[i].clone());
                }
            }

            let id = self.unique_id(&entry, agent_id, now, &["consolidation"]);
            let report = ConsolidationReport {
                id,
                agent_id: agent_id.clone(),
                episodes_reviewed: episodes_reviewed as u64,
                patterns_found: knowledge.len() as u64,
                knowledge_ids: knowledge.iter().map(|k| k.id.clone()).collect(),
                timestamp: now,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            (report, knowledge, learned)
        };

        for record in &knowledge {
            self.persist_semantic(record).await;
        }
        for memory in &learned {
            if let Err(e) = self.backend.store_episodic(memory).await {
                warn!(
                    agent = %agent_id,
                    memory_id = %memory.id,
                    error = %e,
                    "Failed to persist learned flag"
                );
            }
        }
        if let Err(e) = self.backend.record_consolidation(&report).await {
            warn!(agent = %agent_id, error = %e, "Failed to record consolidation");
        }

        info!(
            agent = %agent_id,
            reviewed = report.episodes_reviewed,
            patterns = report.patterns_found,
            "Memory consolidation complete"
        );
        Ok(report)
    }

    /// Load an agent's persisted memories, merging them with in-process ones.
    ///
    /// Returns the number of records that were not already held in memory.
    pub async fn load_agent(&self, agent_id: &AgentId) -> MeshResult<usize> {
        require_agent(agent_id)?;
        let episodic = self.backend.retrieve_episodic(agent_id).await?;
        let semantic = self.backend.retrieve_semantic(agent_id).await?;
        let procedural = self.backend.retrieve_procedural(agent_id).await?;

        let mut entry = self.agents.entry(agent_id.clone()).or_default();
        let mut added = 0;
        for m in episodic {
            if !entry.contains(&m.id) {
                entry.episodic.push(m);
                added += 1;
            }
        }
        for m in semantic {
            if !entry.contains(&m.id) {
                entry.semantic.push(m);
                added += 1;
            }
        }
        for m in procedural {
            if !entry.contains(&m.id) {
                entry.procedural.push(m);
                added += 1;
            }
        }
        debug!(agent = %agent_id, added, "Loaded persisted memories");
        Ok(added)
    }

    /// Derive an ID that no record of this agent already uses.
    fn unique_id(
        &self,
        memories: &AgentMemories,
        agent_id: &AgentId,
        timestamp: DateTime<Utc>,
        fields: &[&str],
    ) -> MemoryId {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed).to_string();
            let mut discriminators: Vec<&str> = fields.to_vec();
            discriminators.push(&seq);
            let id = MemoryId::derive(agent_id, timestamp, &discriminators);
            if !memories.contains(&id) {
                return id;
            }
        }
    }

    async fn persist_semantic(&self, memory: &SemanticMemory) {
        if let Err(e) = self.backend.store_semantic(memory).await {
            warn!(
                agent = %memory.agent_id,
                memory_id = %memory.id,
                error = %e,
                "Failed to persist knowledge"
            );
        }
    }

    async fn persist_procedural(&self, memory: &ProceduralMemory) {
        if let Err(e) = self.backend.store_procedural(memory).await {
            warn!(
                agent = %memory.agent_id,
                memory_id = %memory.id,
                error = %e,
                "Failed to persist skill"
            );
        }
    }
}

fn require_agent(agent_id: &AgentId) -> MeshResult<()> {
    if agent_id.as_str().is_empty() {
        return Err(MeshError::InvalidInput("agent_id must not be empty".into()));
    }
    Ok(())
}

/// Descending order for floats; NaN sorts as equal.
fn cmp_desc(a: f64, b: f64) -> CmpOrdering {
    b.partial_cmp(&a).unwrap_or(CmpOrdering::Equal)
}

struct PatternStats {
    occurrences: u64,
    average_importance: f64,
    average_valence: f64,
    outcomes: BTreeMap<String, u64>,
    last_seen: Option<DateTime<Utc>>,
}

impl PatternStats {
    fn collect<'a>(episodes: impl Iterator<Item = &'a EpisodicMemory>) -> Self {
        let mut stats = Self {
            occurrences: 0,
            average_importance: 0.0,
            average_valence: 0.0,
            outcomes: BTreeMap::new(),
            last_seen: None,
        };
        let (mut importance, mut valence) = (0.0, 0.0);
        for m in episodes {
            stats.occurrences += 1;
            importance += m.importance;
            valence += m.emotional_valence;
            if let Some(outcome) = &m.outcome {
                *stats.outcomes.entry(outcome.clone()).or_insert(0) += 1;
            }
            stats.last_seen = stats.last_seen.max(Some(m.timestamp));
        }
        if stats.occurrences > 0 {
            stats.average_importance = importance / stats.occurrences as f64;
            stats.average_valence = valence / stats.occurrences as f64;
        }
        stats
    }

    /// Confidence grows with total evidence, saturating at ten occurrences.
    fn confidence(&self, prior_occurrences: u64) -> f64 {
        ((self.occurrences + prior_occurrences) as f64 / 10.0).min(1.0)
    }

    fn to_knowledge(&self, prior_occurrences: u64) -> HashMap<String, Value> {
        let mut knowledge = HashMap::new();
        knowledge.insert(
            "occurrences".to_string(),
            Value::from(self.occurrences + prior_occurrences),
        );
        knowledge.insert(
            "average_importance".to_string(),
            Value::from(self.average_importance),
        );
        knowledge.insert(
            "average_valence".to_string(),
            Value::from(self.average_valence),
        );
        knowledge.insert(
            "outcomes".to_string(),
            serde_json::to_value(&self.outcomes).unwrap_or(Value::Null),
        );
        if let Some(last_seen) = self.last_seen {
            knowledge.insert("last_seen".to_string(), Value::from(last_seen.to_rfc3339()));
        }
        knowledge
    }
}
