//! SQLite store for the self-improvement loop: task feedback, learned
//! insights, suggested actions and the local opportunity queue.

use crate::codec::{fmt_time, from_json_or_default, lock_err, parse_time, storage_err, to_json};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::improvement::{
    FeedbackId, ImprovementAction, ImprovementOpportunity, ImprovementType, InsightCategory,
    LearningInsight, PerformanceFeedback,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Feedback store backed by SQLite.
#[derive(Clone)]
pub struct FeedbackStore {
    conn: Arc<Mutex<Connection>>,
}

impl FeedbackStore {
    /// Create a new feedback store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append a feedback record.
    pub fn insert_feedback(&self, feedback: &PerformanceFeedback) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let context = to_json(&feedback.context)?;
        conn.execute(
            "INSERT INTO performance_feedback (id, agent_id, task_type, success, execution_time_ms, quality_score, user_satisfaction, error_details, context, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                feedback.id.0.to_string(),
                feedback.agent_id.as_str(),
                feedback.task_type,
                feedback.success,
                feedback.execution_time_ms,
                feedback.quality_score,
                feedback.user_satisfaction,
                feedback.error_details,
                context,
                fmt_time(&feedback.timestamp),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Feedback recorded at or after `since`, oldest first. `None` loads every agent.
    pub fn load_since(
        &self,
        agent_id: Option<&AgentId>,
        since: DateTime<Utc>,
    ) -> MeshResult<Vec<PerformanceFeedback>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut sql = String::from(
            "SELECT id, agent_id, task_type, success, execution_time_ms, quality_score, user_satisfaction, error_details, context, timestamp
             FROM performance_feedback WHERE timestamp >= ?1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(fmt_time(&since))];
        if let Some(agent_id) = agent_id {
            sql.push_str(" AND agent_id = ?2");
            params.push(Box::new(agent_id.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, agent, task_type, success, exec, quality, satisfaction, error, context, ts) =
                row.map_err(storage_err)?;
            let id = match uuid::Uuid::parse_str(&id) {
                Ok(u) => FeedbackId(u),
                Err(e) => {
                    warn!(id = %id, "Skipping feedback row with bad id: {e}");
                    continue;
                }
            };
            records.push(PerformanceFeedback {
                id,
                agent_id: AgentId(agent),
                task_type,
                success,
                execution_time_ms: exec,
                quality_score: quality,
                user_satisfaction: satisfaction,
                error_details: error,
                context: from_json_or_default("context", &context),
                timestamp: parse_time(&ts),
            });
        }
        Ok(records)
    }

    /// Delete feedback older than `cutoff`. Returns rows removed.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> MeshResult<usize> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let removed = conn
            .execute(
                "DELETE FROM performance_feedback WHERE timestamp < ?1",
                rusqlite::params![fmt_time(&cutoff)],
            )
            .map_err(storage_err)?;
        Ok(removed)
    }

    /// Total feedback rows.
    pub fn count_all(&self) -> MeshResult<usize> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM performance_feedback", [], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;
        Ok(n as usize)
    }

    /// Insert or replace an insight.
    pub fn upsert_insight(&self, insight: &LearningInsight) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let learned_from = to_json(&insight.learned_from)?;
        conn.execute(
            "INSERT OR REPLACE INTO learning_insights (id, agent_id, category, pattern, confidence, evidence_count, learned_from, timestamp, task_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                insight.id,
                insight.agent_id.as_str(),
                insight.category.as_str(),
                insight.pattern,
                insight.confidence,
                insight.evidence_count as i64,
                learned_from,
                fmt_time(&insight.timestamp),
                insight.task_type,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Insights for an agent (every agent if `None`).
    pub fn load_insights(&self, agent_id: Option<&AgentId>) -> MeshResult<Vec<LearningInsight>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut sql = String::from(
            "SELECT id, agent_id, category, pattern, confidence, evidence_count, learned_from, timestamp, task_type
             FROM learning_insights",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(agent_id) = agent_id {
            sql.push_str(" WHERE agent_id = ?1");
            params.push(Box::new(agent_id.as_str().to_string()));
        }
        sql.push_str(" ORDER BY confidence DESC, timestamp DESC");

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(storage_err)?;

        let mut insights = Vec::new();
        for row in rows {
            let (id, agent, category, pattern, confidence, evidence, learned, ts, task_type) =
                row.map_err(storage_err)?;
            let Some(category) = InsightCategory::parse(&category) else {
                warn!(id = %id, category = %category, "Skipping insight with unknown category");
                continue;
            };
            insights.push(LearningInsight {
                id,
                agent_id: AgentId(agent),
                task_type,
                category,
                pattern,
                confidence,
                evidence_count: evidence.max(0) as usize,
                learned_from: from_json_or_default("learned_from", &learned),
                timestamp: parse_time(&ts),
            });
        }
        Ok(insights)
    }

    /// Insert or replace an action.
    pub fn upsert_action(&self, action: &ImprovementAction) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let validation = match &action.validation_results {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        conn.execute(
            "INSERT OR REPLACE INTO improvement_actions (id, agent_id, improvement_type, description, expected_impact, implemented, validation_results, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                action.id,
                action.agent_id.as_str(),
                action.improvement_type.as_str(),
                action.description,
                action.expected_impact,
                action.implemented,
                validation,
                fmt_time(&action.timestamp),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Actions for an agent, highest expected impact first.
    pub fn load_actions(&self, agent_id: &AgentId) -> MeshResult<Vec<ImprovementAction>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, improvement_type, description, expected_impact, implemented, validation_results, timestamp
                 FROM improvement_actions WHERE agent_id = ?1 ORDER BY expected_impact DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(storage_err)?;

        let mut actions = Vec::new();
        for row in rows {
            let (id, kind, description, impact, implemented, validation, ts) =
                row.map_err(storage_err)?;
            let Some(improvement_type) = ImprovementType::parse(&kind) else {
                warn!(id = %id, kind = %kind, "Skipping action with unknown type");
                continue;
            };
            actions.push(ImprovementAction {
                id,
                agent_id: agent_id.clone(),
                improvement_type,
                description,
                expected_impact: impact,
                implemented,
                validation_results: validation.map(|v| {
                    from_json_or_default::<HashMap<String, serde_json::Value>>(
                        "validation_results",
                        &v,
                    )
                }),
                timestamp: parse_time(&ts),
            });
        }
        Ok(actions)
    }

    /// Queue an opportunity that couldn't be handed to the iteration engine.
    pub fn save_opportunity(&self, opportunity: &ImprovementOpportunity) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let payload = to_json(opportunity)?;
        let iteration_type = to_json(&opportunity.iteration_type)?;
        let status = to_json(&opportunity.status)?;
        conn.execute(
            "INSERT OR REPLACE INTO improvement_opportunities (id, agent_id, iteration_type, impact_score, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                opportunity.id.to_string(),
                opportunity.agent_id.as_str(),
                iteration_type,
                opportunity.impact_score,
                status,
                payload,
                fmt_time(&opportunity.created_at),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Every queued opportunity, highest impact first.
    pub fn load_opportunities(&self) -> MeshResult<Vec<ImprovementOpportunity>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT payload FROM improvement_opportunities ORDER BY impact_score DESC, created_at ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        let mut opportunities = Vec::new();
        for row in rows {
            let payload = row.map_err(storage_err)?;
            let opp: ImprovementOpportunity = serde_json::from_str(&payload)
                .map_err(|e| MeshError::Serialization(e.to_string()))?;
            opportunities.push(opp);
        }
        Ok(opportunities)
    }
}
