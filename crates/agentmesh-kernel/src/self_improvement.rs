//! Self-improvement: statistical analysis of recorded task outcomes.
//!
//! Every recorded outcome triggers an analysis of the agent's trailing
//! window. Per task type, persistently poor success, speed or quality becomes
//! a [`LearningInsight`] plus a suggested [`ImprovementAction`]. A drop between
//! the older and newer halves of the window becomes an
//! [`ImprovementOpportunity`] for the external iteration engine, or is queued
//! locally when the engine is unavailable.

use agentmesh_memory::feedback::FeedbackStore;
use agentmesh_types::agent::AgentId;
use agentmesh_types::config::ImprovementConfig;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::improvement::{
    FeedbackId, ImprovementAction, ImprovementOpportunity, ImprovementStatus, InsightCategory,
    IterationEngine, IterationType, LearningInsight, PerformanceFeedback, PerformanceSummary,
    TaskFeedback,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything one analysis pass produced.
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub insights: Vec<LearningInsight>,
    pub actions: Vec<ImprovementAction>,
    pub opportunities: Vec<ImprovementOpportunity>,
}

/// The feedback loop shared by every agent in the mesh.
pub struct SelfImprovementSystem {
    config: ImprovementConfig,
    store: Option<FeedbackStore>,
    engine: Arc<dyn IterationEngine>,
    /// Per-agent feedback, oldest first.
    feedback: DashMap<AgentId, Vec<PerformanceFeedback>>,
    insights: DashMap<String, LearningInsight>,
    actions: DashMap<String, ImprovementAction>,
    pending: Mutex<Vec<ImprovementOpportunity>>,
    last_emitted: DashMap<(AgentId, IterationType), DateTime<Utc>>,
}

impl SelfImprovementSystem {
    pub fn new(
        config: ImprovementConfig,
        store: Option<FeedbackStore>,
        engine: Arc<dyn IterationEngine>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            feedback: DashMap::new(),
            insights: DashMap::new(),
            actions: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            last_emitted: DashMap::new(),
        }
    }

    /// Validate, store and analyze one task outcome.
    ///
    /// Only validation failures are returned; storage and analysis problems
    /// are logged.
    pub async fn record_feedback(&self, report: TaskFeedback) -> MeshResult<FeedbackId> {
        report.validate()?;
        let feedback = PerformanceFeedback::from_report(report);
        let id = feedback.id;
        let agent_id = feedback.agent_id.clone();

        if let Some(store) = self.store.clone() {
            let row = feedback.clone();
            if let Err(e) = blocking(move || store.insert_feedback(&row)).await {
                warn!(
                    agent = %agent_id,
                    feedback_id = %id,
                    error = %e,
                    "Failed to persist feedback"
                );
            }
        }
        self.feedback
            .entry(agent_id.clone())
            .or_default()
            .push(feedback);
        debug!(agent = %agent_id, feedback_id = %id, "Feedback recorded");

        if let Err(e) = self.analyze_agent(&agent_id).await {
            warn!(agent = %agent_id, error = %e, "Feedback analysis failed");
        }
        Ok(id)
    }

    /// Analyze an agent's trailing window. No-op below the minimum history.
    pub async fn analyze_agent(&self, agent_id: &AgentId) -> MeshResult<AnalysisReport> {
        let since = days_ago(self.config.analysis_window_days);
        let window = self.feedback_since(agent_id, since);
        if window.len() < self.config.min_feedback_for_analysis {
            debug!(
                agent = %agent_id,
                records = window.len(),
                required = self.config.min_feedback_for_analysis,
                "Not enough feedback to analyze"
            );
            return Ok(AnalysisReport::default());
        }

        let mut report = AnalysisReport {
            insights: detect_patterns(&self.config, agent_id, &window),
            ..Default::default()
        };
        for insight in &report.insights {
            self.save_insight(insight).await;
        }

        for action in generate_suggestions(&report.insights) {
            if self.actions.contains_key(&action.id) {
                continue;
            }
            self.save_action(&action).await;
            report.actions.push(action);
        }

        if window.len() >= self.config.min_feedback_for_degradation {
            for opportunity in detect_degradation(&self.config, agent_id, &window) {
                if !self.claim_emission(agent_id, opportunity.iteration_type) {
                    debug!(
                        agent = %agent_id,
                        iteration_type = ?opportunity.iteration_type,
                        "Opportunity suppressed by cooldown"
                    );
                    continue;
                }
                self.emit_opportunity(opportunity.clone()).await;
                report.opportunities.push(opportunity);
            }
        }

        if !report.insights.is_empty() || !report.opportunities.is_empty() {
            info!(
                agent = %agent_id,
                insights = report.insights.len(),
                new_actions = report.actions.len(),
                opportunities = report.opportunities.len(),
                "Performance analysis complete"
            );
        }
        Ok(report)
    }

    /// Re-analyze every agent with feedback in the last hour.
    ///
    /// A failing agent is logged and skipped. Returns the number analyzed.
    pub async fn run_periodic_analysis(&self) -> usize {
        let since = Utc::now() - ChronoDuration::hours(1);
        let mut analyzed = 0;
        for agent_id in self.agents_with_feedback_since(since) {
            match self.analyze_agent(&agent_id).await {
                Ok(_) => analyzed += 1,
                Err(e) => warn!(agent = %agent_id, error = %e, "Periodic analysis failed"),
            }
        }
        analyzed
    }

    /// Roll up an agent's last `days` of feedback.
    ///
    /// `days` is clamped to the representable time range.
    pub fn get_agent_performance_summary(
        &self,
        agent_id: &AgentId,
        days: i64,
    ) -> PerformanceSummary {
        let since = days_ago(days);
        let window = self.feedback_since(agent_id, since);
        let stats = WindowStats::of(window.iter());

        let mut top_insights = self.list_insights(Some(agent_id));
        top_insights.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        top_insights.truncate(5);

        let mut improvement_opportunities: Vec<ImprovementAction> = self
            .list_actions(agent_id)
            .into_iter()
            .filter(|a| !a.implemented)
            .collect();
        improvement_opportunities.sort_by(|a, b| {
            b.expected_impact
                .partial_cmp(&a.expected_impact)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        PerformanceSummary {
            agent_id: agent_id.clone(),
            period_days: days,
            total_tasks: window.len(),
            success_rate: stats.success_rate,
            average_execution_time_ms: stats.average_execution_ms,
            average_quality_score: stats.average_quality,
            top_insights,
            improvement_opportunities,
        }
    }

    /// Current insights, optionally for one agent.
    pub fn list_insights(&self, agent_id: Option<&AgentId>) -> Vec<LearningInsight> {
        let mut insights: Vec<LearningInsight> = self
            .insights
            .iter()
            .filter(|i| agent_id.is_none_or(|a| &i.agent_id == a))
            .map(|i| i.value().clone())
            .collect();
        insights.sort_by(|a, b| a.id.cmp(&b.id));
        insights
    }

    /// Suggested actions for one agent.
    pub fn list_actions(&self, agent_id: &AgentId) -> Vec<ImprovementAction> {
        let mut actions: Vec<ImprovementAction> = self
            .actions
            .iter()
            .filter(|a| &a.agent_id == agent_id)
            .map(|a| a.value().clone())
            .collect();
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        actions
    }

    /// Record that a suggested action was applied, with optional results.
    pub async fn mark_action_implemented(
        &self,
        action_id: &str,
        validation_results: Option<HashMap<String, Value>>,
    ) -> MeshResult<ImprovementAction> {
        let updated = {
            let mut action = self
                .actions
                .get_mut(action_id)
                .ok_or_else(|| MeshError::InvalidInput(format!("unknown action {action_id}")))?;
            action.implemented = true;
            action.validation_results = validation_results;
            action.timestamp = Utc::now();
            action.clone()
        };
        self.persist_action(&updated).await;
        info!(action_id, agent = %updated.agent_id, "Improvement action implemented");
        Ok(updated)
    }

    /// Opportunities the iteration engine has not accepted yet.
    pub fn pending_opportunities(&self) -> Vec<ImprovementOpportunity> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Drop feedback older than the retention period. Returns rows removed.
    pub async fn purge_expired(&self) -> MeshResult<usize> {
        let cutoff = days_ago(self.config.retention_days);
        let mut removed_in_memory = 0;
        for mut entry in self.feedback.iter_mut() {
            let before = entry.len();
            entry.retain(|f| f.timestamp >= cutoff);
            removed_in_memory += before - entry.len();
        }
        self.feedback.retain(|_, v| !v.is_empty());

        let removed = match self.store.clone() {
            Some(store) => blocking(move || store.purge_before(cutoff)).await?,
            None => removed_in_memory,
        };
        if removed > 0 {
            info!(removed, retention_days = self.config.retention_days, "Purged expired feedback");
        }
        Ok(removed)
    }

    /// Hydrate from storage: the last `days` of feedback, all insights, the
    /// feedback agents' actions and the queued opportunities.
    pub async fn load_recent(&self, days: i64) -> MeshResult<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let since = days_ago(days);
        let (feedback, insights, actions, opportunities) = blocking(move || {
            let feedback = store.load_since(None, since)?;
            let insights = store.load_insights(None)?;
            let mut agents: Vec<AgentId> = feedback.iter().map(|f| f.agent_id.clone()).collect();
            agents.extend(insights.iter().map(|i| i.agent_id.clone()));
            agents.sort();
            agents.dedup();
            let mut actions = Vec::new();
            for agent in &agents {
                actions.extend(store.load_actions(agent)?);
            }
            let opportunities = store.load_opportunities()?;
            Ok((feedback, insights, actions, opportunities))
        })
        .await?;

        let loaded = feedback.len();
        for record in feedback {
            let mut entry = self.feedback.entry(record.agent_id.clone()).or_default();
            if !entry.iter().any(|f| f.id == record.id) {
                entry.push(record);
            }
        }
        for mut entry in self.feedback.iter_mut() {
            entry.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
        for insight in insights {
            self.insights.insert(insight.id.clone(), insight);
        }
        for action in actions {
            self.actions.insert(action.id.clone(), action);
        }
        if let Ok(mut pending) = self.pending.lock() {
            for opportunity in opportunities {
                if !pending.iter().any(|p| p.id == opportunity.id) {
                    pending.push(opportunity);
                }
            }
        }
        info!(feedback = loaded, "Loaded recent self-improvement state");
        Ok(loaded)
    }

    /// Agents with at least one feedback record at or after `since`.
    pub fn agents_with_feedback_since(&self, since: DateTime<Utc>) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .feedback
            .iter()
            .filter(|e| e.value().iter().any(|f| f.timestamp >= since))
            .map(|e| e.key().clone())
            .collect();
        agents.sort();
        agents
    }

    fn feedback_since(&self, agent_id: &AgentId, since: DateTime<Utc>) -> Vec<PerformanceFeedback> {
        let mut window: Vec<PerformanceFeedback> = self
            .feedback
            .get(agent_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|f| f.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        window
    }

    /// Record an emission for `(agent_id, iteration_type)` unless one happened
    /// within the cooldown. Returns whether the caller may emit.
    ///
    /// The check and the update happen under the same map entry lock.
    fn claim_emission(&self, agent_id: &AgentId, iteration_type: IterationType) -> bool {
        let cooldown = i64::try_from(self.config.opportunity_cooldown_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds);
        let now = Utc::now();
        match self.last_emitted.entry((agent_id.clone(), iteration_type)) {
            Entry::Occupied(mut last) => {
                let expired = cooldown.is_some_and(|c| now.signed_duration_since(*last.get()) >= c);
                if expired {
                    last.insert(now);
                }
                expired
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    async fn emit_opportunity(&self, opportunity: ImprovementOpportunity) {
        if self.engine.is_available() {
            match self.engine.submit_opportunity(opportunity.clone()).await {
                Ok(()) => {
                    info!(
                        agent = %opportunity.agent_id,
                        title = %opportunity.title,
                        impact = opportunity.impact_score,
                        "Improvement opportunity submitted"
                    );
                    return;
                }
                Err(e) => warn!(
                    error = %e,
                    "Iteration engine rejected opportunity; queueing locally"
                ),
            }
        }

        if let Some(store) = self.store.clone() {
            let row = opportunity.clone();
            if let Err(e) = blocking(move || store.save_opportunity(&row)).await {
                warn!(error = %e, "Failed to persist queued opportunity");
            }
        }
        info!(
            agent = %opportunity.agent_id,
            title = %opportunity.title,
            impact = opportunity.impact_score,
            "Improvement opportunity queued locally"
        );
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(opportunity);
        }
    }

    async fn save_insight(&self, insight: &LearningInsight) {
        self.insights.insert(insight.id.clone(), insight.clone());
        if let Some(store) = self.store.clone() {
            let row = insight.clone();
            if let Err(e) = blocking(move || store.upsert_insight(&row)).await {
                warn!(insight_id = %insight.id, error = %e, "Failed to persist insight");
            }
        }
    }

    async fn save_action(&self, action: &ImprovementAction) {
        self.actions.insert(action.id.clone(), action.clone());
        self.persist_action(action).await;
    }

    async fn persist_action(&self, action: &ImprovementAction) {
        if let Some(store) = self.store.clone() {
            let row = action.clone();
            if let Err(e) = blocking(move || store.upsert_action(&row)).await {
                warn!(action_id = %action.id, error = %e, "Failed to persist improvement action");
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> MeshResult<T>
where
    F: FnOnce() -> MeshResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MeshError::Internal(format!("storage task failed: {e}")))?
}

struct WindowStats {
    success_rate: f64,
    average_execution_ms: f64,
    average_quality: f64,
}

impl WindowStats {
    fn of<'a>(records: impl Iterator<Item = &'a PerformanceFeedback>) -> Self {
        let (mut n, mut successes, mut exec, mut quality) = (0usize, 0usize, 0.0, 0.0);
        for f in records {
            n += 1;
            if f.success {
                successes += 1;
            }
            exec += f.execution_time_ms;
            quality += f.quality_score;
        }
        if n == 0 {
            return Self {
                success_rate: 0.0,
                average_execution_ms: 0.0,
                average_quality: 0.0,
            };
        }
        let n = n as f64;
        Self {
            success_rate: successes as f64 / n,
            average_execution_ms: exec / n,
            average_quality: quality / n,
        }
    }
}

/// Stable insight ID: one insight per agent, task type and category.
/// `days` before now, saturating at the earliest representable instant.
fn days_ago(days: i64) -> DateTime<Utc> {
    ChronoDuration::try_days(days.max(0))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn insight_id(agent_id: &AgentId, task_type: &str, category: InsightCategory) -> String {
    format!("{agent_id}:{task_type}:{}", category.as_str())
}

/// Per task type, flag low success, slow execution and low quality.
pub fn detect_patterns(
    config: &ImprovementConfig,
    agent_id: &AgentId,
    window: &[PerformanceFeedback],
) -> Vec<LearningInsight> {
    let mut by_type: BTreeMap<&str, Vec<&PerformanceFeedback>> = BTreeMap::new();
    for f in window {
        by_type.entry(f.task_type.as_str()).or_default().push(f);
    }

    let saturation = (2 * config.min_feedback_for_analysis).max(1) as f64;
    let now = Utc::now();
    let mut insights = Vec::new();
    for (task_type, records) in by_type {
        let stats = WindowStats::of(records.iter().copied());
        let evidence_count = records.len();
        let learned_from: Vec<FeedbackId> = records.iter().map(|f| f.id).collect();
        let confidence = (evidence_count as f64 / saturation).min(1.0);

        let mut found = Vec::new();
        if stats.success_rate < config.success_rate_threshold {
            found.push((
                InsightCategory::LowSuccessRate,
                format!(
                    "'{task_type}' tasks succeed {:.1}% of the time (threshold {:.0}%)",
                    stats.success_rate * 100.0,
                    config.success_rate_threshold * 100.0
                ),
            ));
        }
        if stats.average_execution_ms > config.slow_execution_ms {
            found.push((
                InsightCategory::SlowExecution,
                format!(
                    "'{task_type}' tasks average {:.0}ms (threshold {:.0}ms)",
                    stats.average_execution_ms, config.slow_execution_ms
                ),
            ));
        }
        if stats.average_quality < config.quality_threshold {
            found.push((
                InsightCategory::LowQuality,
                format!(
                    "'{task_type}' tasks average quality {:.2} (threshold {:.2})",
                    stats.average_quality, config.quality_threshold
                ),
            ));
        }

        for (category, pattern) in found {
            insights.push(LearningInsight {
                id: insight_id(agent_id, task_type, category),
                agent_id: agent_id.clone(),
                task_type: task_type.to_string(),
                category,
                pattern,
                confidence,
                evidence_count,
                learned_from: learned_from.clone(),
                timestamp: now,
            });
        }
    }
    insights
}

/// One suggested action per insight, never applied automatically.
pub fn generate_suggestions(insights: &[LearningInsight]) -> Vec<ImprovementAction> {
    insights
        .iter()
        .map(|insight| {
            let description = match insight.category {
                InsightCategory::LowSuccessRate => format!(
                    "Add error handling and retries to '{}' tasks: {}",
                    insight.task_type, insight.pattern
                ),
                InsightCategory::SlowExecution => format!(
                    "Profile and optimize '{}' tasks: {}",
                    insight.task_type, insight.pattern
                ),
                InsightCategory::LowQuality => format!(
                    "Review output validation for '{}' tasks: {}",
                    insight.task_type, insight.pattern
                ),
            };
            ImprovementAction {
                id: format!("{}:action", insight.id),
                agent_id: insight.agent_id.clone(),
                improvement_type: insight.category.improvement_type(),
                description,
                expected_impact: insight.category.expected_impact(),
                implemented: false,
                validation_results: None,
                timestamp: insight.timestamp,
            }
        })
        .collect()
}

/// Compare the older and newer halves of the window for regressions.
pub fn detect_degradation(
    config: &ImprovementConfig,
    agent_id: &AgentId,
    window: &[PerformanceFeedback],
) -> Vec<ImprovementOpportunity> {
    if window.len() < config.min_feedback_for_degradation.max(2) {
        return Vec::new();
    }
    let (older, newer) = window.split_at(window.len() / 2);
    let older_stats = WindowStats::of(older.iter());
    let newer_stats = WindowStats::of(newer.iter());
    let mut opportunities = Vec::new();

    if older_stats.success_rate > 0.0
        && newer_stats.success_rate < config.success_regression_ratio * older_stats.success_rate
    {
        let mut evidence = HashMap::new();
        evidence.insert("older_success_rate".to_string(), Value::from(older_stats.success_rate));
        evidence.insert("newer_success_rate".to_string(), Value::from(newer_stats.success_rate));
        evidence.insert("sample_size".to_string(), Value::from(window.len()));
        opportunities.push(opportunity(
            agent_id,
            IterationType::BugFix,
            format!("Success rate regression for {agent_id}"),
            format!(
                "Success rate fell from {:.1}% to {:.1}% across the last {} tasks",
                older_stats.success_rate * 100.0,
                newer_stats.success_rate * 100.0,
                window.len()
            ),
            8.0,
            5.0,
            evidence,
            vec![format!(
                "Success rate back above {:.0}%",
                config.success_regression_ratio * older_stats.success_rate * 100.0
            )],
            "Low: fixes target failures already observed in production",
        ));
    }

    if older_stats.average_execution_ms > 0.0
        && newer_stats.average_execution_ms
            > config.latency_regression_ratio * older_stats.average_execution_ms
    {
        let mut evidence = HashMap::new();
        evidence.insert(
            "older_average_ms".to_string(),
            Value::from(older_stats.average_execution_ms),
        );
        evidence.insert(
            "newer_average_ms".to_string(),
            Value::from(newer_stats.average_execution_ms),
        );
        evidence.insert("sample_size".to_string(), Value::from(window.len()));
        opportunities.push(opportunity(
            agent_id,
            IterationType::PerformanceOptimization,
            format!("Latency regression for {agent_id}"),
            format!(
                "Average execution time rose from {:.0}ms to {:.0}ms",
                older_stats.average_execution_ms, newer_stats.average_execution_ms
            ),
            7.0,
            6.0,
            evidence,
            vec![format!(
                "Average execution time below {:.0}ms",
                older_stats.average_execution_ms * config.latency_regression_ratio
            )],
            "Medium: optimizations can change behaviour under load",
        ));
    }
    opportunities
}

#[allow(clippy::too_many_arguments)]
fn opportunity(
    agent_id: &AgentId,
    iteration_type: IterationType,
    title: String,
    description: String,
    impact_score: f64,
    effort_score: f64,
    evidence: HashMap<String, Value>,
    success_criteria: Vec<String>,
    risk_assessment: &str,
) -> ImprovementOpportunity {
    ImprovementOpportunity {
        id: Uuid::new_v4(),
        agent_id: agent_id.clone(),
        iteration_type,
        title,
        description,
        impact_score,
        effort_score,
        priority_score: impact_score / effort_score,
        evidence,
        affected_components: vec![agent_id.to_string()],
        success_criteria,
        risk_assessment: risk_assessment.to_string(),
        status: ImprovementStatus::Identified,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::improvement::{ImprovementType, NoopIterationEngine};
    use async_trait::async_trait;

    fn system() -> SelfImprovementSystem {
        SelfImprovementSystem::new(
            ImprovementConfig::default(),
            None,
            Arc::new(NoopIterationEngine),
        )
    }

    #[derive(Default)]
    struct RecordingEngine {
        submitted: Mutex<Vec<ImprovementOpportunity>>,
    }

    #[async_trait]
    impl IterationEngine for RecordingEngine {
        async fn submit_opportunity(&self, opportunity: ImprovementOpportunity) -> MeshResult<()> {
            self.submitted.lock().unwrap().push(opportunity);
            Ok(())
        }
    }

    async fn record_n(sys: &SelfImprovementSystem, agent: &str, outcomes: &[bool]) {
        for &success in outcomes {
            sys.record_feedback(TaskFeedback::new(agent, "render", success, 100.0, 0.9))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_agent_rejected() {
        let sys = system();
        let err = sys
            .record_feedback(TaskFeedback::new("", "render", true, 1.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_no_analysis_below_minimum() {
        let sys = system();
        record_n(&sys, "a", &[false; 9]).await;
        assert!(sys.list_insights(None).is_empty());
    }

    #[tokio::test]
    async fn test_low_success_insight_at_boundary() {
        let sys = system();
        let mut outcomes = [true; 10];
        outcomes[..4].copy_from_slice(&[false; 4]);
        record_n(&sys, "four_failures", &outcomes).await;

        let insights = sys.list_insights(Some(&AgentId::from("four_failures")));
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].category, InsightCategory::LowSuccessRate);
        assert_eq!(insights[0].evidence_count, 10);
        assert_eq!(insights[0].learned_from.len(), 10);

        let actions = sys.list_actions(&AgentId::from("four_failures"));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].improvement_type, ImprovementType::ErrorHandling);
        assert_eq!(actions[0].expected_impact, 0.25);
        assert!(!actions[0].implemented);

        let mut outcomes = [true; 10];
        outcomes[..3].copy_from_slice(&[false; 3]);
        record_n(&sys, "three_failures", &outcomes).await;
        assert!(sys
            .list_insights(Some(&AgentId::from("three_failures")))
            .is_empty());
    }

    #[tokio::test]
    async fn test_slow_and_low_quality_insights() {
        let sys = system();
        for _ in 0..10 {
            sys.record_feedback(TaskFeedback::new("a", "report", true, 6000.0, 0.5))
                .await
                .unwrap();
        }
        let categories: Vec<_> = sys
            .list_insights(None)
            .into_iter()
            .map(|i| i.category)
            .collect();
        assert!(categories.contains(&InsightCategory::SlowExecution));
        assert!(categories.contains(&InsightCategory::LowQuality));
        assert!(!categories.contains(&InsightCategory::LowSuccessRate));
    }

    #[tokio::test]
    async fn test_degradation_queues_opportunity_without_engine() {
        let sys = system();
        let mut outcomes = vec![true; 10];
        outcomes.extend([true, false].repeat(5));
        record_n(&sys, "a", &outcomes).await;

        let pending = sys.pending_opportunities();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].iteration_type, IterationType::BugFix);
        assert_eq!(pending[0].impact_score, 8.0);
        assert_eq!(pending[0].status, ImprovementStatus::Identified);

        // Cooldown keeps the same regression from being re-emitted.
        record_n(&sys, "a", &[false]).await;
        assert_eq!(sys.pending_opportunities().len(), 1);
    }

    #[tokio::test]
    async fn test_degradation_submitted_to_engine() {
        let engine = Arc::new(RecordingEngine::default());
        let sys = SelfImprovementSystem::new(
            ImprovementConfig::default(),
            None,
            Arc::clone(&engine) as Arc<dyn IterationEngine>,
        );
        for i in 0..20 {
            let ms = if i < 10 { 100.0 } else { 400.0 };
            sys.record_feedback(TaskFeedback::new("a", "render", true, ms, 0.9))
                .await
                .unwrap();
        }
        let submitted = engine.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].iteration_type, IterationType::PerformanceOptimization);
        assert_eq!(submitted[0].impact_score, 7.0);
        assert!(sys.pending_opportunities().is_empty());
    }

    #[tokio::test]
    async fn test_performance_summary_and_mark_implemented() {
        let sys = system();
        let mut outcomes = [true; 10];
        outcomes[..5].copy_from_slice(&[false; 5]);
        record_n(&sys, "a", &outcomes).await;

        let agent = AgentId::from("a");
        let summary = sys.get_agent_performance_summary(&agent, 7);
        assert_eq!(summary.total_tasks, 10);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.average_execution_time_ms, 100.0);
        assert_eq!(summary.top_insights.len(), 1);
        assert_eq!(summary.improvement_opportunities.len(), 1);

        let action_id = summary.improvement_opportunities[0].id.clone();
        let action = sys.mark_action_implemented(&action_id, None).await.unwrap();
        assert!(action.implemented);
        let summary = sys.get_agent_performance_summary(&agent, 7);
        assert!(summary.improvement_opportunities.is_empty());

        assert!(sys.mark_action_implemented("missing", None).await.is_err());
    }

    #[tokio::test]
    async fn test_persisted_state_reloads() {
        let store = agentmesh_memory::MeshStore::open_in_memory().unwrap();
        {
            let sys = SelfImprovementSystem::new(
                ImprovementConfig::default(),
                Some(store.feedback()),
                Arc::new(NoopIterationEngine),
            );
            record_n(&sys, "a", &[false; 10]).await;
        }

        let fresh = SelfImprovementSystem::new(
            ImprovementConfig::default(),
            Some(store.feedback()),
            Arc::new(NoopIterationEngine),
        );
        assert_eq!(fresh.load_recent(7).await.unwrap(), 10);
        assert_eq!(fresh.list_insights(None).len(), 1);
        assert_eq!(fresh.list_actions(&AgentId::from("a")).len(), 1);
        assert_eq!(fresh.purge_expired().await.unwrap(), 0);
    }

    #[test]
    fn test_cooldown_claim_is_exclusive() {
        let sys = system();
        let agent = AgentId::from("a");
        let claimed = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| sys.claim_emission(&agent, IterationType::BugFix)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count()
        });
        assert_eq!(claimed, 1);
        // Other iteration types have their own cooldown.
        assert!(sys.claim_emission(&agent, IterationType::PerformanceOptimization));

        let no_cooldown = SelfImprovementSystem::new(
            ImprovementConfig {
                opportunity_cooldown_secs: 0,
                ..ImprovementConfig::default()
            },
            None,
            Arc::new(NoopIterationEngine),
        );
        assert!(no_cooldown.claim_emission(&agent, IterationType::BugFix));
        assert!(no_cooldown.claim_emission(&agent, IterationType::BugFix));
    }

    #[tokio::test]
    async fn test_summary_window_saturates() {
        let sys = system();
        record_n(&sys, "a", &[true, true, false]).await;
        let agent = AgentId::from("a");

        let summary = sys.get_agent_performance_summary(&agent, i64::MAX);
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.period_days, i64::MAX);

        let summary = sys.get_agent_performance_summary(&agent, i64::MIN);
        assert_eq!(summary.period_days, i64::MIN);
        assert!(summary.total_tasks <= 3);
    }

    #[test]
    fn test_detect_degradation_needs_minimum() {
        let config = ImprovementConfig::default();
        let window: Vec<PerformanceFeedback> = (0..19)
            .map(|_| PerformanceFeedback::from_report(TaskFeedback::new("a", "t", false, 1.0, 1.0)))
            .collect();
        assert!(detect_degradation(&config, &AgentId::from("a"), &window).is_empty());
    }
}
