//! Self-improvement types: task feedback, learned insights, suggested actions,
//! and the contract for handing opportunities to an external iteration engine.

use crate::agent::AgentId;
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackId(pub Uuid);

impl FeedbackId {
    /// Create a new random FeedbackId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FeedbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FeedbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one task execution, as reported by the agent that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFeedback {
    pub agent_id: AgentId,
    pub task_type: String,
    pub success: bool,
    pub execution_time_ms: f64,
    /// Quality score (0.0 - 1.0).
    pub quality_score: f64,
    pub user_satisfaction: Option<f64>,
    pub error_details: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskFeedback {
    pub fn new(
        agent_id: impl Into<AgentId>,
        task_type: impl Into<String>,
        success: bool,
        execution_time_ms: f64,
        quality_score: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            success,
            execution_time_ms,
            quality_score,
            user_satisfaction: None,
            error_details: None,
            context: HashMap::new(),
        }
    }

    pub fn with_error(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn with_satisfaction(mut self, score: f64) -> Self {
        self.user_satisfaction = Some(score);
        self
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Reject feedback that can't be analysed.
    pub fn validate(&self) -> MeshResult<()> {
        if self.agent_id.as_str().trim().is_empty() {
            return Err(MeshError::InvalidInput("agent_id must not be empty".into()));
        }
        if self.task_type.trim().is_empty() {
            return Err(MeshError::InvalidInput("task_type must not be empty".into()));
        }
        if !self.execution_time_ms.is_finite() || self.execution_time_ms < 0.0 {
            return Err(MeshError::InvalidInput(format!(
                "execution_time_ms must be a non-negative number, got {}",
                self.execution_time_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(MeshError::InvalidInput(format!(
                "quality_score must be within [0, 1], got {}",
                self.quality_score
            )));
        }
        if let Some(s) = self.user_satisfaction {
            if !(0.0..=1.0).contains(&s) {
                return Err(MeshError::InvalidInput(format!(
                    "user_satisfaction must be within [0, 1], got {s}"
                )));
            }
        }
        Ok(())
    }
}

/// A persisted feedback record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceFeedback {
    pub id: FeedbackId,
    pub agent_id: AgentId,
    pub task_type: String,
    pub success: bool,
    pub execution_time_ms: f64,
    pub quality_score: f64,
    pub user_satisfaction: Option<f64>,
    pub error_details: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceFeedback {
    /// Stamp validated feedback with an ID and the current time.
    pub fn from_report(report: TaskFeedback) -> Self {
        Self {
            id: FeedbackId::new(),
            agent_id: report.agent_id,
            task_type: report.task_type,
            success: report.success,
            execution_time_ms: report.execution_time_ms,
            quality_score: report.quality_score,
            user_satisfaction: report.user_satisfaction,
            error_details: report.error_details,
            context: report.context,
            timestamp: Utc::now(),
        }
    }
}

/// Kind of recurring performance pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    LowSuccessRate,
    SlowExecution,
    LowQuality,
}

impl InsightCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::LowSuccessRate => "low_success_rate",
            InsightCategory::SlowExecution => "slow_execution",
            InsightCategory::LowQuality => "low_quality",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low_success_rate" => Some(InsightCategory::LowSuccessRate),
            "slow_execution" => Some(InsightCategory::SlowExecution),
            "low_quality" => Some(InsightCategory::LowQuality),
            _ => None,
        }
    }

    /// The action type that addresses this pattern.
    pub fn improvement_type(&self) -> ImprovementType {
        match self {
            InsightCategory::LowSuccessRate => ImprovementType::ErrorHandling,
            InsightCategory::SlowExecution => ImprovementType::PerformanceOptimization,
            InsightCategory::LowQuality => ImprovementType::QualityEnhancement,
        }
    }

    /// Fixed expected impact of the suggested action.
    pub fn expected_impact(&self) -> f64 {
        match self {
            InsightCategory::SlowExecution => 0.30,
            InsightCategory::LowSuccessRate => 0.25,
            InsightCategory::LowQuality => 0.20,
        }
    }
}

impl std::fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statistically derived statement about an agent's performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningInsight {
    pub id: String,
    pub agent_id: AgentId,
    pub task_type: String,
    pub category: InsightCategory,
    /// Human-readable description of the pattern.
    pub pattern: String,
    /// Confidence score (0.0 - 1.0).
    pub confidence: f64,
    pub evidence_count: usize,
    /// Feedback records the insight was derived from.
    pub learned_from: Vec<FeedbackId>,
    pub timestamp: DateTime<Utc>,
}

/// Kind of corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementType {
    PerformanceOptimization,
    ErrorHandling,
    QualityEnhancement,
}

impl ImprovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementType::PerformanceOptimization => "performance_optimization",
            ImprovementType::ErrorHandling => "error_handling",
            ImprovementType::QualityEnhancement => "quality_enhancement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "performance_optimization" => Some(ImprovementType::PerformanceOptimization),
            "error_handling" => Some(ImprovementType::ErrorHandling),
            "quality_enhancement" => Some(ImprovementType::QualityEnhancement),
            _ => None,
        }
    }
}

/// A suggested corrective action. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementAction {
    pub id: String,
    pub agent_id: AgentId,
    pub improvement_type: ImprovementType,
    pub description: String,
    pub expected_impact: f64,
    pub implemented: bool,
    pub validation_results: Option<HashMap<String, serde_json::Value>>,
    pub timestamp: DateTime<Utc>,
}

/// Kind of iteration an opportunity asks the planning engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationType {
    PerformanceOptimization,
    BugFix,
    QualityImprovement,
    FeatureEnhancement,
}

/// Where an opportunity is in the planning engine's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementStatus {
    Identified,
    Planned,
    InProgress,
    Completed,
    Rejected,
}

/// A proposed corrective iteration surfaced to an external planning system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementOpportunity {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub iteration_type: IterationType,
    pub title: String,
    pub description: String,
    pub impact_score: f64,
    pub effort_score: f64,
    pub priority_score: f64,
    pub evidence: HashMap<String, serde_json::Value>,
    pub affected_components: Vec<String>,
    pub success_criteria: Vec<String>,
    pub risk_assessment: String,
    pub status: ImprovementStatus,
    pub created_at: DateTime<Utc>,
}

/// External iteration/planning engine that consumes opportunities.
#[async_trait]
pub trait IterationEngine: Send + Sync {
    /// Whether the engine can currently accept submissions.
    fn is_available(&self) -> bool {
        true
    }

    /// Hand an opportunity to the engine.
    async fn submit_opportunity(&self, opportunity: ImprovementOpportunity) -> MeshResult<()>;
}

/// Stand-in used when no engine is wired up. Everything is queued locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIterationEngine;

#[async_trait]
impl IterationEngine for NoopIterationEngine {
    fn is_available(&self) -> bool {
        false
    }

    async fn submit_opportunity(&self, _opportunity: ImprovementOpportunity) -> MeshResult<()> {
        Err(MeshError::Collaborator(
            "no iteration engine configured".to_string(),
        ))
    }
}

/// Rolled-up performance view for one agent over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub agent_id: AgentId,
    pub period_days: i64,
    pub total_tasks: usize,
    pub success_rate: f64,
    pub average_execution_time_ms: f64,
    pub average_quality_score: f64,
    pub top_insights: Vec<LearningInsight>,
    pub improvement_opportunities: Vec<ImprovementAction>,
}
