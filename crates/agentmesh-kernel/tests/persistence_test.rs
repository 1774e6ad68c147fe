//! Tracer and memory state survive a round-trip through an on-disk store.

use agentmesh_kernel::agent::{AgentBehavior, EnhancedAgent, Task, TaskOutput};
use agentmesh_kernel::agent_memory::{AgentMemorySystem, Experience, Knowledge, Skill};
use agentmesh_kernel::tracer::{current_context, Tracer};
use agentmesh_kernel::AgentMesh;
use agentmesh_memory::MeshStore;
use agentmesh_types::agent::AgentId;
use agentmesh_types::config::{MemoryConfig, MeshConfig, TracingConfig};
use agentmesh_types::error::MeshResult;
use agentmesh_types::memory::{ExperienceQuery, KnowledgeQuery, SkillQuery};
use agentmesh_types::trace::{LogLevel, SpanStatus, TraceId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_trace_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mesh.db");
    let store = MeshStore::open(&db).unwrap();
    let tracer = Tracer::new(TracingConfig::default(), store.traces());

    let mut tags = HashMap::new();
    tags.insert("order".to_string(), "A-17".to_string());
    let result: Result<TraceId, String> = tracer
        .trace_operation("fulfil_order", tags, Some(AgentId::from("ops")), || async {
            let ctx = current_context().unwrap();
            // No explicit parent: nests under the caller's current span.
            let ok = tracer
                .start_span(ctx.trace_id, "reserve_stock", None, HashMap::new(), None)
                .unwrap();
            tracer
                .log_span(ok, LogLevel::Info, "reserved", HashMap::new())
                .unwrap();
            assert_eq!(tracer.active_span(ok).unwrap().parent_span_id, Some(ctx.span_id));
            tracer.end_span(ok, SpanStatus::Success, None);

            let bad = tracer
                .start_span(ctx.trace_id, "charge_card", None, HashMap::new(), None)
                .unwrap();
            tracer.end_span(bad, SpanStatus::Error, Some("card declined"));
            tracer.end_span(bad, SpanStatus::Success, None);
            Ok(ctx.trace_id)
        })
        .await;
    let trace_id = result.unwrap();
    assert!(current_context().is_none());
    tracer.flush().await;
    drop(tracer);
    drop(store);

    let reopened = MeshStore::open(&db).unwrap();
    let trace = reopened.traces().load_trace(trace_id).unwrap().unwrap();
    assert_eq!(trace.status, SpanStatus::Error);
    assert_eq!(trace.spans.len(), 3);
    assert_eq!(trace.tags["order"], "A-17");

    for span in &trace.spans {
        let end = span.end_time.unwrap();
        let expected = (end - span.start_time).num_microseconds().unwrap() as f64 / 1000.0;
        assert!((span.duration_ms.unwrap() - expected).abs() < 1e-6);
        assert_eq!(span.trace_id, trace_id);
    }
    let declined = trace
        .spans
        .iter()
        .find(|s| s.operation_name == "charge_card")
        .unwrap();
    assert_eq!(declined.status, SpanStatus::Error);
    assert_eq!(declined.tags["error"], "card declined");
    let reserved = trace
        .spans
        .iter()
        .find(|s| s.operation_name == "reserve_stock")
        .unwrap();
    assert_eq!(reserved.logs.len(), 1);

    // Loading twice yields the same records.
    let again = reopened.traces().load_trace(trace_id).unwrap().unwrap();
    assert_eq!(again, trace);
}

#[tokio::test]
async fn test_memory_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mesh.db");
    let agent = AgentId::from("researcher");

    let (experiences, knowledge, skills) = {
        let store = MeshStore::open(&db).unwrap();
        let memory =
            AgentMemorySystem::new(Arc::new(store.memory_backend()), MemoryConfig::default());
        for i in 0..3 {
            let mut context = HashMap::new();
            context.insert("attempt".to_string(), serde_json::json!(i));
            memory
                .remember_experience(
                    &agent,
                    Experience::new("paper_reviewed", format!("review {i}"))
                        .with_context(context)
                        .with_importance(0.6)
                        .with_outcome("accepted"),
                )
                .await
                .unwrap();
        }
        let mut facts = HashMap::new();
        facts.insert("venue".to_string(), serde_json::json!("NeurIPS"));
        memory
            .learn_knowledge(
                &agent,
                Knowledge::new("publishing", "deadlines", facts).with_confidence(0.8),
            )
            .await
            .unwrap();
        let skill = memory
            .learn_skill(
                &agent,
                Skill::new("literature_search", vec![serde_json::json!({"step": "query"})])
                    .with_success_rate(0.75),
            )
            .await
            .unwrap();
        memory.use_skill(&agent, &skill, true, 40.0).await.unwrap();
        memory.consolidate_memories(&agent).await.unwrap();

        (
            memory.recall_experiences(&agent, &ExperienceQuery::default()),
            memory.recall_knowledge(&agent, &KnowledgeQuery::default()).await,
            memory.recall_skills(&agent, &SkillQuery::default()),
        )
    };

    let store = MeshStore::open(&db).unwrap();
    let memory = AgentMemorySystem::new(Arc::new(store.memory_backend()), MemoryConfig::default());
    assert_eq!(memory.load_agent(&agent).await.unwrap(), 3 + 2 + 1);

    assert_eq!(memory.recall_experiences(&agent, &ExperienceQuery::default()), experiences);
    assert_eq!(memory.recall_skills(&agent, &SkillQuery::default()), skills);

    let reloaded = memory.recall_knowledge(&agent, &KnowledgeQuery::default()).await;
    assert_eq!(reloaded.len(), knowledge.len());
    for (before, after) in knowledge.iter().zip(&reloaded) {
        assert_eq!(after.id, before.id);
        assert_eq!(after.knowledge, before.knowledge);
        assert_eq!(after.access_count, before.access_count + 1);
    }
}

struct Summarizer;

#[async_trait]
impl AgentBehavior for Summarizer {
    async fn execute_task(&self, task: &Task) -> MeshResult<TaskOutput> {
        Ok(TaskOutput::new(serde_json::json!({ "summary": task.description })))
    }
}

#[tokio::test]
async fn test_agent_memories_survive_mesh_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = MeshConfig {
        data_dir: dir.path().to_path_buf(),
        ..MeshConfig::default()
    };
    let id = AgentId::from("summarizer");

    {
        let mesh = AgentMesh::boot(config.clone()).await.unwrap();
        let agent = EnhancedAgent::new(id.clone(), Arc::new(Summarizer), mesh.services()).await;
        agent
            .execute_task(&Task::new("summarize", "weekly report"))
            .await
            .unwrap();
        agent.shutdown();
        mesh.shutdown().await;
    }

    let mesh = AgentMesh::boot(config).await.unwrap();
    let services = mesh.services();
    assert!(services
        .memory
        .recall_experiences(&id, &ExperienceQuery::default())
        .is_empty());

    let _agent = EnhancedAgent::new(id.clone(), Arc::new(Summarizer), services.clone()).await;
    let experiences = services
        .memory
        .recall_experiences(&id, &ExperienceQuery::default());
    assert_eq!(experiences.len(), 1);
    assert_eq!(experiences[0].event_type, "task_success");

    let summary = services.improvement.get_agent_performance_summary(&id, 7);
    assert_eq!(summary.total_tasks, 1);
}
