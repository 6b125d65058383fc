//! End-to-end tests for the guided analysis flow: routing, slot filling,
//! stage transitions, sandboxed execution, and cross-worker consistency.

use parley_core::{
    ActionCatalog, ActionHandler, ActionOutcome, ActionSpec, Conversation, ConversationStore,
    CoreConfig, Engine, MemoryStore, ParamSpec, ResolvedArguments, Response, Result,
    WorkflowStage,
};
use parley_sandbox::{ExecutionJob, SandboxExecutor};
use std::sync::Arc;
use std::time::Duration;

struct TextHandler {
    spec: ActionSpec,
    reply: &'static str,
}

#[async_trait::async_trait]
impl ActionHandler for TextHandler {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _args: &ResolvedArguments,
        _conversation: &Conversation,
    ) -> Result<ActionOutcome> {
        Ok(ActionOutcome::message(self.reply))
    }
}

struct SnippetHandler {
    spec: ActionSpec,
    sandbox: Arc<SandboxExecutor>,
}

#[async_trait::async_trait]
impl ActionHandler for SnippetHandler {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _args: &ResolvedArguments,
        conversation: &Conversation,
    ) -> Result<ActionOutcome> {
        let tier = conversation
            .context_value("tier")
            .and_then(|v| v.as_str())
            .unwrap_or("all")
            .to_string();
        let job = ExecutionJob::new("result = {\"tier\": params[\"tier\"], \"n\": 3}")
            .with_binding("tier", serde_json::json!(tier))
            .with_timeout(Duration::from_secs(10));

        let output = self.sandbox.run(&job).await.map_err(parley_core::Error::from)?;
        Ok(
            ActionOutcome::message(format!("Computed for {}.", output.value["tier"]))
                .with_result_handle(format!("analysis:{}", job.id)),
        )
    }
}

fn catalog(sandbox: Arc<SandboxExecutor>) -> Arc<ActionCatalog> {
    let mut catalog = ActionCatalog::new();
    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("start_guided_analysis", "Begin the guided flow")
            .with_keywords(&["start", "begin", "guided", "analysis"])
            .gated_to(&[WorkflowStage::Idle])
            .advances_to(WorkflowStage::AwaitingFacilityChoice),
        reply: "Which facility tier?",
    }));
    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("choose_facility_tier", "Record the facility tier")
            .with_keywords(&["facility", "tier", "hospitals"])
            .with_param(ParamSpec::choice(
                "tier",
                "facility tier",
                &["primary", "secondary", "tertiary", "all"],
            ))
            .gated_to(&[WorkflowStage::AwaitingFacilityChoice])
            .advances_to(WorkflowStage::AwaitingAgeGroup),
        reply: "Which age group?",
    }));
    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("choose_age_group", "Record the age group")
            .with_keywords(&["age", "group", "band"])
            .with_param(ParamSpec::choice(
                "band",
                "age group",
                &["under_five", "adults", "all_ages"],
            ))
            .gated_to(&[WorkflowStage::AwaitingAgeGroup])
            .advances_to(WorkflowStage::ReadyForCompute),
        reply: "Ready to compute.",
    }));
    catalog.register(Arc::new(SnippetHandler {
        spec: ActionSpec::new("run_analysis", "Run the analysis")
            .with_keywords(&["run", "compute", "calculate"])
            .gated_to(&[WorkflowStage::ReadyForCompute])
            .advances_to(WorkflowStage::Completed),
        sandbox,
    }));
    Arc::new(catalog)
}

fn engine_over(store: Arc<MemoryStore>) -> Arc<Engine> {
    let sandbox = Arc::new(SandboxExecutor::with_defaults());
    Arc::new(Engine::new(
        CoreConfig::default(),
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        catalog(sandbox),
    ))
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn guided_flow_end_to_end() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }

    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(Arc::clone(&store));

    let r1 = engine.handle("c1", "start a guided analysis").await.unwrap();
    assert!(matches!(r1, Response::Answer { .. }));

    let r2 = engine.handle("c1", "go with the second one").await.unwrap();
    assert!(matches!(r2, Response::Answer { .. }), "got: {:?}", r2);

    let r3 = engine.handle("c1", "adults age group").await.unwrap();
    assert!(matches!(r3, Response::Answer { .. }), "got: {:?}", r3);

    let r4 = engine.handle("c1", "run the compute").await.unwrap();
    match r4 {
        Response::Answer { text, result_handle } => {
            assert!(text.contains("secondary"), "text: {}", text);
            assert!(result_handle.unwrap().starts_with("analysis:"));
        }
        other => panic!("expected answer, got: {:?}", other),
    }

    let conv = store.load("c1").await.unwrap().unwrap();
    assert_eq!(conv.stage, WorkflowStage::Completed);
    assert_eq!(conv.context.get("tier"), Some(&serde_json::json!("secondary")));
    assert_eq!(conv.context.get("band"), Some(&serde_json::json!("adults")));
}

#[tokio::test]
async fn vague_choice_gets_one_clarifier_and_stage_holds() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(Arc::clone(&store));

    engine.handle("c1", "start a guided analysis").await.unwrap();
    let response = engine
        .handle("c1", "maybe all of them or something")
        .await
        .unwrap();

    match response {
        Response::Clarification { text } => {
            for option in ["primary", "secondary", "tertiary", "all"] {
                assert!(text.contains(option), "clarifier missing {}", option);
            }
        }
        other => panic!("expected clarification, got: {:?}", other),
    }
    assert_eq!(
        store.load("c1").await.unwrap().unwrap().stage,
        WorkflowStage::AwaitingFacilityChoice
    );
}

#[tokio::test]
async fn racing_workers_share_one_stage() {
    // Two stateless "workers" over the same store, racing the same
    // conversation. The store's version check keeps exactly one stage
    // active; the loser retries against the fresh state.
    let store = Arc::new(MemoryStore::new());
    let worker_a = engine_over(Arc::clone(&store));
    let worker_b = engine_over(Arc::clone(&store));

    worker_a.handle("c1", "start a guided analysis").await.unwrap();

    let (ra, rb) = tokio::join!(
        worker_a.handle("c1", "tertiary facilities"),
        worker_b.handle("c1", "tertiary facilities"),
    );
    ra.unwrap();
    rb.unwrap();

    let conv = store.load("c1").await.unwrap().unwrap();
    assert_eq!(conv.stage, WorkflowStage::AwaitingAgeGroup);
    assert_eq!(conv.context.get("tier"), Some(&serde_json::json!("tertiary")));
}

#[tokio::test]
async fn expired_battles_are_swept() {
    let store = Arc::new(MemoryStore::new());
    let mut config = CoreConfig::default();
    config.arena.expiry_secs = 0;

    let sandbox = Arc::new(SandboxExecutor::with_defaults());
    let engine = Arc::new(Engine::new(
        config,
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        catalog(sandbox),
    ));

    let battle = parley_core::ArenaBattle::new("c1", Duration::from_secs(0));
    store.save_battle(&battle).await.unwrap();

    let swept = engine.expire_stale_battles().await.unwrap();
    assert_eq!(swept, 1);

    let response = engine.vote(battle.id, parley_core::Vote::A).await.unwrap();
    assert!(matches!(response, Response::Failure { .. }));
}
