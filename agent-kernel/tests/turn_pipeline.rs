use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use agent_kernel::{
    Action, ActionError, ActionHandlerResult, ActionOptions, ActionOutcome, AgentRuntime,
    Evaluator, KernelError, KernelResult, ModelError, ResponseCallback, TEXT_LARGE, TurnContext,
};
use agent_primitives::{
    ActionResult, Character, Content, EntityId, Memory, MemoryKind, RoomId, State, StepStatus,
    WorkingMemory,
};
use agent_store::{LocalStore, LogQuery, MemoryQuery, StoreAdapter};

async fn runtime_with_store(max_working_memory: Option<usize>) -> (Arc<LocalStore>, AgentRuntime) {
    let store = Arc::new(LocalStore::new());
    let mut builder = AgentRuntime::builder(Character::builder("Pipeline").build().unwrap())
        .store(Arc::clone(&store) as Arc<dyn StoreAdapter>);
    if let Some(max) = max_working_memory {
        builder = builder.max_working_memory(max);
    }
    let runtime = builder.build();
    runtime.initialize().await.unwrap();
    (store, runtime)
}

fn inbound(room_id: RoomId) -> Memory {
    Memory::message(EntityId::random(), room_id, Content::from_text("hello"))
}

fn response_with_actions(room_id: RoomId, actions: &[&str]) -> Memory {
    Memory::message(
        EntityId::random(),
        room_id,
        Content::from_text("on it").with_actions(actions.iter().copied()),
    )
}

async fn action_result_memories(store: &LocalStore) -> Vec<Memory> {
    let mut rows: Vec<Memory> = store
        .get_memories(&MemoryQuery::table("messages"))
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.metadata.kind == MemoryKind::ActionResult)
        .collect();
    rows.sort_by_key(|m| m.created_at);
    rows
}

struct GreetAction;

#[async_trait]
impl Action for GreetAction {
    fn name(&self) -> &str {
        "GREET"
    }

    async fn handle(
        &self,
        _runtime: &AgentRuntime,
        _message: &Memory,
        _state: &State,
        _options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        Ok(ActionOutcome::Structured(
            ActionResult::ok().with_text("hi"),
        ))
    }
}

struct FetchAction;

#[async_trait]
impl Action for FetchAction {
    fn name(&self) -> &str {
        "FETCH"
    }

    async fn handle(
        &self,
        runtime: &AgentRuntime,
        _message: &Memory,
        _state: &State,
        options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        // A model call made inside the step must be attributed to it.
        runtime
            .use_model(&options.turn, TEXT_LARGE, json!({ "prompt": "where?" }), None)
            .await
            .map_err(|err| ActionError::failed(err.to_string()))?;
        Ok(ActionOutcome::Structured(
            ActionResult::ok()
                .with_value("url", json!("x"))
                .with_data("actionName", json!("FETCH")),
        ))
    }
}

struct FailingAction {
    critical: bool,
}

#[async_trait]
impl Action for FailingAction {
    fn name(&self) -> &str {
        "POST"
    }

    async fn handle(
        &self,
        _runtime: &AgentRuntime,
        _message: &Memory,
        _state: &State,
        _options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        if self.critical {
            Err(ActionError::critical("boom"))
        } else {
            Err(ActionError::failed("boom"))
        }
    }
}

struct StepAction;

#[async_trait]
impl Action for StepAction {
    fn name(&self) -> &str {
        "STEP"
    }

    async fn handle(
        &self,
        _runtime: &AgentRuntime,
        _message: &Memory,
        _state: &State,
        options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        // Distinct timestamps per step so eviction order is observable.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let index = options.context.previous_results.len();
        Ok(ActionOutcome::Structured(
            ActionResult::ok().with_data("index", json!(index)),
        ))
    }
}

struct RecordingAction {
    seen: Arc<Mutex<Option<WorkingMemory>>>,
}

#[async_trait]
impl Action for RecordingAction {
    fn name(&self) -> &str {
        "RECORD"
    }

    async fn handle(
        &self,
        _runtime: &AgentRuntime,
        _message: &Memory,
        state: &State,
        _options: &ActionOptions,
        _responses: &[Memory],
    ) -> ActionHandlerResult {
        *self.seen.lock().unwrap() = Some(state.data.working_memory.clone());
        Ok(ActionOutcome::Structured(ActionResult::ok()))
    }
}

#[tokio::test]
async fn single_action_success_records_memory_and_log() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(GreetAction));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["GREET"])];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let memories = action_result_memories(&store).await;
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content.text.as_deref(), Some("hi"));
    assert_eq!(memories[0].content.extra["actionStatus"], "completed");
    assert!(!memories[0].content.extra.contains_key("planStep"));
    assert_eq!(memories[0].metadata.action_name.as_deref(), Some("GREET"));

    let logs = store
        .get_logs(&LogQuery {
            log_type: Some("action".into()),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].body["action"], "GREET");

    let cached = runtime
        .cached_state(&format!("{}_action_results", message.id))
        .await
        .unwrap();
    assert_eq!(cached.data.action_results.len(), 1);
    assert!(cached.data.action_results[0].success);
    assert_eq!(cached.data.action_results[0].text.as_deref(), Some("hi"));
    assert!(cached.data.action_plan.is_none());
}

#[tokio::test]
async fn second_action_failure_is_recovered() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(FetchAction));
    runtime.register_action(Arc::new(FailingAction { critical: false }));
    runtime.register_model(
        TEXT_LARGE,
        Arc::new(|_params: Value| async move { Ok::<_, ModelError>(Value::from("somewhere")) }),
        "test",
        0,
    );

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["FETCH", "POST"])];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let cached = runtime
        .cached_state(&format!("{}_action_results", message.id))
        .await
        .unwrap();
    let plan = cached.data.action_plan.as_ref().unwrap();
    assert_eq!(plan.total_steps, 2);
    assert_eq!(plan.current_step, 2);
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(plan.steps[1].status, StepStatus::Failed);
    assert_eq!(plan.steps[1].error.as_deref(), Some("boom"));

    let results = &cached.data.action_results;
    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert_eq!(results[0].values["url"], "x");
    assert!(!results[1].success);
    assert_eq!(results[1].data["actionName"], "POST");
    assert_eq!(results[1].data["error"], "boom");

    let memories = action_result_memories(&store).await;
    assert_eq!(memories.len(), 2);
    let failed = memories
        .iter()
        .find(|m| m.metadata.action_name.as_deref() == Some("POST"))
        .unwrap();
    assert_eq!(failed.content.extra["actionStatus"], "failed");
    assert_eq!(failed.content.source.as_deref(), Some("auto"));
    assert_eq!(failed.metadata.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn model_calls_inside_actions_carry_attribution() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(FetchAction));
    runtime.register_model(
        TEXT_LARGE,
        Arc::new(|_params: Value| async move { Ok::<_, ModelError>(Value::from("somewhere")) }),
        "test",
        0,
    );

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["FETCH"])];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let model_logs = store
        .get_logs(&LogQuery {
            log_type: Some(format!("useModel:{TEXT_LARGE}")),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(model_logs.len(), 1);
    assert_eq!(model_logs[0].body["actionContext"]["actionName"], "FETCH");
    assert!(model_logs[0].body["actionContext"]["actionId"].is_string());

    // The captured prompt surfaces in the step's action log.
    let action_logs = store
        .get_logs(&LogQuery {
            log_type: Some("action".into()),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(action_logs[0].body["promptCount"], 1);
    assert_eq!(action_logs[0].body["prompts"][0]["prompt"], "where?");

    // Outside action handling there is no attribution.
    runtime
        .use_model(&turn, TEXT_LARGE, json!({ "prompt": "later" }), None)
        .await
        .unwrap();
    let model_logs = store
        .get_logs(&LogQuery {
            log_type: Some(format!("useModel:{TEXT_LARGE}")),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    let outside = model_logs
        .iter()
        .find(|l| l.body["prompt"] == "later")
        .unwrap();
    assert!(outside.body["actionContext"].is_null());
}

#[tokio::test]
async fn critical_error_aborts_the_turn() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(GreetAction));
    runtime.register_action(Arc::new(FailingAction { critical: true }));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["GREET", "POST", "GREET"])];

    let turn = Arc::new(TurnContext::new());
    let err = runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .expect_err("critical error should abort");
    assert!(matches!(
        err,
        KernelError::Action(ActionError::Critical { .. })
    ));

    // The first two steps persisted; the third was never attempted.
    let memories = action_result_memories(&store).await;
    assert_eq!(memories.len(), 2);
    let failed = memories
        .iter()
        .find(|m| m.metadata.action_name.as_deref() == Some("POST"))
        .unwrap();
    assert_eq!(failed.content.extra["actionStatus"], "failed");
}

#[tokio::test]
async fn unknown_action_records_failed_step_and_continues() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(GreetAction));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["TELEPORT", "GREET"])];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let memories = action_result_memories(&store).await;
    assert_eq!(memories.len(), 2);
    let missing = memories
        .iter()
        .find(|m| m.metadata.action_name.as_deref() == Some("TELEPORT"))
        .unwrap();
    assert_eq!(missing.content.extra["actionStatus"], "failed");
    assert_eq!(
        missing.content.extra["error"],
        "Action not found: TELEPORT"
    );

    let cached = runtime
        .cached_state(&format!("{}_action_results", message.id))
        .await
        .unwrap();
    let plan = cached.data.action_plan.as_ref().unwrap();
    assert_eq!(plan.steps[0].status, StepStatus::Failed);
    assert_eq!(plan.steps[1].status, StepStatus::Completed);
}

#[tokio::test]
async fn working_memory_keeps_newest_entries() {
    let seen = Arc::new(Mutex::new(None));
    let (_store, runtime) = runtime_with_store(Some(3)).await;
    runtime.register_action(Arc::new(StepAction));
    runtime.register_action(Arc::new(RecordingAction {
        seen: Arc::clone(&seen),
    }));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(
        room_id,
        &["STEP", "STEP", "STEP", "STEP", "RECORD"],
    )];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let working = seen.as_ref().expect("recording action ran");
    assert_eq!(working.len(), 3);

    let mut indices: Vec<u64> = working
        .iter()
        .map(|(_, entry)| entry.result.data["index"].as_u64().unwrap())
        .collect();
    indices.sort_unstable();
    // Step 0 is the oldest and was evicted.
    assert_eq!(indices, [1, 2, 3]);
}

#[tokio::test]
async fn action_result_order_matches_declaration_across_responses() {
    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(StepAction));
    runtime.register_action(Arc::new(GreetAction));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![
        response_with_actions(room_id, &["STEP", "GREET"]),
        response_with_actions(room_id, &["STEP"]),
    ];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let names: Vec<String> = action_result_memories(&store)
        .await
        .into_iter()
        .filter_map(|m| m.metadata.action_name)
        .collect();
    assert_eq!(names, ["STEP", "GREET", "STEP"]);
}

#[tokio::test]
async fn legacy_returns_record_memory_without_result() {
    struct LegacyAction;

    #[async_trait]
    impl Action for LegacyAction {
        fn name(&self) -> &str {
            "LEGACY"
        }

        async fn handle(
            &self,
            _runtime: &AgentRuntime,
            _message: &Memory,
            _state: &State,
            _options: &ActionOptions,
            _responses: &[Memory],
        ) -> ActionHandlerResult {
            Ok(ActionOutcome::Legacy(Value::Bool(true)))
        }
    }

    let (store, runtime) = runtime_with_store(None).await;
    runtime.register_action(Arc::new(LegacyAction));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let responses = vec![response_with_actions(room_id, &["LEGACY"])];

    let turn = Arc::new(TurnContext::new());
    runtime
        .process_actions(&turn, &message, &responses, None, None)
        .await
        .unwrap();

    let memories = action_result_memories(&store).await;
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content.extra["legacy"], true);
    assert_eq!(memories[0].content.extra["actionStatus"], "completed");

    let cached = runtime
        .cached_state(&format!("{}_action_results", message.id))
        .await
        .unwrap();
    assert!(cached.data.action_results.is_empty());
}

#[tokio::test]
async fn evaluators_respect_always_run_and_are_logged() {
    struct TrackingEvaluator {
        name: &'static str,
        always_run: bool,
        runs: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Evaluator for TrackingEvaluator {
        fn name(&self) -> &str {
            self.name
        }

        fn always_run(&self) -> bool {
            self.always_run
        }

        async fn validate(
            &self,
            _runtime: &AgentRuntime,
            _message: &Memory,
            _state: &State,
        ) -> bool {
            true
        }

        async fn handle(
            &self,
            _runtime: &AgentRuntime,
            _turn: Arc<TurnContext>,
            _message: &Memory,
            _state: &State,
            _did_respond: bool,
            _responses: &[Memory],
            _callback: Option<ResponseCallback>,
        ) -> KernelResult<()> {
            self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    let (store, runtime) = runtime_with_store(None).await;
    let on_respond = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let always = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    runtime.register_evaluator(Arc::new(TrackingEvaluator {
        name: "reflect",
        always_run: false,
        runs: Arc::clone(&on_respond),
    }));
    runtime.register_evaluator(Arc::new(TrackingEvaluator {
        name: "audit",
        always_run: true,
        runs: Arc::clone(&always),
    }));

    let room_id = RoomId::random();
    let message = inbound(room_id);
    let state = State::default();
    let turn = Arc::new(TurnContext::new());

    let ran = runtime
        .evaluate(&turn, &message, &state, false, &[], None)
        .await
        .unwrap();
    assert_eq!(ran, ["audit"]);
    assert_eq!(on_respond.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(always.load(std::sync::atomic::Ordering::SeqCst), 1);

    let ran = runtime
        .evaluate(&turn, &message, &state, true, &[], None)
        .await
        .unwrap();
    assert_eq!(ran.len(), 2);
    assert_eq!(on_respond.load(std::sync::atomic::Ordering::SeqCst), 1);

    let logs = store
        .get_logs(&LogQuery {
            log_type: Some("evaluator".into()),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(logs.len(), 3);
}
