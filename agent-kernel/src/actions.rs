//! Multi-step action execution and post-turn evaluators.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use agent_primitives::{
    ActionPlan, ActionResult, Content, EntityId, Memory, MemoryId, MemoryKind, MemoryMetadata,
    RunId, State, WorkingMemoryEntry, now_millis,
};
use agent_store::LogEntry;

use crate::events::{ACTION_COMPLETED, ACTION_STARTED, RUN_ENDED, RUN_STARTED};
use crate::providers::{ACTION_STATE, RECENT_MESSAGES};
use crate::{AgentRuntime, KernelResult, TurnContext};

/// Callback used by handlers to emit response messages mid-turn.
pub type ResponseCallback =
    Arc<dyn Fn(Content) -> BoxFuture<'static, KernelResult<Vec<Memory>>> + Send + Sync>;

/// Result alias for action handlers.
pub type ActionHandlerResult = Result<ActionOutcome, ActionError>;

/// Errors surfaced by action handlers.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The handler failed; the step is marked failed and the turn continues.
    #[error("action failed: {reason}")]
    Failed {
        /// Human-readable reason.
        reason: String,
    },
    /// The handler failed critically; the turn aborts.
    #[error("critical action failure: {reason}")]
    Critical {
        /// Human-readable reason.
        reason: String,
    },
}

impl ActionError {
    /// Convenience constructor for recoverable failures.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for turn-aborting failures.
    #[must_use]
    pub fn critical(reason: impl Into<String>) -> Self {
        Self::Critical {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error aborts the turn.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }

    /// Returns the underlying reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Failed { reason } | Self::Critical { reason } => reason,
        }
    }
}

/// Value returned by an action handler.
///
/// Handlers ported from looser runtimes may not produce a structured
/// result; the engine normalises this sum at the boundary and never keeps
/// it alive past normalisation.
#[derive(Clone, Debug)]
pub enum ActionOutcome {
    /// Untyped return: `Null` and booleans record a legacy memory without
    /// contributing an [`ActionResult`]; any other value is wrapped into a
    /// successful result carrying it as `legacyResult`.
    Legacy(Value),
    /// A structured action result.
    Structured(ActionResult),
}

impl From<ActionResult> for ActionOutcome {
    fn from(value: ActionResult) -> Self {
        Self::Structured(value)
    }
}

/// Read access to results accumulated earlier in the turn.
#[derive(Clone, Debug, Default)]
pub struct ActionHandlerContext {
    /// Results of the steps executed before this one, in order.
    pub previous_results: Vec<ActionResult>,
}

impl ActionHandlerContext {
    /// Returns the first prior result recorded by the named action.
    #[must_use]
    pub fn get_previous_result(&self, action_name: &str) -> Option<&ActionResult> {
        self.previous_results
            .iter()
            .find(|result| result.action_name() == Some(action_name))
    }
}

/// Options handed to an action handler for one step.
#[derive(Clone, Default)]
pub struct ActionOptions {
    /// Turn context for attributed model calls.
    pub turn: Arc<TurnContext>,
    /// Cross-step result access.
    pub context: ActionHandlerContext,
    /// Copy of the current plan, for multi-action turns.
    pub plan: Option<ActionPlan>,
    /// Callback for emitting response messages mid-step.
    pub callback: Option<ResponseCallback>,
}

impl std::fmt::Debug for ActionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionOptions")
            .field("context", &self.context)
            .field("plan", &self.plan)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// A named capability executed by the action engine.
#[async_trait]
pub trait Action: Send + Sync {
    /// Canonical action name.
    fn name(&self) -> &str;

    /// Alternative names resolving to this action.
    fn similes(&self) -> &[String] {
        &[]
    }

    /// Human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Returns `true` when the action applies to the message.
    async fn validate(&self, runtime: &AgentRuntime, message: &Memory, state: &State) -> bool {
        let _ = (runtime, message, state);
        true
    }

    /// Executes one step.
    ///
    /// # Errors
    ///
    /// [`ActionError::Failed`] marks the step failed and lets the turn
    /// continue; [`ActionError::Critical`] aborts the turn.
    async fn handle(
        &self,
        runtime: &AgentRuntime,
        message: &Memory,
        state: &State,
        options: &ActionOptions,
        responses: &[Memory],
    ) -> ActionHandlerResult;
}

/// Post-response reflection or classification.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Unique evaluator name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// When `true` the evaluator also runs on turns the agent did not
    /// respond to.
    fn always_run(&self) -> bool {
        false
    }

    /// Returns `true` when the evaluator should run for this turn.
    async fn validate(&self, runtime: &AgentRuntime, message: &Memory, state: &State) -> bool;

    /// Executes the evaluator.
    ///
    /// # Errors
    ///
    /// Failures are logged by the caller and do not abort the turn.
    async fn handle(
        &self,
        runtime: &AgentRuntime,
        turn: Arc<TurnContext>,
        message: &Memory,
        state: &State,
        did_respond: bool,
        responses: &[Memory],
        callback: Option<ResponseCallback>,
    ) -> KernelResult<()>;
}

fn normalize_action_name(name: &str) -> String {
    name.to_lowercase().replace('_', "")
}

/// Resolves a declared action name against the registered actions.
///
/// Match priority: exact name, name substring (either direction), exact
/// simile, simile substring (either direction). Names are compared after
/// lowercasing and stripping underscores.
#[must_use]
pub fn resolve_action(actions: &[Arc<dyn Action>], requested: &str) -> Option<Arc<dyn Action>> {
    let normalized = normalize_action_name(requested);

    if let Some(action) = actions
        .iter()
        .find(|a| normalize_action_name(a.name()) == normalized)
    {
        debug!("Action found (exact match): {}", action.name());
        return Some(Arc::clone(action));
    }

    if let Some(action) = actions.iter().find(|a| {
        let name = normalize_action_name(a.name());
        name.contains(&normalized) || normalized.contains(&name)
    }) {
        debug!("Action found (substring match): {}", action.name());
        return Some(Arc::clone(action));
    }

    if let Some(action) = actions.iter().find(|a| {
        a.similes()
            .iter()
            .any(|simile| normalize_action_name(simile) == normalized)
    }) {
        debug!("Action found in similes (exact match): {}", action.name());
        return Some(Arc::clone(action));
    }

    if let Some(action) = actions.iter().find(|a| {
        a.similes().iter().any(|simile| {
            let simile = normalize_action_name(simile);
            simile.contains(&normalized) || normalized.contains(&simile)
        })
    }) {
        debug!("Action found in similes (substring match): {}", action.name());
        return Some(Arc::clone(action));
    }

    None
}

enum StepRecord {
    Legacy(Value),
    Result(ActionResult),
    Error(ActionError),
}

struct StepMemoryParts<'a> {
    action_name: &'a str,
    action_id: Option<MemoryId>,
    run_id: RunId,
    record: &'a StepRecord,
    plan: Option<&'a ActionPlan>,
}

fn build_action_memory(
    agent_entity: EntityId,
    message: &Memory,
    parts: &StepMemoryParts<'_>,
) -> Memory {
    let (status, text, source) = match parts.record {
        StepRecord::Result(result) => (
            "completed",
            result
                .text
                .clone()
                .unwrap_or_else(|| format!("Executed action: {}", parts.action_name)),
            "action",
        ),
        StepRecord::Legacy(_) => (
            "completed",
            format!("Executed action: {}", parts.action_name),
            "action",
        ),
        StepRecord::Error(err) => (
            "failed",
            format!("Action {} failed: {}", parts.action_name, err.reason()),
            "auto",
        ),
    };

    let mut content = Content::from_text(text).with_source(source);
    content.extra.insert("type".into(), json!("action_result"));
    content
        .extra
        .insert("actionName".into(), json!(parts.action_name));
    content.extra.insert("actionStatus".into(), json!(status));
    content.extra.insert("runId".into(), json!(parts.run_id));
    match parts.record {
        StepRecord::Result(result) => {
            content.extra.insert("actionResult".into(), json!(result));
        }
        StepRecord::Legacy(value) => {
            content.extra.insert("legacy".into(), value.clone());
        }
        StepRecord::Error(err) => {
            content.extra.insert("error".into(), json!(err.reason()));
        }
    }
    if let Some(plan) = parts.plan {
        content
            .extra
            .insert("planStep".into(), json!(plan.progress()));
        content
            .extra
            .insert("planThought".into(), json!(plan.thought));
    }

    let mut metadata = MemoryMetadata::of_kind(MemoryKind::ActionResult);
    metadata.action_name = Some(parts.action_name.to_owned());
    metadata.run_id = Some(parts.run_id);
    metadata.action_id = parts.action_id;
    if let Some(plan) = parts.plan {
        metadata.total_steps = Some(plan.total_steps);
        metadata.current_step = Some(plan.current_step);
    }
    if let StepRecord::Error(err) = parts.record {
        metadata.error = Some(err.reason().to_owned());
    }

    let mut memory = Memory::message(agent_entity, message.room_id, content);
    memory.world_id = message.world_id;
    memory.metadata = metadata;
    memory
}

impl AgentRuntime {
    /// Resolves a declared action name against the registered actions.
    #[must_use]
    pub fn resolve_action(&self, requested: &str) -> Option<Arc<dyn Action>> {
        resolve_action(&self.actions(), requested)
    }

    /// Executes the actions declared by `responses`, in declaration order.
    ///
    /// Each step recomposes state (pulling in recent messages and the
    /// evolving action state), resolves the declared name, dispatches the
    /// handler with an action-scoped context, accumulates its result, feeds
    /// working memory, updates the plan, and persists one action-result
    /// memory plus one structured `action` log carrying the prompts captured
    /// during the step. Handler failures mark the step failed and the turn
    /// continues, unless the error is critical.
    ///
    /// # Errors
    ///
    /// Propagates store failures, composition failures, and critical action
    /// errors. Unknown actions and non-critical handler failures are
    /// recorded as data and do not abort the turn.
    #[allow(clippy::too_many_lines)]
    pub async fn process_actions(
        &self,
        turn: &Arc<TurnContext>,
        message: &Memory,
        responses: &[Memory],
        state: Option<State>,
        callback: Option<ResponseCallback>,
    ) -> KernelResult<()> {
        let all_actions: Vec<String> = responses
            .iter()
            .flat_map(|response| response.content.actions.iter().cloned())
            .collect();
        if all_actions.is_empty() {
            return Ok(());
        }

        let store = self.require_store()?;
        let run_id = turn.start_run();
        let start_time = now_millis();
        let agent_entity = EntityId::from_uuid(self.agent_id().as_uuid());

        self.events()
            .emit_event(
                self,
                &[RUN_STARTED],
                &json!({ "runId": run_id, "messageId": message.id, "actions": all_actions }),
            )
            .await;

        let mut plan = (all_actions.len() > 1).then(|| {
            let thought = responses
                .first()
                .and_then(|response| response.content.thought.clone())
                .unwrap_or_else(|| {
                    format!(
                        "Executing {} actions: {}",
                        all_actions.len(),
                        all_actions.join(", ")
                    )
                });
            ActionPlan::new(run_id, &all_actions, thought, start_time)
        });

        let mut accumulated: Vec<ActionResult> = Vec::new();
        let (mut carried_values, mut working) = state
            .map(|s| (s.values, s.data.working_memory))
            .unwrap_or_default();
        let mut action_index = 0usize;

        for response in responses {
            for requested in &response.content.actions {
                let mut step_state = self
                    .compose_state(message, &[RECENT_MESSAGES, ACTION_STATE], false, false)
                    .await?;
                for (key, value) in &carried_values {
                    step_state.values.insert(key.clone(), value.clone());
                }
                step_state.data.action_plan.clone_from(&plan);
                step_state.data.action_results.clone_from(&accumulated);
                step_state.data.working_memory = working.clone();
                step_state.data.run_id = Some(run_id);

                let Some(action) = self.resolve_action(requested) else {
                    warn!(action = %requested, "no action registered matching declared name");
                    let reason = format!("Action not found: {requested}");
                    if let Some(plan) = plan.as_mut() {
                        plan.fail_step(action_index, reason.clone());
                    }
                    let record = StepRecord::Error(ActionError::failed(reason));
                    let memory = build_action_memory(
                        agent_entity,
                        message,
                        &StepMemoryParts {
                            action_name: requested,
                            action_id: None,
                            run_id,
                            record: &record,
                            plan: plan.as_ref(),
                        },
                    );
                    store.create_memory(&memory, "messages", false).await?;
                    action_index += 1;
                    continue;
                };

                let action_id = turn.begin_action(action.name());
                self.events()
                    .emit_event(
                        self,
                        &[ACTION_STARTED],
                        &json!({
                            "runId": run_id,
                            "actionName": action.name(),
                            "actionId": action_id,
                        }),
                    )
                    .await;

                let options = ActionOptions {
                    turn: Arc::clone(turn),
                    context: ActionHandlerContext {
                        previous_results: accumulated.clone(),
                    },
                    plan: plan.clone(),
                    callback: callback.clone(),
                };

                let outcome = action
                    .handle(self, message, &step_state, &options, responses)
                    .await;

                let record = match outcome {
                    Ok(ActionOutcome::Legacy(value))
                        if value.is_null() || value.is_boolean() =>
                    {
                        StepRecord::Legacy(value)
                    }
                    Ok(ActionOutcome::Legacy(value)) => {
                        let result = ActionResult::ok()
                            .with_data("actionName", json!(action.name()))
                            .with_data("legacyResult", value);
                        StepRecord::Result(result)
                    }
                    Ok(ActionOutcome::Structured(result)) => StepRecord::Result(result),
                    Err(err) => StepRecord::Error(err),
                };

                match &record {
                    StepRecord::Result(result) => {
                        accumulated.push(result.clone());
                        for (key, value) in &result.values {
                            carried_values.insert(key.clone(), value.clone());
                        }
                        working.insert(
                            format!("action_{requested}_{}", MemoryId::random()),
                            WorkingMemoryEntry {
                                action_name: action.name().to_owned(),
                                result: result.clone(),
                                timestamp: now_millis(),
                            },
                        );
                        working.evict_to(self.max_working_memory());
                        if let Some(plan) = plan.as_mut() {
                            plan.complete_step(action_index, result.clone());
                        }
                    }
                    StepRecord::Legacy(value) => {
                        if let Some(plan) = plan.as_mut() {
                            plan.complete_step(
                                action_index,
                                ActionResult::ok().with_data("legacy", value.clone()),
                            );
                        }
                    }
                    StepRecord::Error(err) => {
                        let error_result = ActionResult::failure(action.name(), err.reason())
                            .with_data("errorObject", json!({ "message": err.reason() }));
                        accumulated.push(error_result);
                        if let Some(plan) = plan.as_mut() {
                            plan.fail_step(action_index, err.reason());
                        }
                    }
                }

                let captured = turn.finish_action();
                let prompts: Vec<Value> = captured
                    .as_ref()
                    .map(|active| {
                        active
                            .prompts
                            .iter()
                            .map(|record| {
                                json!({
                                    "modelType": record.model_type,
                                    "prompt": record.prompt,
                                    "timestamp": record.timestamp,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let memory = build_action_memory(
                    agent_entity,
                    message,
                    &StepMemoryParts {
                        action_name: action.name(),
                        action_id: Some(action_id),
                        run_id,
                        record: &record,
                        plan: plan.as_ref(),
                    },
                );
                store.create_memory(&memory, "messages", false).await?;

                let step_result = match &record {
                    StepRecord::Result(result) => json!(result),
                    StepRecord::Legacy(value) => json!({ "legacy": value }),
                    StepRecord::Error(err) => json!({ "error": err.reason() }),
                };
                let log_body = json!({
                    "action": action.name(),
                    "actionId": action_id,
                    "message": message.content.text,
                    "state": serde_json::to_value(&step_state)?,
                    "responses": serde_json::to_value(responses)?,
                    "result": step_result,
                    "prompts": prompts,
                    "promptCount": prompts.len(),
                    "runId": run_id,
                    "planStep": plan.as_ref().map(ActionPlan::progress),
                });
                store
                    .log(&LogEntry::new(
                        agent_entity,
                        message.room_id,
                        "action",
                        log_body,
                    ))
                    .await?;

                let status = match &record {
                    StepRecord::Error(_) => "failed",
                    StepRecord::Result(_) | StepRecord::Legacy(_) => "completed",
                };
                self.events()
                    .emit_event(
                        self,
                        &[ACTION_COMPLETED],
                        &json!({
                            "runId": run_id,
                            "actionName": action.name(),
                            "actionId": action_id,
                            "status": status,
                        }),
                    )
                    .await;

                if let StepRecord::Error(err) = record
                    && err.is_critical()
                {
                    self.events()
                        .emit_event(
                            self,
                            &[RUN_ENDED],
                            &json!({ "runId": run_id, "status": "aborted" }),
                        )
                        .await;
                    return Err(err.into());
                }

                action_index += 1;
            }
        }

        let final_state = State {
            values: {
                let mut values = serde_json::Map::new();
                values.insert("actionResults".into(), json!(accumulated));
                values
            },
            data: agent_primitives::StateData {
                action_results: accumulated.clone(),
                action_plan: plan,
                ..agent_primitives::StateData::default()
            },
            text: serde_json::to_string(&accumulated)?,
        };
        self.cache_state(format!("{}_action_results", message.id), final_state)
            .await;

        self.events()
            .emit_event(
                self,
                &[RUN_ENDED],
                &json!({ "runId": run_id, "status": "completed" }),
            )
            .await;

        Ok(())
    }

    /// Runs the registered evaluators for a processed turn.
    ///
    /// Evaluators whose `always_run` flag is off are skipped when the agent
    /// did not respond. Validation runs concurrently; evaluators that
    /// validate run their handlers concurrently. Each run is logged; handler
    /// failures are logged and do not abort the turn.
    ///
    /// Returns the names of the evaluators that ran.
    ///
    /// # Errors
    ///
    /// Propagates store failures while logging evaluator runs.
    pub async fn evaluate(
        &self,
        turn: &Arc<TurnContext>,
        message: &Memory,
        state: &State,
        did_respond: bool,
        responses: &[Memory],
        callback: Option<ResponseCallback>,
    ) -> KernelResult<Vec<String>> {
        let candidates: Vec<Arc<dyn Evaluator>> = self
            .evaluators()
            .into_iter()
            .filter(|evaluator| did_respond || evaluator.always_run())
            .collect();

        let validations = join_all(
            candidates
                .iter()
                .map(|evaluator| evaluator.validate(self, message, state)),
        )
        .await;
        let selected: Vec<Arc<dyn Evaluator>> = candidates
            .into_iter()
            .zip(validations)
            .filter_map(|(evaluator, valid)| valid.then_some(evaluator))
            .collect();

        let outcomes = join_all(selected.iter().map(|evaluator| {
            let callback = callback.clone();
            let turn = Arc::clone(turn);
            async move {
                let outcome = evaluator
                    .handle(self, turn, message, state, did_respond, responses, callback)
                    .await;
                (evaluator.name().to_owned(), outcome)
            }
        }))
        .await;

        let agent_entity = EntityId::from_uuid(self.agent_id().as_uuid());
        let mut ran = Vec::with_capacity(outcomes.len());
        for (name, outcome) in outcomes {
            if let Err(err) = outcome {
                warn!(evaluator = %name, %err, "evaluator failed");
            }
            if let Some(store) = self.store() {
                store
                    .log(&LogEntry::new(
                        agent_entity,
                        message.room_id,
                        "evaluator",
                        json!({
                            "evaluator": name,
                            "messageId": message.id,
                            "runId": turn.current_run_id(),
                        }),
                    ))
                    .await?;
            }
            ran.push(name);
        }

        Ok(ran)
    }
}
