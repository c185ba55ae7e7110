//! Composed turn state, action results, plans, and working memory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{RoomId, RunId};

/// Output produced by a single context provider.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Values to shallow-merge into the state.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,
    /// Text contribution to the composed prompt context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Structured data kept out of the prompt.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ProviderOutput {
    /// Creates an output carrying only text.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Structured portion of the composed state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateData {
    /// Per-provider outputs keyed by provider name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderOutput>,
    /// Results accumulated by the action engine during this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<ActionResult>,
    /// Execution plan for multi-action turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_plan: Option<ActionPlan>,
    /// Bounded history of recent action results.
    #[serde(default, skip_serializing_if = "WorkingMemory::is_empty")]
    pub working_memory: WorkingMemory,
    /// Room the state was composed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Run the state belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Additional data attached by providers or handlers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The composed context for one turn.
///
/// After composition `values["providers"]` always equals `text`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    /// Flat key/value view consumed by prompt templates.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,
    /// Structured view consumed by the kernel and plugins.
    #[serde(default)]
    pub data: StateData,
    /// Concatenated provider text in position order.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

/// Outcome of a single executed action step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the step succeeded.
    pub success: bool,
    /// Values to merge into the running state.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,
    /// Structured result payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    /// Human-readable result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ActionResult {
    /// Creates an empty successful result.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            values: Map::new(),
            data: Map::new(),
            text: None,
        }
    }

    /// Creates a failed result attributed to the named action.
    #[must_use]
    pub fn failure(action_name: impl Into<String>, error: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("actionName".into(), Value::from(action_name.into()));
        data.insert("error".into(), Value::from(error.into()));
        Self {
            success: false,
            values: Map::new(),
            data,
            text: None,
        }
    }

    /// Sets the result text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Inserts a value entry.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Inserts a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the action name recorded in the result data, when present.
    #[must_use]
    pub fn action_name(&self) -> Option<&str> {
        self.data.get("actionName").and_then(Value::as_str)
    }
}

/// Status of a single plan step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet executed.
    Pending,
    /// Executed successfully.
    Completed,
    /// Executed and failed.
    Failed,
}

/// One entry in an [`ActionPlan`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStep {
    /// Action name to execute.
    pub action: String,
    /// Execution status.
    pub status: StepStatus,
    /// Result, for completed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    /// Error message, for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Execution ledger for a multi-action turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Run this plan belongs to.
    pub run_id: RunId,
    /// Number of planned steps.
    pub total_steps: usize,
    /// Number of steps no longer pending.
    pub current_step: usize,
    /// Ordered step ledger.
    pub steps: Vec<PlanStep>,
    /// Reasoning behind the plan.
    pub thought: String,
    /// Plan creation time, epoch milliseconds.
    pub start_time: i64,
}

impl ActionPlan {
    /// Creates a plan with one pending step per action name.
    #[must_use]
    pub fn new(run_id: RunId, actions: &[String], thought: impl Into<String>, start_time: i64) -> Self {
        let steps = actions
            .iter()
            .map(|action| PlanStep {
                action: action.clone(),
                status: StepStatus::Pending,
                result: None,
                error: None,
            })
            .collect::<Vec<_>>();
        Self {
            run_id,
            total_steps: steps.len(),
            current_step: 0,
            steps,
            thought: thought.into(),
            start_time,
        }
    }

    /// Marks the step at `index` completed with the supplied result.
    pub fn complete_step(&mut self, index: usize, result: ActionResult) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Completed;
            step.result = Some(result);
            step.error = None;
        }
        self.refresh_current_step();
    }

    /// Marks the step at `index` failed with the supplied error message.
    pub fn fail_step(&mut self, index: usize, error: impl Into<String>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Failed;
            step.error = Some(error.into());
        }
        self.refresh_current_step();
    }

    /// Returns a `"<current>/<total>"` progress label.
    #[must_use]
    pub fn progress(&self) -> String {
        format!("{}/{}", self.current_step, self.total_steps)
    }

    fn refresh_current_step(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .filter(|step| step.status != StepStatus::Pending)
            .count();
    }
}

/// A single retained action result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkingMemoryEntry {
    /// Action that produced the result.
    pub action_name: String,
    /// The result itself.
    pub result: ActionResult,
    /// Insertion time, epoch milliseconds.
    pub timestamp: i64,
}

/// Bounded per-turn history of action results.
///
/// On overflow the newest entries by timestamp are retained.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingMemory {
    entries: BTreeMap<String, WorkingMemoryEntry>,
}

impl WorkingMemory {
    /// Inserts an entry under the supplied key.
    pub fn insert(&mut self, key: impl Into<String>, entry: WorkingMemoryEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Evicts the oldest entries until at most `max` remain.
    pub fn evict_to(&mut self, max: usize) {
        if self.entries.len() <= max {
            return;
        }
        let mut ranked: Vec<_> = std::mem::take(&mut self.entries).into_iter().collect();
        ranked.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        ranked.truncate(max);
        self.entries = ranked.into_iter().collect();
    }

    /// Returns the entry stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&WorkingMemoryEntry> {
        self.entries.get(key)
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &WorkingMemoryEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ActionPlan {
        ActionPlan::new(
            RunId::random(),
            &["FETCH".into(), "POST".into()],
            "fetch then post",
            0,
        )
    }

    #[test]
    fn plan_starts_pending() {
        let plan = plan();
        assert_eq!(plan.total_steps, 2);
        assert_eq!(plan.current_step, 0);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn step_accounting_tracks_non_pending() {
        let mut plan = plan();
        plan.complete_step(0, ActionResult::ok());
        assert_eq!(plan.current_step, 1);
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        assert!(plan.steps[0].result.is_some());

        plan.fail_step(1, "boom");
        assert_eq!(plan.current_step, 2);
        assert_eq!(plan.steps[1].status, StepStatus::Failed);
        assert_eq!(plan.steps[1].error.as_deref(), Some("boom"));
        assert_eq!(plan.progress(), "2/2");
    }

    #[test]
    fn non_pending_steps_carry_result_or_error() {
        let mut plan = plan();
        plan.complete_step(0, ActionResult::ok().with_text("done"));
        plan.fail_step(1, "boom");
        for step in &plan.steps {
            assert!(
                step.status == StepStatus::Pending
                    || step.result.is_some()
                    || step.error.is_some()
            );
        }
    }

    #[test]
    fn working_memory_keeps_newest_on_overflow() {
        let mut memory = WorkingMemory::default();
        for (i, t) in [10_i64, 20, 30, 40].iter().enumerate() {
            memory.insert(
                format!("action_step_{i}"),
                WorkingMemoryEntry {
                    action_name: format!("ACTION_{i}"),
                    result: ActionResult::ok(),
                    timestamp: *t,
                },
            );
        }

        memory.evict_to(3);
        assert_eq!(memory.len(), 3);
        assert!(memory.get("action_step_0").is_none());
        assert!(memory.get("action_step_1").is_some());
        assert!(memory.get("action_step_3").is_some());
    }

    #[test]
    fn failure_result_records_action_name() {
        let result = ActionResult::failure("POST", "boom");
        assert!(!result.success);
        assert_eq!(result.action_name(), Some("POST"));
        assert_eq!(result.data.get("error").unwrap(), "boom");
    }
}
