//! Per-turn execution context: run ids and action attribution.
//!
//! The run id and the current action context are scoped to the task driving
//! a turn, never stored on the runtime itself, so concurrent turns cannot
//! observe each other's attribution.

use std::sync::Mutex;

use agent_primitives::{MemoryId, RunId, now_millis};

/// A model call captured while an action was executing.
#[derive(Clone, Debug)]
pub struct PromptRecord {
    /// Model type the call was dispatched to.
    pub model_type: String,
    /// Extracted prompt, when one was present in the params.
    pub prompt: Option<String>,
    /// Capture time, epoch milliseconds.
    pub timestamp: i64,
}

/// The action currently executing within a turn.
#[derive(Clone, Debug)]
pub struct ActiveAction {
    /// Resolved action name.
    pub action_name: String,
    /// Identifier of this specific invocation.
    pub action_id: MemoryId,
    /// Model calls captured so far.
    pub prompts: Vec<PromptRecord>,
}

/// Task-scoped context threaded through turn processing.
///
/// Created per turn by the caller and passed explicitly to
/// [`process_actions`](crate::AgentRuntime::process_actions),
/// [`evaluate`](crate::AgentRuntime::evaluate), and
/// [`use_model`](crate::AgentRuntime::use_model).
#[derive(Debug, Default)]
pub struct TurnContext {
    run_id: Mutex<Option<RunId>>,
    action: Mutex<Option<ActiveAction>>,
}

impl TurnContext {
    /// Creates a fresh context with no run and no active action.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new run id and makes it current.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn start_run(&self) -> RunId {
        let run_id = RunId::random();
        *self.run_id.lock().expect("turn context poisoned") = Some(run_id);
        run_id
    }

    /// Clears the current run id.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn end_run(&self) {
        *self.run_id.lock().expect("turn context poisoned") = None;
    }

    /// Returns the current run id, minting one when absent.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn current_run_id(&self) -> RunId {
        let mut guard = self.run_id.lock().expect("turn context poisoned");
        *guard.get_or_insert_with(RunId::random)
    }

    /// Marks the named action as executing and returns its invocation id.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn begin_action(&self, action_name: impl Into<String>) -> MemoryId {
        let action_id = MemoryId::random();
        *self.action.lock().expect("turn context poisoned") = Some(ActiveAction {
            action_name: action_name.into(),
            action_id,
            prompts: Vec::new(),
        });
        action_id
    }

    /// Clears the active action, returning it with its captured prompts.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn finish_action(&self) -> Option<ActiveAction> {
        self.action.lock().expect("turn context poisoned").take()
    }

    /// Returns the name and invocation id of the active action, when set.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn active_action(&self) -> Option<(String, MemoryId)> {
        self.action
            .lock()
            .expect("turn context poisoned")
            .as_ref()
            .map(|a| (a.action_name.clone(), a.action_id))
    }

    /// Appends a prompt record to the active action, when one is set.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn record_prompt(&self, model_type: impl Into<String>, prompt: Option<String>) {
        if let Some(action) = self.action.lock().expect("turn context poisoned").as_mut() {
            action.prompts.push(PromptRecord {
                model_type: model_type.into(),
                prompt,
                timestamp: now_millis(),
            });
        }
    }
}
