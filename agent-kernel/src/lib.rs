//! Runtime kernel for Conversa agents.
//!
//! The kernel composes pluggable capabilities (actions, evaluators, context
//! providers, model handlers, services, event handlers, task workers) into a
//! deterministic request/response pipeline over a persistent memory store.
//! Persistence itself lives behind the [`agent_store::StoreAdapter`] trait;
//! the kernel owns only the wiring: plugin registration, state composition,
//! multi-step action execution, model dispatch with priority routing and
//! prompt capture, service lifecycle, and a typed event bus.

#![warn(missing_docs, clippy::pedantic)]

mod actions;
mod events;
mod models;
mod plugin;
mod providers;
mod runtime;
mod services;
mod settings;
mod turn;

use thiserror::Error;

pub use actions::{
    Action, ActionError, ActionHandlerContext, ActionHandlerResult, ActionOptions, ActionOutcome,
    Evaluator, ResponseCallback, resolve_action,
};
pub use events::{
    ACTION_COMPLETED, ACTION_STARTED, CONTROL_MESSAGE, EventBus, EventHandler, HandlerToken,
    MESSAGE_RECEIVED, RUN_ENDED, RUN_STARTED,
};
pub use models::{
    ModelError, ModelHandler, ModelResult, ModelRouter, OBJECT_LARGE, OBJECT_SMALL, TEXT_EMBEDDING,
    TEXT_LARGE, TEXT_SMALL, extract_prompt,
};
pub use plugin::{ModelRegistration, Plugin, PluginError, PluginInit, Route, RouteMethod};
pub use providers::{ACTION_STATE, Provider, ProviderError, RECENT_MESSAGES};
pub use runtime::{AgentRuntime, ControlAction, RuntimeBuilder, TaskWorker};
pub use services::{
    SendHandler, SendTarget, Service, ServiceDefinition, ServiceError, ServiceRegistry,
    ServiceResult,
};
pub use settings::{PassthroughCodec, SecretCodec, coerce_setting};
pub use turn::{ActiveAction, PromptRecord, TurnContext};

/// Errors surfaced by kernel operations.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Kernel configuration is invalid (e.g. no store adapter registered).
    #[error("configuration error: {reason}")]
    Config {
        /// Human-readable reason.
        reason: String,
    },
    /// Plugin registration failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),
    /// Service lifecycle or send-handler failure.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Model resolution or handler failure.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Provider failure during state composition.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Action handler failure that aborted the turn.
    #[error(transparent)]
    Action(#[from] ActionError),
    /// Store adapter failure.
    #[error(transparent)]
    Store(#[from] agent_store::StoreError),
    /// Serialization failure while assembling state or log payloads.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: serde_json::Error,
    },
}

impl KernelError {
    /// Convenience constructor for configuration failures.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
