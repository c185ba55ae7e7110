//! Model dispatch: per-type handler routing, prompt capture, and call logs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use agent_primitives::{EntityId, RoomId};
use agent_store::LogEntry;

use crate::{AgentRuntime, KernelResult, TurnContext};

/// Small instruction-following text model.
pub const TEXT_SMALL: &str = "TEXT_SMALL";
/// Large text model.
pub const TEXT_LARGE: &str = "TEXT_LARGE";
/// Embedding model. Calls of this type are excluded from prompt capture.
pub const TEXT_EMBEDDING: &str = "TEXT_EMBEDDING";
/// Small structured-output model.
pub const OBJECT_SMALL: &str = "OBJECT_SMALL";
/// Large structured-output model.
pub const OBJECT_LARGE: &str = "OBJECT_LARGE";

/// Result alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors surfaced by model resolution and invocation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No handler is registered for the requested model type.
    #[error("no handler registered for model type `{model_type}`")]
    UnknownModelType {
        /// The unresolved model type.
        model_type: String,
    },
    /// The handler failed while serving the call.
    #[error("model handler error: {reason}")]
    Handler {
        /// Human-readable reason returned by the handler.
        reason: String,
    },
}

impl ModelError {
    /// Convenience constructor for handler failures.
    #[must_use]
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler {
            reason: reason.into(),
        }
    }
}

/// Handler serving calls for one model type.
#[async_trait]
pub trait ModelHandler: Send + Sync {
    /// Serves a single model call.
    async fn run(&self, runtime: &AgentRuntime, params: Value) -> ModelResult<Value>;
}

#[async_trait]
impl<F, Fut> ModelHandler for F
where
    F: Send + Sync + Fn(Value) -> Fut,
    Fut: Future<Output = ModelResult<Value>> + Send,
{
    async fn run(&self, _runtime: &AgentRuntime, params: Value) -> ModelResult<Value> {
        (self)(params).await
    }
}

struct ModelEntry {
    handler: Arc<dyn ModelHandler>,
    provider: String,
    priority: i32,
    registration_order: u64,
}

/// Routes model calls to the best-ranked registered handler per type.
///
/// Entries are ordered by priority (descending), ties broken by earlier
/// registration.
#[derive(Default)]
pub struct ModelRouter {
    entries: RwLock<HashMap<String, Vec<ModelEntry>>>,
    next_order: AtomicU64,
}

impl ModelRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `model_type` on behalf of `provider`.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register(
        &self,
        model_type: impl Into<String>,
        handler: Arc<dyn ModelHandler>,
        provider: impl Into<String>,
        priority: i32,
    ) {
        let registration_order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().expect("model registry poisoned");
        let slot = entries.entry(model_type.into()).or_default();
        slot.push(ModelEntry {
            handler,
            provider: provider.into(),
            priority,
            registration_order,
        });
        slot.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.registration_order.cmp(&b.registration_order))
        });
    }

    /// Resolves the handler for `model_type`, preferring `provider` when set.
    ///
    /// An unmatched provider logs a warning and falls back to the
    /// highest-priority entry. Returns the handler together with the provider
    /// name it was registered under.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn resolve(
        &self,
        model_type: &str,
        provider: Option<&str>,
    ) -> Option<(Arc<dyn ModelHandler>, String)> {
        let entries = self.entries.read().expect("model registry poisoned");
        let slot = entries.get(model_type)?;

        if let Some(wanted) = provider {
            if let Some(entry) = slot.iter().find(|e| e.provider == wanted) {
                return Some((Arc::clone(&entry.handler), entry.provider.clone()));
            }
            warn!(
                model_type,
                provider = wanted,
                "provider not registered for model type, falling back to best handler"
            );
        }

        slot.first()
            .map(|entry| (Arc::clone(&entry.handler), entry.provider.clone()))
    }

    /// Returns `true` when at least one handler exists for `model_type`.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn has(&self, model_type: &str) -> bool {
        let entries = self.entries.read().expect("model registry poisoned");
        entries.get(model_type).is_some_and(|slot| !slot.is_empty())
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().expect("model registry poisoned");
        let types: Vec<_> = entries.keys().cloned().collect();
        f.debug_struct("ModelRouter")
            .field("model_types", &types)
            .finish()
    }
}

/// Extracts prompt text from model params.
///
/// Priority: `params.prompt`, then `params.input`, then the serialized
/// `params.messages` list.
#[must_use]
pub fn extract_prompt(params: &Value) -> Option<String> {
    let map = params.as_object()?;
    if let Some(prompt) = map.get("prompt").and_then(Value::as_str) {
        return Some(prompt.to_owned());
    }
    if let Some(input) = map.get("input").and_then(Value::as_str) {
        return Some(input.to_owned());
    }
    map.get("messages")
        .and_then(|messages| serde_json::to_string(messages).ok())
}

fn numeric_vector_len(value: &Value) -> Option<usize> {
    let array = value.as_array()?;
    (!array.is_empty() && array.iter().all(Value::is_number)).then_some(array.len())
}

impl AgentRuntime {
    /// Registers a model handler.
    pub fn register_model(
        &self,
        model_type: impl Into<String>,
        handler: Arc<dyn ModelHandler>,
        provider: impl Into<String>,
        priority: i32,
    ) {
        self.models().register(model_type, handler, provider, priority);
    }

    /// Returns the best handler for `model_type`, honouring `provider`.
    #[must_use]
    pub fn get_model(
        &self,
        model_type: &str,
        provider: Option<&str>,
    ) -> Option<Arc<dyn ModelHandler>> {
        self.models()
            .resolve(model_type, provider)
            .map(|(handler, _)| handler)
    }

    /// Dispatches a model call and audits it.
    ///
    /// On success a structured log is persisted carrying the params, the
    /// extracted prompt, the run id, elapsed wall-clock time, and — when the
    /// call happened inside an action — the action attribution. Numeric
    /// vector responses (embeddings) are redacted from the log body. When an
    /// action is active and the type is not [`TEXT_EMBEDDING`], the prompt is
    /// appended to the action's capture list.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::UnknownModelType`] when no handler exists, or
    /// the handler's own [`ModelError`] on failure (in which case no log is
    /// written). Store failures while persisting the log propagate.
    pub async fn use_model(
        &self,
        turn: &TurnContext,
        model_type: &str,
        params: Value,
        provider: Option<&str>,
    ) -> KernelResult<Value> {
        let (handler, resolved_provider) =
            self.models()
                .resolve(model_type, provider)
                .ok_or_else(|| ModelError::UnknownModelType {
                    model_type: model_type.to_owned(),
                })?;

        let prompt = extract_prompt(&params);
        let started = Instant::now();
        let response = handler.run(self, params.clone()).await?;
        let execution_time = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let action_context = turn.active_action();
        if action_context.is_some() && model_type != TEXT_EMBEDDING {
            turn.record_prompt(model_type, prompt.clone());
        }

        if let Some(store) = self.store() {
            let logged_response = match numeric_vector_len(&response) {
                Some(len) => Value::from(format!("[array of {len} numbers]")),
                None => response.clone(),
            };
            let body = json!({
                "modelType": model_type,
                "modelKey": model_type,
                "params": params,
                "prompt": prompt,
                "runId": turn.current_run_id(),
                "executionTime": execution_time,
                "provider": resolved_provider,
                "actionContext": action_context.as_ref().map(|(name, id)| {
                    json!({ "actionName": name, "actionId": id })
                }),
                "response": logged_response,
            });
            let agent_id = self.agent_id();
            let entry = LogEntry::new(
                EntityId::from_uuid(agent_id.as_uuid()),
                RoomId::from_uuid(agent_id.as_uuid()),
                format!("useModel:{model_type}"),
                body,
            );
            store.log(&entry).await?;
        } else {
            debug!(model_type, "no store adapter registered, model call not logged");
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::Character;
    use agent_store::{LocalStore, LogQuery, StoreAdapter};

    fn handler(response: &'static str) -> Arc<dyn ModelHandler> {
        Arc::new(move |_params: Value| async move { Ok::<_, ModelError>(Value::from(response)) })
    }

    async fn run(router: &ModelRouter, runtime: &AgentRuntime, model_type: &str) -> Value {
        let (resolved, _) = router.resolve(model_type, None).unwrap();
        resolved.run(runtime, Value::Null).await.unwrap()
    }

    fn runtime() -> AgentRuntime {
        AgentRuntime::builder(Character::builder("model-test").build().unwrap()).build()
    }

    #[tokio::test]
    async fn highest_priority_wins() {
        let runtime = runtime();
        let router = ModelRouter::new();
        router.register(TEXT_SMALL, handler("low"), "a", 0);
        router.register(TEXT_SMALL, handler("high"), "b", 10);

        assert_eq!(run(&router, &runtime, TEXT_SMALL).await, "high");
    }

    #[tokio::test]
    async fn ties_break_by_registration_order() {
        let runtime = runtime();
        let router = ModelRouter::new();
        router.register(TEXT_SMALL, handler("first"), "a", 5);
        router.register(TEXT_SMALL, handler("second"), "b", 5);

        assert_eq!(run(&router, &runtime, TEXT_SMALL).await, "first");
    }

    #[tokio::test]
    async fn provider_match_and_fallback() {
        let runtime = runtime();
        let router = ModelRouter::new();
        router.register(TEXT_LARGE, handler("alpha"), "alpha", 0);
        router.register(TEXT_LARGE, handler("beta"), "beta", 1);

        let (resolved, provider) = router.resolve(TEXT_LARGE, Some("alpha")).unwrap();
        assert_eq!(provider, "alpha");
        assert_eq!(resolved.run(&runtime, Value::Null).await.unwrap(), "alpha");

        // Unknown provider falls back to the best entry.
        let (resolved, provider) = router.resolve(TEXT_LARGE, Some("missing")).unwrap();
        assert_eq!(provider, "beta");
        assert_eq!(resolved.run(&runtime, Value::Null).await.unwrap(), "beta");
    }

    #[test]
    fn unknown_type_resolves_to_none() {
        let router = ModelRouter::new();
        assert!(router.resolve("NOPE", None).is_none());
        assert!(!router.has("NOPE"));
    }

    #[test]
    fn prompt_extraction_priority() {
        let both = json!({ "prompt": "p", "input": "i" });
        assert_eq!(extract_prompt(&both).as_deref(), Some("p"));

        let input = json!({ "input": "i" });
        assert_eq!(extract_prompt(&input).as_deref(), Some("i"));

        let messages = json!({ "messages": [{"role": "user", "content": "hi"}] });
        assert!(extract_prompt(&messages).unwrap().contains("\"hi\""));

        assert_eq!(extract_prompt(&Value::Null), None);
        assert_eq!(extract_prompt(&json!({})), None);
    }

    #[tokio::test]
    async fn use_model_logs_success() {
        let store = Arc::new(LocalStore::new());
        store.init().await.unwrap();
        let runtime = AgentRuntime::builder(Character::builder("model-test").build().unwrap())
            .store(Arc::clone(&store) as Arc<dyn StoreAdapter>)
            .build();
        runtime.register_model(TEXT_LARGE, handler("pong"), "test", 0);

        let turn = TurnContext::new();
        let response = runtime
            .use_model(&turn, TEXT_LARGE, json!({ "prompt": "ping" }), None)
            .await
            .unwrap();
        assert_eq!(response, "pong");

        let logs = store
            .get_logs(&LogQuery {
                log_type: Some(format!("useModel:{TEXT_LARGE}")),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].body["prompt"], "ping");
        assert_eq!(logs[0].body["provider"], "test");
        assert!(logs[0].body["actionContext"].is_null());
    }

    #[tokio::test]
    async fn use_model_failure_writes_no_log() {
        let store = Arc::new(LocalStore::new());
        store.init().await.unwrap();
        let runtime = AgentRuntime::builder(Character::builder("model-test").build().unwrap())
            .store(Arc::clone(&store) as Arc<dyn StoreAdapter>)
            .build();
        runtime.register_model(
            TEXT_LARGE,
            Arc::new(|_params: Value| async move {
                Err::<Value, _>(ModelError::handler("overloaded"))
            }),
            "test",
            0,
        );

        let turn = TurnContext::new();
        let err = runtime
            .use_model(&turn, TEXT_LARGE, json!({ "prompt": "ping" }), None)
            .await
            .expect_err("handler failure");
        assert!(matches!(
            err,
            crate::KernelError::Model(ModelError::Handler { .. })
        ));

        let logs = store.get_logs(&LogQuery::default()).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn embedding_responses_are_redacted() {
        let store = Arc::new(LocalStore::new());
        store.init().await.unwrap();
        let runtime = AgentRuntime::builder(Character::builder("model-test").build().unwrap())
            .store(Arc::clone(&store) as Arc<dyn StoreAdapter>)
            .build();
        runtime.register_model(
            TEXT_EMBEDDING,
            Arc::new(|_params: Value| async move { Ok::<_, ModelError>(json!([0.25, 0.5, 0.75])) }),
            "test",
            0,
        );

        let turn = TurnContext::new();
        runtime
            .use_model(&turn, TEXT_EMBEDDING, Value::Null, None)
            .await
            .unwrap();

        let logs = store.get_logs(&LogQuery::default()).await.unwrap();
        assert_eq!(logs[0].body["response"], "[array of 3 numbers]");
    }
}
