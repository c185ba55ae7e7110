//! Context providers and the state composition pipeline.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use agent_primitives::{Memory, ProviderOutput, State};

use crate::{AgentRuntime, KernelResult};

/// Provider name used by the action engine to pull recent conversation.
pub const RECENT_MESSAGES: &str = "RECENT_MESSAGES";
/// Provider name used by the action engine to pull accumulated action state.
pub const ACTION_STATE: &str = "ACTION_STATE";

/// Errors surfaced by state composition.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A provider failed while producing its output, failing the whole
    /// composition.
    #[error("provider `{provider}` failed: {reason}")]
    Failed {
        /// Name of the failing provider.
        provider: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A read-only context source.
///
/// Non-private, non-dynamic providers run on every composition; private and
/// dynamic providers run only when named in an include list.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique provider name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Merge position; lower positions contribute earlier. Defaults to 0.
    fn position(&self) -> i32 {
        0
    }

    /// Private providers are excluded from default selection.
    fn is_private(&self) -> bool {
        false
    }

    /// Dynamic providers are excluded from default selection.
    fn is_dynamic(&self) -> bool {
        false
    }

    /// Produces this provider's contribution for one message.
    ///
    /// The supplied state is the cached prior composition, read-only.
    ///
    /// # Errors
    ///
    /// Any error fails the whole composition.
    async fn get(
        &self,
        runtime: &AgentRuntime,
        message: &Memory,
        state: &State,
    ) -> KernelResult<ProviderOutput>;
}

impl AgentRuntime {
    /// Composes the turn state for `message` from the registered providers.
    ///
    /// Selection: with `only_include` set and a non-empty `include_list`,
    /// exactly the named providers run; otherwise every non-private,
    /// non-dynamic provider runs, plus any provider named in `include_list`.
    /// Selected providers execute concurrently and merge in ascending
    /// position order: provider text concatenates with `"\n"` (empty
    /// contributions skipped), values shallow-merge with later positions
    /// overriding, and cached outputs from providers not refreshed this turn
    /// are retained. After composition `values["providers"]` equals `text`.
    ///
    /// The result is cached under the message id; the cache is intentionally
    /// unbounded, entries are overwritten on recomposition. `skip_cache`
    /// ignores the cached prior state.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Failed`] when any selected provider fails.
    pub async fn compose_state(
        &self,
        message: &Memory,
        include_list: &[&str],
        only_include: bool,
        skip_cache: bool,
    ) -> KernelResult<State> {
        let cache_key = message.id.to_string();
        let prior = if skip_cache {
            None
        } else {
            self.cached_state(&cache_key).await
        };

        let registered = self.providers();
        let mut selected: Vec<Arc<dyn Provider>> = if only_include && !include_list.is_empty() {
            registered
                .iter()
                .filter(|p| include_list.contains(&p.name()))
                .cloned()
                .collect()
        } else {
            let mut selected: Vec<Arc<dyn Provider>> = registered
                .iter()
                .filter(|p| !p.is_private() && !p.is_dynamic())
                .cloned()
                .collect();
            for name in include_list {
                if !selected.iter().any(|p| p.name() == *name)
                    && let Some(provider) = registered.iter().find(|p| p.name() == *name)
                {
                    selected.push(Arc::clone(provider));
                }
            }
            selected
        };
        selected.sort_by_key(|provider| provider.position());

        let prior_state = prior.clone().unwrap_or_default();
        let outputs = join_all(selected.iter().map(|provider| {
            let prior_state = &prior_state;
            async move {
                let output = provider.get(self, message, prior_state).await;
                (provider.name().to_owned(), output)
            }
        }))
        .await;

        let mut fresh: Vec<(String, ProviderOutput)> = Vec::with_capacity(outputs.len());
        for (name, output) in outputs {
            match output {
                Ok(output) => fresh.push((name, output)),
                Err(err) => {
                    return Err(ProviderError::Failed {
                        provider: name,
                        reason: err.to_string(),
                    }
                    .into());
                }
            }
        }

        let mut state = prior.unwrap_or_default();

        for (name, output) in &fresh {
            state.data.providers.insert(name.clone(), output.clone());
        }

        let text = fresh
            .iter()
            .map(|(_, output)| output.text.as_str())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        for (_, output) in &fresh {
            for (key, value) in &output.values {
                state.values.insert(key.clone(), value.clone());
            }
        }
        let refreshed: HashSet<&str> = fresh.iter().map(|(name, _)| name.as_str()).collect();
        let cached_values: Vec<(String, Value)> = state
            .data
            .providers
            .iter()
            .filter(|(name, _)| !refreshed.contains(name.as_str()))
            .flat_map(|(_, output)| output.values.clone())
            .collect();
        for (key, value) in cached_values {
            state.values.entry(key).or_insert(value);
        }

        state.values.insert("providers".into(), Value::from(text.clone()));
        state.text = text;
        state.data.room_id = Some(message.room_id);

        self.cache_state(cache_key, state.clone()).await;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    use agent_primitives::{Character, Content, EntityId, RoomId};

    use crate::KernelError;

    struct StaticProvider {
        name: &'static str,
        position: i32,
        private: bool,
        dynamic: bool,
        values: Map<String, Value>,
        text: &'static str,
        fail: bool,
    }

    impl StaticProvider {
        fn new(name: &'static str, position: i32, text: &'static str) -> Self {
            Self {
                name,
                position,
                private: false,
                dynamic: false,
                values: Map::new(),
                text,
                fail: false,
            }
        }

        fn value(mut self, key: &str, value: Value) -> Self {
            self.values.insert(key.into(), value);
            self
        }
    }

    #[async_trait]
    impl Provider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn position(&self) -> i32 {
            self.position
        }

        fn is_private(&self) -> bool {
            self.private
        }

        fn is_dynamic(&self) -> bool {
            self.dynamic
        }

        async fn get(
            &self,
            _runtime: &AgentRuntime,
            _message: &Memory,
            _state: &State,
        ) -> KernelResult<ProviderOutput> {
            if self.fail {
                return Err(KernelError::config("provider exploded"));
            }
            Ok(ProviderOutput {
                values: self.values.clone(),
                text: self.text.to_owned(),
                data: Map::new(),
            })
        }
    }

    fn runtime() -> AgentRuntime {
        AgentRuntime::builder(Character::builder("compose-test").build().unwrap()).build()
    }

    fn message() -> Memory {
        Memory::message(
            EntityId::random(),
            RoomId::random(),
            Content::from_text("hello"),
        )
    }

    #[tokio::test]
    async fn merges_in_position_order_and_skips_private() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(
            StaticProvider::new("A", 10, "A").value("a", json!(1)),
        ));
        runtime.register_provider(Arc::new(
            StaticProvider::new("B", 5, "B")
                .value("b", json!(2))
                .value("a", json!(9)),
        ));
        runtime.register_provider(Arc::new({
            let mut p = StaticProvider::new("C", 20, "C");
            p.private = true;
            p
        }));

        let state = runtime
            .compose_state(&message(), &[], false, false)
            .await
            .unwrap();

        assert_eq!(state.text, "B\nA");
        assert_eq!(state.values.get("a").unwrap(), &json!(1));
        assert_eq!(state.values.get("b").unwrap(), &json!(2));
        assert_eq!(state.values.get("providers").unwrap(), &json!("B\nA"));
        assert!(state.data.providers.contains_key("A"));
        assert!(state.data.providers.contains_key("B"));
        assert!(!state.data.providers.contains_key("C"));
    }

    #[tokio::test]
    async fn include_list_pulls_in_dynamic_providers() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(StaticProvider::new("BASE", 0, "base")));
        runtime.register_provider(Arc::new({
            let mut p = StaticProvider::new("DYN", 1, "dyn");
            p.dynamic = true;
            p
        }));

        let message = message();
        let without = runtime
            .compose_state(&message, &[], false, true)
            .await
            .unwrap();
        assert_eq!(without.text, "base");

        let with = runtime
            .compose_state(&message, &["DYN"], false, true)
            .await
            .unwrap();
        assert_eq!(with.text, "base\ndyn");
    }

    #[tokio::test]
    async fn only_include_restricts_selection() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(StaticProvider::new("A", 0, "a")));
        runtime.register_provider(Arc::new(StaticProvider::new("B", 1, "b")));

        let state = runtime
            .compose_state(&message(), &["B"], true, true)
            .await
            .unwrap();
        assert_eq!(state.text, "b");
        assert!(!state.data.providers.contains_key("A"));
    }

    #[tokio::test]
    async fn cached_outputs_survive_partial_recompose() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(
            StaticProvider::new("BASE", 0, "base").value("base", json!(true)),
        ));
        runtime.register_provider(Arc::new({
            let mut p = StaticProvider::new("DYN", 1, "dyn");
            p.dynamic = true;
            p.values.insert("dyn".into(), json!(7));
            p
        }));

        let message = message();
        runtime
            .compose_state(&message, &["DYN"], false, false)
            .await
            .unwrap();

        // Recompose only the always-on provider; the dynamic output stays cached.
        let state = runtime
            .compose_state(&message, &[], false, false)
            .await
            .unwrap();
        assert_eq!(state.text, "base");
        assert!(state.data.providers.contains_key("DYN"));
        assert_eq!(state.values.get("dyn").unwrap(), &json!(7));
        assert_eq!(state.values.get("providers").unwrap(), &json!("base"));
    }

    #[tokio::test]
    async fn provider_failure_fails_composition() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(StaticProvider::new("OK", 0, "ok")));
        runtime.register_provider(Arc::new({
            let mut p = StaticProvider::new("BAD", 1, "bad");
            p.fail = true;
            p
        }));

        let err = runtime
            .compose_state(&message(), &[], false, false)
            .await
            .expect_err("composition should fail");
        assert!(matches!(
            err,
            KernelError::Provider(ProviderError::Failed { ref provider, .. }) if provider == "BAD"
        ));
    }

    #[tokio::test]
    async fn state_is_cached_by_message_id() {
        let runtime = runtime();
        runtime.register_provider(Arc::new(StaticProvider::new("A", 0, "a")));

        let message = message();
        runtime
            .compose_state(&message, &[], false, false)
            .await
            .unwrap();
        let cached = runtime.cached_state(&message.id.to_string()).await.unwrap();
        assert_eq!(cached.text, "a");
        assert_eq!(cached.values.get("providers").unwrap(), &json!("a"));
    }
}
