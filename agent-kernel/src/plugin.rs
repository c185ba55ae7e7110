//! Plugin capability bundles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use agent_store::StoreAdapter;

use crate::{
    Action, AgentRuntime, EventHandler, Evaluator, KernelResult, ModelHandler, Provider,
    ServiceDefinition,
};

/// Errors surfaced by plugin registration.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin's init hook failed for a non-configuration reason.
    #[error("plugin `{plugin}` failed to initialise: {reason}")]
    Init {
        /// Plugin name.
        plugin: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Init hook invoked when the plugin is registered.
///
/// Failures whose message mentions missing API keys, environment variables,
/// or invalid plugin configuration are downgraded to warnings by the loader.
#[async_trait]
pub trait PluginInit: Send + Sync {
    /// Initialises the plugin against the supplied runtime.
    async fn init(&self, config: &Map<String, Value>, runtime: &AgentRuntime) -> KernelResult<()>;
}

/// HTTP verb of a plugin route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

/// An HTTP route exposed by a plugin, served by an external gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    /// Path pattern (e.g. `"/health"`).
    pub path: String,
    /// HTTP verb.
    pub method: RouteMethod,
    /// Route name, when exposed in listings.
    pub name: Option<String>,
    /// Whether the route is reachable without authentication.
    pub public: bool,
}

/// A model handler registration contributed by a plugin.
///
/// The plugin's own name becomes the provider key for routing.
#[derive(Clone)]
pub struct ModelRegistration {
    /// Model type the handler serves.
    pub model_type: String,
    /// Routing priority; higher wins.
    pub priority: i32,
    /// The handler itself.
    pub handler: Arc<dyn ModelHandler>,
}

impl ModelRegistration {
    /// Creates a registration with priority 0.
    #[must_use]
    pub fn new(model_type: impl Into<String>, handler: Arc<dyn ModelHandler>) -> Self {
        Self {
            model_type: model_type.into(),
            priority: 0,
            handler,
        }
    }

    /// Sets the routing priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for ModelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistration")
            .field("model_type", &self.model_type)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// A bundle of capabilities wired into the runtime as one unit.
///
/// The loader walks the capability lists in a fixed order: adapter, actions,
/// evaluators, providers, models, routes, events, services.
#[derive(Default)]
pub struct Plugin {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) config: Map<String, Value>,
    pub(crate) init: Option<Arc<dyn PluginInit>>,
    pub(crate) adapter: Option<Arc<dyn StoreAdapter>>,
    pub(crate) actions: Vec<Arc<dyn Action>>,
    pub(crate) evaluators: Vec<Arc<dyn Evaluator>>,
    pub(crate) providers: Vec<Arc<dyn Provider>>,
    pub(crate) models: Vec<ModelRegistration>,
    pub(crate) routes: Vec<Route>,
    pub(crate) events: Vec<(String, Arc<dyn EventHandler>)>,
    pub(crate) services: Vec<Arc<dyn ServiceDefinition>>,
    pub(crate) schema: Option<Value>,
}

impl Plugin {
    /// Creates an empty plugin with the supplied name.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the plugin description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Sets the configuration handed to the init hook.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Sets the init hook.
    #[must_use]
    pub fn with_init(mut self, init: Arc<dyn PluginInit>) -> Self {
        self.init = Some(init);
        self
    }

    /// Contributes a store adapter. Only the first adapter registered with
    /// the runtime wins.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn StoreAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Contributes an action.
    #[must_use]
    pub fn with_action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    /// Contributes an evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Contributes a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Contributes a model handler.
    #[must_use]
    pub fn with_model(mut self, model: ModelRegistration) -> Self {
        self.models.push(model);
        self
    }

    /// Contributes an HTTP route.
    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Subscribes a typed event handler.
    #[must_use]
    pub fn with_event(mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.events.push((name.into(), handler));
        self
    }

    /// Contributes a service definition.
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn ServiceDefinition>) -> Self {
        self.services.push(service);
        self
    }

    /// Attaches a schema migration payload.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("actions", &self.actions.len())
            .field("evaluators", &self.evaluators.len())
            .field("providers", &self.providers.len())
            .field("models", &self.models.len())
            .field("routes", &self.routes.len())
            .field("events", &self.events.len())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}
