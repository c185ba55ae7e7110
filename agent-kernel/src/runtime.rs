//! The agent runtime: construction, plugin wiring, and lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use agent_primitives::{
    Agent, AgentId, Character, Content, Entity, EntityId, Memory, MemoryId, Room, RoomId, RoomType,
    State, Task, World, WorldId, now_millis,
};
use agent_store::{LogEntry, LogQuery, MemoryQuery, SearchQuery, StoreAdapter};

use crate::events::CONTROL_MESSAGE;
use crate::models::TEXT_EMBEDDING;
use crate::services::{SendHandler, SendTarget, Service, ServiceDefinition, ServiceError};
use crate::settings::{PassthroughCodec, SecretCodec};
use crate::turn::TurnContext;
use crate::{
    Action, EventBus, EventHandler, Evaluator, KernelError, KernelResult, ModelRouter, Plugin,
    PluginError, Provider, Route, ServiceRegistry,
};

const DEFAULT_MAX_WORKING_MEMORY: usize = 50;

/// Worker executing deferred [`Task`] records.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Worker name tasks are dispatched by.
    fn name(&self) -> &str;

    /// Returns `true` when the worker accepts the task.
    async fn validate(&self, runtime: &AgentRuntime, task: &Task) -> bool {
        let _ = (runtime, task);
        true
    }

    /// Executes the task.
    async fn execute(&self, runtime: &AgentRuntime, task: &Task) -> KernelResult<()>;
}

/// Input-gating instruction carried by a control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Re-enable user input in the target room.
    EnableInput,
    /// Disable user input in the target room.
    DisableInput,
}

impl ControlAction {
    /// Returns the wire form of the instruction.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EnableInput => "enable_input",
            Self::DisableInput => "disable_input",
        }
    }
}

/// The runtime kernel: one agent identity plus its wired capabilities.
///
/// The runtime exclusively owns the event bus, the service registry, the
/// model router, and all in-memory caches. The store adapter owns persistent
/// records; the runtime holds a shared reference and never closes it unless
/// [`close`](Self::close) is invoked explicitly.
pub struct AgentRuntime {
    pub(crate) character: RwLock<Character>,
    agent_id: AgentId,
    store: RwLock<Option<Arc<dyn StoreAdapter>>>,
    actions: RwLock<Vec<Arc<dyn Action>>>,
    evaluators: RwLock<Vec<Arc<dyn Evaluator>>>,
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    models: ModelRouter,
    events: EventBus,
    services: ServiceRegistry,
    send_handlers: RwLock<HashMap<String, Arc<dyn SendHandler>>>,
    routes: RwLock<Vec<Route>>,
    task_workers: RwLock<HashMap<String, Arc<dyn TaskWorker>>>,
    registered_plugins: RwLock<Vec<String>>,
    plugin_schemas: RwLock<Vec<Value>>,
    pending_plugins: AsyncMutex<Vec<Plugin>>,
    service_queue: AsyncMutex<Vec<Arc<dyn ServiceDefinition>>>,
    pub(crate) settings: RwLock<Map<String, Value>>,
    pub(crate) secret_codec: Arc<dyn SecretCodec>,
    state_cache: AsyncRwLock<HashMap<String, State>>,
    initialized: AtomicBool,
    max_working_memory: usize,
}

/// Builder for [`AgentRuntime`].
pub struct RuntimeBuilder {
    character: Character,
    store: Option<Arc<dyn StoreAdapter>>,
    plugins: Vec<Plugin>,
    settings: Map<String, Value>,
    secret_codec: Arc<dyn SecretCodec>,
    max_working_memory: Option<usize>,
}

impl RuntimeBuilder {
    /// Installs the store adapter.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queues a plugin for registration during [`AgentRuntime::initialize`].
    #[must_use]
    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds a runtime-level setting.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Installs a secret codec. Defaults to [`PassthroughCodec`].
    #[must_use]
    pub fn secret_codec(mut self, codec: Arc<dyn SecretCodec>) -> Self {
        self.secret_codec = codec;
        self
    }

    /// Overrides the working-memory entry cap.
    #[must_use]
    pub fn max_working_memory(mut self, max: usize) -> Self {
        self.max_working_memory = Some(max);
        self
    }

    /// Builds the runtime. The agent id derives from the character.
    #[must_use]
    pub fn build(self) -> AgentRuntime {
        let agent_id = self.character.agent_id();
        let max_working_memory = self
            .max_working_memory
            .or_else(|| setting_as_usize(self.settings.get("MAX_WORKING_MEMORY_ENTRIES")))
            .or_else(|| {
                std::env::var("MAX_WORKING_MEMORY_ENTRIES")
                    .ok()
                    .and_then(|raw| raw.parse().ok())
            })
            .unwrap_or(DEFAULT_MAX_WORKING_MEMORY);

        AgentRuntime {
            character: RwLock::new(self.character),
            agent_id,
            store: RwLock::new(self.store),
            actions: RwLock::new(Vec::new()),
            evaluators: RwLock::new(Vec::new()),
            providers: RwLock::new(Vec::new()),
            models: ModelRouter::new(),
            events: EventBus::new(),
            services: ServiceRegistry::new(),
            send_handlers: RwLock::new(HashMap::new()),
            routes: RwLock::new(Vec::new()),
            task_workers: RwLock::new(HashMap::new()),
            registered_plugins: RwLock::new(Vec::new()),
            plugin_schemas: RwLock::new(Vec::new()),
            pending_plugins: AsyncMutex::new(self.plugins),
            service_queue: AsyncMutex::new(Vec::new()),
            settings: RwLock::new(self.settings),
            secret_codec: self.secret_codec,
            state_cache: AsyncRwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            max_working_memory,
        }
    }
}

fn setting_as_usize(value: Option<&Value>) -> Option<usize> {
    let value = value?;
    value
        .as_u64()
        .and_then(|v| usize::try_from(v).ok())
        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
}

impl AgentRuntime {
    /// Starts building a runtime for the supplied character.
    #[must_use]
    pub fn builder(character: Character) -> RuntimeBuilder {
        RuntimeBuilder {
            character,
            store: None,
            plugins: Vec::new(),
            settings: Map::new(),
            secret_codec: Arc::new(PassthroughCodec),
            max_working_memory: None,
        }
    }

    // -- accessors ---------------------------------------------------------

    /// Returns the agent identifier.
    #[must_use]
    pub const fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Returns a snapshot of the character.
    ///
    /// # Panics
    ///
    /// Panics if the character lock is poisoned.
    #[must_use]
    pub fn character(&self) -> Character {
        self.character.read().expect("character lock poisoned").clone()
    }

    /// Returns the registered store adapter, when present.
    ///
    /// # Panics
    ///
    /// Panics if the store lock is poisoned.
    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn StoreAdapter>> {
        self.store.read().expect("store lock poisoned").clone()
    }

    pub(crate) fn require_store(&self) -> KernelResult<Arc<dyn StoreAdapter>> {
        self.store()
            .ok_or_else(|| KernelError::config("no store adapter registered"))
    }

    /// Returns the model router.
    #[must_use]
    pub const fn models(&self) -> &ModelRouter {
        &self.models
    }

    /// Returns the event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Returns the service registry.
    #[must_use]
    pub const fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Returns the registered actions, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the action registry lock is poisoned.
    #[must_use]
    pub fn actions(&self) -> Vec<Arc<dyn Action>> {
        self.actions.read().expect("action registry poisoned").clone()
    }

    /// Returns the registered evaluators, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the evaluator registry lock is poisoned.
    #[must_use]
    pub fn evaluators(&self) -> Vec<Arc<dyn Evaluator>> {
        self.evaluators
            .read()
            .expect("evaluator registry poisoned")
            .clone()
    }

    /// Returns the registered providers, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the provider registry lock is poisoned.
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("provider registry poisoned")
            .clone()
    }

    /// Returns the registered routes.
    ///
    /// # Panics
    ///
    /// Panics if the route registry lock is poisoned.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().expect("route registry poisoned").clone()
    }

    /// Returns the names of the registered plugins, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the plugin registry lock is poisoned.
    #[must_use]
    pub fn registered_plugins(&self) -> Vec<String> {
        self.registered_plugins
            .read()
            .expect("plugin registry poisoned")
            .clone()
    }

    /// Returns the working-memory entry cap.
    #[must_use]
    pub const fn max_working_memory(&self) -> usize {
        self.max_working_memory
    }

    /// Returns `true` once [`initialize`](Self::initialize) has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns the cached state stored under `key`.
    pub async fn cached_state(&self, key: &str) -> Option<State> {
        self.state_cache.read().await.get(key).cloned()
    }

    /// Caches a state under `key`, overwriting any prior entry.
    pub async fn cache_state(&self, key: impl Into<String>, state: State) {
        self.state_cache.write().await.insert(key.into(), state);
    }

    // -- registrars --------------------------------------------------------

    /// Installs the store adapter. Only the first registration wins.
    ///
    /// # Panics
    ///
    /// Panics if the store lock is poisoned.
    pub fn register_database_adapter(&self, adapter: Arc<dyn StoreAdapter>) {
        let mut slot = self.store.write().expect("store lock poisoned");
        if slot.is_some() {
            warn!("store adapter already registered, ignoring replacement");
        } else {
            *slot = Some(adapter);
        }
    }

    /// Registers an action. Duplicate names are skipped with a warning.
    ///
    /// # Panics
    ///
    /// Panics if the action registry lock is poisoned.
    pub fn register_action(&self, action: Arc<dyn Action>) {
        let mut actions = self.actions.write().expect("action registry poisoned");
        if actions.iter().any(|a| a.name() == action.name()) {
            warn!(action = %action.name(), "action already registered, skipping");
            return;
        }
        debug!(action = %action.name(), "action registered");
        actions.push(action);
    }

    /// Registers an evaluator.
    ///
    /// # Panics
    ///
    /// Panics if the evaluator registry lock is poisoned.
    pub fn register_evaluator(&self, evaluator: Arc<dyn Evaluator>) {
        self.evaluators
            .write()
            .expect("evaluator registry poisoned")
            .push(evaluator);
    }

    /// Registers a provider.
    ///
    /// # Panics
    ///
    /// Panics if the provider registry lock is poisoned.
    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.providers
            .write()
            .expect("provider registry poisoned")
            .push(provider);
    }

    /// Subscribes a typed event handler.
    pub fn register_event(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.events.register(name, handler);
    }

    /// Registers an HTTP route served by an external gateway.
    ///
    /// # Panics
    ///
    /// Panics if the route registry lock is poisoned.
    pub fn register_route(&self, route: Route) {
        self.routes.write().expect("route registry poisoned").push(route);
    }

    /// Registers a task worker. Duplicate names warn and overwrite.
    ///
    /// # Panics
    ///
    /// Panics if the worker registry lock is poisoned.
    pub fn register_task_worker(&self, worker: Arc<dyn TaskWorker>) {
        let name = worker.name().to_owned();
        let mut workers = self.task_workers.write().expect("worker registry poisoned");
        if workers.insert(name.clone(), worker).is_some() {
            warn!(worker = %name, "task worker replaced");
        }
    }

    /// Returns the task worker registered under `name`.
    ///
    /// # Panics
    ///
    /// Panics if the worker registry lock is poisoned.
    #[must_use]
    pub fn get_task_worker(&self, name: &str) -> Option<Arc<dyn TaskWorker>> {
        self.task_workers
            .read()
            .expect("worker registry poisoned")
            .get(name)
            .cloned()
    }

    /// Registers a send handler for a message source. Duplicates warn and
    /// overwrite.
    ///
    /// # Panics
    ///
    /// Panics if the send-handler registry lock is poisoned.
    pub fn register_send_handler(&self, source: impl Into<String>, handler: Arc<dyn SendHandler>) {
        let source = source.into();
        let mut handlers = self
            .send_handlers
            .write()
            .expect("send handler registry poisoned");
        if handlers.insert(source.clone(), handler).is_some() {
            warn!(source = %source, "send handler replaced");
        }
    }

    /// Registers a service definition.
    ///
    /// Before initialization completes, definitions are parked in a queue
    /// and started once the store is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::MissingType`] when the definition declares an
    /// empty service type; propagates start failures after initialization.
    pub async fn register_service(
        &self,
        definition: Arc<dyn ServiceDefinition>,
    ) -> KernelResult<()> {
        if definition.service_type().trim().is_empty() {
            return Err(ServiceError::MissingType {
                service: definition.service_name().to_owned(),
            }
            .into());
        }

        if self.is_initialized() {
            self.start_service(definition).await
        } else {
            debug!(
                service = %definition.service_name(),
                "runtime not initialized, deferring service start"
            );
            self.service_queue.lock().await.push(definition);
            Ok(())
        }
    }

    async fn start_service(&self, definition: Arc<dyn ServiceDefinition>) -> KernelResult<()> {
        let instance = definition.start(self).await?;
        info!(
            service_type = %definition.service_type(),
            service = %definition.service_name(),
            "service started"
        );
        for (source, handler) in definition.send_handlers() {
            self.register_send_handler(source, handler);
        }
        self.services.insert(definition, instance);
        Ok(())
    }

    /// Looks a service up by name (case-insensitive), falling back to type.
    #[must_use]
    pub fn get_service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name)
    }

    /// Returns every instance registered under `service_type`.
    #[must_use]
    pub fn get_services_by_type(&self, service_type: &str) -> Vec<Arc<dyn Service>> {
        self.services.of_type(service_type)
    }

    /// Returns `true` when at least one instance of `service_type` exists.
    #[must_use]
    pub fn has_service(&self, service_type: &str) -> bool {
        self.services.has(service_type)
    }

    // -- plugin loading ----------------------------------------------------

    /// Wires a plugin's capabilities into the runtime.
    ///
    /// Capabilities register in a fixed order: adapter, actions, evaluators,
    /// providers, models, routes, events, services. Duplicate plugin names
    /// are skipped with a warning. Init-hook failures mentioning missing API
    /// keys, environment variables, or invalid plugin configuration are
    /// downgraded to warnings.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Init`] for other init-hook failures and
    /// propagates service registration failures.
    ///
    /// # Panics
    ///
    /// Panics if an internal registry lock is poisoned.
    pub async fn register_plugin(&self, plugin: Plugin) -> KernelResult<()> {
        let name = plugin.name.clone();
        // Reserve the name under one write guard so concurrent registrations
        // of the same plugin cannot both pass the duplicate check.
        {
            let mut registered = self
                .registered_plugins
                .write()
                .expect("plugin registry poisoned");
            if registered.iter().any(|registered| registered == &name) {
                warn!(plugin = %name, "plugin already registered, skipping");
                return Ok(());
            }
            registered.push(name.clone());
        }

        if let Some(init) = &plugin.init
            && let Err(err) = init.init(&plugin.config, self).await
        {
            let reason = err.to_string();
            if reason.contains("API key")
                || reason.contains("environment variables")
                || reason.contains("Invalid plugin configuration")
            {
                warn!(plugin = %name, reason = %reason, "plugin init deferred pending configuration");
            } else {
                self.registered_plugins
                    .write()
                    .expect("plugin registry poisoned")
                    .retain(|registered| registered != &name);
                return Err(PluginError::Init {
                    plugin: name,
                    reason,
                }
                .into());
            }
        }

        if let Some(adapter) = plugin.adapter {
            self.register_database_adapter(adapter);
        }
        for action in plugin.actions {
            self.register_action(action);
        }
        for evaluator in plugin.evaluators {
            self.register_evaluator(evaluator);
        }
        for provider in plugin.providers {
            self.register_provider(provider);
        }
        for model in plugin.models {
            self.models
                .register(model.model_type, model.handler, name.clone(), model.priority);
        }
        for route in plugin.routes {
            self.register_route(route);
        }
        for (event, handler) in plugin.events {
            self.register_event(event, handler);
        }
        for service in plugin.services {
            self.register_service(service).await?;
        }
        if let Some(schema) = plugin.schema {
            self.plugin_schemas
                .write()
                .expect("schema registry poisoned")
                .push(schema);
        }

        Ok(())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Boots the runtime: registers queued plugins, initialises the store,
    /// ensures the agent record, self-entity, self-room, and self
    /// participation exist, probes the embedding dimension, and drains the
    /// deferred service queue. Idempotent; re-entry warns and returns.
    ///
    /// # Errors
    ///
    /// Fails when no store adapter is registered, and propagates store,
    /// plugin, model, and service failures.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    pub async fn initialize(&self) -> KernelResult<()> {
        if self.is_initialized() {
            warn!(agent_id = %self.agent_id, "runtime already initialized");
            return Ok(());
        }

        let pending: Vec<Plugin> = self.pending_plugins.lock().await.drain(..).collect();
        let results = join_all(pending.into_iter().map(|plugin| self.register_plugin(plugin))).await;
        for result in results {
            result?;
        }

        let store = self.require_store()?;
        store.init().await?;

        let agent = self.ensure_agent_exists().await?;

        let entity_id = EntityId::from_uuid(self.agent_id.as_uuid());
        let agent_name = agent.character.name().to_owned();
        let entity = Entity::new(entity_id, self.agent_id, agent_name.clone());
        match store.create_entities(&[entity]).await {
            Ok(_) => {}
            Err(err) if err.is_duplicate() => {
                debug!(agent_id = %self.agent_id, "agent self-entity already exists");
            }
            Err(err) => return Err(err.into()),
        }

        let world_id = WorldId::from_uuid(self.agent_id.as_uuid());
        if store.get_world(world_id).await?.is_none() {
            store
                .create_world(&World {
                    id: world_id,
                    name: format!("{agent_name} (self)"),
                    agent_id: self.agent_id,
                    server_id: self.agent_id.to_string(),
                    metadata: Map::new(),
                })
                .await?;
        }

        let room_id = RoomId::from_uuid(self.agent_id.as_uuid());
        if store.get_rooms_by_ids(&[room_id]).await?.is_empty() {
            store
                .create_rooms(&[Room {
                    id: room_id,
                    name: Some(agent_name),
                    world_id,
                    source: Some("self".into()),
                    room_type: RoomType::SelfRoom,
                    channel_id: None,
                    server_id: Some(self.agent_id.to_string()),
                    metadata: Map::new(),
                }])
                .await?;
        }

        store.add_participants_room(&[entity_id], room_id).await?;

        if self.models.has(TEXT_EMBEDDING) {
            // Dimension probe: a real embedding of null input, by contract.
            let turn = TurnContext::new();
            let response = self.use_model(&turn, TEXT_EMBEDDING, Value::Null, None).await?;
            if let Some(vector) = response.as_array() {
                store.ensure_embedding_dimension(vector.len()).await?;
            }
        }

        let queued: Vec<Arc<dyn ServiceDefinition>> =
            self.service_queue.lock().await.drain(..).collect();
        for definition in queued {
            self.start_service(definition).await?;
        }

        self.initialized.store(true, Ordering::Release);
        info!(agent_id = %self.agent_id, "runtime initialized");
        Ok(())
    }

    /// Finds the agent record by character name, updating it when present
    /// and creating it otherwise.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn ensure_agent_exists(&self) -> KernelResult<Agent> {
        let store = self.require_store()?;
        let character = self.character();

        let existing = store
            .get_agents()
            .await?
            .into_iter()
            .find(|agent| agent.character.name() == character.name());

        if let Some(mut agent) = existing {
            agent.character = character;
            agent.updated_at = now_millis();
            store.update_agent(&agent).await?;
            Ok(agent)
        } else {
            let agent = Agent::from_character(&character);
            store.create_agent(&agent).await?;
            Ok(agent)
        }
    }

    /// Creates the world unless it already exists.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn ensure_world_exists(&self, world: &World) -> KernelResult<()> {
        let store = self.require_store()?;
        if store.get_world(world.id).await?.is_none() {
            store.create_world(world).await?;
        }
        Ok(())
    }

    /// Creates the room unless it already exists.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn ensure_room_exists(&self, room: &Room) -> KernelResult<()> {
        let store = self.require_store()?;
        if store.get_rooms_by_ids(&[room.id]).await?.is_empty() {
            store.create_rooms(std::slice::from_ref(room)).await?;
        }
        Ok(())
    }

    /// Adds the entity to the room's participant set (idempotent).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn ensure_participant_in_room(
        &self,
        entity_id: EntityId,
        room_id: RoomId,
    ) -> KernelResult<()> {
        let store = self.require_store()?;
        store.add_participants_room(&[entity_id], room_id).await?;
        Ok(())
    }

    /// Applies the schema migrations collected from plugins.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    ///
    /// # Panics
    ///
    /// Panics if the schema registry lock is poisoned.
    pub async fn run_migrations(&self) -> KernelResult<()> {
        let schemas = self
            .plugin_schemas
            .read()
            .expect("schema registry poisoned")
            .clone();
        self.require_store()?.run_migrations(&schemas).await?;
        Ok(())
    }

    /// Stops every running service. Failures are logged, never rethrown.
    pub async fn stop(&self) {
        self.services.stop_all().await;
    }

    /// Stops services and closes the store adapter.
    ///
    /// # Errors
    ///
    /// Propagates store close failures.
    pub async fn close(&self) -> KernelResult<()> {
        self.stop().await;
        if let Some(store) = self.store() {
            store.close().await?;
        }
        Ok(())
    }

    /// Returns `true` when initialization completed and the store is ready.
    pub async fn is_ready(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        match self.store() {
            Some(store) => store.is_ready().await,
            None => false,
        }
    }

    // -- messaging ---------------------------------------------------------

    /// Delivers content to an external target via its source's send handler.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownSendTarget`] when no handler is
    /// registered for the target source.
    ///
    /// # Panics
    ///
    /// Panics if the send-handler registry lock is poisoned.
    pub async fn send_message_to_target(
        &self,
        target: &SendTarget,
        content: &Content,
    ) -> KernelResult<()> {
        let handler = self
            .send_handlers
            .read()
            .expect("send handler registry poisoned")
            .get(&target.source)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownSendTarget {
                target_source: target.source.clone(),
            })?;
        handler.send(self, target, content).await
    }

    /// Emits a `CONTROL_MESSAGE` typed event gating input for a room.
    pub async fn send_control_message(
        &self,
        room_id: RoomId,
        action: ControlAction,
        target: Option<String>,
    ) {
        let payload = json!({
            "type": "control",
            "payload": { "action": action.as_str(), "target": target },
            "roomId": room_id,
        });
        self.events
            .emit_event(self, &[CONTROL_MESSAGE], &payload)
            .await;
    }

    // -- events ------------------------------------------------------------

    /// Emits a typed event under each of `names`.
    ///
    /// Handlers fan out concurrently; failures are logged and do not abort
    /// siblings.
    pub async fn emit_event(&self, names: &[&str], payload: &Value) {
        self.events.emit_event(self, names, payload).await;
    }

    /// Returns the typed handlers subscribed to `name`.
    #[must_use]
    pub fn get_event(&self, name: &str) -> Vec<Arc<dyn EventHandler>> {
        self.events.handlers(name)
    }

    /// Subscribes an untyped handler, returning its token.
    pub fn on(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Fn(&Value) + Send + Sync>,
    ) -> crate::HandlerToken {
        self.events.on(name, handler)
    }

    /// Removes the untyped handler registered under `token`.
    pub fn off(&self, name: &str, token: crate::HandlerToken) -> bool {
        self.events.off(name, token)
    }

    /// Invokes the untyped handlers for `name` in registration order.
    pub fn emit(&self, name: &str, payload: &Value) {
        self.events.emit(name, payload);
    }

    // -- store pass-through ------------------------------------------------

    /// Persists a memory into `table`.
    ///
    /// # Errors
    ///
    /// Propagates store failures, including duplicate-key rejections.
    pub async fn create_memory(
        &self,
        memory: &Memory,
        table: &str,
        unique: bool,
    ) -> KernelResult<MemoryId> {
        Ok(self.require_store()?.create_memory(memory, table, unique).await?)
    }

    /// Persists an entity, tolerating duplicates.
    ///
    /// Duplicate-key failures are logged at debug level and reported as
    /// `false`; all other failures propagate.
    ///
    /// # Errors
    ///
    /// Propagates non-duplicate store failures.
    pub async fn create_entity(&self, entity: &Entity) -> KernelResult<bool> {
        let store = self.require_store()?;
        match store.create_entities(std::slice::from_ref(entity)).await {
            Ok(created) => Ok(created),
            Err(err) if err.is_duplicate() => {
                debug!(entity_id = %entity.id, "entity already exists");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns memories matching `query`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_memories(&self, query: &MemoryQuery) -> KernelResult<Vec<Memory>> {
        Ok(self.require_store()?.get_memories(query).await?)
    }

    /// Returns memories ranked by embedding similarity.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn search_memories(&self, query: &SearchQuery) -> KernelResult<Vec<Memory>> {
        Ok(self.require_store()?.search_memories(query).await?)
    }

    /// Returns the cached value stored under `key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_cache(&self, key: &str) -> KernelResult<Option<Value>> {
        Ok(self.require_store()?.get_cache(key).await?)
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_cache(&self, key: &str, value: Value) -> KernelResult<bool> {
        Ok(self.require_store()?.set_cache(key, value).await?)
    }

    /// Appends a structured log record.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn log(&self, entry: &LogEntry) -> KernelResult<()> {
        Ok(self.require_store()?.log(entry).await?)
    }

    /// Returns log records matching `query`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_logs(&self, query: &LogQuery) -> KernelResult<Vec<LogEntry>> {
        Ok(self.require_store()?.get_logs(query).await?)
    }

    /// Persists a task.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn create_task(&self, task: &Task) -> KernelResult<MemoryId> {
        Ok(self.require_store()?.create_task(task).await?)
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.agent_id)
            .field("initialized", &self.is_initialized())
            .field("plugins", &self.registered_plugins())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use agent_store::LocalStore;

    use crate::KernelError;

    fn character(name: &str) -> Character {
        Character::builder(name).build().unwrap()
    }

    struct CountingService;

    #[async_trait]
    impl Service for CountingService {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct CountingDefinition {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceDefinition for CountingDefinition {
        fn service_type(&self) -> &str {
            "counting"
        }

        async fn start(&self, _runtime: &AgentRuntime) -> KernelResult<Arc<dyn Service>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingService))
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let store = Arc::new(LocalStore::new());
        let runtime = AgentRuntime::builder(character("runtime-test"))
            .store(Arc::clone(&store) as Arc<dyn StoreAdapter>)
            .build();

        runtime.initialize().await.unwrap();
        runtime.initialize().await.unwrap();

        let agents = store.get_agents().await.unwrap();
        assert_eq!(agents.len(), 1);

        let entity_id = EntityId::from_uuid(runtime.agent_id().as_uuid());
        let room_id = RoomId::from_uuid(runtime.agent_id().as_uuid());
        let participants = store.get_participants_for_room(room_id).await.unwrap();
        assert_eq!(participants, vec![entity_id]);
        assert!(runtime.is_ready().await);
    }

    #[tokio::test]
    async fn initialize_without_store_fails() {
        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let err = runtime.initialize().await.expect_err("missing adapter");
        assert!(matches!(err, KernelError::Config { .. }));
    }

    #[tokio::test]
    async fn services_defer_until_initialized() {
        let starts = Arc::new(AtomicUsize::new(0));
        let runtime = AgentRuntime::builder(character("runtime-test"))
            .store(Arc::new(LocalStore::new()))
            .plugin(Plugin::new("svc-plugin", "services").with_service(Arc::new(
                CountingDefinition {
                    starts: Arc::clone(&starts),
                },
            )))
            .build();

        assert_eq!(starts.load(Ordering::SeqCst), 0);
        runtime.initialize().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(runtime.has_service("counting"));

        // Post-init registrations start immediately.
        runtime
            .register_service(Arc::new(CountingDefinition {
                starts: Arc::clone(&starts),
            }))
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.get_services_by_type("counting").len(), 2);
    }

    #[tokio::test]
    async fn empty_service_type_is_rejected() {
        struct Nameless;

        #[async_trait]
        impl ServiceDefinition for Nameless {
            fn service_type(&self) -> &str {
                " "
            }

            async fn start(&self, _runtime: &AgentRuntime) -> KernelResult<Arc<dyn Service>> {
                unreachable!("rejected before start")
            }
        }

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let err = runtime
            .register_service(Arc::new(Nameless))
            .await
            .expect_err("missing type");
        assert!(matches!(
            err,
            KernelError::Service(ServiceError::MissingType { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_plugin_names_are_skipped() {
        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        runtime
            .register_plugin(Plugin::new("dup", "first"))
            .await
            .unwrap();
        runtime
            .register_plugin(Plugin::new("dup", "second"))
            .await
            .unwrap();
        assert_eq!(runtime.registered_plugins(), ["dup"]);
    }

    #[tokio::test]
    async fn concurrent_duplicate_plugins_register_once() {
        struct YieldingInit;

        #[async_trait]
        impl crate::PluginInit for YieldingInit {
            async fn init(
                &self,
                _config: &Map<String, Value>,
                _runtime: &AgentRuntime,
            ) -> KernelResult<()> {
                tokio::task::yield_now().await;
                Ok(())
            }
        }

        struct NoopEvaluator;

        #[async_trait]
        impl Evaluator for NoopEvaluator {
            fn name(&self) -> &str {
                "noop"
            }

            async fn validate(
                &self,
                _runtime: &AgentRuntime,
                _message: &Memory,
                _state: &State,
            ) -> bool {
                false
            }

            async fn handle(
                &self,
                _runtime: &AgentRuntime,
                _turn: Arc<TurnContext>,
                _message: &Memory,
                _state: &State,
                _did_respond: bool,
                _responses: &[Memory],
                _callback: Option<crate::ResponseCallback>,
            ) -> KernelResult<()> {
                Ok(())
            }
        }

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let bundle = || {
            Plugin::new("dup", "duplicate")
                .with_init(Arc::new(YieldingInit))
                .with_evaluator(Arc::new(NoopEvaluator))
        };

        // Same fan-out shape initialize() uses; both futures reach the init
        // await before either finishes registering.
        let results = join_all([
            runtime.register_plugin(bundle()),
            runtime.register_plugin(bundle()),
        ])
        .await;
        for result in results {
            result.unwrap();
        }

        assert_eq!(runtime.registered_plugins(), ["dup"]);
        assert_eq!(runtime.evaluators().len(), 1);
    }

    #[tokio::test]
    async fn plugin_init_configuration_errors_downgrade() {
        struct FailingInit {
            message: &'static str,
        }

        #[async_trait]
        impl crate::PluginInit for FailingInit {
            async fn init(
                &self,
                _config: &Map<String, Value>,
                _runtime: &AgentRuntime,
            ) -> KernelResult<()> {
                Err(KernelError::config(self.message))
            }
        }

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let plugin = Plugin::new("needs-key", "config").with_init(Arc::new(FailingInit {
            message: "missing API key for provider",
        }));
        runtime.register_plugin(plugin).await.unwrap();
        assert_eq!(runtime.registered_plugins(), ["needs-key"]);

        let plugin = Plugin::new("broken", "other").with_init(Arc::new(FailingInit {
            message: "database exploded",
        }));
        let err = runtime
            .register_plugin(plugin)
            .await
            .expect_err("hard failure");
        assert!(matches!(err, KernelError::Plugin(PluginError::Init { .. })));
        // A failed registration releases its name reservation.
        assert_eq!(runtime.registered_plugins(), ["needs-key"]);
    }

    #[tokio::test]
    async fn unknown_send_target_errors() {
        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let err = runtime
            .send_message_to_target(
                &SendTarget::source("discord"),
                &Content::from_text("hello"),
            )
            .await
            .expect_err("no handler");
        assert!(matches!(
            err,
            KernelError::Service(ServiceError::UnknownSendTarget { .. })
        ));
    }

    #[tokio::test]
    async fn control_messages_reach_typed_subscribers() {
        use std::sync::Mutex;

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runtime.register_event(
            CONTROL_MESSAGE,
            Arc::new(move |payload: &Value| -> KernelResult<()> {
                sink.lock().unwrap().push(payload.clone());
                Ok(())
            }),
        );

        let room_id = RoomId::random();
        runtime
            .send_control_message(room_id, ControlAction::DisableInput, None)
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["payload"]["action"], "disable_input");
    }

    #[test]
    fn working_memory_cap_resolves_from_settings() {
        let runtime = AgentRuntime::builder(character("runtime-test"))
            .setting("MAX_WORKING_MEMORY_ENTRIES", json!("7"))
            .build();
        assert_eq!(runtime.max_working_memory(), 7);

        let runtime = AgentRuntime::builder(character("runtime-test"))
            .max_working_memory(3)
            .build();
        assert_eq!(runtime.max_working_memory(), 3);

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        assert_eq!(runtime.max_working_memory(), DEFAULT_MAX_WORKING_MEMORY);
    }

    #[tokio::test]
    async fn task_workers_register_and_resolve() {
        struct EchoWorker;

        #[async_trait]
        impl TaskWorker for EchoWorker {
            fn name(&self) -> &str {
                "echo"
            }

            async fn execute(&self, _runtime: &AgentRuntime, _task: &Task) -> KernelResult<()> {
                Ok(())
            }
        }

        let runtime = AgentRuntime::builder(character("runtime-test")).build();
        runtime.register_task_worker(Arc::new(EchoWorker));
        assert!(runtime.get_task_worker("echo").is_some());
        assert!(runtime.get_task_worker("missing").is_none());
    }
}
