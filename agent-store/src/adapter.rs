//! The store adapter trait and its query types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_primitives::{
    Agent, AgentId, Component, Entity, EntityId, Memory, MemoryId, Participant,
    ParticipantUserState, Relationship, Room, RoomId, Task, World, WorldId, now_millis,
};

use crate::StoreResult;

/// Filter for [`StoreAdapter::get_memories`].
#[derive(Clone, Debug, Default)]
pub struct MemoryQuery {
    /// Table to read from (e.g. `"messages"`).
    pub table: String,
    /// Restrict to a room.
    pub room_id: Option<RoomId>,
    /// Restrict to a world.
    pub world_id: Option<WorldId>,
    /// Restrict to an author entity.
    pub entity_id: Option<EntityId>,
    /// Maximum number of records, newest first.
    pub count: Option<usize>,
    /// Only records flagged unique.
    pub unique: bool,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub end: Option<i64>,
}

impl MemoryQuery {
    /// Creates a query over the supplied table.
    #[must_use]
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Restricts the query to a room.
    #[must_use]
    pub fn in_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// Caps the number of returned records.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// Similarity search over embedded memories.
#[derive(Clone, Debug)]
pub struct SearchQuery {
    /// Table to search.
    pub table: String,
    /// Query embedding.
    pub embedding: Vec<f32>,
    /// Minimum cosine similarity for a match.
    pub match_threshold: f32,
    /// Maximum number of matches.
    pub count: Option<usize>,
    /// Restrict to a room.
    pub room_id: Option<RoomId>,
    /// Restrict to a world.
    pub world_id: Option<WorldId>,
    /// Only records flagged unique.
    pub unique: bool,
}

impl SearchQuery {
    /// Creates a search over the supplied table and embedding.
    #[must_use]
    pub fn new(table: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            table: table.into(),
            embedding,
            match_threshold: 0.0,
            count: None,
            room_id: None,
            world_id: None,
            unique: false,
        }
    }
}

/// A structured audit log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Record identifier.
    pub id: MemoryId,
    /// Entity the log is attributed to.
    pub entity_id: EntityId,
    /// Room scope of the log.
    pub room_id: RoomId,
    /// Log discriminator (e.g. `"action"`, `"useModel:TEXT_LARGE"`).
    #[serde(rename = "type")]
    pub log_type: String,
    /// Structured payload.
    pub body: Value,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

impl LogEntry {
    /// Creates a log entry of the supplied type.
    #[must_use]
    pub fn new(
        entity_id: EntityId,
        room_id: RoomId,
        log_type: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            id: MemoryId::random(),
            entity_id,
            room_id,
            log_type: log_type.into(),
            body,
            created_at: now_millis(),
        }
    }
}

/// Filter for [`StoreAdapter::get_logs`].
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Restrict to an entity.
    pub entity_id: Option<EntityId>,
    /// Restrict to a room.
    pub room_id: Option<RoomId>,
    /// Restrict to a log type.
    pub log_type: Option<String>,
    /// Maximum number of records, newest first.
    pub count: Option<usize>,
}

/// Filter for [`StoreAdapter::get_tasks`].
#[derive(Clone, Debug, Default)]
pub struct TaskQuery {
    /// Restrict to a room.
    pub room_id: Option<RoomId>,
    /// Require all of these tags.
    pub tags: Vec<String>,
    /// Restrict to a worker name.
    pub name: Option<String>,
}

/// Abstract persistence consumed by the kernel.
///
/// Backends own all persistent records; the kernel holds only a shared
/// reference to the adapter. Every operation may fail with a
/// [`StoreError`](crate::StoreError); uniqueness violations surface as
/// [`StoreError::Duplicate`](crate::StoreError::Duplicate) so the kernel can
/// decide whether they are recoverable.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    // -- lifecycle ---------------------------------------------------------

    /// Initialises the backend (connections, schema).
    async fn init(&self) -> StoreResult<()>;

    /// Closes the backend and releases its resources.
    async fn close(&self) -> StoreResult<()>;

    /// Returns `true` once [`init`](Self::init) has completed successfully.
    async fn is_ready(&self) -> bool;

    /// Applies plugin-provided schema migrations.
    async fn run_migrations(&self, schemas: &[Value]) -> StoreResult<()> {
        let _ = schemas;
        Ok(())
    }

    // -- agents ------------------------------------------------------------

    /// Returns the agent stored under `id`.
    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>>;

    /// Returns all stored agents.
    async fn get_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Persists a new agent record.
    async fn create_agent(&self, agent: &Agent) -> StoreResult<bool>;

    /// Updates an existing agent record.
    async fn update_agent(&self, agent: &Agent) -> StoreResult<bool>;

    /// Deletes the agent stored under `id`.
    async fn delete_agent(&self, id: AgentId) -> StoreResult<bool>;

    // -- entities ----------------------------------------------------------

    /// Returns the entities stored under `ids`.
    async fn get_entities_by_ids(&self, ids: &[EntityId]) -> StoreResult<Vec<Entity>>;

    /// Returns every entity participating in `room_id`.
    async fn get_entities_for_room(
        &self,
        room_id: RoomId,
        include_components: bool,
    ) -> StoreResult<Vec<Entity>>;

    /// Persists the supplied entities.
    ///
    /// Fails with a duplicate-key error when an entity id already exists.
    async fn create_entities(&self, entities: &[Entity]) -> StoreResult<bool>;

    /// Updates an existing entity.
    async fn update_entity(&self, entity: &Entity) -> StoreResult<()>;

    // -- components --------------------------------------------------------

    /// Returns one component of `component_type` attached to `entity_id`.
    async fn get_component(
        &self,
        entity_id: EntityId,
        component_type: &str,
    ) -> StoreResult<Option<Component>>;

    /// Returns all components attached to `entity_id`.
    async fn get_components(&self, entity_id: EntityId) -> StoreResult<Vec<Component>>;

    /// Persists a component.
    async fn create_component(&self, component: &Component) -> StoreResult<bool>;

    /// Updates an existing component.
    async fn update_component(&self, component: &Component) -> StoreResult<()>;

    /// Deletes the component stored under `id`.
    async fn delete_component(&self, id: MemoryId) -> StoreResult<()>;

    // -- worlds ------------------------------------------------------------

    /// Persists a world and returns its id.
    async fn create_world(&self, world: &World) -> StoreResult<WorldId>;

    /// Returns the world stored under `id`.
    async fn get_world(&self, id: WorldId) -> StoreResult<Option<World>>;

    /// Updates an existing world.
    async fn update_world(&self, world: &World) -> StoreResult<()>;

    /// Deletes the world stored under `id`.
    async fn remove_world(&self, id: WorldId) -> StoreResult<()>;

    /// Returns every stored world.
    async fn get_all_worlds(&self) -> StoreResult<Vec<World>>;

    // -- rooms -------------------------------------------------------------

    /// Persists the supplied rooms and returns their ids.
    async fn create_rooms(&self, rooms: &[Room]) -> StoreResult<Vec<RoomId>>;

    /// Returns the rooms stored under `ids`.
    async fn get_rooms_by_ids(&self, ids: &[RoomId]) -> StoreResult<Vec<Room>>;

    /// Returns every room inside `world_id`.
    async fn get_rooms_by_world(&self, world_id: WorldId) -> StoreResult<Vec<Room>>;

    /// Updates an existing room.
    async fn update_room(&self, room: &Room) -> StoreResult<()>;

    /// Deletes the room stored under `id`.
    async fn delete_room(&self, id: RoomId) -> StoreResult<()>;

    /// Deletes every room inside `world_id`.
    async fn delete_rooms_by_world_id(&self, world_id: WorldId) -> StoreResult<()>;

    // -- participants ------------------------------------------------------

    /// Adds the supplied entities as participants of `room_id`.
    async fn add_participants_room(
        &self,
        entity_ids: &[EntityId],
        room_id: RoomId,
    ) -> StoreResult<bool>;

    /// Removes `entity_id` from `room_id`.
    async fn remove_participant(&self, entity_id: EntityId, room_id: RoomId)
    -> StoreResult<bool>;

    /// Returns the entity ids participating in `room_id`.
    async fn get_participants_for_room(&self, room_id: RoomId) -> StoreResult<Vec<EntityId>>;

    /// Returns every participation record for `entity_id`.
    async fn get_participants_for_entity(
        &self,
        entity_id: EntityId,
    ) -> StoreResult<Vec<Participant>>;

    /// Returns the rooms `entity_id` participates in.
    async fn get_rooms_for_participant(&self, entity_id: EntityId) -> StoreResult<Vec<RoomId>>;

    /// Returns the union of rooms any of `entity_ids` participates in.
    async fn get_rooms_for_participants(
        &self,
        entity_ids: &[EntityId],
    ) -> StoreResult<Vec<RoomId>>;

    /// Returns the attention state of `entity_id` toward `room_id`.
    async fn get_participant_user_state(
        &self,
        room_id: RoomId,
        entity_id: EntityId,
    ) -> StoreResult<Option<ParticipantUserState>>;

    /// Sets (or clears) the attention state of `entity_id` toward `room_id`.
    async fn set_participant_user_state(
        &self,
        room_id: RoomId,
        entity_id: EntityId,
        state: Option<ParticipantUserState>,
    ) -> StoreResult<()>;

    // -- memories ----------------------------------------------------------

    /// Persists a memory into `table` and returns its id.
    ///
    /// When `unique` is set, backends should reject near-duplicates with a
    /// duplicate-key error.
    async fn create_memory(
        &self,
        memory: &Memory,
        table: &str,
        unique: bool,
    ) -> StoreResult<MemoryId>;

    /// Returns the memory stored under `id`.
    async fn get_memory_by_id(&self, id: MemoryId) -> StoreResult<Option<Memory>>;

    /// Returns the memories stored under `ids`.
    async fn get_memories_by_ids(&self, ids: &[MemoryId]) -> StoreResult<Vec<Memory>>;

    /// Returns memories matching `query`, newest first.
    async fn get_memories(&self, query: &MemoryQuery) -> StoreResult<Vec<Memory>>;

    /// Returns memories from any of `room_ids`, newest first.
    async fn get_memories_by_room_ids(
        &self,
        table: &str,
        room_ids: &[RoomId],
        limit: Option<usize>,
    ) -> StoreResult<Vec<Memory>>;

    /// Returns memories scoped to `world_id`, newest first.
    async fn get_memories_by_world_id(
        &self,
        table: &str,
        world_id: WorldId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Memory>>;

    /// Returns memories ranked by embedding similarity.
    async fn search_memories(&self, query: &SearchQuery) -> StoreResult<Vec<Memory>>;

    /// Updates an existing memory.
    async fn update_memory(&self, memory: &Memory) -> StoreResult<bool>;

    /// Deletes the memory stored under `id`.
    async fn delete_memory(&self, id: MemoryId) -> StoreResult<()>;

    /// Deletes the memories stored under `ids`.
    async fn delete_many_memories(&self, ids: &[MemoryId]) -> StoreResult<()>;

    /// Deletes every memory in `room_id` within `table`.
    async fn delete_all_memories(&self, room_id: RoomId, table: &str) -> StoreResult<()>;

    /// Counts memories in `room_id` within `table`.
    async fn count_memories(
        &self,
        room_id: RoomId,
        unique: bool,
        table: &str,
    ) -> StoreResult<usize>;

    /// Returns a previously computed embedding for identical content.
    async fn get_cached_embedding(&self, text: &str) -> StoreResult<Option<Vec<f32>>>;

    /// Declares the embedding dimension used by subsequent writes.
    async fn ensure_embedding_dimension(&self, dimension: usize) -> StoreResult<()>;

    // -- relationships -----------------------------------------------------

    /// Persists a relationship edge.
    async fn create_relationship(&self, relationship: &Relationship) -> StoreResult<bool>;

    /// Updates an existing relationship edge.
    async fn update_relationship(&self, relationship: &Relationship) -> StoreResult<()>;

    /// Returns the edge from `source` to `target`, when present.
    async fn get_relationship(
        &self,
        source: EntityId,
        target: EntityId,
    ) -> StoreResult<Option<Relationship>>;

    /// Returns every edge touching `entity_id`, optionally filtered by tags.
    async fn get_relationships(
        &self,
        entity_id: EntityId,
        tags: &[String],
    ) -> StoreResult<Vec<Relationship>>;

    // -- tasks -------------------------------------------------------------

    /// Persists a task and returns its id.
    async fn create_task(&self, task: &Task) -> StoreResult<MemoryId>;

    /// Returns tasks matching `query`.
    async fn get_tasks(&self, query: &TaskQuery) -> StoreResult<Vec<Task>>;

    /// Returns the task stored under `id`.
    async fn get_task(&self, id: MemoryId) -> StoreResult<Option<Task>>;

    /// Returns every task dispatched to `name`.
    async fn get_tasks_by_name(&self, name: &str) -> StoreResult<Vec<Task>>;

    /// Updates an existing task.
    async fn update_task(&self, task: &Task) -> StoreResult<()>;

    /// Deletes the task stored under `id`.
    async fn delete_task(&self, id: MemoryId) -> StoreResult<()>;

    // -- cache -------------------------------------------------------------

    /// Returns the cached value stored under `key`.
    async fn get_cache(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Stores `value` under `key`.
    async fn set_cache(&self, key: &str, value: Value) -> StoreResult<bool>;

    /// Deletes the cached value stored under `key`.
    async fn delete_cache(&self, key: &str) -> StoreResult<bool>;

    // -- logs --------------------------------------------------------------

    /// Appends a structured log record.
    async fn log(&self, entry: &LogEntry) -> StoreResult<()>;

    /// Returns log records matching `query`, newest first.
    async fn get_logs(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>>;

    /// Deletes the log record stored under `id`.
    async fn delete_log(&self, id: MemoryId) -> StoreResult<()>;
}
