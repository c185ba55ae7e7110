//! In-memory reference adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use agent_primitives::{
    Agent, AgentId, Component, Entity, EntityId, Memory, MemoryId, Participant,
    ParticipantUserState, Relationship, Room, RoomId, Task, World, WorldId,
};

use crate::adapter::{LogEntry, LogQuery, MemoryQuery, SearchQuery, StoreAdapter, TaskQuery};
use crate::{StoreError, StoreResult};

#[derive(Default)]
struct LocalInner {
    ready: bool,
    agents: HashMap<AgentId, Agent>,
    entities: HashMap<EntityId, Entity>,
    components: HashMap<MemoryId, Component>,
    worlds: HashMap<WorldId, World>,
    rooms: HashMap<RoomId, Room>,
    participants: Vec<Participant>,
    memories: HashMap<String, Vec<Memory>>,
    relationships: Vec<Relationship>,
    tasks: HashMap<MemoryId, Task>,
    cache: HashMap<String, Value>,
    logs: Vec<LogEntry>,
    embedding_dimension: Option<usize>,
}

/// Non-durable adapter keeping every record in process memory.
///
/// Suitable for tests, demos, and embedders that accept losing state on
/// restart. All operations are linear scans; the adapter is not intended
/// for large datasets.
#[derive(Default)]
pub struct LocalStore {
    inner: RwLock<LocalInner>,
}

impl LocalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the declared embedding dimension, when one was set.
    pub async fn embedding_dimension(&self) -> Option<usize> {
        self.inner.read().await.embedding_dimension
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn newest_first(memories: &mut [Memory]) {
    memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl StoreAdapter for LocalStore {
    async fn init(&self) -> StoreResult<()> {
        self.inner.write().await.ready = true;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.write().await.ready = false;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.inner.read().await.ready
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        Ok(self.inner.read().await.agents.get(&id).cloned())
    }

    async fn get_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.inner.read().await.agents.values().cloned().collect())
    }

    async fn create_agent(&self, agent: &Agent) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(&agent.id) {
            return Err(StoreError::duplicate(agent.id.to_string()));
        }
        inner.agents.insert(agent.id, agent.clone());
        Ok(true)
    }

    async fn update_agent(&self, agent: &Agent) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(&agent.id) {
            return Ok(false);
        }
        inner.agents.insert(agent.id, agent.clone());
        Ok(true)
    }

    async fn delete_agent(&self, id: AgentId) -> StoreResult<bool> {
        Ok(self.inner.write().await.agents.remove(&id).is_some())
    }

    async fn get_entities_by_ids(&self, ids: &[EntityId]) -> StoreResult<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect())
    }

    async fn get_entities_for_room(
        &self,
        room_id: RoomId,
        include_components: bool,
    ) -> StoreResult<Vec<Entity>> {
        let inner = self.inner.read().await;
        let mut entities: Vec<Entity> = inner
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .filter_map(|p| inner.entities.get(&p.entity_id).cloned())
            .collect();
        if include_components {
            for entity in &mut entities {
                entity.components = inner
                    .components
                    .values()
                    .filter(|c| c.entity_id == entity.id)
                    .cloned()
                    .collect();
            }
        }
        Ok(entities)
    }

    async fn create_entities(&self, entities: &[Entity]) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        for entity in entities {
            if inner.entities.contains_key(&entity.id) {
                return Err(StoreError::duplicate(entity.id.to_string()));
            }
        }
        for entity in entities {
            inner.entities.insert(entity.id, entity.clone());
        }
        Ok(true)
    }

    async fn update_entity(&self, entity: &Entity) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .entities
            .insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_component(
        &self,
        entity_id: EntityId,
        component_type: &str,
    ) -> StoreResult<Option<Component>> {
        let inner = self.inner.read().await;
        Ok(inner
            .components
            .values()
            .find(|c| c.entity_id == entity_id && c.component_type == component_type)
            .cloned())
    }

    async fn get_components(&self, entity_id: EntityId) -> StoreResult<Vec<Component>> {
        let inner = self.inner.read().await;
        Ok(inner
            .components
            .values()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn create_component(&self, component: &Component) -> StoreResult<bool> {
        self.inner
            .write()
            .await
            .components
            .insert(component.id, component.clone());
        Ok(true)
    }

    async fn update_component(&self, component: &Component) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .components
            .insert(component.id, component.clone());
        Ok(())
    }

    async fn delete_component(&self, id: MemoryId) -> StoreResult<()> {
        self.inner.write().await.components.remove(&id);
        Ok(())
    }

    async fn create_world(&self, world: &World) -> StoreResult<WorldId> {
        self.inner.write().await.worlds.insert(world.id, world.clone());
        Ok(world.id)
    }

    async fn get_world(&self, id: WorldId) -> StoreResult<Option<World>> {
        Ok(self.inner.read().await.worlds.get(&id).cloned())
    }

    async fn update_world(&self, world: &World) -> StoreResult<()> {
        self.inner.write().await.worlds.insert(world.id, world.clone());
        Ok(())
    }

    async fn remove_world(&self, id: WorldId) -> StoreResult<()> {
        self.inner.write().await.worlds.remove(&id);
        Ok(())
    }

    async fn get_all_worlds(&self) -> StoreResult<Vec<World>> {
        Ok(self.inner.read().await.worlds.values().cloned().collect())
    }

    async fn create_rooms(&self, rooms: &[Room]) -> StoreResult<Vec<RoomId>> {
        let mut inner = self.inner.write().await;
        let mut ids = Vec::with_capacity(rooms.len());
        for room in rooms {
            inner.rooms.insert(room.id, room.clone());
            ids.push(room.id);
        }
        Ok(ids)
    }

    async fn get_rooms_by_ids(&self, ids: &[RoomId]) -> StoreResult<Vec<Room>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.rooms.get(id).cloned())
            .collect())
    }

    async fn get_rooms_by_world(&self, world_id: WorldId) -> StoreResult<Vec<Room>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rooms
            .values()
            .filter(|r| r.world_id == world_id)
            .cloned()
            .collect())
    }

    async fn update_room(&self, room: &Room) -> StoreResult<()> {
        self.inner.write().await.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn delete_room(&self, id: RoomId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.rooms.remove(&id);
        inner.participants.retain(|p| p.room_id != id);
        Ok(())
    }

    async fn delete_rooms_by_world_id(&self, world_id: WorldId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<RoomId> = inner
            .rooms
            .values()
            .filter(|r| r.world_id == world_id)
            .map(|r| r.id)
            .collect();
        for id in doomed {
            inner.rooms.remove(&id);
            inner.participants.retain(|p| p.room_id != id);
        }
        Ok(())
    }

    async fn add_participants_room(
        &self,
        entity_ids: &[EntityId],
        room_id: RoomId,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        for entity_id in entity_ids {
            let exists = inner
                .participants
                .iter()
                .any(|p| p.entity_id == *entity_id && p.room_id == room_id);
            if !exists {
                inner.participants.push(Participant {
                    entity_id: *entity_id,
                    room_id,
                    user_state: None,
                });
            }
        }
        Ok(true)
    }

    async fn remove_participant(
        &self,
        entity_id: EntityId,
        room_id: RoomId,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.participants.len();
        inner
            .participants
            .retain(|p| !(p.entity_id == entity_id && p.room_id == room_id));
        Ok(inner.participants.len() < before)
    }

    async fn get_participants_for_room(&self, room_id: RoomId) -> StoreResult<Vec<EntityId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .map(|p| p.entity_id)
            .collect())
    }

    async fn get_participants_for_entity(
        &self,
        entity_id: EntityId,
    ) -> StoreResult<Vec<Participant>> {
        let inner = self.inner.read().await;
        Ok(inner
            .participants
            .iter()
            .filter(|p| p.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn get_rooms_for_participant(&self, entity_id: EntityId) -> StoreResult<Vec<RoomId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .participants
            .iter()
            .filter(|p| p.entity_id == entity_id)
            .map(|p| p.room_id)
            .collect())
    }

    async fn get_rooms_for_participants(
        &self,
        entity_ids: &[EntityId],
    ) -> StoreResult<Vec<RoomId>> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<RoomId> = inner
            .participants
            .iter()
            .filter(|p| entity_ids.contains(&p.entity_id))
            .map(|p| p.room_id)
            .collect();
        rooms.sort();
        rooms.dedup();
        Ok(rooms)
    }

    async fn get_participant_user_state(
        &self,
        room_id: RoomId,
        entity_id: EntityId,
    ) -> StoreResult<Option<ParticipantUserState>> {
        let inner = self.inner.read().await;
        Ok(inner
            .participants
            .iter()
            .find(|p| p.entity_id == entity_id && p.room_id == room_id)
            .and_then(|p| p.user_state))
    }

    async fn set_participant_user_state(
        &self,
        room_id: RoomId,
        entity_id: EntityId,
        state: Option<ParticipantUserState>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(participant) = inner
            .participants
            .iter_mut()
            .find(|p| p.entity_id == entity_id && p.room_id == room_id)
        {
            participant.user_state = state;
            Ok(())
        } else {
            Err(StoreError::Missing {
                what: "participant",
            })
        }
    }

    async fn create_memory(
        &self,
        memory: &Memory,
        table: &str,
        unique: bool,
    ) -> StoreResult<MemoryId> {
        let mut inner = self.inner.write().await;
        if let (Some(dimension), Some(embedding)) =
            (inner.embedding_dimension, memory.embedding.as_ref())
            && embedding.len() != dimension
        {
            return Err(StoreError::backend(format!(
                "embedding dimension mismatch: expected {dimension}, got {}",
                embedding.len()
            )));
        }
        let rows = inner.memories.entry(table.to_owned()).or_default();
        if unique
            && let Some(text) = memory.content.text.as_deref()
            && rows
                .iter()
                .any(|m| m.room_id == memory.room_id && m.content.text.as_deref() == Some(text))
        {
            debug!(table, room_id = %memory.room_id, "duplicate unique memory rejected");
            return Err(StoreError::duplicate(memory.id.to_string()));
        }
        let mut memory = memory.clone();
        memory.unique = unique || memory.unique;
        let id = memory.id;
        rows.push(memory);
        Ok(id)
    }

    async fn get_memory_by_id(&self, id: MemoryId) -> StoreResult<Option<Memory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memories
            .values()
            .flatten()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn get_memories_by_ids(&self, ids: &[MemoryId]) -> StoreResult<Vec<Memory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memories
            .values()
            .flatten()
            .filter(|m| ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn get_memories(&self, query: &MemoryQuery) -> StoreResult<Vec<Memory>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Memory> = inner
            .memories
            .get(&query.table)
            .into_iter()
            .flatten()
            .filter(|m| query.room_id.is_none_or(|room| m.room_id == room))
            .filter(|m| query.world_id.is_none_or(|world| m.world_id == Some(world)))
            .filter(|m| query.entity_id.is_none_or(|entity| m.entity_id == entity))
            .filter(|m| !query.unique || m.unique)
            .filter(|m| query.start.is_none_or(|start| m.created_at >= start))
            .filter(|m| query.end.is_none_or(|end| m.created_at <= end))
            .cloned()
            .collect();
        newest_first(&mut rows);
        if let Some(count) = query.count {
            rows.truncate(count);
        }
        Ok(rows)
    }

    async fn get_memories_by_room_ids(
        &self,
        table: &str,
        room_ids: &[RoomId],
        limit: Option<usize>,
    ) -> StoreResult<Vec<Memory>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Memory> = inner
            .memories
            .get(table)
            .into_iter()
            .flatten()
            .filter(|m| room_ids.contains(&m.room_id))
            .cloned()
            .collect();
        newest_first(&mut rows);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get_memories_by_world_id(
        &self,
        table: &str,
        world_id: WorldId,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Memory>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Memory> = inner
            .memories
            .get(table)
            .into_iter()
            .flatten()
            .filter(|m| m.world_id == Some(world_id))
            .cloned()
            .collect();
        newest_first(&mut rows);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn search_memories(&self, query: &SearchQuery) -> StoreResult<Vec<Memory>> {
        let inner = self.inner.read().await;
        let mut scored: Vec<(f32, Memory)> = inner
            .memories
            .get(&query.table)
            .into_iter()
            .flatten()
            .filter(|m| query.room_id.is_none_or(|room| m.room_id == room))
            .filter(|m| query.world_id.is_none_or(|world| m.world_id == Some(world)))
            .filter(|m| !query.unique || m.unique)
            .filter_map(|m| {
                let embedding = m.embedding.as_ref()?;
                let score = cosine_similarity(&query.embedding, embedding);
                (score >= query.match_threshold).then(|| (score, m.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(count) = query.count {
            scored.truncate(count);
        }
        Ok(scored.into_iter().map(|(_, m)| m).collect())
    }

    async fn update_memory(&self, memory: &Memory) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        for rows in inner.memories.values_mut() {
            if let Some(slot) = rows.iter_mut().find(|m| m.id == memory.id) {
                *slot = memory.clone();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_memory(&self, id: MemoryId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for rows in inner.memories.values_mut() {
            rows.retain(|m| m.id != id);
        }
        Ok(())
    }

    async fn delete_many_memories(&self, ids: &[MemoryId]) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for rows in inner.memories.values_mut() {
            rows.retain(|m| !ids.contains(&m.id));
        }
        Ok(())
    }

    async fn delete_all_memories(&self, room_id: RoomId, table: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(rows) = inner.memories.get_mut(table) {
            rows.retain(|m| m.room_id != room_id);
        }
        Ok(())
    }

    async fn count_memories(
        &self,
        room_id: RoomId,
        unique: bool,
        table: &str,
    ) -> StoreResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .memories
            .get(table)
            .into_iter()
            .flatten()
            .filter(|m| m.room_id == room_id)
            .filter(|m| !unique || m.unique)
            .count())
    }

    async fn get_cached_embedding(&self, text: &str) -> StoreResult<Option<Vec<f32>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memories
            .values()
            .flatten()
            .find(|m| m.content.text.as_deref() == Some(text) && m.embedding.is_some())
            .and_then(|m| m.embedding.clone()))
    }

    async fn ensure_embedding_dimension(&self, dimension: usize) -> StoreResult<()> {
        self.inner.write().await.embedding_dimension = Some(dimension);
        Ok(())
    }

    async fn create_relationship(&self, relationship: &Relationship) -> StoreResult<bool> {
        self.inner
            .write()
            .await
            .relationships
            .push(relationship.clone());
        Ok(true)
    }

    async fn update_relationship(&self, relationship: &Relationship) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(slot) = inner
            .relationships
            .iter_mut()
            .find(|r| r.id == relationship.id)
        {
            *slot = relationship.clone();
        }
        Ok(())
    }

    async fn get_relationship(
        &self,
        source: EntityId,
        target: EntityId,
    ) -> StoreResult<Option<Relationship>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relationships
            .iter()
            .find(|r| r.source_entity_id == source && r.target_entity_id == target)
            .cloned())
    }

    async fn get_relationships(
        &self,
        entity_id: EntityId,
        tags: &[String],
    ) -> StoreResult<Vec<Relationship>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relationships
            .iter()
            .filter(|r| r.source_entity_id == entity_id || r.target_entity_id == entity_id)
            .filter(|r| tags.iter().all(|tag| r.tags.contains(tag)))
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: &Task) -> StoreResult<MemoryId> {
        self.inner.write().await.tasks.insert(task.id, task.clone());
        Ok(task.id)
    }

    async fn get_tasks(&self, query: &TaskQuery) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| query.room_id.is_none_or(|room| t.room_id == Some(room)))
            .filter(|t| query.name.as_deref().is_none_or(|name| t.name == name))
            .filter(|t| query.tags.iter().all(|tag| t.tags.contains(tag)))
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: MemoryId) -> StoreResult<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn get_tasks_by_name(&self, name: &str) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.name == name)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        self.inner.write().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: MemoryId) -> StoreResult<()> {
        self.inner.write().await.tasks.remove(&id);
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.inner.read().await.cache.get(key).cloned())
    }

    async fn set_cache(&self, key: &str, value: Value) -> StoreResult<bool> {
        self.inner.write().await.cache.insert(key.to_owned(), value);
        Ok(true)
    }

    async fn delete_cache(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.write().await.cache.remove(key).is_some())
    }

    async fn log(&self, entry: &LogEntry) -> StoreResult<()> {
        self.inner.write().await.logs.push(entry.clone());
        Ok(())
    }

    async fn get_logs(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|l| query.entity_id.is_none_or(|entity| l.entity_id == entity))
            .filter(|l| query.room_id.is_none_or(|room| l.room_id == room))
            .filter(|l| {
                query
                    .log_type
                    .as_deref()
                    .is_none_or(|log_type| l.log_type == log_type)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(count) = query.count {
            rows.truncate(count);
        }
        Ok(rows)
    }

    async fn delete_log(&self, id: MemoryId) -> StoreResult<()> {
        self.inner.write().await.logs.retain(|l| l.id != id);
        Ok(())
    }
}
