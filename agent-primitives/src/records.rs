//! Persistent graph records: entities, worlds, rooms, and their sidecars.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AgentId, EntityId, MemoryId, RoomId, WorldId, now_millis};

/// An actor known to the runtime: the agent itself, a user, or a bot.
///
/// The owning agent has exactly one self-entity whose id equals the agent id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier.
    pub id: EntityId,
    /// Agent that owns this record.
    pub agent_id: AgentId,
    /// Known names, most canonical first.
    pub names: Vec<String>,
    /// Per-source metadata (e.g. platform user ids and handles).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Sidecar components attached to this entity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
}

impl Entity {
    /// Creates an entity with a single name and empty metadata.
    #[must_use]
    pub fn new(id: EntityId, agent_id: AgentId, name: impl Into<String>) -> Self {
        Self {
            id,
            agent_id,
            names: vec![name.into()],
            metadata: Map::new(),
            components: Vec::new(),
        }
    }
}

/// A server-level grouping of rooms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct World {
    /// World identifier.
    pub id: WorldId,
    /// Display name.
    pub name: String,
    /// Owning agent.
    pub agent_id: AgentId,
    /// External server identifier this world mirrors.
    pub server_id: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Kind of conversation a room represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomType {
    /// Direct message between two participants.
    Dm,
    /// Multi-participant group conversation.
    Group,
    /// The agent's private self-room.
    #[serde(rename = "SELF")]
    SelfRoom,
    /// Threaded sub-conversation.
    Thread,
    /// Broadcast channel.
    Channel,
    /// Programmatic API surface.
    Api,
}

/// A conversation surface inside a world.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// Display name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// World this room belongs to.
    pub world_id: WorldId,
    /// Originating platform (e.g. "discord", "api").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Conversation kind.
    pub room_type: RoomType,
    /// External channel identifier, when mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// External server identifier, when mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Attention state a participant holds toward a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantUserState {
    /// The participant follows the room and receives every message.
    Followed,
    /// The participant muted the room.
    Muted,
}

/// Membership of an entity in a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    /// Member entity.
    pub entity_id: EntityId,
    /// Room the entity participates in.
    pub room_id: RoomId,
    /// Optional attention state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_state: Option<ParticipantUserState>,
}

/// Directed edge between two entities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relationship {
    /// Edge identifier.
    pub id: MemoryId,
    /// Source entity.
    pub source_entity_id: EntityId,
    /// Target entity.
    pub target_entity_id: EntityId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Relationship labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Sidecar attribute record attached to an entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Component {
    /// Component identifier.
    pub id: MemoryId,
    /// Entity the component is attached to.
    pub entity_id: EntityId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Room scope, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// World scope, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<WorldId>,
    /// Entity that created the component.
    pub source_entity_id: EntityId,
    /// Component type label.
    pub component_type: String,
    /// Component payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A deferred job queued for a task worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: MemoryId,
    /// Worker name this task is dispatched to.
    pub name: String,
    /// Room scope, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// World scope, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<WorldId>,
    /// Scheduling and worker-specific payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Filter labels (e.g. "queue", "repeat").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
}

impl Task {
    /// Creates a task for the supplied worker name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: MemoryId::random(),
            name: name.into(),
            room_id: None,
            world_id: None,
            metadata: Map::new(),
            tags: Vec::new(),
            updated_at: now_millis(),
        }
    }
}
