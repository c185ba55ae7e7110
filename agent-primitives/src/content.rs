//! Memory records and their content envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AgentId, EntityId, MemoryId, RoomId, RunId, WorldId, now_millis};

/// Message body stored inside a [`Memory`].
///
/// Only the fields the kernel inspects are typed; everything else rides in
/// `extra` and round-trips untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Content {
    /// Message text, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Action names the response declares, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    /// Reasoning attached to the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Originating surface (e.g. "discord", "action", "auto").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Remaining content fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    /// Creates content holding only text.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Sets the declared action list.
    #[must_use]
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the thought field.
    #[must_use]
    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    /// Sets the source field.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Classification of a memory record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemoryKind {
    /// A conversational message.
    Message,
    /// The recorded outcome of an executed action step.
    ActionResult,
    /// An extracted fact.
    Fact,
    /// An ingested document.
    Document,
    /// Implementer-defined classification.
    Custom(String),
}

impl MemoryKind {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "MESSAGE",
            Self::ActionResult => "ACTION_RESULT",
            Self::Fact => "FACT",
            Self::Document => "DOCUMENT",
            Self::Custom(label) => label,
        }
    }
}

impl From<String> for MemoryKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "MESSAGE" => Self::Message,
            "ACTION_RESULT" => Self::ActionResult,
            "FACT" => Self::Fact,
            "DOCUMENT" => Self::Document,
            _ => Self::Custom(value),
        }
    }
}

impl From<MemoryKind> for String {
    fn from(value: MemoryKind) -> Self {
        value.as_str().to_owned()
    }
}

/// Metadata describing how a memory was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Record classification.
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    /// Action that produced the record, for action results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    /// Run the record belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Identifier of the specific action invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<MemoryId>,
    /// Total planned steps, for multi-action turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    /// Step position at the time of recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    /// Error message, for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remaining metadata, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryMetadata {
    /// Creates metadata for the supplied kind with no attribution.
    #[must_use]
    pub fn of_kind(kind: MemoryKind) -> Self {
        Self {
            kind,
            action_name: None,
            run_id: None,
            action_id: None,
            total_steps: None,
            current_step: None,
            error: None,
            extra: Map::new(),
        }
    }
}

/// A durable message or record owned by the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Memory {
    /// Record identifier.
    pub id: MemoryId,
    /// Author entity.
    pub entity_id: EntityId,
    /// Owning agent, when attributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Room the record belongs to.
    pub room_id: RoomId,
    /// World scope, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<WorldId>,
    /// Message body.
    pub content: Content,
    /// Optional embedding vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Whether the store should reject near-duplicates.
    #[serde(default)]
    pub unique: bool,
    /// Provenance metadata.
    pub metadata: MemoryMetadata,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

impl Memory {
    /// Creates a message memory in the supplied room.
    #[must_use]
    pub fn message(entity_id: EntityId, room_id: RoomId, content: Content) -> Self {
        Self {
            id: MemoryId::random(),
            entity_id,
            agent_id: None,
            room_id,
            world_id: None,
            content,
            embedding: None,
            unique: false,
            metadata: MemoryMetadata::of_kind(MemoryKind::Message),
            created_at: now_millis(),
        }
    }

    /// Sets the owning agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Replaces the metadata block.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MemoryMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
