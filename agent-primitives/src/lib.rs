//! Core data types shared across the Conversa agent runtime.
//!
//! This crate defines the identifiers, persistent records, and the composed
//! turn state consumed by the kernel and by store adapters. It carries no
//! runtime behaviour of its own beyond validation and bookkeeping helpers.

#![warn(missing_docs, clippy::pedantic)]

mod character;
mod content;
mod error;
mod ids;
mod records;
mod state;

pub use character::{Agent, Character, CharacterBuilder};
pub use content::{Content, Memory, MemoryKind, MemoryMetadata};
pub use error::{Error, Result};
pub use ids::{AgentId, EntityId, MemoryId, RoomId, RunId, WorldId};
pub use records::{
    Component, Entity, Participant, ParticipantUserState, Relationship, Room, RoomType, Task, World,
};
pub use state::{
    ActionPlan, ActionResult, PlanStep, ProviderOutput, State, StateData, StepStatus,
    WorkingMemory, WorkingMemoryEntry,
};

/// Returns the current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
