//! Conversational agent runtime SDK facade.
//!
//! Depend on this crate via `cargo add conversa-agents`. It bundles the
//! internal runtime crates behind feature flags so downstream users can
//! enable or disable components as needed for their agents.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use agent_primitives as primitives;

/// Runtime kernel (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Persistence contract and reference adapter (enabled by `store` feature).
#[cfg(feature = "store")]
pub use agent_store as store;
