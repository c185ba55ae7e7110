//! Service lifecycle registry and outbound send handlers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use agent_primitives::{Content, EntityId, RoomId};

use crate::{AgentRuntime, KernelResult};

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the service registry and send handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A service definition declared no service type.
    #[error("service `{service}` declares no service type")]
    MissingType {
        /// Service name as registered.
        service: String,
    },
    /// No send handler is registered for the target source.
    #[error("no send handler registered for source `{target_source}`")]
    UnknownSendTarget {
        /// The unmatched source.
        target_source: String,
    },
    /// A service failed to start.
    #[error("service `{service}` failed to start: {reason}")]
    Start {
        /// Service name as registered.
        service: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A running service instance started from a [`ServiceDefinition`].
#[async_trait]
pub trait Service: Send + Sync {
    /// Stops the service and releases its resources.
    async fn stop(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Returns the instance as [`Any`] so callers can downcast to the
    /// concrete service type.
    fn as_any(&self) -> &dyn Any;
}

/// Factory describing how to start a service and what it handles.
#[async_trait]
pub trait ServiceDefinition: Send + Sync {
    /// Service type key this definition registers under.
    fn service_type(&self) -> &str;

    /// Service name, looked up case-insensitively. Defaults to the type.
    fn service_name(&self) -> &str {
        self.service_type()
    }

    /// Starts an instance against the supplied runtime.
    async fn start(&self, runtime: &AgentRuntime) -> KernelResult<Arc<dyn Service>>;

    /// Send handlers contributed by this service, keyed by message source.
    fn send_handlers(&self) -> Vec<(String, Arc<dyn SendHandler>)> {
        Vec::new()
    }
}

/// Destination of an outbound message.
#[derive(Clone, Debug)]
pub struct SendTarget {
    /// Source key selecting the send handler (e.g. `"discord"`).
    pub source: String,
    /// Destination room, when applicable.
    pub room_id: Option<RoomId>,
    /// Destination entity, when applicable.
    pub entity_id: Option<EntityId>,
    /// Destination channel on the external platform.
    pub channel_id: Option<String>,
}

impl SendTarget {
    /// Creates a target for the supplied source.
    #[must_use]
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            room_id: None,
            entity_id: None,
            channel_id: None,
        }
    }

    /// Sets the destination room.
    #[must_use]
    pub fn room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }
}

/// Handler delivering outbound content for one source.
#[async_trait]
pub trait SendHandler: Send + Sync {
    /// Delivers `content` to `target`.
    async fn send(
        &self,
        runtime: &AgentRuntime,
        target: &SendTarget,
        content: &Content,
    ) -> KernelResult<()>;
}

struct ServiceSlot {
    instances: Vec<Arc<dyn Service>>,
    definitions: Vec<Arc<dyn ServiceDefinition>>,
}

/// Registry of running services, addressable by type and by name.
#[derive(Default)]
pub struct ServiceRegistry {
    slots: RwLock<HashMap<String, ServiceSlot>>,
    by_name: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a started instance under its definition's type and name.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn insert(&self, definition: Arc<dyn ServiceDefinition>, instance: Arc<dyn Service>) {
        let service_type = definition.service_type().to_owned();
        let name = definition.service_name().to_lowercase();

        let mut slots = self.slots.write().expect("service registry poisoned");
        let slot = slots.entry(service_type).or_insert_with(|| ServiceSlot {
            instances: Vec::new(),
            definitions: Vec::new(),
        });
        slot.instances.push(Arc::clone(&instance));
        slot.definitions.push(definition);
        drop(slots);

        self.by_name
            .write()
            .expect("service registry poisoned")
            .insert(name, instance);
    }

    /// Looks a service up by name (case-insensitive), falling back to type.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        let by_name = self.by_name.read().expect("service registry poisoned");
        if let Some(instance) = by_name.get(&name.to_lowercase()) {
            return Some(Arc::clone(instance));
        }
        drop(by_name);
        self.first_of_type(name)
    }

    /// Returns the first instance registered under `service_type`.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn first_of_type(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        let slots = self.slots.read().expect("service registry poisoned");
        slots
            .get(service_type)
            .and_then(|slot| slot.instances.first().cloned())
    }

    /// Returns every instance registered under `service_type`.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn of_type(&self, service_type: &str) -> Vec<Arc<dyn Service>> {
        let slots = self.slots.read().expect("service registry poisoned");
        slots
            .get(service_type)
            .map(|slot| slot.instances.clone())
            .unwrap_or_default()
    }

    /// Returns `true` when at least one instance of `service_type` exists.
    #[must_use]
    pub fn has(&self, service_type: &str) -> bool {
        !self.of_type(service_type).is_empty()
    }

    /// Returns every registered service type.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let slots = self.slots.read().expect("service registry poisoned");
        slots.keys().cloned().collect()
    }

    /// Stops every instance, logging failures and continuing.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub async fn stop_all(&self) {
        let instances: Vec<(String, Arc<dyn Service>)> = {
            let slots = self.slots.read().expect("service registry poisoned");
            slots
                .iter()
                .flat_map(|(service_type, slot)| {
                    slot.instances
                        .iter()
                        .map(|i| (service_type.clone(), Arc::clone(i)))
                })
                .collect()
        };

        for (service_type, instance) in instances {
            if let Err(err) = instance.stop().await {
                warn!(service_type = %service_type, %err, "service failed to stop");
            }
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
