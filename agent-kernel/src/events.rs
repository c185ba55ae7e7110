//! Typed and untyped event channels.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::error;

use crate::{AgentRuntime, KernelResult};

/// Emitted when an inbound message enters the pipeline.
pub const MESSAGE_RECEIVED: &str = "MESSAGE_RECEIVED";
/// Emitted when the action engine starts a run.
pub const RUN_STARTED: &str = "RUN_STARTED";
/// Emitted when the action engine finishes a run.
pub const RUN_ENDED: &str = "RUN_ENDED";
/// Emitted before an action handler is dispatched.
pub const ACTION_STARTED: &str = "ACTION_STARTED";
/// Emitted after an action handler returns or fails.
pub const ACTION_COMPLETED: &str = "ACTION_COMPLETED";
/// Emitted by [`AgentRuntime::send_control_message`].
pub const CONTROL_MESSAGE: &str = "CONTROL_MESSAGE";

/// Handler subscribed to a typed event name.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one emission of the subscribed event.
    async fn handle(&self, runtime: &AgentRuntime, payload: &Value) -> KernelResult<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Send + Sync + Fn(&Value) -> KernelResult<()>,
{
    async fn handle(&self, _runtime: &AgentRuntime, payload: &Value) -> KernelResult<()> {
        (self)(payload)
    }
}

/// Token identifying an untyped handler registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

type UntypedHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Named multi-handler pub/sub with two channels.
///
/// The typed channel fans out async handlers concurrently per event name;
/// the untyped channel invokes synchronous handlers in registration order on
/// the caller's task. Within a single name, registration order is preserved
/// in iteration; across names no ordering is guaranteed.
#[derive(Default)]
pub struct EventBus {
    events: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    emitters: RwLock<HashMap<String, Vec<(HandlerToken, UntypedHandler)>>>,
    next_token: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a typed handler to `name`.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.events
            .write()
            .expect("event registry poisoned")
            .entry(name.into())
            .or_default()
            .push(handler);
    }

    /// Returns the typed handlers subscribed to `name`, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn handlers(&self, name: &str) -> Vec<Arc<dyn EventHandler>> {
        self.events
            .read()
            .expect("event registry poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Emits a typed event under each of `names`.
    ///
    /// Handlers for every name run concurrently; a handler failure is logged
    /// and does not abort its siblings.
    pub async fn emit_event(&self, runtime: &AgentRuntime, names: &[&str], payload: &Value) {
        let mut selected: Vec<(String, Arc<dyn EventHandler>)> = Vec::new();
        for name in names {
            for handler in self.handlers(name) {
                selected.push(((*name).to_owned(), handler));
            }
        }

        let results = join_all(selected.iter().map(|(name, handler)| async move {
            (name, handler.handle(runtime, payload).await)
        }))
        .await;

        for (name, result) in results {
            if let Err(err) = result {
                error!(event = %name, %err, "event handler failed");
            }
        }
    }

    /// Subscribes an untyped handler to `name`, returning its token.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn on(&self, name: impl Into<String>, handler: UntypedHandler) -> HandlerToken {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.emitters
            .write()
            .expect("emitter registry poisoned")
            .entry(name.into())
            .or_default()
            .push((token, handler));
        token
    }

    /// Removes the untyped handler registered under `token`.
    ///
    /// Returns `true` when a handler was removed.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn off(&self, name: &str, token: HandlerToken) -> bool {
        let mut emitters = self.emitters.write().expect("emitter registry poisoned");
        if let Some(handlers) = emitters.get_mut(name) {
            let before = handlers.len();
            handlers.retain(|(t, _)| *t != token);
            return handlers.len() < before;
        }
        false
    }

    /// Invokes the untyped handlers for `name` in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn emit(&self, name: &str, payload: &Value) {
        let handlers: Vec<UntypedHandler> = {
            let emitters = self.emitters.read().expect("emitter registry poisoned");
            emitters
                .get(name)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(payload);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.events.read().expect("event registry poisoned");
        let names: Vec<_> = events.keys().cloned().collect();
        f.debug_struct("EventBus").field("events", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use agent_primitives::Character;

    use crate::KernelError;

    fn runtime() -> AgentRuntime {
        AgentRuntime::builder(Character::builder("bus-test").build().unwrap()).build()
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _runtime: &AgentRuntime, _payload: &Value) -> KernelResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KernelError::config("handler failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn fan_out_runs_all_handlers_despite_failures() {
        let runtime = runtime();
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.register(
            "PING",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail: true,
            }),
        );
        bus.register(
            "PING",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );

        bus.emit_event(&runtime, &["PING"], &Value::Null).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emit_event_covers_every_name() {
        let runtime = runtime();
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["A", "B"] {
            bus.register(
                name,
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
            );
        }

        bus.emit_event(&runtime, &["A", "B"], &Value::Null).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn untyped_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.on(
                "tick",
                Arc::new(move |_payload: &Value| {
                    seen.lock().unwrap().push(label);
                }),
            );
        }

        bus.emit("tick", &Value::Null);
        assert_eq!(*seen.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn off_removes_only_the_token() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let keep = Arc::clone(&count);
        bus.on(
            "tick",
            Arc::new(move |_| {
                keep.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let drop_count = Arc::clone(&count);
        let token = bus.on(
            "tick",
            Arc::new(move |_| {
                drop_count.fetch_add(10, Ordering::SeqCst);
            }),
        );

        assert!(bus.off("tick", token));
        assert!(!bus.off("tick", token));

        bus.emit("tick", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
