//! Command Handler Registry
//!
//! Maps wire command names (e.g. "delete") to executable Rust closures.
//! Every command a node answers is registered here explicitly at startup,
//! so the set of supported operations is visible in one place and an
//! unknown name is a typed fault rather than a protocol error.

use crate::error::Fault;

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous command handler function.
/// It takes the raw command payload and returns a Future resolving to the
/// response payload or a fault.
pub type CommandHandlerFn = Arc<
    dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Fault>> + Send>> + Send + Sync,
>;

/// Registry holding the mapping between command names and their handlers.
pub struct CommandRegistry {
    handlers: DashMap<String, CommandHandlerFn>,
}

impl CommandRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registers a handler under a command name, replacing any previous one.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, Fault>> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so handlers with
        // different bodies share one map.
        let handler_fn: CommandHandlerFn = Arc::new(move |payload: Vec<u8>| {
            Box::pin(handler(payload)) as Pin<Box<dyn Future<Output = Result<Vec<u8>, Fault>> + Send>>
        });

        self.handlers.insert(name.to_string(), handler_fn);

        tracing::info!("Registered command handler: {}", name);
    }

    /// Looks up a handler by name and runs it with the given payload.
    pub async fn dispatch(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        let handler_fn = match self.handlers.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::warn!("No handler registered for command '{}'", name);
                return Err(Fault::OperationNotSupported(name.to_string()));
            }
        };

        tracing::debug!(
            "Dispatching command '{}' (payload size: {} bytes)",
            name,
            payload.len()
        );

        handler_fn(payload).await
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Returns all registered command names.
    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
