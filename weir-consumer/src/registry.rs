//! Handler registry.
//!
//! Maps topics to their processing handlers, resolved once at startup into
//! a fixed table. Applications consuming several topics register one
//! handler per topic and spawn one engine per topic with the resolved
//! handler.

use std::collections::HashMap;
use std::sync::Arc;
use weir_core::{Error, MessageHandler, Result};

/// Fixed topic-to-handler table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic.
    ///
    /// # Errors
    /// Returns an error if the topic already has a handler; registration
    /// happens once at startup, never at runtime.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(Error::configuration(format!(
                "handler already registered for topic '{topic}'"
            )));
        }
        self.handlers.insert(topic, handler);
        Ok(())
    }

    /// Resolve the handler for a topic.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(topic).cloned()
    }

    /// Registered topics.
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
