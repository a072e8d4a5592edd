//! Explicit sink registration.
//!
//! The host registers its state object once it exists; the registry
//! holds exactly one reference and hands it to the relay on demand.

use std::sync::{Arc, RwLock};

use tracing::info;

use super::{SinkResolver, StateSink};

/// Holds the state sink the host registered, if any.
#[derive(Default)]
pub struct SinkRegistry {
    sink: RwLock<Option<Arc<dyn StateSink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the state sink.
    pub fn register(&self, sink: Arc<dyn StateSink>) {
        let replaced = self.sink.write().unwrap().replace(sink).is_some();
        info!(replaced, "state sink registered");
    }

    /// Drop the registered sink, e.g. when the host tears its state down.
    pub fn unregister(&self) -> Option<Arc<dyn StateSink>> {
        self.sink.write().unwrap().take()
    }

    pub fn is_registered(&self) -> bool {
        self.sink.read().unwrap().is_some()
    }
}

impl SinkResolver for SinkRegistry {
    fn resolve(&self) -> Option<Arc<dyn StateSink>> {
        self.sink.read().unwrap().clone()
    }
}
