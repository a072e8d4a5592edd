//! One-way event relay from the backend side to the host's state sink.
//!
//! The sink is owned by the host and may be replaced at any time, so the
//! [`Relay`] asks its [`SinkResolver`] for the current sink on every
//! event instead of holding on to one.

pub mod locator;
pub mod registry;

pub use locator::{GlobalScope, Scope, ScopeLocator, ScopeValue};
pub use registry::SinkRegistry;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use rand::RngExt;
use tracing::{debug, error, warn};

use crate::error::BridgeError;

/// The method surface a state sink can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkMethod {
    Progress,
    Update,
    Complete,
    Loaded,
}

impl SinkMethod {
    pub const ALL: [SinkMethod; 4] = [
        SinkMethod::Progress,
        SinkMethod::Update,
        SinkMethod::Complete,
        SinkMethod::Loaded,
    ];

    /// Name of the handler on the host state object.
    pub fn name(self) -> &'static str {
        match self {
            SinkMethod::Progress => "on_gemma_progress",
            SinkMethod::Update => "on_gemma_update",
            SinkMethod::Complete => "on_gemma_complete",
            SinkMethod::Loaded => "on_gemma_loaded",
        }
    }
}

impl fmt::Display for SinkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fire-and-forget notification for the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Human-readable loading or status text.
    Progress(String),
    /// The model finished loading.
    Loaded,
    /// A chunk of generated text.
    Update(String),
    /// The full generated text.
    Complete(String),
}

impl RelayEvent {
    pub fn method(&self) -> SinkMethod {
        match self {
            RelayEvent::Progress(_) => SinkMethod::Progress,
            RelayEvent::Loaded => SinkMethod::Loaded,
            RelayEvent::Update(_) => SinkMethod::Update,
            RelayEvent::Complete(_) => SinkMethod::Complete,
        }
    }
}

/// The host's state object, as seen from the bridge.
pub trait StateSink: Send + Sync {
    /// Methods this sink answers to.
    fn methods(&self) -> &[SinkMethod];

    /// Deliver one event. Only called for methods listed in [`methods`](Self::methods).
    fn deliver(&self, event: RelayEvent) -> Result<()>;

    fn exposes(&self, method: SinkMethod) -> bool {
        self.methods().contains(&method)
    }
}

/// Finds the sink that should receive the next event.
pub trait SinkResolver: Send + Sync {
    fn resolve(&self) -> Option<Arc<dyn StateSink>>;
}

/// Delivers relay events to whatever sink the resolver currently yields.
#[derive(Clone)]
pub struct Relay {
    resolver: Arc<dyn SinkResolver>,
}

impl Relay {
    pub fn new(resolver: Arc<dyn SinkResolver>) -> Self {
        Self { resolver }
    }

    /// Deliver an event, reporting a missing target to the caller.
    pub fn try_emit(&self, event: RelayEvent) -> Result<(), BridgeError> {
        let method = event.method();
        let sink = self
            .resolver
            .resolve()
            .filter(|sink| sink.exposes(method))
            .ok_or(BridgeError::RelayTargetMissing(method.name()))?;

        debug!(%method, ?event, "relaying to state sink");
        if let Err(e) = sink.deliver(event) {
            // The sink's own failure stays on this side of the relay.
            error!(%method, "state sink rejected event: {e:#}");
        }
        Ok(())
    }

    /// Deliver an event; a missing target is logged and the event dropped.
    pub fn emit(&self, event: RelayEvent) {
        let progress = matches!(event, RelayEvent::Progress(_));
        let detail = format!("{event:?}");
        if let Err(e) = self.try_emit(event) {
            if progress {
                // Progress fires constantly while the host boots; sample it.
                let mut rng = rand::rng();
                if rng.random::<f64>() < 0.1 {
                    warn!("still waiting for a state sink: {e} ({detail})");
                }
            } else {
                warn!("dropping relay event: {e} ({detail})");
            }
        }
    }
}
