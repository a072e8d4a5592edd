//! Error taxonomy for the bridge, the worker and the backends.

use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong between a caller and an inference backend.
///
/// Backend-side failures normally travel as relay events or completion
/// text; only the call bridge hands these back to a caller.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Required hardware or service is missing. Terminal for the session's
    /// current load attempt.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The model has not finished loading.
    #[error("backend not ready")]
    NotReady,

    /// Runtime error reported by the backend during load or generation.
    #[error("backend fault: {0}")]
    BackendFault(String),

    /// No registered sink exposes the method the event needs.
    #[error("no relay target for {0}")]
    RelayTargetMissing(&'static str),

    /// Nothing was installed behind the bridge in time.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: &'static str },

    /// The bridge was shut down while a call was waiting.
    #[error("bridge shut down")]
    Cancelled,

    /// A newer request took over the pending callbacks.
    #[error("request superseded by a newer one")]
    Superseded,

    /// The background worker is no longer running.
    #[error("worker is gone")]
    WorkerGone,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// The bare message for errors that carry one, the full display otherwise.
    /// Used where a category prefix would be redundant, e.g. `Error: ...` notices.
    pub fn reason(&self) -> String {
        match self {
            BridgeError::CapabilityUnavailable(reason) | BridgeError::BackendFault(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}
