//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Default model served by the chat engine backend.
pub const DEFAULT_ENGINE_MODEL: &str = "gemma-2-2b-it-q4f16_1-MLC";

/// Default model for the transformer pipeline backend.
pub const DEFAULT_PIPELINE_MODEL: &str = "unsloth/gemma-3-270m-it";

/// OpenAI-compatible endpoint of a locally running chat engine.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/v1";

/// Catalog document fetched once for prompt enrichment.
pub const DEFAULT_CATALOG: &str = "assets/heartyculture_plants.json";

/// How often `load` re-checks for an installed handler.
pub const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often `ask` re-checks for an installed handler.
pub const ASK_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Upper bound on waiting for a handler to be installed.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress notice while `load` waits for the handler.
pub const LOAD_WAITING_NOTICE: &str = "Loading AI engine...";

/// Progress notice while `ask` waits for the handler.
pub const ASK_WAITING_NOTICE: &str = "Wait! Gemma is waking up...";

/// Completion text for requests that arrive before the model is loaded.
pub const NOT_READY_MESSAGE: &str = "Gemma is still preparing... Wait a moment.";

/// Progress text relayed once the model is ready.
pub const READY_NOTICE: &str = "Ready!";

/// Maximum catalog matches injected into a prompt.
pub const CONTEXT_LIMIT: usize = 5;

/// Only query words longer than this take part in catalog matching.
pub const MIN_KEYWORD_LEN: usize = 3;

/// Generation budget per request.
pub const MAX_NEW_TOKENS: u32 = 256;

/// Sampling temperature for generation.
pub const TEMPERATURE: f32 = 0.3;

/// Default database path: `~/.whisperer/whisperer.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".whisperer")
        .join("whisperer.db")
}

/// Default directory for downloaded model files.
pub fn default_model_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("whisperer")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_polls_slower_than_load() {
        assert!(ASK_POLL_INTERVAL > LOAD_POLL_INTERVAL);
    }

    #[test]
    fn install_timeout_covers_several_polls() {
        assert!(INSTALL_TIMEOUT > ASK_POLL_INTERVAL * 10);
    }

    #[test]
    fn db_path_ends_with_file_name() {
        let path = default_db_path();
        assert!(path.ends_with(".whisperer/whisperer.db"));
    }

    #[test]
    fn model_cache_dir_is_namespaced() {
        let dir = default_model_cache_dir();
        assert!(dir.ends_with("whisperer/models"));
    }
}
