//! Transformer pipeline backend.
//!
//! Wraps a [`Pipeline`] (tokenizer + causal LM, owned by an inference
//! runtime) with staged loading and key/value cache reuse across turns.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Backend, Outbox, StoppingCriteria, TokenRate};
use crate::error::BridgeError;
use crate::protocol::{ChatMessage, Reply};

/// Per-file loading progress reported by a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Initiate { file: String },
    Progress { file: String, progress: f64 },
    Done { file: String },
}

impl From<FileEvent> for Reply {
    fn from(event: FileEvent) -> Self {
        match event {
            FileEvent::Initiate { file } => Reply::Initiate { file },
            FileEvent::Progress { file, progress } => Reply::Progress { file, progress },
            FileEvent::Done { file } => Reply::Done { file },
        }
    }
}

/// Progress callback handed to [`Pipeline::load`].
pub type FileProgress<'a> = &'a (dyn Fn(FileEvent) + Send + Sync);

/// Output of one generation: the text and the cache to reuse next turn.
#[derive(Debug)]
pub struct Generation<C> {
    pub text: String,
    pub cache: C,
}

/// The model runtime behind a [`PipelineBackend`].
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Reusable generation state (past key/values).
    type Cache: Send + 'static;

    /// Check that the runtime can execute here (e.g. a GPU adapter exists).
    async fn probe(&self) -> Result<(), BridgeError>;

    /// Load tokenizer and weights, reporting per-file progress.
    async fn load(&self, progress: FileProgress<'_>) -> Result<(), BridgeError>;

    /// Run a one-token generation so first-request latency is paid now.
    async fn warm_up(&self) -> Result<(), BridgeError>;

    /// Generate a reply. `on_token` gets each decoded chunk as it is
    /// produced; `stop` is polled between tokens.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        cache: Option<Self::Cache>,
        stop: &StoppingCriteria,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<Generation<Self::Cache>, BridgeError>;
}

/// [`Backend`] over a local transformer pipeline.
pub struct PipelineBackend<P: Pipeline> {
    model: String,
    pipeline: P,
    load_lock: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
    cache: Mutex<Option<P::Cache>>,
    /// Bumped on every reset so late generations don't restore old cache.
    epoch: AtomicU64,
    stop: StoppingCriteria,
}

impl<P: Pipeline> PipelineBackend<P> {
    pub fn new(model: impl Into<String>, pipeline: P) -> Self {
        Self {
            model: model.into(),
            pipeline,
            load_lock: tokio::sync::Mutex::new(()),
            loaded: AtomicBool::new(false),
            cache: Mutex::new(None),
            epoch: AtomicU64::new(0),
            stop: StoppingCriteria::new(),
        }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Whether a generation cache is held for the next turn.
    pub fn has_cache(&self) -> bool {
        self.cache.lock().unwrap().is_some()
    }
}

#[async_trait]
impl<P: Pipeline> Backend for PipelineBackend<P> {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn check_capability(&self) -> Result<(), BridgeError> {
        self.pipeline.probe().await
    }

    async fn load(&self, outbox: &Outbox) -> Result<(), BridgeError> {
        let _guard = self.load_lock.lock().await;
        if self.is_loaded() {
            debug!(model = %self.model, "pipeline already loaded");
            return Ok(());
        }

        outbox.loading(format!("Loading {}...", self.model));
        let report = |event: FileEvent| outbox.send(event.into());
        self.pipeline.load(&report).await?;

        outbox.loading("Compiling shaders (90%)...");
        outbox.loading("Warming up (95%)...");
        self.pipeline.warm_up().await?;

        self.loaded.store(true, Ordering::SeqCst);
        info!(model = %self.model, "pipeline loaded");
        Ok(())
    }

    async fn generate(&self, messages: &[ChatMessage], outbox: &Outbox) -> Result<String, BridgeError> {
        if !self.is_loaded() {
            return Err(BridgeError::NotReady);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let cache = self.cache.lock().unwrap().take();

        let mut rate = TokenRate::new();
        let mut on_token = |chunk: &str| {
            rate.record_token();
            outbox.send(Reply::Update {
                output: chunk.to_string(),
                tps: rate.per_second(),
                num_tokens: rate.tokens(),
            });
        };

        let generation = self
            .pipeline
            .generate(messages, cache, &self.stop, &mut on_token)
            .await?;

        if self.epoch.load(Ordering::SeqCst) == epoch {
            *self.cache.lock().unwrap() = Some(generation.cache);
        } else {
            debug!("reset during generation, discarding its cache");
        }
        Ok(generation.text)
    }

    fn begin_generation(&self) {
        self.stop.reset();
    }

    fn interrupt(&self) {
        self.stop.interrupt();
    }

    async fn reset(&self) {
        self.stop.interrupt();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.lock().unwrap().take();
    }
}
