//! Gemma 3 on candle: the runtime behind `--backend pipeline`.
//!
//! Model files come from a Hugging Face repository through a
//! [`ModelFetcher`]; tokenizing uses `tokenizers` and the forward pass runs
//! on candle (CUDA or Metal when available, CPU otherwise). The model is
//! driven on a blocking thread and its chunks are streamed back over a
//! channel.
//!
//! The model holds its key/value cache internally. The [`GemmaCache`]
//! handed back after each generation records which tokens that cache
//! covers, so the next prompt only feeds its new suffix when it extends
//! the previous conversation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::gemma3::{Config, Model};
use rand::RngExt;
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::StoppingCriteria;
use super::fetch::{ModelFetcher, ModelFile};
use super::pipeline::{FileProgress, Generation, Pipeline};
use crate::consts::{MAX_NEW_TOKENS, TEMPERATURE};
use crate::error::BridgeError;
use crate::protocol::{ChatMessage, Role};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Tokens that end a model turn.
const STOP_TOKENS: [&str; 2] = ["<end_of_turn>", "<eos>"];

/// Layers per sliding-window group when `config.json` leaves it out.
const DEFAULT_SLIDING_WINDOW_PATTERN: u64 = 6;

/// Token ids whose keys and values the model currently holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GemmaCache {
    pub tokens: Vec<u32>,
}

/// [`Pipeline`] over a Gemma 3 checkpoint in safetensors format.
pub struct GemmaPipeline {
    fetcher: ModelFetcher,
    device: Mutex<Option<Device>>,
    runtime: Arc<Mutex<Option<Runtime>>>,
}

impl GemmaPipeline {
    /// Pipeline whose files come from `fetcher`, typically
    /// [`ModelFetcher::hugging_face`].
    pub fn new(fetcher: ModelFetcher) -> Self {
        Self {
            fetcher,
            device: Mutex::new(None),
            runtime: Arc::new(Mutex::new(None)),
        }
    }

    /// Files fetched before the model is built, in download order.
    pub fn files() -> Vec<ModelFile> {
        [CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE]
            .into_iter()
            .map(ModelFile::new)
            .collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime.lock().unwrap().is_some()
    }

    fn device(&self) -> Result<Device, BridgeError> {
        let mut slot = self.device.lock().unwrap();
        if let Some(device) = slot.as_ref() {
            return Ok(device.clone());
        }
        let device = select_device()
            .map_err(|e| BridgeError::CapabilityUnavailable(format!("no usable compute device: {e}")))?;
        *slot = Some(device.clone());
        Ok(device)
    }

    /// Run `f` against the loaded runtime on a blocking thread.
    async fn with_runtime<T, F>(&self, f: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Runtime) -> Result<T, BridgeError> + Send + 'static,
    {
        let runtime = self.runtime.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = runtime.lock().unwrap();
            let runtime = guard.as_mut().ok_or(BridgeError::NotReady)?;
            f(runtime)
        })
        .await
        .map_err(|e| BridgeError::BackendFault(format!("inference task failed: {e}")))?
    }
}

#[async_trait]
impl Pipeline for GemmaPipeline {
    type Cache = GemmaCache;

    async fn probe(&self) -> Result<(), BridgeError> {
        let device = self.device()?;
        if device.is_cpu() {
            warn!("no GPU found, running the pipeline on the CPU");
        }
        info!(device = ?device, "compute device selected");
        Ok(())
    }

    async fn load(&self, progress: FileProgress<'_>) -> Result<(), BridgeError> {
        if self.is_loaded() {
            return Ok(());
        }
        self.fetcher.fetch_all(&Self::files(), progress).await?;

        let paths = ModelPaths {
            config: self.fetcher.path_for(&ModelFile::new(CONFIG_FILE)),
            tokenizer: self.fetcher.path_for(&ModelFile::new(TOKENIZER_FILE)),
            weights: self.fetcher.path_for(&ModelFile::new(WEIGHTS_FILE)),
        };
        let device = self.device()?;
        let runtime = tokio::task::spawn_blocking(move || Runtime::load(&paths, device))
            .await
            .map_err(|e| BridgeError::BackendFault(format!("model load task failed: {e}")))??;

        *self.runtime.lock().unwrap() = Some(runtime);
        Ok(())
    }

    async fn warm_up(&self) -> Result<(), BridgeError> {
        self.with_runtime(Runtime::warm_up).await
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        cache: Option<GemmaCache>,
        stop: &StoppingCriteria,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<Generation<GemmaCache>, BridgeError> {
        let prompt = format_prompt(messages);
        let stop = stop.clone();
        let (tx, mut chunks) = mpsc::unbounded_channel::<String>();
        let seed = rand::rng().random::<u64>();

        let runtime = self.runtime.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = runtime.lock().unwrap();
            let runtime = guard.as_mut().ok_or(BridgeError::NotReady)?;
            runtime.generate(&prompt, cache, &stop, seed, |chunk| {
                let _ = tx.send(chunk);
            })
        });

        let mut text = String::new();
        while let Some(chunk) = chunks.recv().await {
            on_token(&chunk);
            text.push_str(&chunk);
        }
        let cache = task
            .await
            .map_err(|e| BridgeError::BackendFault(format!("inference task failed: {e}")))??;
        Ok(Generation { text, cache })
    }
}

struct ModelPaths {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// Loaded model state. Only touched from blocking threads.
struct Runtime {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    stop_tokens: Vec<u32>,
}

impl Runtime {
    fn load(paths: &ModelPaths, device: Device) -> Result<Self, BridgeError> {
        let config = parse_config(&std::fs::read(&paths.config)?)?;
        let tokenizer = Tokenizer::from_file(&paths.tokenizer)
            .map_err(|e| BridgeError::BackendFault(format!("failed to read tokenizer: {e}")))?;

        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        // SAFETY: the weights file is owned by our model cache and is not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&paths.weights], dtype, &device) }
            .map_err(runtime_fault)?;
        let model = Model::new(false, &config, vb).map_err(runtime_fault)?;

        let stop_tokens = STOP_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        info!(layers = config.num_hidden_layers, ?dtype, "gemma weights loaded");
        Ok(Self {
            model,
            tokenizer,
            device,
            stop_tokens,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, BridgeError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| BridgeError::BackendFault(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, BridgeError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| BridgeError::BackendFault(format!("detokenization failed: {e}")))
    }

    /// Logits for the last position after feeding `ids` at `offset`.
    fn forward(&mut self, ids: &[u32], offset: usize) -> candle_core::Result<Tensor> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, offset)?;
        logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)
    }

    fn warm_up(&mut self) -> Result<(), BridgeError> {
        let ids = self.encode(&format_prompt(&[ChatMessage::user("a")]))?;
        self.model.clear_kv_cache();
        self.forward(&ids, 0).map_err(runtime_fault)?;
        self.model.clear_kv_cache();
        debug!("gemma warm-up pass done");
        Ok(())
    }

    fn generate(
        &mut self,
        prompt: &str,
        cache: Option<GemmaCache>,
        stop: &StoppingCriteria,
        seed: u64,
        mut emit: impl FnMut(String),
    ) -> Result<GemmaCache, BridgeError> {
        let prompt_ids = self.encode(prompt)?;
        let reused = cache.map_or(0, |c| reusable_prefix(&c.tokens, &prompt_ids));
        if reused == 0 {
            self.model.clear_kv_cache();
        }
        debug!(prompt = prompt_ids.len(), reused, "gemma prefill");

        let mut sampler = LogitsProcessor::new(seed, Some(f64::from(TEMPERATURE)), None);
        let mut fed = prompt_ids[..reused].to_vec();
        let mut input = prompt_ids[reused..].to_vec();
        let mut generated = Vec::new();
        let mut printed = 0;

        for _ in 0..MAX_NEW_TOKENS {
            if stop.is_interrupted() {
                debug!("generation interrupted");
                break;
            }
            let logits = self.forward(&input, fed.len()).map_err(runtime_fault)?;
            fed.extend_from_slice(&input);

            let next = sampler.sample(&logits).map_err(runtime_fault)?;
            if self.stop_tokens.contains(&next) {
                break;
            }
            generated.push(next);

            let text = self.decode(&generated)?;
            if let Some(chunk) = new_text(&text, printed) {
                emit(chunk.to_string());
                printed = text.len();
            }
            input = vec![next];
        }

        Ok(GemmaCache { tokens: fed })
    }
}

fn runtime_fault(e: candle_core::Error) -> BridgeError {
    BridgeError::BackendFault(e.to_string())
}

fn select_device() -> candle_core::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        return Device::new_cuda(0);
    }
    if candle_core::utils::metal_is_available() {
        return Device::new_metal(0);
    }
    Ok(Device::Cpu)
}

/// Parse `config.json`, filling in fields newer checkpoints express differently.
fn parse_config(bytes: &[u8]) -> Result<Config, BridgeError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("sliding_window_pattern")
            .or_insert_with(|| DEFAULT_SLIDING_WINDOW_PATTERN.into());
    }
    Ok(serde_json::from_value(value)?)
}

/// Render a conversation with Gemma's turn markers. Gemma has no system
/// role, so the system prompt opens the first user turn.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::from("<bos>");
    let mut system = None;
    for message in messages {
        match message.role {
            Role::System => system = Some(message.content.as_str()),
            Role::User => {
                prompt.push_str("<start_of_turn>user\n");
                if let Some(system) = system.take() {
                    prompt.push_str(system);
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&message.content);
                prompt.push_str("<end_of_turn>\n");
            }
            Role::Assistant => {
                prompt.push_str("<start_of_turn>model\n");
                prompt.push_str(&message.content);
                prompt.push_str("<end_of_turn>\n");
            }
        }
    }
    prompt.push_str("<start_of_turn>model\n");
    prompt
}

/// How many leading prompt tokens the cache already covers. The cache is
/// only usable when it is a strict prefix of the new prompt.
fn reusable_prefix(cached: &[u32], prompt: &[u32]) -> usize {
    if !cached.is_empty() && cached.len() < prompt.len() && prompt.starts_with(cached) {
        cached.len()
    } else {
        0
    }
}

/// Text decoded since `printed` bytes were emitted, unless the tail is
/// still an incomplete character.
fn new_text(decoded: &str, printed: usize) -> Option<&str> {
    if decoded.ends_with('\u{fffd}') {
        return None;
    }
    decoded.get(printed..).filter(|chunk| !chunk.is_empty())
}
