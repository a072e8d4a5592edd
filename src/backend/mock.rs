use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::StoppingCriteria;
use super::pipeline::{FileEvent, FileProgress, Generation, Pipeline};
use crate::error::BridgeError;
use crate::protocol::ChatMessage;

/// Number of turns the scripted model has "seen" through its cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedCache {
    pub turns: usize,
}

/// A scripted pipeline for tests and offline demos. Replies are returned
/// in order (cycling), streamed word by word.
pub struct ScriptedPipeline {
    replies: Vec<String>,
    next: AtomicUsize,
    files: Vec<String>,
    supported: bool,
    load_error: Option<String>,
    token_delay: Duration,
    loads: AtomicUsize,
    warm_ups: AtomicUsize,
    turns_seen: Mutex<Vec<usize>>,
}

impl ScriptedPipeline {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            next: AtomicUsize::new(0),
            files: vec!["tokenizer.json".to_string(), "model.safetensors".to_string()],
            supported: true,
            load_error: None,
            token_delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            warm_ups: AtomicUsize::new(0),
            turns_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_files(mut self, files: Vec<&str>) -> Self {
        self.files = files.into_iter().map(String::from).collect();
        self
    }

    /// Pause between streamed tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Make the capability probe fail.
    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Make loading fail with the given message.
    pub fn failing_load(mut self, message: &str) -> Self {
        self.load_error = Some(message.to_string());
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn warm_up_count(&self) -> usize {
        self.warm_ups.load(Ordering::SeqCst)
    }

    /// Cache depth passed into each generation, in call order.
    pub fn cache_turns_seen(&self) -> Vec<usize> {
        self.turns_seen.lock().unwrap().clone()
    }

    fn next_reply(&self) -> String {
        if self.replies.is_empty() {
            return String::new();
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        self.replies[i % self.replies.len()].clone()
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    type Cache = ScriptedCache;

    async fn probe(&self) -> Result<(), BridgeError> {
        if self.supported {
            Ok(())
        } else {
            Err(BridgeError::CapabilityUnavailable(
                "no GPU adapter found".to_string(),
            ))
        }
    }

    async fn load(&self, progress: FileProgress<'_>) -> Result<(), BridgeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.load_error {
            return Err(BridgeError::BackendFault(message.clone()));
        }
        for file in &self.files {
            progress(FileEvent::Initiate { file: file.clone() });
            for step in (0..=100).step_by(5) {
                progress(FileEvent::Progress {
                    file: file.clone(),
                    progress: f64::from(step),
                });
                tokio::task::yield_now().await;
            }
            progress(FileEvent::Done { file: file.clone() });
        }
        Ok(())
    }

    async fn warm_up(&self) -> Result<(), BridgeError> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        cache: Option<ScriptedCache>,
        stop: &StoppingCriteria,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<Generation<ScriptedCache>, BridgeError> {
        let turns = cache.map(|c| c.turns).unwrap_or(0);
        self.turns_seen.lock().unwrap().push(turns);

        let reply = self.next_reply();
        let mut text = String::new();
        for token in reply.split_inclusive(' ') {
            if self.token_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.token_delay).await;
            }
            if stop.is_interrupted() {
                break;
            }
            on_token(token);
            text.push_str(token);
        }

        Ok(Generation {
            text,
            cache: ScriptedCache { turns: turns + 1 },
        })
    }
}
