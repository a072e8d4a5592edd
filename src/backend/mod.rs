//! Interchangeable inference backends.
//!
//! Each backend runs behind the [`worker`](crate::worker) and reports
//! loading and generation progress by posting protocol [`Reply`]s to an
//! [`Outbox`]. The worker adds the lifecycle framing (`ready_to_load`,
//! `ready`, `start`, `complete`, `error`) around these calls.

pub mod engine;
pub mod fetch;
pub mod gemma;
pub mod mock;
pub mod pipeline;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::protocol::{ChatMessage, Reply};

/// Where a backend posts its replies. Sending never blocks or fails;
/// replies to a session that went away are dropped.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Reply>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Reply>) -> Self {
        Self { tx }
    }

    /// An outbox plus the receiving end, for tests and custom drivers.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, reply: Reply) {
        let _ = self.tx.send(reply);
    }

    pub fn loading(&self, text: impl Into<String>) {
        self.send(Reply::Loading { data: text.into() });
    }
}

/// The capability set every inference backend provides.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend identifier, e.g. `"engine"`.
    fn name(&self) -> &str;

    /// Model this backend serves.
    fn model(&self) -> &str;

    /// Probe for required hardware or service.
    async fn check_capability(&self) -> Result<(), BridgeError>;

    /// Fetch, load and warm up the model. Loading twice is a no-op.
    async fn load(&self, outbox: &Outbox) -> Result<(), BridgeError>;

    /// Stream a reply as [`Reply::Update`]s and return the full text.
    /// An interrupted generation returns what it produced so far.
    async fn generate(&self, messages: &[ChatMessage], outbox: &Outbox) -> Result<String, BridgeError>;

    /// Clear a stale stop request. Called before each generation is
    /// started, so an interrupt that arrives before it runs still counts.
    fn begin_generation(&self);

    /// Stop the in-flight generation, if any.
    fn interrupt(&self);

    /// Stop the in-flight generation and drop reusable generation cache.
    /// The loaded model stays loaded.
    async fn reset(&self);
}

/// Shared stop flag checked between tokens.
#[derive(Debug, Clone, Default)]
pub struct StoppingCriteria {
    stop: Arc<AtomicBool>,
}

impl StoppingCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Generation speed measured from the first completed token.
#[derive(Debug, Clone, Default)]
pub struct TokenRate {
    first_token: Option<Instant>,
    tokens: u64,
}

impl TokenRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_token(&mut self) {
        self.first_token.get_or_insert_with(Instant::now);
        self.tokens += 1;
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Tokens per second as of now.
    pub fn per_second(&self) -> f64 {
        self.per_second_at(Instant::now())
    }

    /// Tokens per second as of `now`; zero until a token has completed.
    pub fn per_second_at(&self, now: Instant) -> f64 {
        match self.first_token {
            Some(start) => tokens_per_second(self.tokens, now.saturating_duration_since(start)),
            None => 0.0,
        }
    }
}

/// `tokens / elapsed_ms * 1000`, or zero when nothing can be measured.
pub fn tokens_per_second(tokens: u64, elapsed: Duration) -> f64 {
    let millis = elapsed.as_secs_f64() * 1000.0;
    if tokens == 0 || millis <= 0.0 {
        return 0.0;
    }
    tokens as f64 * 1000.0 / millis
}

/// Coalesces fractional download progress into 10-point steps.
///
/// Only multiples of 10 (100 included) pass, each at most once and in
/// increasing order, which bounds relay traffic per file to 11 events.
#[derive(Debug, Clone, Default)]
pub struct ProgressFilter {
    last: Option<u8>,
}

impl ProgressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the percentage to relay, if this update crosses a step.
    pub fn accept(&mut self, progress: f64) -> Option<u8> {
        if !progress.is_finite() {
            return None;
        }
        let percent = progress.round().clamp(0.0, 100.0) as u8;
        if percent % 10 != 0 && percent != 100 {
            return None;
        }
        if self.last.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_zero_before_first_token() {
        let rate = TokenRate::new();
        assert_eq!(rate.per_second(), 0.0);
        assert_eq!(rate.tokens(), 0);
    }

    #[test]
    fn rate_is_positive_after_tokens() {
        let mut rate = TokenRate::new();
        rate.record_token();
        rate.record_token();
        let later = Instant::now() + Duration::from_millis(500);
        let tps = rate.per_second_at(later);
        assert!(tps.is_finite());
        assert!(tps > 0.0);
        // at most 2 tokens in at least 500ms
        assert!(tps <= 4.0 + f64::EPSILON);
    }

    #[test]
    fn tokens_per_second_formula() {
        assert_eq!(tokens_per_second(10, Duration::from_millis(500)), 20.0);
        assert_eq!(tokens_per_second(0, Duration::from_secs(1)), 0.0);
        assert_eq!(tokens_per_second(5, Duration::ZERO), 0.0);
    }

    #[test]
    fn filter_passes_only_ten_point_steps() {
        let mut filter = ProgressFilter::new();
        let relayed: Vec<u8> = [0.0, 3.2, 9.6, 10.4, 15.0, 19.5, 20.0, 55.0, 99.6]
            .into_iter()
            .filter_map(|p| filter.accept(p))
            .collect();
        // 9.6 rounds to 10, 10.4 rounds to 10 again, 19.5 rounds to 20
        assert_eq!(relayed, vec![0, 10, 20, 100]);
    }

    #[test]
    fn filter_output_is_monotonic_for_any_input() {
        let inputs = [50.0, 10.0, 70.0, 69.9, 30.0, 100.0, 90.0, f64::NAN, 120.0, -4.0];
        let mut filter = ProgressFilter::new();
        let relayed: Vec<u8> = inputs.into_iter().filter_map(|p| filter.accept(p)).collect();
        assert_eq!(relayed, vec![50, 70, 100]);
        assert!(relayed.windows(2).all(|w| w[0] <= w[1]));
        assert!(relayed.iter().all(|p| p % 10 == 0));
    }

    #[test]
    fn stopping_criteria_round_trip() {
        let stop = StoppingCriteria::new();
        let shared = stop.clone();
        assert!(!stop.is_interrupted());
        shared.interrupt();
        assert!(stop.is_interrupted());
        stop.reset();
        assert!(!shared.is_interrupted());
    }

    #[tokio::test]
    async fn outbox_survives_dropped_receiver() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        outbox.loading("still fine");
    }
}
