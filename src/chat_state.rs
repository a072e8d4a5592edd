//! Reference state sink: the chat widget's state.
//!
//! [`ChatState`] keeps the transcript and loading indicators a chat UI
//! renders, and answers every relay method. The terminal front end wraps
//! it; embedders can register it directly.

use std::sync::Mutex;

use anyhow::Result;
use tracing::debug;

use crate::consts::READY_NOTICE;
use crate::protocol::{ChatMessage, Role};
use crate::relay::{RelayEvent, SinkMethod, StateSink};

pub const GREETING: &str =
    "Hi! I'm Gemma, your Heartyculture Plant Whisperer. How can I help you with your garden today?";

/// Starter questions offered in an empty chat.
pub const EXAMPLE_QUESTIONS: [&str; 3] = [
    "How do I care for my snake plant?",
    "What are some low-light indoor plants?",
    "How often should I water my cactus?",
];

/// A point-in-time copy of the chat state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    /// A request is out and no output has streamed yet.
    pub is_loading: bool,
    pub loading_progress: String,
    pub loading_percent: u8,
    pub model_loaded: bool,
    pub model_loading: bool,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            messages: vec![ChatMessage::assistant(GREETING)],
            is_loading: false,
            loading_progress: String::new(),
            loading_percent: 0,
            model_loaded: false,
            model_loading: false,
        }
    }
}

/// Outcome of [`ChatState::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Blank input; nothing to send.
    Empty,
    /// The model is not loaded yet.
    NotLoaded,
    /// Recorded in the transcript; send this text.
    Accepted(String),
}

#[derive(Debug, Default)]
pub struct ChatState {
    inner: Mutex<ChatSnapshot>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.lock().unwrap().clone()
    }

    /// Mark the model as loading. Returns false if a load is already under
    /// way or done.
    pub fn begin_load(&self) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.model_loading || state.model_loaded {
            return false;
        }
        state.model_loading = true;
        state.loading_progress = "Initializing...".to_string();
        true
    }

    /// Record a user message for sending.
    pub fn submit(&self, input: &str) -> Submission {
        let text = input.trim();
        if text.is_empty() {
            return Submission::Empty;
        }
        let mut state = self.inner.lock().unwrap();
        if !state.model_loaded {
            return Submission::NotLoaded;
        }
        state.messages.push(ChatMessage::user(text));
        state.is_loading = true;
        Submission::Accepted(text.to_string())
    }

    /// Back to just the greeting. Loading state is kept.
    pub fn clear(&self) {
        self.inner.lock().unwrap().messages = vec![ChatMessage::assistant(GREETING)];
    }

    pub fn on_progress(&self, text: &str) {
        let mut state = self.inner.lock().unwrap();
        state.loading_progress = text.to_string();
        if let Some(percent) = first_percent(text) {
            state.loading_percent = percent;
        }
    }

    /// Append a streamed chunk to the assistant's reply.
    pub fn on_update(&self, chunk: &str) {
        let mut state = self.inner.lock().unwrap();
        match assistant_tail(&mut state.messages) {
            Some(last) => last.content.push_str(chunk),
            None => state.messages.push(ChatMessage::assistant(chunk)),
        }
        // streaming has started; drop the thinking indicator
        state.is_loading = false;
    }

    /// Replace the assistant's reply with the final text.
    pub fn on_complete(&self, text: &str) {
        let mut state = self.inner.lock().unwrap();
        match assistant_tail(&mut state.messages) {
            Some(last) => last.content = text.to_string(),
            None => state.messages.push(ChatMessage::assistant(text)),
        }
        state.is_loading = false;
    }

    pub fn on_loaded(&self) {
        debug!("chat state: model loaded");
        let mut state = self.inner.lock().unwrap();
        state.model_loaded = true;
        state.model_loading = false;
        state.loading_progress = READY_NOTICE.to_string();
        state.loading_percent = 100;
    }
}

impl StateSink for ChatState {
    fn methods(&self) -> &[SinkMethod] {
        &SinkMethod::ALL
    }

    fn deliver(&self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Progress(text) => self.on_progress(&text),
            RelayEvent::Loaded => self.on_loaded(),
            RelayEvent::Update(chunk) => self.on_update(&chunk),
            RelayEvent::Complete(text) => self.on_complete(&text),
        }
        Ok(())
    }
}

fn assistant_tail(messages: &mut [ChatMessage]) -> Option<&mut ChatMessage> {
    messages.last_mut().filter(|m| m.role == Role::Assistant)
}

/// The number in the first `N%` of `text`, capped at 100.
pub fn first_percent(text: &str) -> Option<u8> {
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let start = bytes[..i]
            .iter()
            .rposition(|c| !c.is_ascii_digit())
            .map_or(0, |p| p + 1);
        if start < i {
            let value: u32 = text[start..i].parse().unwrap_or(u32::MAX);
            return Some(value.min(100) as u8);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> ChatState {
        let state = ChatState::new();
        state.on_loaded();
        state
    }

    #[test]
    fn starts_with_greeting() {
        let snapshot = ChatState::new().snapshot();
        assert_eq!(snapshot.messages, vec![ChatMessage::assistant(GREETING)]);
        assert!(!snapshot.model_loaded);
    }

    #[test]
    fn percent_extraction() {
        assert_eq!(first_percent("Downloading: 40%"), Some(40));
        assert_eq!(first_percent("Compiling shaders (90%)..."), Some(90));
        assert_eq!(first_percent("100% of 2 files, 50% done"), Some(100));
        assert_eq!(first_percent("Loading gemma..."), None);
        assert_eq!(first_percent("% only"), None);
        assert_eq!(first_percent("9999%"), Some(100));
    }

    #[test]
    fn progress_keeps_last_percent_for_plain_text() {
        let state = ChatState::new();
        state.on_progress("Downloading: 30%");
        state.on_progress("Loading gemma...");
        let snapshot = state.snapshot();
        assert_eq!(snapshot.loading_progress, "Loading gemma...");
        assert_eq!(snapshot.loading_percent, 30);
    }

    #[test]
    fn ready_text_alone_does_not_mark_loaded() {
        let state = ChatState::new();
        state.on_progress(READY_NOTICE);
        assert!(!state.snapshot().model_loaded);
    }

    #[test]
    fn loaded_sets_full_progress() {
        let state = ChatState::new();
        assert!(state.begin_load());
        assert!(!state.begin_load());
        state.on_loaded();
        let snapshot = state.snapshot();
        assert!(snapshot.model_loaded);
        assert!(!snapshot.model_loading);
        assert_eq!(snapshot.loading_percent, 100);
        assert!(!state.begin_load());
    }

    #[test]
    fn submit_requires_text_and_model() {
        let state = ChatState::new();
        assert_eq!(state.submit("   "), Submission::Empty);
        assert_eq!(state.submit("hello"), Submission::NotLoaded);

        state.on_loaded();
        assert_eq!(state.submit(" hello "), Submission::Accepted("hello".into()));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.last(), Some(&ChatMessage::user("hello")));
        assert!(snapshot.is_loading);
    }

    #[test]
    fn streamed_chunks_build_one_reply() {
        let state = loaded();
        state.submit("water?");
        state.on_update("Twice ");
        state.on_update("a week.");

        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.messages[2], ChatMessage::assistant("Twice a week."));
        assert!(!snapshot.is_loading);
    }

    #[test]
    fn completion_replaces_streamed_text() {
        let state = loaded();
        state.submit("water?");
        state.on_update("Twi");
        state.on_complete("Twice a week.");

        let messages = state.snapshot().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "Twice a week.");
    }

    #[test]
    fn completion_without_updates_appends() {
        let state = loaded();
        state.submit("hi");
        state.on_complete("Gemma is still preparing... Wait a moment.");
        let messages = state.snapshot().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, GREETING);
    }

    #[test]
    fn clear_restores_greeting_only() {
        let state = loaded();
        state.submit("hi");
        state.on_complete("hello");
        state.clear();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages, vec![ChatMessage::assistant(GREETING)]);
        assert!(snapshot.model_loaded);
    }

    #[test]
    fn sink_dispatches_every_method() {
        let state = ChatState::new();
        state.deliver(RelayEvent::Progress("Downloading: 20%".into())).unwrap();
        state.deliver(RelayEvent::Loaded).unwrap();
        state.deliver(RelayEvent::Update("Hi".into())).unwrap();
        state.deliver(RelayEvent::Complete("Hi there".into())).unwrap();

        let snapshot = state.snapshot();
        assert!(snapshot.model_loaded);
        assert_eq!(snapshot.messages.last().unwrap().content, "Hi there");
        assert!(SinkMethod::ALL.iter().all(|m| state.exposes(*m)));
    }
}
