//! Terminal front end for the relay.
//!
//! [`TerminalSink`] keeps a [`ChatState`] up to date, prints streamed
//! chunks to stdout as they arrive and publishes progress text on a watch
//! channel that a [`Spinner`](crate::spinner::Spinner) can follow.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tokio::sync::watch;

use crate::chat_state::ChatState;
use crate::consts::READY_NOTICE;
use crate::relay::{RelayEvent, SinkMethod, StateSink};

pub struct TerminalSink {
    chat: Arc<ChatState>,
    progress: watch::Sender<String>,
    /// Whether any chunk of the current reply has been printed.
    streamed: AtomicBool,
    echo: bool,
}

impl TerminalSink {
    pub fn new(chat: Arc<ChatState>) -> Self {
        let (progress, _) = watch::channel(String::new());
        Self {
            chat,
            progress,
            streamed: AtomicBool::new(false),
            echo: true,
        }
    }

    /// Keep state without printing anything.
    pub fn quiet(chat: Arc<ChatState>) -> Self {
        Self {
            echo: false,
            ..Self::new(chat)
        }
    }

    pub fn chat(&self) -> &ChatState {
        &self.chat
    }

    /// Latest progress text, for a spinner label.
    pub fn progress(&self) -> watch::Receiver<String> {
        self.progress.subscribe()
    }

    fn print(&self, text: &str) {
        if self.echo {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }
}

impl StateSink for TerminalSink {
    fn methods(&self) -> &[SinkMethod] {
        &SinkMethod::ALL
    }

    fn deliver(&self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Progress(text) => {
                self.chat.on_progress(&text);
                self.progress.send_replace(text);
            }
            RelayEvent::Loaded => {
                self.chat.on_loaded();
                self.progress.send_replace(READY_NOTICE.to_string());
            }
            RelayEvent::Update(chunk) => {
                self.streamed.store(true, Ordering::SeqCst);
                self.print(&chunk);
                self.chat.on_update(&chunk);
            }
            RelayEvent::Complete(text) => {
                // chunks already on screen; otherwise show the whole reply
                if !self.streamed.swap(false, Ordering::SeqCst) {
                    self.print(&text);
                }
                self.print("\n");
                self.chat.on_complete(&text);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_published_and_recorded() {
        let sink = TerminalSink::quiet(Arc::new(ChatState::new()));
        let mut rx = sink.progress();
        sink.deliver(RelayEvent::Progress("Downloading: 40%".into())).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), "Downloading: 40%");
        assert_eq!(sink.chat().snapshot().loading_percent, 40);
    }

    #[test]
    fn loaded_marks_chat_ready() {
        let sink = TerminalSink::quiet(Arc::new(ChatState::new()));
        let rx = sink.progress();
        sink.deliver(RelayEvent::Loaded).unwrap();
        assert!(sink.chat().snapshot().model_loaded);
        assert_eq!(*rx.borrow(), READY_NOTICE);
    }

    #[test]
    fn streamed_flag_resets_after_completion() {
        let sink = TerminalSink::quiet(Arc::new(ChatState::new()));
        sink.deliver(RelayEvent::Update("Water ".into())).unwrap();
        assert!(sink.streamed.load(Ordering::SeqCst));
        sink.deliver(RelayEvent::Complete("Water weekly.".into())).unwrap();
        assert!(!sink.streamed.load(Ordering::SeqCst));
        assert_eq!(
            sink.chat().snapshot().messages.last().unwrap().content,
            "Water weekly."
        );
    }
}
