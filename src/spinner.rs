//! A minimal terminal spinner for visual feedback during async operations.

use std::io::Write;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Braille spinner frames.
const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Frame interval.
const INTERVAL: Duration = Duration::from_millis(80);

/// A terminal spinner that runs in a background task.
///
/// The label either stays fixed ([`Spinner::start`]) or follows a watch
/// channel of progress text ([`Spinner::follow`]), so load progress can
/// be shown in place. Writes to stderr so it doesn't interfere with
/// streamed output on stdout.
pub struct Spinner {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl Spinner {
    /// Start a spinner with a fixed message (e.g. `"thinking"`).
    pub fn start(message: &str) -> Self {
        let (_tx, rx) = watch::channel(message.to_string());
        Self::follow(rx)
    }

    /// Start a spinner whose label is the latest value of `label`.
    pub fn follow(mut label: watch::Receiver<String>) -> Self {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut i = 0;
            loop {
                let frame = FRAMES[i % FRAMES.len()];
                let message = label.borrow_and_update().clone();
                // \r moves to start of line, \x1b[2K clears the line
                eprint!("\x1b[2K\r{frame} {message}");
                let _ = std::io::stderr().flush();

                tokio::select! {
                    _ = tokio::time::sleep(INTERVAL) => {}
                    _ = cancel_rx.changed() => break,
                }
                i += 1;
            }
            // Clear the spinner line
            eprint!("\x1b[2K\r");
            let _ = std::io::stderr().flush();
        });

        Self {
            handle,
            cancel: cancel_tx,
        }
    }

    /// Stop the spinner and clear its line.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}
