//! Call bridge: stable `load` / `ask` entry points for the host.
//!
//! The host may call in before anything is installed behind the bridge.
//! Calls then wait, relaying a progress notice on every retry cycle,
//! until a [`ChatHandler`] is installed, the wait times out, or the
//! bridge is shut down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::{
    ASK_POLL_INTERVAL, ASK_WAITING_NOTICE, INSTALL_TIMEOUT, LOAD_POLL_INTERVAL, LOAD_WAITING_NOTICE,
};
use crate::error::BridgeError;
use crate::relay::{Relay, RelayEvent};
use crate::session::Callbacks;

/// What the bridge forwards calls to once installed.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    async fn load(&self) -> Result<(), BridgeError>;
    async fn ask(&self, message: &str, callbacks: Callbacks) -> Result<String, BridgeError>;
}

/// Retry cadence and upper bound for calls made before installation.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub load_poll: Duration,
    pub ask_poll: Duration,
    pub install_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            load_poll: LOAD_POLL_INTERVAL,
            ask_poll: ASK_POLL_INTERVAL,
            install_timeout: INSTALL_TIMEOUT,
        }
    }
}

pub struct Bridge {
    handler: watch::Sender<Option<Arc<dyn ChatHandler>>>,
    relay: Relay,
    config: BridgeConfig,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(relay: Relay) -> Self {
        Self::with_config(relay, BridgeConfig::default())
    }

    pub fn with_config(relay: Relay, config: BridgeConfig) -> Self {
        let (handler, _) = watch::channel(None);
        Self {
            handler,
            relay,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Install the real handler. Waiting calls proceed immediately.
    pub fn install(&self, handler: Arc<dyn ChatHandler>) {
        info!("chat handler installed");
        self.handler.send_replace(Some(handler));
    }

    pub fn is_installed(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// Abort every waiting call with [`BridgeError::Cancelled`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn load(&self) -> Result<(), BridgeError> {
        let handler = self
            .wait_for_handler(self.config.load_poll, LOAD_WAITING_NOTICE, "load handler")
            .await?;
        handler.load().await
    }

    pub async fn ask(&self, message: &str, callbacks: Callbacks) -> Result<String, BridgeError> {
        let handler = self
            .wait_for_handler(self.config.ask_poll, ASK_WAITING_NOTICE, "ask handler")
            .await?;
        handler.ask(message, callbacks).await
    }

    async fn wait_for_handler(
        &self,
        poll: Duration,
        notice: &str,
        what: &'static str,
    ) -> Result<Arc<dyn ChatHandler>, BridgeError> {
        let mut rx = self.handler.subscribe();
        let started = Instant::now();
        let deadline = started + self.config.install_timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            if let Some(handler) = rx.borrow_and_update().clone() {
                return Ok(handler);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout {
                    waited: now - started,
                    what,
                });
            }

            debug!(what, "handler not installed yet");
            self.relay.emit(RelayEvent::Progress(notice.to_string()));

            let nap = poll.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BridgeError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(BridgeError::Cancelled);
                    }
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
