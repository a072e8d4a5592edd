//! Background inference worker.
//!
//! The worker owns a [`Backend`] and speaks the [`Command`] / [`Reply`]
//! protocol over channels. Long operations (`load`, `generate`) run on
//! their own tasks so `interrupt` and `reset` are handled while a reply
//! is still streaming.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Outbox};
use crate::error::BridgeError;
use crate::protocol::{Command, Reply};

/// Sending side of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    pub fn send(&self, command: Command) -> Result<(), BridgeError> {
        self.tx.send(command).map_err(|_| BridgeError::WorkerGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start a worker for `backend`. The worker stops when every handle is dropped.
pub fn spawn(backend: Arc<dyn Backend>) -> (WorkerHandle, mpsc::UnboundedReceiver<Reply>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (outbox, reply_rx) = Outbox::channel();
    info!(backend = backend.name(), model = backend.model(), "starting worker");
    tokio::spawn(run(backend, cmd_rx, outbox));
    (WorkerHandle { tx: cmd_tx }, reply_rx)
}

async fn run(backend: Arc<dyn Backend>, mut commands: mpsc::UnboundedReceiver<Command>, outbox: Outbox) {
    while let Some(command) = commands.recv().await {
        debug!(?command, "worker command");
        match command {
            Command::Check => {
                let backend = backend.clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    match backend.check_capability().await {
                        Ok(()) => outbox.send(Reply::ReadyToLoad),
                        Err(e) => {
                            warn!("capability check failed: {e}");
                            outbox.send(Reply::Error { data: e.reason() });
                        }
                    }
                });
            }
            Command::Load => {
                let backend = backend.clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    match backend.load(&outbox).await {
                        Ok(()) => outbox.send(Reply::Ready),
                        Err(e) => {
                            warn!("model load failed: {e}");
                            outbox.send(Reply::Error { data: e.reason() });
                        }
                    }
                });
            }
            Command::Generate(messages) => {
                backend.begin_generation();
                let backend = backend.clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    outbox.send(Reply::Start);
                    match backend.generate(&messages, &outbox).await {
                        Ok(output) => outbox.send(Reply::Complete { output }),
                        Err(e) => {
                            warn!("generation failed: {e}");
                            outbox.send(Reply::Error { data: e.reason() });
                        }
                    }
                });
            }
            Command::Interrupt => backend.interrupt(),
            Command::Reset => backend.reset().await,
        }
    }
    debug!("worker stopped");
}
