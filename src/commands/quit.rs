use async_trait::async_trait;
use tracing::warn;

use super::{Command, CommandResult, SessionInfo};
use crate::session::SessionState;

/// Leaves the REPL. A reply still streaming is interrupted first so the
/// worker does not keep generating for a session nobody is reading.
pub struct QuitCommand;

#[async_trait]
impl Command for QuitCommand {
    fn name(&self) -> &str {
        "/quit"
    }

    fn aliases(&self) -> &[&str] {
        &["/bye", "/exit", "exit"]
    }

    fn description(&self) -> &str {
        "stop any reply in progress and leave"
    }

    async fn execute(&self, _args: &str, info: &SessionInfo<'_>) -> CommandResult {
        if let Some(session) = info.session
            && session.state() == SessionState::Generating
        {
            if let Err(e) = session.interrupt().await {
                warn!("could not interrupt generation on quit: {e}");
            }
            println!("(reply interrupted)");
        }
        CommandResult::Quit
    }
}
