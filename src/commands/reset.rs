use async_trait::async_trait;

use super::{Command, CommandResult, SessionInfo};

pub struct ResetCommand;

#[async_trait]
impl Command for ResetCommand {
    fn name(&self) -> &str {
        "/reset"
    }

    fn aliases(&self) -> &[&str] {
        &["/new"]
    }

    fn description(&self) -> &str {
        "stop generating and start a fresh conversation"
    }

    async fn execute(&self, _args: &str, info: &SessionInfo<'_>) -> CommandResult {
        let Some(session) = info.session else {
            eprintln!("  ✗ reset not available");
            return CommandResult::Handled;
        };

        if let Err(e) = session.reset().await {
            eprintln!("  ✗ failed to reset: {e}");
            return CommandResult::Handled;
        }
        if let Some(chat) = info.chat {
            chat.clear();
        }

        println!("  ✓ conversation cleared");
        CommandResult::Handled
    }
}
