use async_trait::async_trait;

use super::{Command, CommandResult, SessionInfo};

/// Clears the transcript only; the model keeps its conversation cache.
pub struct ClearCommand;

#[async_trait]
impl Command for ClearCommand {
    fn name(&self) -> &str {
        "/clear"
    }

    fn description(&self) -> &str {
        "clear the transcript, keep the conversation"
    }

    async fn execute(&self, _args: &str, info: &SessionInfo<'_>) -> CommandResult {
        match info.chat {
            Some(chat) => {
                chat.clear();
                // \x1b[2J clears the screen, \x1b[H homes the cursor
                print!("\x1b[2J\x1b[H");
            }
            None => eprintln!("  ✗ nothing to clear"),
        }
        CommandResult::Handled
    }
}
