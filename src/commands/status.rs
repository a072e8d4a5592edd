use async_trait::async_trait;

use super::{Command, CommandResult, SessionInfo};

pub struct StatusCommand;

#[async_trait]
impl Command for StatusCommand {
    fn name(&self) -> &str {
        "/status"
    }

    fn description(&self) -> &str {
        "show backend, model state, and catalog"
    }

    async fn execute(&self, _args: &str, info: &SessionInfo<'_>) -> CommandResult {
        println!("  backend   {} ({})", info.backend, info.model);
        println!("  settings  {}", info.settings);

        let Some(session) = info.session else {
            println!("  state     no session");
            return CommandResult::Handled;
        };
        println!("  state     {}", session.state());
        println!("  catalog   {} plants", session.catalog().loaded_len());

        let (tokens, tps) = session.last_stats();
        if tokens > 0 {
            println!("  last      {tokens} tokens at {tps:.1} tok/s");
        }
        if let Some(chat) = info.chat {
            let snapshot = chat.snapshot();
            println!("  messages  {}", snapshot.messages.len());
        }
        CommandResult::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_info;

    #[tokio::test]
    async fn handled_without_session() {
        assert!(matches!(
            StatusCommand.execute("", &test_info()).await,
            CommandResult::Handled
        ));
    }

    #[test]
    fn metadata() {
        assert_eq!(StatusCommand.name(), "/status");
        assert!(StatusCommand.aliases().is_empty());
    }
}
