use async_trait::async_trait;

use super::{Command, CommandResult, SessionInfo};
use crate::chat_state::EXAMPLE_QUESTIONS;

/// Lists the starter questions, or asks one: `/examples 2`.
pub struct ExamplesCommand;

#[async_trait]
impl Command for ExamplesCommand {
    fn name(&self) -> &str {
        "/examples"
    }

    fn description(&self) -> &str {
        "list example questions, or ask one by number"
    }

    async fn execute(&self, args: &str, _info: &SessionInfo<'_>) -> CommandResult {
        if args.is_empty() {
            for (i, question) in EXAMPLE_QUESTIONS.iter().enumerate() {
                println!("  {}. {question}", i + 1);
            }
            return CommandResult::Handled;
        }

        match args.parse::<usize>() {
            Ok(n) if (1..=EXAMPLE_QUESTIONS.len()).contains(&n) => {
                let question = EXAMPLE_QUESTIONS[n - 1];
                println!("  > {question}");
                CommandResult::Ask(question.to_string())
            }
            _ => {
                eprintln!("  ✗ pick a number from 1 to {}", EXAMPLE_QUESTIONS.len());
                CommandResult::Handled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_info;

    #[tokio::test]
    async fn lists_without_args() {
        assert!(matches!(
            ExamplesCommand.execute("", &test_info()).await,
            CommandResult::Handled
        ));
    }

    #[tokio::test]
    async fn asks_by_number() {
        match ExamplesCommand.execute("3", &test_info()).await {
            CommandResult::Ask(q) => assert_eq!(q, EXAMPLE_QUESTIONS[2]),
            other => panic!("expected Ask, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_out_of_range() {
        for arg in ["0", "4", "cactus"] {
            assert!(matches!(
                ExamplesCommand.execute(arg, &test_info()).await,
                CommandResult::Handled
            ));
        }
    }
}
