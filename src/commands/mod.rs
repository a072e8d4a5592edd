//! Built-in REPL commands prefixed with `/`.
//!
//! Commands implement the [`Command`] trait and are registered in a
//! [`CommandRegistry`]. The registry handles dispatch, alias resolution,
//! and dynamic help generation. Embedders can register additional
//! commands at runtime via `registry.register(Arc::new(MyCommand))`.

mod clear;
mod examples;
mod help;
mod quit;
mod reset;
mod status;

use async_trait::async_trait;
use std::sync::Arc;

use crate::chat_state::ChatState;
use crate::session::Session;

/// Session info available to commands during execution.
pub struct SessionInfo<'a> {
    pub backend: &'a str,
    pub model: &'a str,
    pub settings: &'a str,
    /// Session reference for commands that drive the worker (e.g. `/reset`).
    pub session: Option<&'a Session>,
    pub chat: Option<&'a ChatState>,
}

/// What the REPL should do after a command runs.
#[derive(Debug)]
pub enum CommandResult {
    /// Not a command; pass input to the session.
    NotACommand,
    /// Command handled, continue the REPL loop.
    Handled,
    /// Send this text to the session as if the user had typed it.
    Ask(String),
    /// Exit the REPL.
    Quit,
}

/// A REPL command. Implement this trait to add new commands.
#[async_trait]
pub trait Command: Send + Sync {
    /// Primary name, e.g. `"/status"`.
    fn name(&self) -> &str;

    /// Alternative names, e.g. `&["/h", "/?"]`.
    fn aliases(&self) -> &[&str] {
        &[]
    }

    /// One-line description for `/help`.
    fn description(&self) -> &str;

    /// Run the command with whatever followed its name.
    async fn execute(&self, args: &str, info: &SessionInfo<'_>) -> CommandResult;
}

/// Holds registered commands.
pub struct CommandRegistry {
    commands: Vec<Arc<dyn Command>>,
}

impl CommandRegistry {
    /// Create a registry with all built-in commands.
    pub fn new() -> Self {
        let commands: Vec<Arc<dyn Command>> = vec![
            Arc::new(help::HelpCommand),
            Arc::new(status::StatusCommand),
            Arc::new(examples::ExamplesCommand),
            Arc::new(reset::ResetCommand),
            Arc::new(clear::ClearCommand),
            Arc::new(quit::QuitCommand),
        ];
        Self { commands }
    }

    /// Register an additional command.
    pub fn register(&mut self, command: Arc<dyn Command>) {
        self.commands.push(command);
    }

    /// Dispatch input to a matching command, or return `NotACommand`.
    pub async fn dispatch(&self, input: &str, info: &SessionInfo<'_>) -> CommandResult {
        let input = input.trim();
        let (cmd, args) = match input.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd, args.trim()),
            None => (input, ""),
        };

        for command in &self.commands {
            if cmd == command.name() || command.aliases().contains(&cmd) {
                // /help is special: it needs the registry to list all commands
                if command.name() == "/help" {
                    print!("{}", self.help_text());
                    return CommandResult::Handled;
                }
                return command.execute(args, info).await;
            }
        }

        if cmd.starts_with('/') {
            println!("unknown command: {cmd}");
            println!("type /help for available commands");
            return CommandResult::Handled;
        }

        CommandResult::NotACommand
    }

    /// Generate help text from all registered commands.
    pub fn help_text(&self) -> String {
        let entries: Vec<(String, &str)> = self
            .commands
            .iter()
            .map(|c| (format_label(c.name(), c.aliases()), c.description()))
            .collect();

        let max_width = entries
            .iter()
            .map(|(label, _)| label.len())
            .max()
            .unwrap_or(10);

        let mut out = String::new();
        for (label, desc) in &entries {
            out.push_str(&format!("  {label:<max_width$}  {desc}\n"));
        }
        out
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name()).collect()
    }

    /// All registered names and aliases (for duplicate detection).
    pub fn all_triggers(&self) -> Vec<&str> {
        let mut triggers = Vec::new();
        for cmd in &self.commands {
            triggers.push(cmd.name());
            triggers.extend_from_slice(cmd.aliases());
        }
        triggers
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn format_label(name: &str, aliases: &[&str]) -> String {
    if aliases.is_empty() {
        name.to_string()
    } else {
        format!("{} ({})", name, aliases.join(", "))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_info() -> SessionInfo<'static> {
        SessionInfo {
            backend: "scripted",
            model: "demo",
            settings: ":memory:",
            session: None,
            chat: None,
        }
    }

    #[test]
    fn all_builtins_registered() {
        let reg = CommandRegistry::new();
        let names = reg.names();
        for name in ["/help", "/status", "/examples", "/reset", "/clear", "/quit"] {
            assert!(names.contains(&name), "missing {name}");
        }
    }

    #[test]
    fn no_duplicate_triggers() {
        let reg = CommandRegistry::new();
        let triggers = reg.all_triggers();
        let mut seen = Vec::new();
        for t in &triggers {
            assert!(!seen.contains(t), "duplicate trigger: {t}");
            seen.push(t);
        }
    }

    #[test]
    fn help_text_includes_all_commands_and_aliases() {
        let reg = CommandRegistry::new();
        let text = reg.help_text();
        for name in reg.names() {
            assert!(text.contains(name), "help missing: {name}");
        }
        assert!(text.contains("/h"));
        assert!(text.contains("/?"));
    }

    #[tokio::test]
    async fn unknown_slash_command_is_handled() {
        let reg = CommandRegistry::new();
        assert!(matches!(
            reg.dispatch("/foobar", &test_info()).await,
            CommandResult::Handled
        ));
    }

    #[tokio::test]
    async fn non_command_passes_through() {
        let reg = CommandRegistry::new();
        assert!(matches!(
            reg.dispatch("how do I repot a fern?", &test_info()).await,
            CommandResult::NotACommand
        ));
    }

    #[tokio::test]
    async fn registered_command_receives_args() {
        struct EchoCommand;

        #[async_trait]
        impl Command for EchoCommand {
            fn name(&self) -> &str {
                "/echo"
            }
            fn description(&self) -> &str {
                "ask the given text"
            }
            async fn execute(&self, args: &str, _info: &SessionInfo<'_>) -> CommandResult {
                CommandResult::Ask(args.to_string())
            }
        }

        let mut reg = CommandRegistry::new();
        reg.register(Arc::new(EchoCommand));
        assert!(reg.help_text().contains("/echo"));
        match reg.dispatch("/echo  basil care ", &test_info()).await {
            CommandResult::Ask(text) => assert_eq!(text, "basil care"),
            other => panic!("expected Ask, got {other:?}"),
        }
    }

    #[test]
    fn format_label_variants() {
        assert_eq!(format_label("/status", &[]), "/status");
        assert_eq!(format_label("/help", &["/h", "/?"]), "/help (/h, /?)");
    }
}
