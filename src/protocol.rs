//! Wire types spoken between the session and its background worker.
//!
//! Commands are `{"type": ..., "data": ...}`; replies are tagged by
//! `"status"`. Both serialize to the JSON shapes the browser worker used,
//! so the same messages can cross a real process or thread boundary.

use serde::{Deserialize, Serialize};

/// Who said a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn fed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Session → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Probe for the hardware or service the backend needs.
    Check,
    /// Fetch, load and warm up the model.
    Load,
    /// Generate a reply to the conversation.
    Generate(Vec<ChatMessage>),
    /// Stop the in-flight generation.
    Interrupt,
    /// Stop the in-flight generation and drop the generation cache.
    Reset,
}

/// Worker → session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    ReadyToLoad,
    Loading {
        data: String,
    },
    Initiate {
        file: String,
    },
    Progress {
        file: String,
        /// Percent of the file downloaded, 0 to 100.
        progress: f64,
    },
    Done {
        file: String,
    },
    Ready,
    Start,
    Update {
        output: String,
        tps: f64,
        #[serde(rename = "numTokens")]
        num_tokens: u64,
    },
    Complete {
        output: String,
    },
    Error {
        data: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_command_carries_messages_as_data() {
        let cmd = Command::Generate(vec![ChatMessage::user("hello")]);
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({"type": "generate", "data": [{"role": "user", "content": "hello"}]})
        );
    }

    #[test]
    fn unit_commands_have_only_a_type() {
        let value = serde_json::to_value(Command::Interrupt).unwrap();
        assert_eq!(value, json!({"type": "interrupt"}));

        let parsed: Command = serde_json::from_value(json!({"type": "reset"})).unwrap();
        assert_eq!(parsed, Command::Reset);
    }

    #[test]
    fn replies_are_tagged_by_status() {
        let value = serde_json::to_value(Reply::ReadyToLoad).unwrap();
        assert_eq!(value, json!({"status": "ready_to_load"}));

        let value = serde_json::to_value(Reply::Loading {
            data: "Warming up (95%)...".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"status": "loading", "data": "Warming up (95%)..."}));
    }

    #[test]
    fn update_uses_camel_case_token_count() {
        let parsed: Reply = serde_json::from_value(json!({
            "status": "update",
            "output": "Roses",
            "tps": 12.5,
            "numTokens": 3
        }))
        .unwrap();
        assert_eq!(
            parsed,
            Reply::Update {
                output: "Roses".into(),
                tps: 12.5,
                num_tokens: 3
            }
        );
    }

    #[test]
    fn file_progress_parses() {
        let parsed: Reply = serde_json::from_value(json!({
            "status": "progress",
            "file": "onnx/model_q4.onnx",
            "progress": 42.7
        }))
        .unwrap();
        assert!(matches!(parsed, Reply::Progress { ref file, progress } if file == "onnx/model_q4.onnx" && progress > 42.0));
    }
}
