use crate::protocol::ChatMessage;

const INTRO: &str =
    "You are Gemma, the Heartyculture Nursery Plant Whisperer. You are an expert botanist and gardener.";
const GUIDANCE: &str = "Use the following inventory context to help users find plants. If a plant isn't in context, use your general knowledge but mention it's not in our current online catalog.";
const STYLE: &str = "Keep answers concise.";

/// System prompt for one request. An empty `context` leaves the
/// inventory block out entirely.
pub fn build_system_prompt(context: &str) -> String {
    let context = context.trim_end();
    if context.is_empty() {
        return format!("{INTRO} {STYLE}");
    }
    format!("{INTRO} {GUIDANCE} {STYLE}\n\nContext:\n{context}\n")
}

/// The conversation sent to the backend: system prompt, then the user turn.
pub fn build_messages(context: &str, message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(build_system_prompt(context)),
        ChatMessage::user(message),
    ]
}
