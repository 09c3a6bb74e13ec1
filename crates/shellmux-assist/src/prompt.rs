//! Prompt construction for terminal questions.

use shellmux_llm_api::ChatMessage;
use shellmux_types::MAX_CONTEXT_CHARS;

pub const SYSTEM_PROMPT: &str = "You are a terminal assistant attached to a live shell session. \
Answer concisely and practically. Prefer concrete commands the user can run, in fenced code blocks. \
When the terminal output shows an error, explain the likely cause before suggesting a fix. \
Never claim to have run anything yourself.";

/// The last `max_chars` characters of `text`, cut on a char boundary
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// System message plus one user message carrying the query and, when
/// present, the most recent terminal context.
pub fn build_messages(query: &str, context: Option<&str>) -> Vec<ChatMessage> {
    let context = context
        .map(|context| tail_chars(context.trim_end(), MAX_CONTEXT_CHARS))
        .filter(|context| !context.trim().is_empty());

    let user = match context {
        Some(context) => format!(
            "Recent terminal output:\n```\n{context}\n```\n\nQuestion: {}",
            query.trim()
        ),
        None => query.trim().to_string(),
    };

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}
