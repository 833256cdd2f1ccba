use crate::llm_client::Message;
use crate::store::{Role, Turn};

pub const SYSTEM_PROMPT_KEY: &str = "gaod_system_prompt";
pub const MEMORY_START: &str = "[LONG-TERM MEMORY START]";
pub const MEMORY_END: &str = "[LONG-TERM MEMORY END]";

/// Compose the system prompt: stored persona (if any), then the tool grammar
/// with the user's memory block embedded.
pub fn build_system_prompt(persona: Option<&str>, memory_block: &str) -> String {
    let mut prompt = String::new();

    if let Some(persona) = persona.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str(persona);
        prompt.push('\n');
    }

    prompt.push_str(
        "You are Gaod, an advanced creative AI.\n\
         You have access to a long-term memory about this user and several tools.\n\n",
    );
    prompt.push_str(MEMORY_START);
    prompt.push('\n');
    prompt.push_str(memory_block.trim());
    prompt.push('\n');
    prompt.push_str(MEMORY_END);
    prompt.push_str("\n\n");

    prompt.push_str(
        "Tools (write the tag exactly; the system replaces it with the result):\n\
         1. UPDATE_MEMORY: save an important fact, preference or unresolved task about the user.\n   \
            Syntax: [UPDATE_MEMORY: <fact>]\n\
         2. EXECUTE_CODE: evaluate a math or logic expression.\n   \
            Syntax: [EXECUTE_CODE: <expression>]\n\
         3. WEB_SEARCH: look up current information on the web.\n   \
            Syntax: [WEB_SEARCH: <query>]\n\
         4. GENERATE_IMAGE: create an image from a description.\n   \
            Syntax: [GENERATE_IMAGE: <prompt>]\n\n\
         Guidelines:\n\
         - If you learn something new about the user (job, favorite color), use UPDATE_MEMORY.\n\
         - Tag payloads must not contain ']'.\n\
         - Never write tool results yourself; output the tag and the system will fill it in.\n",
    );

    prompt
}

/// The last `history_window` user/assistant turns followed by the new input.
/// Local system notices are never sent to a provider.
pub fn build_messages(history: &[Turn], history_window: usize, new_input: &str) -> Vec<Message> {
    let relevant: Vec<&Turn> = history
        .iter()
        .filter(|turn| turn.role != Role::System)
        .collect();
    let start = relevant.len().saturating_sub(history_window);

    let mut messages: Vec<Message> = relevant[start..]
        .iter()
        .map(|turn| match turn.role {
            Role::Assistant => Message::assistant(turn.content.clone()),
            _ => Message::user(turn.content.clone()),
        })
        .collect();
    messages.push(Message::user(new_input));
    messages
}
