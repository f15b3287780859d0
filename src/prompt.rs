//! System prompt assembly and chat context windowing

use crate::chat::ChatMessage;
use crate::db::{ConversationTurn, Identity};
use crate::persona::{Persona, VoicePreset};

/// Build the system prompt for a turn
///
/// Parts are joined by blank lines in this order: persona prompt, user
/// info, preset style, spoken-style guidelines. Blank parts are skipped.
#[must_use]
pub fn build_system_prompt(
    persona: &Persona,
    preset: &VoicePreset,
    identity: Option<&Identity>,
) -> String {
    let user_info = identity.map(user_info_block);

    [
        Some(persona.system_prompt.as_str()),
        user_info.as_deref(),
        Some(preset.style_instructions.as_str()),
        Some(persona.voice_guidelines.sentence_structure.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("\n\n")
}

fn user_info_block(identity: &Identity) -> String {
    let field = |value: Option<&str>| {
        value
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("unknown")
            .to_string()
    };

    format!(
        "USER INFO:\n- Name: {}\n- Email: {}\n- ID: {}\n\nUse this to address the user personally and remember earlier conversations.",
        field(identity.name.as_deref()),
        field(identity.email.as_deref()),
        field(Some(identity.id.as_str())),
    )
}

/// Map the last `window` turns to chat messages, oldest first
#[must_use]
pub fn history_window(turns: &[ConversationTurn], window: usize) -> Vec<ChatMessage> {
    let start = turns.len().saturating_sub(window);
    turns[start..]
        .iter()
        .map(|turn| ChatMessage {
            role: turn.role,
            content: turn.text.clone(),
        })
        .collect()
}
