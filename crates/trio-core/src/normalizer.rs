use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use trio_types::{ChatMessage, ConversationEntry, FileMap, MessageRole};

use crate::agents::PromptPlacement;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(String),
    MissingField(&'static str),
    NonText(String),
    UnsupportedRole(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed(err) => write!(f, "malformed entry: {err}"),
            DropReason::MissingField(field) => write!(f, "missing `{field}`"),
            DropReason::NonText(kind) => write!(f, "non-text entry of type `{kind}`"),
            DropReason::UnsupportedRole(role) => write!(f, "unsupported role `{role}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub index: usize,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedConversation {
    pub messages: Vec<ChatMessage>,
    pub dropped: Vec<DroppedEntry>,
}

fn parse_entry(raw: &Value) -> Result<ChatMessage, DropReason> {
    let entry = ConversationEntry::deserialize(raw)
        .map_err(|err| DropReason::Malformed(err.to_string()))?;
    let (kind, role, content) = match (entry.kind, entry.role, entry.content) {
        (None, _, _) => return Err(DropReason::MissingField("type")),
        (_, None, _) => return Err(DropReason::MissingField("role")),
        (_, _, None) => return Err(DropReason::MissingField("content")),
        (Some(kind), Some(role), Some(content)) => (kind, role, content),
    };
    if kind != "text" {
        return Err(DropReason::NonText(kind));
    }
    match role.as_str() {
        "user" => Ok(ChatMessage::user(content)),
        "assistant" => Ok(ChatMessage::assistant(content)),
        "system" => Ok(ChatMessage::system(content)),
        _ => Err(DropReason::UnsupportedRole(role)),
    }
}

/// Builds the outgoing message sequence: the role prompt, then every valid
/// entry in order, then the file manifest on a trailing user message.
pub fn normalize_conversation(
    entries: &[Value],
    instruction: &str,
    placement: PromptPlacement,
    files: &FileMap,
) -> NormalizedConversation {
    let mut out = NormalizedConversation::default();
    for (index, raw) in entries.iter().enumerate() {
        match parse_entry(raw) {
            Ok(message) => out.messages.push(message),
            Err(reason) => out.dropped.push(DroppedEntry { index, reason }),
        }
    }

    place_instruction(&mut out.messages, instruction, placement);
    append_file_manifest(&mut out.messages, files);
    out
}

fn place_instruction(messages: &mut Vec<ChatMessage>, instruction: &str, placement: PromptPlacement) {
    if placement == PromptPlacement::FirstUserMessage {
        if let Some(first_user) = messages.iter_mut().find(|m| m.role == MessageRole::User) {
            first_user.content = format!("{instruction}\n\n{}", first_user.content);
            return;
        }
    }
    // No user message to carry the prompt: fall back to a system message.
    messages.insert(0, ChatMessage::system(instruction));
}

fn append_file_manifest(messages: &mut [ChatMessage], files: &FileMap) {
    if files.is_empty() {
        return;
    }
    let Some(last) = messages.last_mut() else {
        return;
    };
    if last.role != MessageRole::User {
        return;
    }
    let listing = files
        .keys()
        .map(|path| format!("- {path}"))
        .collect::<Vec<_>>()
        .join("\n");
    last.content.push_str("\n\nExisting files in project:\n");
    last.content.push_str(&listing);
}
