//! Assemble the system prompt and chat-message array for an assistant turn.
//!
//! The system prompt is rebuilt from scratch on every turn from whatever the
//! conversation is anchored to (user profile, project, goal, contact); the
//! replayed history is capped so long conversations keep a bounded prompt.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::{DBConnection, DBError};
use crate::models::conversations::{Conversation, ConversationMode, Message, MessageRole};

/// Prior turns replayed to the model. The system prompt and the current user
/// message are always included in full on top of this window.
pub const HISTORY_WINDOW: usize = 20;

/// Build the system prompt text block for one turn of `conversation`.
pub fn build_system_prompt<D: DBConnection + ?Sized>(
    db: &D,
    user_id: Uuid,
    conversation: &Conversation,
) -> Result<String, DBError> {
    let user_summary = db.get_user_summary(user_id)?;
    let project_summary = match conversation.project_id {
        Some(id) => db.get_project_summary(id)?,
        None => None,
    };
    let goal_summary = match conversation.goal_id {
        Some(id) => db.get_goal_summary(id)?,
        None => None,
    };
    let contact_summary = match conversation.contact_id {
        Some(id) => db.get_contact_summary(id)?,
        None => None,
    };

    Ok(compose_system_prompt(
        conversation.mode,
        user_summary.as_deref(),
        project_summary.as_deref(),
        goal_summary.as_deref(),
        contact_summary.as_deref(),
    ))
}

/// Compose the prompt text - pure function for testing
pub fn compose_system_prompt(
    mode: ConversationMode,
    user_summary: Option<&str>,
    project_summary: Option<&str>,
    goal_summary: Option<&str>,
    contact_summary: Option<&str>,
) -> String {
    let mut prompt = String::from(match mode {
        ConversationMode::General => {
            "You are a supportive career mentor inside a personal work journal. \
             Help the user reflect on their logged accomplishments, spot patterns in their \
             work, and decide what to do next. Be concrete and encouraging, never vague."
        }
        ConversationMode::GoalCoach => {
            "You are a goal coach inside a personal work journal. Keep the conversation \
             anchored to the user's stated goal, break it into actionable steps, and hold \
             them accountable with specific follow-ups."
        }
        ConversationMode::Interview => {
            "You are a mock interviewer inside a personal work journal. Ask one question \
             at a time about the user's real accomplishments, press for specifics, and \
             give short, candid feedback on each answer."
        }
    });

    if let Some(user) = user_summary {
        prompt.push_str("\n\nAbout the user: ");
        prompt.push_str(user);
    }
    if let Some(project) = project_summary {
        prompt.push_str("\nCurrent project: ");
        prompt.push_str(project);
    }
    if let Some(goal) = goal_summary {
        prompt.push_str("\nActive goal: ");
        prompt.push_str(goal);
    }
    if let Some(contact) = contact_summary {
        prompt.push_str("\nRelevant contact: ");
        prompt.push_str(contact);
    }

    prompt
}

/// Build the chat-completions message array.
///
/// `rows` are the most recent stored messages oldest-first and include the
/// just-persisted current user message, identified by `current_uuid`; it is
/// excluded from the windowed history and re-appended last so it can never
/// fall out of the window. Stored system messages are skipped, the prompt is
/// rebuilt fresh each turn.
pub fn build_chat_messages(
    system_prompt: &str,
    rows: &[Message],
    current_uuid: Uuid,
    current_content: &str,
) -> Vec<Value> {
    let prior: Vec<&Message> = rows
        .iter()
        .filter(|m| m.uuid != current_uuid && m.role != MessageRole::System)
        .collect();
    let start = prior.len().saturating_sub(HISTORY_WINDOW);

    let mut messages = Vec::with_capacity(prior.len() - start + 2);
    messages.push(json!({"role": "system", "content": system_prompt}));
    for message in &prior[start..] {
        messages.push(json!({"role": message.role.as_str(), "content": message.content}));
    }
    messages.push(json!({"role": "user", "content": current_content}));

    messages
}

/// The conversation has no assistant turn yet within the fetched window.
pub fn is_first_assistant_turn(rows: &[Message]) -> bool {
    !rows.iter().any(|m| m.role == MessageRole::Assistant)
}
