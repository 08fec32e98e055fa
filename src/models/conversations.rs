use crate::models::schema::{conversations, messages};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// Error types
#[derive(Error, Debug)]
pub enum ConversationsError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Message not found")]
    MessageNotFound,
}

// Conversation mode enum matching the database enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::ConversationMode"]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    General,
    GoalCoach,
    Interview,
}

impl ConversationMode {
    /// Title a conversation of this mode is created with before the first
    /// assistant turn generates a real one.
    pub fn placeholder_title(&self) -> &'static str {
        match self {
            ConversationMode::General => "New conversation",
            ConversationMode::GoalCoach => "Goal coaching",
            ConversationMode::Interview => "Interview practice",
        }
    }
}

// Message role enum matching the database enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::MessageRole"]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Conversation {
    pub id: i64,
    pub uuid: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub mode: ConversationMode,
    pub project_id: Option<i64>,
    pub goal_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// The title has not been replaced since creation. Checked against every
    /// mode's placeholder because clients may switch modes after creation.
    pub fn has_placeholder_title(&self) -> bool {
        [
            ConversationMode::General,
            ConversationMode::GoalCoach,
            ConversationMode::Interview,
        ]
        .iter()
        .any(|mode| self.title == mode.placeholder_title())
    }

    pub fn get_by_uuid_and_user(
        conn: &mut PgConnection,
        uuid: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, ConversationsError> {
        conversations::table
            .filter(conversations::uuid.eq(uuid))
            .filter(conversations::user_id.eq(user_id))
            .first::<Conversation>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ConversationsError::ConversationNotFound,
                _ => ConversationsError::DatabaseError(e),
            })
    }

    pub fn update_title(
        conn: &mut PgConnection,
        id: i64,
        title: &str,
    ) -> Result<(), ConversationsError> {
        diesel::update(conversations::table.filter(conversations::id.eq(id)))
            .set((
                conversations::title.eq(title),
                conversations::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .map(|_| ())
            .map_err(ConversationsError::DatabaseError)
    }

    pub fn touch(conn: &mut PgConnection, id: i64) -> Result<(), ConversationsError> {
        diesel::update(conversations::table.filter(conversations::id.eq(id)))
            .set(conversations::updated_at.eq(diesel::dsl::now))
            .execute(conn)
            .map(|_| ())
            .map_err(ConversationsError::DatabaseError)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Message {
    pub id: i64,
    pub uuid: Uuid,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub uuid: Uuid,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn new(conversation_id: i64, role: MessageRole, content: String) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            conversation_id,
            role,
            content,
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<Message, ConversationsError> {
        diesel::insert_into(messages::table)
            .values(self)
            .get_result(conn)
            .map_err(ConversationsError::DatabaseError)
    }
}

impl Message {
    /// The most recent `limit` messages of a conversation, oldest first.
    pub fn recent_for_conversation(
        conn: &mut PgConnection,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, ConversationsError> {
        let mut rows = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order((messages::created_at.desc(), messages::id.desc()))
            .limit(limit)
            .load::<Message>(conn)
            .map_err(ConversationsError::DatabaseError)?;
        rows.reverse();
        Ok(rows)
    }
}
