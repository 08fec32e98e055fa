//! Repository seam for the chat pipeline.
//!
//! The orchestrator and context builder only ever talk to [`DBConnection`];
//! production wires in [`PostgresConnection`], tests use an in-memory
//! implementation.

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_query;
use thiserror::Error;
use uuid::Uuid;

use crate::models::conversations::{
    Conversation, ConversationsError, Message, NewMessage,
};

#[derive(Error, Debug)]
pub enum DBError {
    #[error("Database connection error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error(transparent)]
    Conversations(#[from] ConversationsError),
    #[error("Database error: {0}")]
    Query(#[from] diesel::result::Error),
}

impl DBError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DBError::Conversations(ConversationsError::ConversationNotFound)
                | DBError::Conversations(ConversationsError::MessageNotFound)
                | DBError::Query(diesel::result::Error::NotFound)
        )
    }
}

pub trait DBConnection: Send + Sync {
    fn get_conversation_by_uuid_and_user(
        &self,
        uuid: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, DBError>;

    fn create_message(&self, new_message: NewMessage) -> Result<Message, DBError>;

    /// The most recent `limit` messages of a conversation, oldest first.
    fn get_recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DBError>;

    fn update_conversation_title(&self, conversation_id: i64, title: &str)
        -> Result<(), DBError>;

    fn touch_conversation(&self, conversation_id: i64) -> Result<(), DBError>;

    /// One-line summary of the user's profile, if they have filled one in.
    fn get_user_summary(&self, user_id: Uuid) -> Result<Option<String>, DBError>;

    fn get_project_summary(&self, project_id: i64) -> Result<Option<String>, DBError>;

    fn get_goal_summary(&self, goal_id: i64) -> Result<Option<String>, DBError>;

    fn get_contact_summary(&self, contact_id: i64) -> Result<Option<String>, DBError>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresConnection {
    pool: Pool<ConnectionManager<PgConnection>>,
}

impl PostgresConnection {
    pub fn new(database_url: &str) -> Result<Self, DBError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().build(manager)?;
        Ok(Self { pool })
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        Ok(self.pool.get()?)
    }
}

/// Row shape for the ad-hoc summary lookups. The profile/project/goal/contact
/// tables are owned by the CRUD side of the application; the chat pipeline
/// only ever reads these one-line summaries from them.
#[derive(QueryableByName)]
struct SummaryRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    summary: String,
}

impl DBConnection for PostgresConnection {
    fn get_conversation_by_uuid_and_user(
        &self,
        uuid: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, DBError> {
        let mut conn = self.conn()?;
        Ok(Conversation::get_by_uuid_and_user(&mut conn, uuid, user_id)?)
    }

    fn create_message(&self, new_message: NewMessage) -> Result<Message, DBError> {
        let mut conn = self.conn()?;
        Ok(new_message.insert(&mut conn)?)
    }

    fn get_recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DBError> {
        let mut conn = self.conn()?;
        Ok(Message::recent_for_conversation(
            &mut conn,
            conversation_id,
            limit,
        )?)
    }

    fn update_conversation_title(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> Result<(), DBError> {
        let mut conn = self.conn()?;
        Ok(Conversation::update_title(&mut conn, conversation_id, title)?)
    }

    fn touch_conversation(&self, conversation_id: i64) -> Result<(), DBError> {
        let mut conn = self.conn()?;
        Ok(Conversation::touch(&mut conn, conversation_id)?)
    }

    fn get_user_summary(&self, user_id: Uuid) -> Result<Option<String>, DBError> {
        let mut conn = self.conn()?;
        let row = sql_query(
            "SELECT display_name || COALESCE(': ' || headline, '') AS summary \
             FROM user_profiles WHERE user_id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(user_id)
        .get_result::<SummaryRow>(&mut conn)
        .optional()?;
        Ok(row.map(|r| r.summary))
    }

    fn get_project_summary(&self, project_id: i64) -> Result<Option<String>, DBError> {
        let mut conn = self.conn()?;
        let row = sql_query(
            "SELECT name || COALESCE(': ' || description, '') AS summary \
             FROM projects WHERE id = $1",
        )
        .bind::<diesel::sql_types::BigInt, _>(project_id)
        .get_result::<SummaryRow>(&mut conn)
        .optional()?;
        Ok(row.map(|r| r.summary))
    }

    fn get_goal_summary(&self, goal_id: i64) -> Result<Option<String>, DBError> {
        let mut conn = self.conn()?;
        let row = sql_query(
            "SELECT title || COALESCE(': ' || description, '') AS summary \
             FROM goals WHERE id = $1",
        )
        .bind::<diesel::sql_types::BigInt, _>(goal_id)
        .get_result::<SummaryRow>(&mut conn)
        .optional()?;
        Ok(row.map(|r| r.summary))
    }

    fn get_contact_summary(&self, contact_id: i64) -> Result<Option<String>, DBError> {
        let mut conn = self.conn()?;
        let row = sql_query(
            "SELECT name || COALESCE(' (' || company || ')', '') AS summary \
             FROM contacts WHERE id = $1",
        )
        .bind::<diesel::sql_types::BigInt, _>(contact_id)
        .get_result::<SummaryRow>(&mut conn)
        .optional()?;
        Ok(row.map(|r| r.summary))
    }
}
