use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::error::ErrorKind;
use thiserror::Error;

use meetbot_core::domain::event::{Event, EventId, NewEvent};
use meetbot_core::errors::ApplicationError;
use meetbot_core::session::{ProfileFields, ScenarioState, UserId, UserSession};

pub mod event;
pub mod memory;
pub mod session;

pub use event::SqlEventRepository;
pub use memory::{InMemoryEventRepository, InMemorySessionStore};
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("required field is missing: {0}")]
    MissingRequiredField(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl RepositoryError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        let kind = match &error {
            sqlx::Error::Database(database) => Some(database.kind()),
            _ => None,
        };
        match kind {
            Some(ErrorKind::UniqueViolation) => Self::Duplicate(error.to_string()),
            Some(ErrorKind::NotNullViolation) => Self::MissingRequiredField(error.to_string()),
            _ => Self::Database(error),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        Self::Persistence(error.to_string())
    }
}

/// Durable per-user dialog records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, user_id: UserId) -> Result<Option<UserSession>, RepositoryError>;

    /// Creates the row for a first contact; `Duplicate` when it already exists.
    async fn insert_session(&self, user_id: UserId) -> Result<(), RepositoryError>;

    async fn update_fields(
        &self,
        user_id: UserId,
        fields: &ProfileFields,
    ) -> Result<(), RepositoryError>;

    async fn set_scenario_state(
        &self,
        user_id: UserId,
        state: Option<&ScenarioState>,
    ) -> Result<(), RepositoryError>;

    /// Records that the user talked to the bot just now.
    async fn touch(&self, user_id: UserId) -> Result<(), RepositoryError>;

    /// Loads the session, creating the row on first contact.
    async fn get_session(&self, user_id: UserId) -> Result<UserSession, RepositoryError> {
        match self.insert_session(user_id).await {
            Ok(()) => {}
            Err(RepositoryError::Duplicate(_)) => self.touch(user_id).await?,
            Err(error) => return Err(error),
        }

        let session = self.load_session(user_id).await?;
        session.ok_or_else(|| {
            RepositoryError::Decode(format!("dialog row for user {user_id} vanished after insert"))
        })
    }

    /// Flushes the session's queued mutations. No-op when nothing changed.
    async fn persist(&self, session: &mut UserSession) -> Result<(), RepositoryError> {
        let changes = session.take_changes();
        if changes.is_empty() {
            return Ok(());
        }

        if !changes.fields.is_empty() {
            self.update_fields(session.user_id, &changes.fields).await?;
        }
        if let Some(state) = &changes.scenario_state {
            self.set_scenario_state(session.user_id, state.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Earliest event dated `today` or later.
    async fn closest_event(&self, today: NaiveDate) -> Result<Option<Event>, RepositoryError>;

    /// `Duplicate` when the user is already registered for the event.
    async fn register_visitor(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), RepositoryError>;

    async fn insert_event(&self, event: NewEvent) -> Result<Event, RepositoryError>;

    async fn list_events(&self) -> Result<Vec<Event>, RepositoryError>;
}
