use chrono::Utc;
use sqlx::Row;

use meetbot_core::session::{ProfileFields, ScenarioState, UserId, UserSession};

use super::{RepositoryError, SessionStore};
use crate::DbPool;

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<UserSession, RepositoryError> {
    let user_id: i64 =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_name: Option<String> =
        row.try_get("user_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: Option<String> =
        row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let email: Option<String> =
        row.try_get("email").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let scenario_state: Option<String> =
        row.try_get("scenario_state").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let scenario_state = scenario_state
        .map(|raw| serde_json::from_str::<ScenarioState>(&raw))
        .transpose()
        .map_err(|e| RepositoryError::Decode(format!("scenario_state for user {user_id}: {e}")))?;

    Ok(UserSession::restore(UserId(user_id), user_name, name, email, scenario_state))
}

async fn write_fields<'e, E>(
    executor: E,
    user_id: UserId,
    fields: &ProfileFields,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "UPDATE dialogs SET
             user_name = COALESCE(?, user_name),
             name = COALESCE(?, name),
             email = COALESCE(?, email),
             last_dialog = ?
         WHERE user_id = ?",
    )
    .bind(&fields.platform_display_name)
    .bind(&fields.declared_name)
    .bind(&fields.declared_email)
    .bind(Utc::now().to_rfc3339())
    .bind(user_id.0)
    .execute(executor)
    .await?;

    Ok(())
}

async fn write_scenario_state<'e, E>(
    executor: E,
    user_id: UserId,
    state: Option<&ScenarioState>,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let encoded = state
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    sqlx::query("UPDATE dialogs SET scenario_state = ? WHERE user_id = ?")
        .bind(encoded)
        .bind(user_id.0)
        .execute(executor)
        .await?;

    Ok(())
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn load_session(&self, user_id: UserId) -> Result<Option<UserSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT user_id, user_name, name, email, scenario_state
             FROM dialogs WHERE user_id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn insert_session(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO dialogs (user_id, first_dialog, last_dialog)
             VALUES (?, ?, ?)",
        )
        .bind(user_id.0)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_fields(
        &self,
        user_id: UserId,
        fields: &ProfileFields,
    ) -> Result<(), RepositoryError> {
        write_fields(&self.pool, user_id, fields).await
    }

    async fn set_scenario_state(
        &self,
        user_id: UserId,
        state: Option<&ScenarioState>,
    ) -> Result<(), RepositoryError> {
        write_scenario_state(&self.pool, user_id, state).await
    }

    async fn touch(&self, user_id: UserId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE dialogs SET last_dialog = ? WHERE user_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Profile fields and scenario state commit in one transaction.
    async fn persist(&self, session: &mut UserSession) -> Result<(), RepositoryError> {
        let changes = session.take_changes();
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        if !changes.fields.is_empty() {
            write_fields(&mut *tx, session.user_id, &changes.fields).await?;
        }
        if let Some(state) = &changes.scenario_state {
            write_scenario_state(&mut *tx, session.user_id, state.as_ref()).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meetbot_core::session::{ScenarioState, SessionMutation, UserId};

    use super::SqlSessionStore;
    use crate::repositories::{RepositoryError, SessionStore};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn first_contact_creates_default_row() {
        let store = SqlSessionStore::new(pool().await);

        let session = store.get_session(UserId(8023886)).await.expect("session");
        assert_eq!(session.user_id, UserId(8023886));
        assert!(session.platform_display_name.is_none());
        assert!(session.scenario_state.is_none());
        assert!(session.needs_profile_enrichment());
    }

    #[tokio::test]
    async fn second_insert_reports_duplicate_and_get_session_recovers() {
        let store = SqlSessionStore::new(pool().await);
        store.insert_session(UserId(5)).await.expect("first insert");

        let error = store.insert_session(UserId(5)).await.expect_err("duplicate");
        assert!(matches!(error, RepositoryError::Duplicate(_)));

        store.get_session(UserId(5)).await.expect("get_session falls back to touch");
    }

    #[tokio::test]
    async fn persist_writes_fields_and_scenario_state_once() {
        let store = SqlSessionStore::new(pool().await);
        let mut session = store.get_session(UserId(9)).await.expect("session");

        let mut state = ScenarioState::new("registration", "step2");
        state.context.insert("name".to_owned(), "Vova".to_owned());
        session.apply(SessionMutation::PlatformDisplayName("Ivanov Vladimir".to_owned()));
        session.apply(SessionMutation::ScenarioState(Some(state.clone())));
        store.persist(&mut session).await.expect("persist");
        assert!(!session.has_pending_changes());

        let reloaded = store.get_session(UserId(9)).await.expect("reload");
        assert_eq!(reloaded.platform_display_name.as_deref(), Some("Ivanov Vladimir"));
        assert_eq!(reloaded.scenario_state, Some(state));

        let mut reloaded = reloaded;
        reloaded.apply(SessionMutation::DeclaredName("Vova".to_owned()));
        reloaded.apply(SessionMutation::ScenarioState(None));
        store.persist(&mut reloaded).await.expect("persist clear");

        let cleared = store.get_session(UserId(9)).await.expect("reload");
        assert!(cleared.scenario_state.is_none());
        assert_eq!(cleared.declared_name.as_deref(), Some("Vova"));
        assert_eq!(cleared.platform_display_name.as_deref(), Some("Ivanov Vladimir"));
    }

    #[tokio::test]
    async fn failed_state_write_rolls_back_the_field_write() {
        let pool = pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let mut session = store.get_session(UserId(11)).await.expect("session");
        sqlx::query(
            "CREATE TRIGGER reject_state BEFORE UPDATE OF scenario_state ON dialogs
             BEGIN SELECT RAISE(ABORT, 'scenario state is read-only'); END",
        )
        .execute(&pool)
        .await
        .expect("trigger");

        session.apply(SessionMutation::DeclaredName("Vova".to_owned()));
        session.apply(SessionMutation::DeclaredEmail("vova@example.com".to_owned()));
        session.apply(SessionMutation::ScenarioState(None));
        store.persist(&mut session).await.expect_err("state write is rejected");

        let reloaded = store.load_session(UserId(11)).await.expect("load").expect("row");
        assert!(reloaded.declared_name.is_none());
        assert!(reloaded.declared_email.is_none());
    }

    #[tokio::test]
    async fn null_in_a_required_column_is_a_missing_field() {
        let pool = pool().await;
        let error = sqlx::query("INSERT INTO dialogs (user_id, last_dialog) VALUES (?, ?)")
            .bind(12_i64)
            .bind("2024-01-01T00:00:00+00:00")
            .execute(&pool)
            .await
            .map_err(RepositoryError::from)
            .expect_err("first_dialog is NOT NULL");

        assert!(matches!(error, RepositoryError::MissingRequiredField(_)), "{error:?}");
        assert!(!error.is_duplicate());
    }

    #[tokio::test]
    async fn corrupt_scenario_state_is_a_decode_error() {
        let pool = pool().await;
        let store = SqlSessionStore::new(pool.clone());
        store.get_session(UserId(3)).await.expect("session");
        sqlx::query("UPDATE dialogs SET scenario_state = '{not json' WHERE user_id = 3")
            .execute(&pool)
            .await
            .expect("corrupt row");

        let error = store.load_session(UserId(3)).await.expect_err("decode");
        assert!(matches!(error, RepositoryError::Decode(_)));
    }
}
