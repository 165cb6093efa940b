use chrono::{NaiveDate, Utc};
use sqlx::Row;

use meetbot_core::domain::event::{Event, EventId, NewEvent};
use meetbot_core::session::UserId;

use super::{EventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, RepositoryError> {
    let id: i64 = row.try_get("event_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let title: String = row.try_get("title").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let date: String = row.try_get("date").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let location: String =
        row.try_get("location").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let map_point: String =
        row.try_get("map_point").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let note: String = row.try_get("note").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| RepositoryError::Decode(format!("event {id} date `{date}`: {e}")))?;

    Ok(Event { id: EventId(id), title, date, location, map_point, note })
}

#[async_trait::async_trait]
impl EventRepository for SqlEventRepository {
    async fn closest_event(&self, today: NaiveDate) -> Result<Option<Event>, RepositoryError> {
        let row = sqlx::query(
            "SELECT event_id, title, date, location, map_point, note
             FROM events
             WHERE date >= ?
             ORDER BY date ASC, event_id ASC
             LIMIT 1",
        )
        .bind(today.format("%Y-%m-%d").to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    async fn register_visitor(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO event_visitors (event_id, user_id, registered_at)
             VALUES (?, ?, ?)",
        )
        .bind(event_id.0)
        .bind(user_id.0)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO events (title, date, location, map_point, note)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.title)
        .bind(event.date.format("%Y-%m-%d").to_string())
        .bind(&event.location)
        .bind(&event.map_point)
        .bind(&event.note)
        .execute(&self.pool)
        .await?;

        Ok(event.with_id(EventId(result.last_insert_rowid())))
    }

    async fn list_events(&self) -> Result<Vec<Event>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT event_id, title, date, location, map_point, note
             FROM events ORDER BY date ASC, event_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}
