use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use tokio::sync::RwLock;

use meetbot_core::domain::event::{Event, EventId, NewEvent};
use meetbot_core::session::{ProfileFields, ScenarioState, UserId, UserSession};

use super::{EventRepository, RepositoryError, SessionStore};

#[derive(Clone, Debug, Default)]
struct DialogRow {
    user_name: Option<String>,
    name: Option<String>,
    email: Option<String>,
    scenario_state: Option<ScenarioState>,
    touches: u64,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    dialogs: RwLock<HashMap<UserId, DialogRow>>,
}

impl InMemorySessionStore {
    /// Number of times the row was touched after creation.
    pub async fn touch_count(&self, user_id: UserId) -> Option<u64> {
        self.dialogs.read().await.get(&user_id).map(|row| row.touches)
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_session(&self, user_id: UserId) -> Result<Option<UserSession>, RepositoryError> {
        let dialogs = self.dialogs.read().await;
        Ok(dialogs.get(&user_id).map(|row| {
            UserSession::restore(
                user_id,
                row.user_name.clone(),
                row.name.clone(),
                row.email.clone(),
                row.scenario_state.clone(),
            )
        }))
    }

    async fn insert_session(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut dialogs = self.dialogs.write().await;
        if dialogs.contains_key(&user_id) {
            return Err(RepositoryError::Duplicate(format!("dialogs.user_id = {user_id}")));
        }
        dialogs.insert(user_id, DialogRow::default());
        Ok(())
    }

    async fn update_fields(
        &self,
        user_id: UserId,
        fields: &ProfileFields,
    ) -> Result<(), RepositoryError> {
        let mut dialogs = self.dialogs.write().await;
        if let Some(row) = dialogs.get_mut(&user_id) {
            if let Some(user_name) = &fields.platform_display_name {
                row.user_name = Some(user_name.clone());
            }
            if let Some(name) = &fields.declared_name {
                row.name = Some(name.clone());
            }
            if let Some(email) = &fields.declared_email {
                row.email = Some(email.clone());
            }
        }
        Ok(())
    }

    async fn set_scenario_state(
        &self,
        user_id: UserId,
        state: Option<&ScenarioState>,
    ) -> Result<(), RepositoryError> {
        let mut dialogs = self.dialogs.write().await;
        if let Some(row) = dialogs.get_mut(&user_id) {
            row.scenario_state = state.cloned();
        }
        Ok(())
    }

    async fn touch(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut dialogs = self.dialogs.write().await;
        if let Some(row) = dialogs.get_mut(&user_id) {
            row.touches += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEventRepository {
    events: RwLock<Vec<Event>>,
    visitors: RwLock<BTreeSet<(i64, i64)>>,
}

impl InMemoryEventRepository {
    pub async fn is_registered(&self, event_id: EventId, user_id: UserId) -> bool {
        self.visitors.read().await.contains(&(event_id.0, user_id.0))
    }
}

#[async_trait::async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn closest_event(&self, today: NaiveDate) -> Result<Option<Event>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.is_upcoming(today))
            .min_by_key(|event| (event.date, event.id.0))
            .cloned())
    }

    async fn register_visitor(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), RepositoryError> {
        let mut visitors = self.visitors.write().await;
        if !visitors.insert((event_id.0, user_id.0)) {
            return Err(RepositoryError::Duplicate(format!(
                "event_visitors ({}, {user_id})",
                event_id.0
            )));
        }
        Ok(())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event, RepositoryError> {
        let mut events = self.events.write().await;
        let next_id = events.iter().map(|event| event.id.0).max().unwrap_or(0) + 1;
        let event = event.with_id(EventId(next_id));
        events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self) -> Result<Vec<Event>, RepositoryError> {
        let mut events = self.events.read().await.clone();
        events.sort_by_key(|event| (event.date, event.id.0));
        Ok(events)
    }
}
