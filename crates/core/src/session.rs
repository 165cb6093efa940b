use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Values collected by scenario validators, keyed by field name.
pub type ScenarioContext = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a user inside a running scenario.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioState {
    pub scenario_name: String,
    pub step_name: String,
    #[serde(default)]
    pub context: ScenarioContext,
}

impl ScenarioState {
    pub fn new(scenario_name: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            step_name: step_name.into(),
            context: ScenarioContext::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionMutation {
    PlatformDisplayName(String),
    DeclaredName(String),
    DeclaredEmail(String),
    ScenarioState(Option<ScenarioState>),
}

/// Profile columns to overwrite; `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileFields {
    pub platform_display_name: Option<String>,
    pub declared_name: Option<String>,
    pub declared_email: Option<String>,
}

impl ProfileFields {
    pub fn is_empty(&self) -> bool {
        self.platform_display_name.is_none()
            && self.declared_name.is_none()
            && self.declared_email.is_none()
    }
}

/// Pending writes of one turn, folded so each column is written at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionChanges {
    pub fields: ProfileFields,
    /// `Some(None)` clears the stored scenario state.
    pub scenario_state: Option<Option<ScenarioState>>,
}

impl SessionChanges {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.scenario_state.is_none()
    }
}

/// Durable per-user record as loaded at the start of a turn.
///
/// Mutations go through [`UserSession::apply`], which updates the in-memory copy and queues
/// the write; the store flushes the queue once at the end of the turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSession {
    pub user_id: UserId,
    pub platform_display_name: Option<String>,
    pub declared_name: Option<String>,
    pub declared_email: Option<String>,
    pub scenario_state: Option<ScenarioState>,
    pending: Vec<SessionMutation>,
}

impl UserSession {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            platform_display_name: None,
            declared_name: None,
            declared_email: None,
            scenario_state: None,
            pending: Vec::new(),
        }
    }

    pub fn restore(
        user_id: UserId,
        platform_display_name: Option<String>,
        declared_name: Option<String>,
        declared_email: Option<String>,
        scenario_state: Option<ScenarioState>,
    ) -> Self {
        Self {
            user_id,
            platform_display_name,
            declared_name,
            declared_email,
            scenario_state,
            pending: Vec::new(),
        }
    }

    pub fn apply(&mut self, mutation: SessionMutation) {
        match &mutation {
            SessionMutation::PlatformDisplayName(value) => {
                self.platform_display_name = Some(value.clone());
            }
            SessionMutation::DeclaredName(value) => self.declared_name = Some(value.clone()),
            SessionMutation::DeclaredEmail(value) => self.declared_email = Some(value.clone()),
            SessionMutation::ScenarioState(state) => self.scenario_state = state.clone(),
        }
        self.pending.push(mutation);
    }

    pub fn with(mut self, mutation: SessionMutation) -> Self {
        self.apply(mutation);
        self
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drains queued mutations into a single write; later mutations of a column win.
    pub fn take_changes(&mut self) -> SessionChanges {
        let mut changes = SessionChanges::default();
        for mutation in self.pending.drain(..) {
            match mutation {
                SessionMutation::PlatformDisplayName(value) => {
                    changes.fields.platform_display_name = Some(value);
                }
                SessionMutation::DeclaredName(value) => changes.fields.declared_name = Some(value),
                SessionMutation::DeclaredEmail(value) => {
                    changes.fields.declared_email = Some(value);
                }
                SessionMutation::ScenarioState(state) => changes.scenario_state = Some(state),
            }
        }
        changes
    }

    pub fn in_scenario(&self) -> bool {
        self.scenario_state.is_some()
    }

    pub fn needs_profile_enrichment(&self) -> bool {
        self.platform_display_name.as_deref().map_or(true, str::is_empty)
    }
}
