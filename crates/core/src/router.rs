use std::sync::Arc;

use crate::catalog::{IntentAction, IntentCatalog};
use crate::session::UserSession;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Reply(String),
    Invoke(String),
    StartScenario(String),
}

/// Routing outcome; `intent` is `None` when the default reply was produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    pub intent: Option<String>,
    pub action: Action,
}

/// Picks the first catalog intent satisfied by an utterance.
#[derive(Clone, Debug)]
pub struct IntentRouter {
    catalog: Arc<IntentCatalog>,
}

impl IntentRouter {
    pub fn new(catalog: Arc<IntentCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &IntentCatalog {
        &self.catalog
    }

    /// The session is accepted for future intents that depend on it; matching ignores it today.
    pub fn route(&self, utterance: &str, _session: &UserSession) -> RouteDecision {
        let matched = self.catalog.intents().iter().find(|intent| intent.matches(utterance));

        match matched {
            Some(intent) => {
                let action = match &intent.action {
                    IntentAction::Answer(text) => Action::Reply(text.clone()),
                    IntentAction::Capability(name) => Action::Invoke(name.clone()),
                    IntentAction::Scenario(name) => Action::StartScenario(name.clone()),
                };
                tracing::debug!(
                    event_name = "router.intent.matched",
                    intent = %intent.name,
                    action = ?action,
                    "intent matched"
                );
                RouteDecision { intent: Some(intent.name.clone()), action }
            }
            None => {
                tracing::debug!(event_name = "router.intent.default", "no intent matched");
                RouteDecision {
                    intent: None,
                    action: Action::Reply(self.catalog.default_answer().to_owned()),
                }
            }
        }
    }
}
