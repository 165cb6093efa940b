use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use meetbot_core::capability::{CapabilityError, CapabilityRegistry, ImageArtifact};
use meetbot_core::catalog::{BotDefinition, CatalogError};
use meetbot_core::channel::{OutboundChannel, ProfileDirectory};
use meetbot_core::errors::ApplicationError;
use meetbot_core::matcher::normalize_whitespace;
use meetbot_core::router::{Action, IntentRouter};
use meetbot_core::scenarios::{ScenarioEngine, ScenarioError, ScenarioTransition};
use meetbot_core::session::{ScenarioContext, SessionMutation, UserId, UserSession};
use meetbot_core::template::{self, TemplateError};
use meetbot_db::{RepositoryError, SessionStore};

use crate::capabilities::{EMAIL_FIELD, NAME_FIELD};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("session store: {0}")]
    Store(#[from] RepositoryError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<TurnError> for ApplicationError {
    fn from(error: TurnError) -> Self {
        match error {
            TurnError::Store(error) => error.into(),
            TurnError::Scenario(error) => error.into(),
            TurnError::Capability(error) => error.into(),
            TurnError::Template(error) => error.into(),
        }
    }
}

/// What one turn produced and whether it reached the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnReport {
    pub user_id: UserId,
    pub utterance: String,
    /// Matched intent; `None` inside a scenario or when the default reply was used.
    pub intent: Option<String>,
    pub reply: String,
    pub images: usize,
    pub transition: Option<ScenarioTransition>,
    pub delivered: bool,
}

struct Decision {
    intent: Option<String>,
    reply: String,
    images: Vec<ImageArtifact>,
    transition: Option<ScenarioTransition>,
}

/// One conversation turn: load session, decide, send, persist, enrich.
pub struct AgentRuntime {
    store: Arc<dyn SessionStore>,
    router: IntentRouter,
    engine: ScenarioEngine,
    capabilities: Arc<CapabilityRegistry>,
    outbound: Arc<dyn OutboundChannel>,
    profiles: Arc<dyn ProfileDirectory>,
}

impl AgentRuntime {
    /// Fails when the definition references capabilities the registry lacks.
    pub fn new(
        definition: BotDefinition,
        capabilities: CapabilityRegistry,
        store: Arc<dyn SessionStore>,
        outbound: Arc<dyn OutboundChannel>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Result<Self, CatalogError> {
        definition.validate(&capabilities)?;

        let BotDefinition { catalog, scenarios } = definition;
        let capabilities = Arc::new(capabilities);
        Ok(Self {
            store,
            router: IntentRouter::new(Arc::new(catalog)),
            engine: ScenarioEngine::new(Arc::new(scenarios), capabilities.clone()),
            capabilities,
            outbound,
            profiles,
        })
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn engine(&self) -> &ScenarioEngine {
        &self.engine
    }

    pub async fn handle_message(
        &self,
        user_id: UserId,
        text: &str,
        correlation_id: &str,
    ) -> Result<TurnReport, TurnError> {
        let utterance = normalize_whitespace(text);
        info!(
            event_name = "agent.turn.started",
            correlation_id,
            user_id = %user_id,
            utterance = %utterance,
            "turn started"
        );

        let mut session = self.store.get_session(user_id).await?;
        let decision = self.decide(&utterance, &mut session, correlation_id).await?;
        let delivered = self.deliver(user_id, &decision, correlation_id).await;

        self.store.persist(&mut session).await?;

        if session.needs_profile_enrichment() {
            self.enrich(&mut session, correlation_id).await;
        }

        info!(
            event_name = "agent.turn.completed",
            correlation_id,
            user_id = %user_id,
            intent = decision.intent.as_deref().unwrap_or("none"),
            transition = ?decision.transition,
            images = decision.images.len(),
            delivered,
            "turn completed"
        );

        Ok(TurnReport {
            user_id,
            utterance,
            intent: decision.intent,
            reply: decision.reply,
            images: decision.images.len(),
            transition: decision.transition,
            delivered,
        })
    }

    async fn decide(
        &self,
        utterance: &str,
        session: &mut UserSession,
        correlation_id: &str,
    ) -> Result<Decision, TurnError> {
        if session.in_scenario() {
            match self.engine.advance(utterance, session).await {
                Ok(outcome) => {
                    return Ok(Decision {
                        intent: None,
                        reply: outcome.reply,
                        images: outcome.images,
                        transition: Some(outcome.transition),
                    });
                }
                Err(error) if error.is_stale() => {
                    warn!(
                        event_name = "agent.scenario.stale_state_cleared",
                        correlation_id,
                        user_id = %session.user_id,
                        error = %error,
                        "stored scenario state no longer matches the catalog; routing normally"
                    );
                    session.apply(SessionMutation::ScenarioState(None));
                }
                Err(error) => return Err(error.into()),
            }
        }

        let route = self.router.route(utterance, session);
        debug!(
            event_name = "agent.route.decided",
            correlation_id,
            user_id = %session.user_id,
            intent = route.intent.as_deref().unwrap_or("default"),
            action = ?route.action,
            "route decided"
        );

        match route.action {
            Action::Reply(text) => {
                let reply = match route.intent {
                    Some(_) => template::render(&text, &profile_context(session))?,
                    None => text,
                };
                Ok(Decision { intent: route.intent, reply, images: Vec::new(), transition: None })
            }
            Action::Invoke(capability) => {
                let responder = self.capabilities.responder(&capability)?;
                let reply = responder.respond(session, utterance).await?;
                Ok(Decision { intent: route.intent, reply, images: Vec::new(), transition: None })
            }
            Action::StartScenario(scenario) => {
                let outcome = self.engine.start(&scenario, session)?;
                Ok(Decision {
                    intent: route.intent,
                    reply: outcome.reply,
                    images: outcome.images,
                    transition: Some(outcome.transition),
                })
            }
        }
    }

    /// Images first, in production order, then the text. Failures are logged, not retried.
    async fn deliver(&self, user_id: UserId, decision: &Decision, correlation_id: &str) -> bool {
        let mut delivered = true;
        for image in &decision.images {
            if let Err(error) = self.outbound.send_image(user_id, image).await {
                delivered = false;
                warn!(
                    event_name = "agent.outbound.image_failed",
                    correlation_id,
                    user_id = %user_id,
                    file_name = %image.file_name,
                    error = %error,
                    "image delivery failed"
                );
            }
        }

        if let Err(error) = self.outbound.send_text(user_id, &decision.reply).await {
            delivered = false;
            warn!(
                event_name = "agent.outbound.text_failed",
                correlation_id,
                user_id = %user_id,
                error = %error,
                "reply delivery failed"
            );
        }
        delivered
    }

    async fn enrich(&self, session: &mut UserSession, correlation_id: &str) {
        match self.profiles.display_name(session.user_id).await {
            Ok(Some(display_name)) => {
                session.apply(SessionMutation::PlatformDisplayName(display_name));
                if let Err(error) = self.store.persist(session).await {
                    warn!(
                        event_name = "agent.profile.persist_failed",
                        correlation_id,
                        user_id = %session.user_id,
                        error = %error,
                        "failed to store display name"
                    );
                }
            }
            Ok(None) => debug!(
                event_name = "agent.profile.unknown",
                correlation_id,
                user_id = %session.user_id,
                "platform has no display name for user"
            ),
            Err(error) => warn!(
                event_name = "agent.profile.lookup_failed",
                correlation_id,
                user_id = %session.user_id,
                error = %error,
                "profile lookup failed"
            ),
        }
    }
}

/// Fields literal answers may reference.
fn profile_context(session: &UserSession) -> ScenarioContext {
    let mut context = ScenarioContext::new();
    if let Some(name) = &session.declared_name {
        context.insert(NAME_FIELD.to_owned(), name.clone());
    }
    if let Some(email) = &session.declared_email {
        context.insert(EMAIL_FIELD.to_owned(), email.clone());
    }
    context
}
