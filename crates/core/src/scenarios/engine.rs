use std::sync::Arc;

use thiserror::Error;

use crate::capability::{CapabilityError, CapabilityRegistry, ImageArtifact, ValidatorInput};
use crate::scenarios::{ScenarioBook, ScenarioDefinition, StepDefinition, StepTransition};
use crate::session::{ScenarioContext, ScenarioState, SessionMutation, UserSession};
use crate::template::{self, TemplateError};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario `{active}` is already in progress")]
    AlreadyActive { active: String },
    #[error("no scenario is in progress")]
    NotActive,
    #[error("scenario `{scenario}` is not defined")]
    UnknownScenario { scenario: String },
    #[error("scenario state `{scenario}`/`{step}` no longer matches the catalog: {reason}")]
    Stale { scenario: String, step: String, reason: String },
    #[error("scenario `{scenario}` step `{step}`: {source}")]
    Template { scenario: String, step: String, source: TemplateError },
    #[error("scenario `{scenario}` step `{step}`: {source}")]
    Capability { scenario: String, step: String, source: CapabilityError },
}

impl ScenarioError {
    /// True when the stored state points at a scenario or step the catalog no longer has.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioTransition {
    Started { scenario: String, step: String },
    Rejected { scenario: String, step: String },
    Advanced { scenario: String, from: String, to: String },
    Completed { scenario: String, terminal_step: String },
}

/// Result of one engine call: the text reply plus images to send before it, in order.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub reply: String,
    pub images: Vec<ImageArtifact>,
    pub transition: ScenarioTransition,
}

/// Drives linear scenarios. State lives in the session; the engine only queues mutations.
#[derive(Clone, Debug)]
pub struct ScenarioEngine {
    scenarios: Arc<ScenarioBook>,
    capabilities: Arc<CapabilityRegistry>,
}

impl ScenarioEngine {
    pub fn new(scenarios: Arc<ScenarioBook>, capabilities: Arc<CapabilityRegistry>) -> Self {
        Self { scenarios, capabilities }
    }

    pub fn scenarios(&self) -> &ScenarioBook {
        &self.scenarios
    }

    pub fn start(
        &self,
        scenario_name: &str,
        session: &mut UserSession,
    ) -> Result<StepOutcome, ScenarioError> {
        if let Some(active) = &session.scenario_state {
            return Err(ScenarioError::AlreadyActive { active: active.scenario_name.clone() });
        }
        let scenario = self
            .scenarios
            .get(scenario_name)
            .ok_or_else(|| ScenarioError::UnknownScenario { scenario: scenario_name.to_owned() })?;
        let first = scenario.first_step();

        let context = ScenarioContext::new();
        let reply = render(scenario, first, &first.prompt, &context)?;
        session.apply(SessionMutation::ScenarioState(Some(ScenarioState::new(
            scenario.name(),
            first.name.as_str(),
        ))));

        tracing::info!(
            event_name = "scenario.started",
            user_id = %session.user_id,
            scenario = %scenario.name(),
            step = %first.name,
            "scenario started"
        );
        Ok(StepOutcome {
            reply,
            images: Vec::new(),
            transition: ScenarioTransition::Started {
                scenario: scenario.name().to_owned(),
                step: first.name.clone(),
            },
        })
    }

    pub async fn advance(
        &self,
        utterance: &str,
        session: &mut UserSession,
    ) -> Result<StepOutcome, ScenarioError> {
        let state = session.scenario_state.clone().ok_or(ScenarioError::NotActive)?;
        let (scenario, step) = self.locate(&state)?;
        let StepTransition::Next { validator, error, next_step } = &step.transition else {
            return Err(stale(&state, "current step is terminal"));
        };

        let mut images = Vec::new();
        if let Some(image) = &step.image {
            images.push(self.produce_image(scenario, step, image, &state.context).await?);
        }

        let input = ValidatorInput { user_id: session.user_id, utterance };
        let mut context = state.context.clone();
        let accepted = self
            .capabilities
            .validator(validator)
            .map_err(|source| capability_error(scenario, step, source))?
            .validate(input, &mut context)
            .await
            .map_err(|source| capability_error(scenario, step, source))?;

        if !accepted {
            tracing::debug!(
                event_name = "scenario.input.rejected",
                user_id = %session.user_id,
                scenario = %scenario.name(),
                step = %step.name,
                "step input rejected"
            );
            return Ok(StepOutcome {
                reply: render(scenario, step, error, &state.context)?,
                images,
                transition: ScenarioTransition::Rejected {
                    scenario: scenario.name().to_owned(),
                    step: step.name.clone(),
                },
            });
        }

        let next = scenario.step(next_step).ok_or_else(|| stale(&state, "next step is missing"))?;

        if let StepTransition::Terminal { on_complete } = &next.transition {
            if let Some(hook) = on_complete {
                self.run_completion(scenario, next, hook, input, &mut context).await;
            }
            if let Some(image) = &next.image {
                images.push(self.produce_image(scenario, next, image, &context).await?);
            }
            let reply = render(scenario, next, &next.prompt, &context)?;

            let profile = scenario.profile();
            if let Some(name) = profile.name.as_ref().and_then(|field| context.get(field)) {
                session.apply(SessionMutation::DeclaredName(name.clone()));
            }
            if let Some(email) = profile.email.as_ref().and_then(|field| context.get(field)) {
                session.apply(SessionMutation::DeclaredEmail(email.clone()));
            }
            session.apply(SessionMutation::ScenarioState(None));

            tracing::info!(
                event_name = "scenario.completed",
                user_id = %session.user_id,
                scenario = %scenario.name(),
                step = %next.name,
                "scenario completed"
            );
            return Ok(StepOutcome {
                reply,
                images,
                transition: ScenarioTransition::Completed {
                    scenario: scenario.name().to_owned(),
                    terminal_step: next.name.clone(),
                },
            });
        }

        let reply = render(scenario, next, &next.prompt, &context)?;
        session.apply(SessionMutation::ScenarioState(Some(ScenarioState {
            scenario_name: scenario.name().to_owned(),
            step_name: next.name.clone(),
            context,
        })));

        tracing::info!(
            event_name = "scenario.advanced",
            user_id = %session.user_id,
            scenario = %scenario.name(),
            from = %step.name,
            to = %next.name,
            "scenario advanced"
        );
        Ok(StepOutcome {
            reply,
            images,
            transition: ScenarioTransition::Advanced {
                scenario: scenario.name().to_owned(),
                from: step.name.clone(),
                to: next.name.clone(),
            },
        })
    }

    fn locate(
        &self,
        state: &ScenarioState,
    ) -> Result<(&ScenarioDefinition, &StepDefinition), ScenarioError> {
        let scenario = self
            .scenarios
            .get(&state.scenario_name)
            .ok_or_else(|| stale(state, "scenario is not defined"))?;
        let step =
            scenario.step(&state.step_name).ok_or_else(|| stale(state, "step is not defined"))?;
        Ok((scenario, step))
    }

    async fn produce_image(
        &self,
        scenario: &ScenarioDefinition,
        step: &StepDefinition,
        capability: &str,
        context: &ScenarioContext,
    ) -> Result<ImageArtifact, ScenarioError> {
        self.capabilities
            .image_producer(capability)
            .map_err(|source| capability_error(scenario, step, source))?
            .produce(context)
            .await
            .map_err(|source| capability_error(scenario, step, source))
    }

    /// Completion failures never keep the user inside a finished scenario.
    async fn run_completion(
        &self,
        scenario: &ScenarioDefinition,
        step: &StepDefinition,
        hook: &str,
        input: ValidatorInput<'_>,
        context: &mut ScenarioContext,
    ) {
        let outcome = match self.capabilities.validator(hook) {
            Ok(validator) => validator.validate(input, context).await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                event_name = "scenario.completion.declined",
                user_id = %input.user_id,
                scenario = %scenario.name(),
                step = %step.name,
                capability = %hook,
                "completion hook declined"
            ),
            Err(error) => tracing::warn!(
                event_name = "scenario.completion.failed",
                user_id = %input.user_id,
                scenario = %scenario.name(),
                step = %step.name,
                capability = %hook,
                error = %error,
                "completion hook failed"
            ),
        }
    }
}

fn render(
    scenario: &ScenarioDefinition,
    step: &StepDefinition,
    source: &str,
    context: &ScenarioContext,
) -> Result<String, ScenarioError> {
    template::render(source, context).map_err(|source| ScenarioError::Template {
        scenario: scenario.name().to_owned(),
        step: step.name.clone(),
        source,
    })
}

fn capability_error(
    scenario: &ScenarioDefinition,
    step: &StepDefinition,
    source: CapabilityError,
) -> ScenarioError {
    ScenarioError::Capability {
        scenario: scenario.name().to_owned(),
        step: step.name.clone(),
        source,
    }
}

fn stale(state: &ScenarioState, reason: &str) -> ScenarioError {
    ScenarioError::Stale {
        scenario: state.scenario_name.clone(),
        step: state.step_name.clone(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{ScenarioEngine, ScenarioError, ScenarioTransition};
    use crate::capability::{
        CapabilityError, CapabilityRegistry, ImageArtifact, ImageProducer, Validator,
        ValidatorInput,
    };
    use crate::scenarios::{ProfileBinding, ScenarioBook, ScenarioDefinition, StepDefinition};
    use crate::session::{ScenarioContext, ScenarioState, UserId, UserSession};

    struct FieldValidator {
        field: &'static str,
        accept: fn(&str) -> bool,
    }

    #[async_trait]
    impl Validator for FieldValidator {
        async fn validate(
            &self,
            input: ValidatorInput<'_>,
            context: &mut ScenarioContext,
        ) -> Result<bool, CapabilityError> {
            if !(self.accept)(input.utterance) {
                return Ok(false);
            }
            context.insert(self.field.to_owned(), input.utterance.to_owned());
            Ok(true)
        }
    }

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct RecordingHook {
        journal: Journal,
        fail: bool,
    }

    #[async_trait]
    impl Validator for RecordingHook {
        async fn validate(
            &self,
            _input: ValidatorInput<'_>,
            _context: &mut ScenarioContext,
        ) -> Result<bool, CapabilityError> {
            self.journal.lock().expect("journal").push("complete");
            if self.fail {
                return Err(CapabilityError::failed("save", "not-null violation"));
            }
            Ok(true)
        }
    }

    struct RecordingImage {
        journal: Journal,
    }

    #[async_trait]
    impl ImageProducer for RecordingImage {
        async fn produce(&self, context: &ScenarioContext) -> Result<ImageArtifact, CapabilityError> {
            self.journal.lock().expect("journal").push("image");
            Ok(ImageArtifact {
                file_name: "ticket.svg".to_owned(),
                content_type: "image/svg+xml".to_owned(),
                bytes: context.get("name").cloned().unwrap_or_default().into_bytes(),
            })
        }
    }

    fn looks_like_name(text: &str) -> bool {
        text.chars().all(char::is_alphabetic) && !text.is_empty()
    }

    fn looks_like_email(text: &str) -> bool {
        text.contains('@') && text.contains('.')
    }

    fn engine(terminal: StepDefinition, journal: &Journal, fail_hook: bool) -> ScenarioEngine {
        let profile = ProfileBinding {
            name: Some("name".to_owned()),
            email: Some("email".to_owned()),
        };
        engine_with_profile(terminal, journal, fail_hook, profile)
    }

    fn engine_with_profile(
        terminal: StepDefinition,
        journal: &Journal,
        fail_hook: bool,
        profile: ProfileBinding,
    ) -> ScenarioEngine {
        let scenario = ScenarioDefinition::new("registration", "step1", vec![
            StepDefinition::awaiting("step1", "Name?", "name", "Bad name", "step2"),
            StepDefinition::awaiting("step2", "Email, {{ name }}?", "email", "Bad email", "step3"),
            terminal,
        ])
        .expect("scenario")
        .with_profile(profile);

        let mut registry = CapabilityRegistry::new();
        registry.register_validator("name", FieldValidator { field: "name", accept: looks_like_name });
        registry
            .register_validator("email", FieldValidator { field: "email", accept: looks_like_email });
        registry.register_validator("save", RecordingHook { journal: journal.clone(), fail: fail_hook });
        registry.register_image_producer("ticket", RecordingImage { journal: journal.clone() });

        ScenarioEngine::new(
            Arc::new(ScenarioBook::new(vec![scenario]).expect("book")),
            Arc::new(registry),
        )
    }

    fn plain_terminal() -> StepDefinition {
        StepDefinition::terminal("step3", "Done, {{ name }} <{{ email }}>")
    }

    #[tokio::test]
    async fn walks_the_registration_chain_end_to_end() {
        let journal = Journal::default();
        let engine = engine(plain_terminal(), &journal, false);
        let mut session = UserSession::new(UserId(42));

        let started = engine.start("registration", &mut session).expect("start");
        assert_eq!(started.reply, "Name?");
        assert_eq!(session.scenario_state, Some(ScenarioState::new("registration", "step1")));

        let rejected = engine.advance("not a name!", &mut session).await.expect("advance");
        assert_eq!(rejected.reply, "Bad name");
        assert!(matches!(rejected.transition, ScenarioTransition::Rejected { .. }));

        let advanced = engine.advance("Vova", &mut session).await.expect("advance");
        assert_eq!(advanced.reply, "Email, Vova?");
        let state = session.scenario_state.clone().expect("active");
        assert_eq!(state.step_name, "step2");
        assert_eq!(state.context.get("name").map(String::as_str), Some("Vova"));

        let rejected = engine.advance("bad-email", &mut session).await.expect("advance");
        assert_eq!(rejected.reply, "Bad email");

        let done = engine.advance("a@b.com", &mut session).await.expect("advance");
        assert_eq!(done.reply, "Done, Vova <a@b.com>");
        assert!(matches!(done.transition, ScenarioTransition::Completed { .. }));
        assert!(session.scenario_state.is_none());
        assert_eq!(session.declared_name.as_deref(), Some("Vova"));
        assert_eq!(session.declared_email.as_deref(), Some("a@b.com"));
        assert_eq!(session.take_changes().scenario_state, Some(None));
    }

    #[tokio::test]
    async fn unbound_scenario_leaves_declared_profile_alone() {
        let journal = Journal::default();
        let profile = ProfileBinding { name: Some("name".to_owned()), email: None };
        let engine = engine_with_profile(plain_terminal(), &journal, false, profile);
        let mut session = UserSession::new(UserId(42));

        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("name");
        engine.advance("a@b.com", &mut session).await.expect("email");

        assert_eq!(session.declared_name.as_deref(), Some("Vova"));
        assert!(session.declared_email.is_none());
        let changes = session.take_changes();
        assert!(changes.fields.declared_email.is_none());
    }

    #[tokio::test]
    async fn rejection_leaves_state_untouched_and_repeats_error() {
        let journal = Journal::default();
        let engine = engine(plain_terminal(), &journal, false);
        let mut session = UserSession::new(UserId(1));
        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("advance");
        let before = session.scenario_state.clone();

        let first = engine.advance("nope", &mut session).await.expect("advance");
        let second = engine.advance("nope", &mut session).await.expect("advance");
        assert_eq!(first.reply, second.reply);
        assert_eq!(session.scenario_state, before);
    }

    #[tokio::test]
    async fn start_does_not_reset_active_scenario() {
        let journal = Journal::default();
        let engine = engine(plain_terminal(), &journal, false);
        let mut session = UserSession::new(UserId(1));
        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("advance");

        let error = engine.start("registration", &mut session).expect_err("already active");
        assert!(matches!(error, ScenarioError::AlreadyActive { .. }));
        assert_eq!(session.scenario_state.expect("active").step_name, "step2");
    }

    #[tokio::test]
    async fn completion_runs_before_image_exactly_once() {
        let journal = Journal::default();
        let terminal = plain_terminal().with_on_complete("save").with_image("ticket");
        let engine = engine(terminal, &journal, false);
        let mut session = UserSession::new(UserId(1));
        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("advance");

        let done = engine.advance("a@b.com", &mut session).await.expect("advance");
        assert_eq!(*journal.lock().expect("journal"), vec!["complete", "image"]);
        assert_eq!(done.images.len(), 1);
        assert_eq!(done.images[0].bytes, b"Vova".to_vec());
        assert!(session.scenario_state.is_none());
    }

    #[tokio::test]
    async fn completion_failure_still_clears_state() {
        let journal = Journal::default();
        let terminal = plain_terminal().with_on_complete("save").with_image("ticket");
        let engine = engine(terminal, &journal, true);
        let mut session = UserSession::new(UserId(1));
        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("advance");

        let done = engine.advance("a@b.com", &mut session).await.expect("advance");
        assert!(matches!(done.transition, ScenarioTransition::Completed { .. }));
        assert!(session.scenario_state.is_none());
        assert_eq!(*journal.lock().expect("journal"), vec!["complete", "image"]);
    }

    #[tokio::test]
    async fn awaiting_step_image_is_sent_even_when_input_is_rejected() {
        let journal = Journal::default();
        let scenario = ScenarioDefinition::new("s", "a", vec![
            StepDefinition::awaiting("a", "A?", "name", "Bad", "b").with_image("ticket"),
            StepDefinition::terminal("b", "Bye"),
        ])
        .expect("scenario");
        let mut registry = CapabilityRegistry::new();
        registry.register_validator("name", FieldValidator { field: "name", accept: looks_like_name });
        registry.register_image_producer("ticket", RecordingImage { journal: journal.clone() });
        let engine = ScenarioEngine::new(
            Arc::new(ScenarioBook::new(vec![scenario]).expect("book")),
            Arc::new(registry),
        );

        let mut session = UserSession::new(UserId(1));
        engine.start("s", &mut session).expect("start");
        let rejected = engine.advance("123", &mut session).await.expect("advance");
        assert_eq!(rejected.reply, "Bad");
        assert_eq!(rejected.images.len(), 1);
    }

    #[tokio::test]
    async fn missing_placeholder_propagates_as_error() {
        let journal = Journal::default();
        let terminal = StepDefinition::terminal("step3", "Done, {{ surname }}");
        let engine = engine(terminal, &journal, false);
        let mut session = UserSession::new(UserId(1));
        engine.start("registration", &mut session).expect("start");
        engine.advance("Vova", &mut session).await.expect("advance");

        let error = engine.advance("a@b.com", &mut session).await.expect_err("template");
        assert!(matches!(error, ScenarioError::Template { .. }));
        assert_eq!(session.scenario_state.expect("unchanged").step_name, "step2");
    }

    #[tokio::test]
    async fn stale_state_and_inactive_session_are_reported() {
        let journal = Journal::default();
        let engine = engine(plain_terminal(), &journal, false);

        let mut idle = UserSession::new(UserId(1));
        assert!(matches!(
            engine.advance("hi", &mut idle).await,
            Err(ScenarioError::NotActive)
        ));

        let mut stale = UserSession::restore(
            UserId(2),
            None,
            None,
            None,
            Some(ScenarioState::new("registration", "step9")),
        );
        let error = engine.advance("hi", &mut stale).await.expect_err("stale");
        assert!(error.is_stale());
    }
}
