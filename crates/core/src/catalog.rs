//! Intent catalog and scenario definitions, loaded once from TOML and immutable afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::capability::{CapabilityError, CapabilityKind, CapabilityRegistry};
use crate::config::BotConfig;
use crate::matcher;
use crate::scenarios::{
    ProfileBinding, ScenarioBook, ScenarioDefinition, StepDefinition, StepTransition,
};
use crate::template::{self, TemplateError};

const BUILTIN_CATALOG: &str = include_str!("../../../config/catalog.toml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read catalog file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("intent `{intent}` is invalid: {message}")]
    Intent { intent: String, message: String },
    #[error("scenario `{scenario}` is invalid: {message}")]
    Scenario { scenario: String, message: String },
    #[error("scenario `{scenario}` step `{step}` is invalid: {message}")]
    Step { scenario: String, step: String, message: String },
    #[error("{owner} refers to an unusable capability: {source}")]
    Capability { owner: String, source: CapabilityError },
    #[error("{owner} has a broken template: {source}")]
    Template { owner: String, source: TemplateError },
}

/// How an intent recognizes an utterance.
#[derive(Clone, Debug)]
pub enum IntentTrigger {
    /// Fuzzy match of any utterance token against any standard token.
    Tokens { tokens: Vec<String>, min_ratio: f32 },
    /// Pattern searched anywhere in the raw utterance.
    Pattern(Regex),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentAction {
    Answer(String),
    Capability(String),
    Scenario(String),
}

#[derive(Clone, Debug)]
pub struct IntentDefinition {
    pub name: String,
    pub trigger: IntentTrigger,
    pub action: IntentAction,
}

impl IntentDefinition {
    pub fn tokens<I, S>(
        name: impl Into<String>,
        tokens: I,
        min_ratio: f32,
        action: IntentAction,
    ) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.iter().all(|token| token.trim().is_empty()) {
            return Err(intent_error(&name, "token trigger needs at least one token"));
        }
        if !(0.0..=1.0).contains(&min_ratio) {
            return Err(intent_error(&name, &format!("min_ratio {min_ratio} is outside 0..=1")));
        }
        Ok(Self { name, trigger: IntentTrigger::Tokens { tokens, min_ratio }, action })
    }

    pub fn pattern(
        name: impl Into<String>,
        pattern: &str,
        case_insensitive: bool,
        action: IntentAction,
    ) -> Result<Self, CatalogError> {
        let name = name.into();
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|error| intent_error(&name, &format!("pattern does not compile: {error}")))?;
        Ok(Self { name, trigger: IntentTrigger::Pattern(regex), action })
    }

    pub fn matches(&self, utterance: &str) -> bool {
        match &self.trigger {
            IntentTrigger::Tokens { tokens, min_ratio } => {
                matcher::words_match(tokens, &matcher::tokenize(utterance), *min_ratio)
            }
            IntentTrigger::Pattern(regex) => regex.is_match(utterance),
        }
    }
}

/// Ordered intents; declaration order is priority order.
#[derive(Clone, Debug)]
pub struct IntentCatalog {
    intents: Vec<IntentDefinition>,
    default_answer: String,
}

impl IntentCatalog {
    pub fn new(intents: Vec<IntentDefinition>, default_answer: impl Into<String>) -> Self {
        Self { intents, default_answer: default_answer.into() }
    }

    pub fn intents(&self) -> &[IntentDefinition] {
        &self.intents
    }

    pub fn default_answer(&self) -> &str {
        &self.default_answer
    }

    pub fn with_default_answer(mut self, default_answer: impl Into<String>) -> Self {
        self.default_answer = default_answer.into();
        self
    }
}

/// Everything the bot reacts to: the intent catalog plus the scenarios it can start.
#[derive(Clone, Debug)]
pub struct BotDefinition {
    pub catalog: IntentCatalog,
    pub scenarios: ScenarioBook,
}

impl BotDefinition {
    pub fn new(catalog: IntentCatalog, scenarios: ScenarioBook) -> Result<Self, CatalogError> {
        for intent in catalog.intents() {
            match &intent.action {
                IntentAction::Scenario(scenario) if !scenarios.contains(scenario) => {
                    return Err(intent_error(
                        &intent.name,
                        &format!("starts unknown scenario `{scenario}`"),
                    ));
                }
                IntentAction::Answer(answer) => {
                    template::check(answer).map_err(|source| CatalogError::Template {
                        owner: format!("intent `{}`", intent.name),
                        source,
                    })?;
                }
                _ => {}
            }
        }
        Ok(Self { catalog, scenarios })
    }

    /// The catalog shipped with the bot (`config/catalog.toml`).
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogError::ReadFile { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` when given, the built-in catalog otherwise.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    /// Catalog named by `bot.catalog_path` (built-in otherwise) with the configured
    /// default answer applied.
    pub fn from_config(bot: &BotConfig) -> Result<Self, CatalogError> {
        let Self { catalog, scenarios } = Self::load_or_builtin(bot.catalog_path.as_deref())?;
        let catalog = match &bot.default_answer {
            Some(answer) => catalog.with_default_answer(answer.clone()),
            None => catalog,
        };
        Ok(Self { catalog, scenarios })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let document = toml::from_str::<RawBotDefinition>(raw)?;

        let intents = document
            .intents
            .into_iter()
            .map(RawIntent::into_definition)
            .collect::<Result<Vec<_>, _>>()?;

        let scenarios = document
            .scenarios
            .into_iter()
            .map(|(name, scenario)| scenario.into_definition(name))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(IntentCatalog::new(intents, document.default_answer), ScenarioBook::new(scenarios)?)
    }

    /// Fails fast when any referenced capability is missing or has the wrong kind.
    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<(), CatalogError> {
        for intent in self.catalog.intents() {
            if let IntentAction::Capability(capability) = &intent.action {
                registry.require(capability, CapabilityKind::Responder).map_err(|source| {
                    CatalogError::Capability { owner: format!("intent `{}`", intent.name), source }
                })?;
            }
        }
        self.scenarios.validate_capabilities(registry)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBotDefinition {
    default_answer: String,
    #[serde(default)]
    intents: Vec<RawIntent>,
    #[serde(default)]
    scenarios: BTreeMap<String, RawScenario>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIntent {
    name: String,
    tokens: Option<Vec<String>>,
    min_ratio: Option<f32>,
    pattern: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
    answer: Option<String>,
    capability: Option<String>,
    scenario: Option<String>,
}

impl RawIntent {
    fn into_definition(self) -> Result<IntentDefinition, CatalogError> {
        let action = match (self.answer, self.capability, self.scenario) {
            (Some(answer), None, None) => IntentAction::Answer(answer),
            (None, Some(capability), None) => IntentAction::Capability(capability),
            (None, None, Some(scenario)) => IntentAction::Scenario(scenario),
            _ => {
                return Err(intent_error(
                    &self.name,
                    "exactly one of `answer`, `capability`, `scenario` must be set",
                ))
            }
        };

        match (self.tokens, self.min_ratio, self.pattern) {
            (Some(tokens), Some(min_ratio), None) => {
                IntentDefinition::tokens(self.name, tokens, min_ratio, action)
            }
            (Some(_), None, None) => {
                Err(intent_error(&self.name, "token trigger requires `min_ratio`"))
            }
            (None, None, Some(pattern)) => {
                IntentDefinition::pattern(self.name, &pattern, self.case_insensitive, action)
            }
            _ => Err(intent_error(
                &self.name,
                "exactly one trigger must be set: `tokens` + `min_ratio`, or `pattern`",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScenario {
    first_step: String,
    steps: BTreeMap<String, RawStep>,
    #[serde(default)]
    profile: ProfileBinding,
}

impl RawScenario {
    fn into_definition(self, name: String) -> Result<ScenarioDefinition, CatalogError> {
        let steps = self
            .steps
            .into_iter()
            .map(|(step_name, step)| step.into_definition(&name, step_name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ScenarioDefinition::new(name, self.first_step, steps)?.with_profile(self.profile))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    prompt: String,
    validator: Option<String>,
    error: Option<String>,
    next_step: Option<String>,
    on_complete: Option<String>,
    image: Option<String>,
}

impl RawStep {
    fn into_definition(self, scenario: &str, name: String) -> Result<StepDefinition, CatalogError> {
        let step_error = |message: &str| CatalogError::Step {
            scenario: scenario.to_owned(),
            step: name.clone(),
            message: message.to_owned(),
        };

        let transition = match self.next_step {
            Some(next_step) => {
                if self.on_complete.is_some() {
                    return Err(step_error("`on_complete` is only allowed on terminal steps"));
                }
                let validator =
                    self.validator.ok_or_else(|| step_error("non-terminal step needs `validator`"))?;
                let error =
                    self.error.ok_or_else(|| step_error("non-terminal step needs `error`"))?;
                StepTransition::Next { validator, error, next_step }
            }
            None => {
                if self.validator.is_some() || self.error.is_some() {
                    return Err(step_error(
                        "terminal step takes no input: drop `validator` and `error`",
                    ));
                }
                StepTransition::Terminal { on_complete: self.on_complete }
            }
        };

        Ok(StepDefinition { name, prompt: self.prompt, image: self.image, transition })
    }
}

fn intent_error(intent: &str, message: &str) -> CatalogError {
    CatalogError::Intent { intent: intent.to_owned(), message: message.to_owned() }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::{BotDefinition, CatalogError, IntentAction, IntentDefinition, IntentTrigger};
    use crate::capability::{
        CapabilityError, CapabilityRegistry, ImageArtifact, ImageProducer, Responder, Validator,
        ValidatorInput,
    };
    use crate::config::{BotConfig, DEFAULT_DATE_FORMAT};
    use crate::session::{ScenarioContext, UserSession};

    const SAMPLE: &str = r#"
default_answer = "Say something else!"

[[intents]]
name = "Greeting"
tokens = ["hello", "hi"]
min_ratio = 0.7
capability = "greeting"

[[intents]]
name = "Polite greeting"
pattern = "good (morning|evening)"
case_insensitive = true
answer = "Good day to you too"

[[intents]]
name = "Registration"
tokens = ["register"]
min_ratio = 0.6
scenario = "registration"

[scenarios.registration]
first_step = "step1"

[scenarios.registration.profile]
name = "name"

[scenarios.registration.steps.step1]
prompt = "Your name?"
validator = "name"
error = "Bad name"
next_step = "step2"

[scenarios.registration.steps.step2]
prompt = "Thanks, {{ name }}!"
on_complete = "save"
image = "ticket"
"#;

    struct Stub;

    #[async_trait]
    impl Responder for Stub {
        async fn respond(&self, _: &UserSession, _: &str) -> Result<String, CapabilityError> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl Validator for Stub {
        async fn validate(
            &self,
            _: ValidatorInput<'_>,
            _: &mut ScenarioContext,
        ) -> Result<bool, CapabilityError> {
            Ok(true)
        }
    }

    #[async_trait]
    impl ImageProducer for Stub {
        async fn produce(&self, _: &ScenarioContext) -> Result<ImageArtifact, CapabilityError> {
            Ok(ImageArtifact {
                file_name: "t.svg".to_owned(),
                content_type: "image/svg+xml".to_owned(),
                bytes: Vec::new(),
            })
        }
    }

    fn full_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register_responder("greeting", Stub);
        registry.register_validator("name", Stub);
        registry.register_validator("save", Stub);
        registry.register_image_producer("ticket", Stub);
        registry
    }

    #[test]
    fn parses_intents_in_declared_order() {
        let definition = BotDefinition::from_toml_str(SAMPLE).expect("valid catalog");
        let names: Vec<_> =
            definition.catalog.intents().iter().map(|intent| intent.name.as_str()).collect();
        assert_eq!(names, vec!["Greeting", "Polite greeting", "Registration"]);
        assert_eq!(definition.catalog.default_answer(), "Say something else!");
        assert!(matches!(
            definition.catalog.intents()[1].trigger,
            IntentTrigger::Pattern(ref regex) if regex.is_match("GOOD MORNING, bot")
        ));

        let scenario = definition.scenarios.get("registration").expect("scenario");
        assert_eq!(scenario.first_step().name, "step1");
        assert!(scenario.step("step2").expect("step2").is_terminal());
        assert_eq!(scenario.profile().name.as_deref(), Some("name"));
        assert_eq!(scenario.profile().email, None);
    }

    #[test]
    fn validation_passes_with_complete_registry() {
        let definition = BotDefinition::from_toml_str(SAMPLE).expect("valid catalog");
        definition.validate(&full_registry()).expect("all capabilities registered");
    }

    #[test]
    fn unknown_capability_fails_at_load_time() {
        let definition = BotDefinition::from_toml_str(SAMPLE).expect("valid catalog");
        let mut registry = full_registry();
        registry.register_responder("ticket", Stub);

        let error = definition.validate(&registry).expect_err("kind mismatch");
        assert!(matches!(
            error,
            CatalogError::Capability { source: CapabilityError::KindMismatch { .. }, .. }
        ));

        let error = definition.validate(&CapabilityRegistry::new()).expect_err("empty registry");
        assert!(matches!(
            error,
            CatalogError::Capability { source: CapabilityError::Unknown { .. }, .. }
        ));
    }

    #[test]
    fn intent_needs_exactly_one_trigger_and_one_action() {
        let two_actions = r#"
default_answer = "?"
[[intents]]
name = "Both"
tokens = ["hi"]
min_ratio = 0.5
answer = "a"
capability = "b"
"#;
        assert!(matches!(
            BotDefinition::from_toml_str(two_actions),
            Err(CatalogError::Intent { ref intent, .. }) if intent == "Both"
        ));

        let two_triggers = r#"
default_answer = "?"
[[intents]]
name = "Both"
tokens = ["hi"]
min_ratio = 0.5
pattern = "hi"
answer = "a"
"#;
        assert!(matches!(
            BotDefinition::from_toml_str(two_triggers),
            Err(CatalogError::Intent { .. })
        ));

        let no_trigger = r#"
default_answer = "?"
[[intents]]
name = "None"
answer = "a"
"#;
        assert!(BotDefinition::from_toml_str(no_trigger).is_err());
    }

    #[test]
    fn rejects_out_of_range_ratio_and_bad_pattern() {
        assert!(IntentDefinition::tokens("r", ["hi"], 1.5, IntentAction::Answer("a".into()))
            .is_err());
        assert!(IntentDefinition::pattern("p", "(unclosed", false, IntentAction::Answer(
            "a".into()
        ))
        .is_err());
    }

    #[test]
    fn rejects_unknown_scenario_reference() {
        let raw = r#"
default_answer = "?"
[[intents]]
name = "Start"
tokens = ["go"]
min_ratio = 0.9
scenario = "missing"
"#;
        assert!(matches!(BotDefinition::from_toml_str(raw), Err(CatalogError::Intent { .. })));
    }

    #[test]
    fn terminal_step_with_validator_is_rejected() {
        let raw = r#"
default_answer = "?"
[scenarios.s]
first_step = "a"
[scenarios.s.steps.a]
prompt = "A"
validator = "v"
error = "e"
next_step = "b"
[scenarios.s.steps.b]
prompt = "B"
validator = "v"
"#;
        assert!(matches!(BotDefinition::from_toml_str(raw), Err(CatalogError::Step { .. })));
    }

    #[test]
    fn builtin_catalog_loads() {
        let definition = BotDefinition::builtin().expect("builtin catalog must parse");
        let registration = definition.scenarios.get("registration").expect("registration");
        assert_eq!(registration.profile().email.as_deref(), Some("email"));
        assert!(!definition.catalog.intents().is_empty());
    }

    #[test]
    fn configured_default_answer_replaces_the_catalog_one() {
        let bot = BotConfig {
            catalog_path: None,
            default_answer: Some("Не понял".to_owned()),
            date_format: DEFAULT_DATE_FORMAT.to_owned(),
        };
        let definition = BotDefinition::from_config(&bot).expect("definition");
        assert_eq!(definition.catalog.default_answer(), "Не понял");
        assert!(definition.scenarios.contains("registration"));
    }
}
