use std::collections::BTreeMap;

use serde::Deserialize;

use crate::capability::{CapabilityKind, CapabilityRegistry};
use crate::catalog::CatalogError;
use crate::template;

/// What happens once a step's input is accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepTransition {
    /// Waits for input checked by `validator`; `error` is shown on rejection.
    Next { validator: String, error: String, next_step: String },
    /// Ends the scenario. `on_complete` runs once when the scenario advances into this step.
    Terminal { on_complete: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepDefinition {
    pub name: String,
    pub prompt: String,
    pub image: Option<String>,
    pub transition: StepTransition,
}

impl StepDefinition {
    pub fn awaiting(
        name: impl Into<String>,
        prompt: impl Into<String>,
        validator: impl Into<String>,
        error: impl Into<String>,
        next_step: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            image: None,
            transition: StepTransition::Next {
                validator: validator.into(),
                error: error.into(),
                next_step: next_step.into(),
            },
        }
    }

    pub fn terminal(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            image: None,
            transition: StepTransition::Terminal { on_complete: None },
        }
    }

    pub fn with_image(mut self, capability: impl Into<String>) -> Self {
        self.image = Some(capability.into());
        self
    }

    /// Only meaningful on terminal steps; ignored otherwise.
    pub fn with_on_complete(mut self, capability: impl Into<String>) -> Self {
        if let StepTransition::Terminal { on_complete } = &mut self.transition {
            *on_complete = Some(capability.into());
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.transition, StepTransition::Terminal { .. })
    }

    fn templates(&self) -> Vec<&str> {
        match &self.transition {
            StepTransition::Next { error, .. } => vec![self.prompt.as_str(), error.as_str()],
            StepTransition::Terminal { .. } => vec![self.prompt.as_str()],
        }
    }
}

/// Context fields a completed scenario copies into the session's declared profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileBinding {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// A named linear chain of steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioDefinition {
    name: String,
    first_step: String,
    steps: BTreeMap<String, StepDefinition>,
    profile: ProfileBinding,
}

impl ScenarioDefinition {
    /// Builds the scenario and checks its shape: unique step names, an existing non-terminal
    /// first step, resolvable `next_step` links and parseable templates.
    pub fn new(
        name: impl Into<String>,
        first_step: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Result<Self, CatalogError> {
        let name = name.into();
        let first_step = first_step.into();

        let mut by_name = BTreeMap::new();
        for step in steps {
            if by_name.contains_key(&step.name) {
                return Err(step_error(&name, &step.name, "duplicate step name"));
            }
            by_name.insert(step.name.clone(), step);
        }

        match by_name.get(&first_step) {
            None => {
                return Err(CatalogError::Scenario {
                    scenario: name,
                    message: format!("first step `{first_step}` is not defined"),
                })
            }
            Some(step) if step.is_terminal() => {
                return Err(CatalogError::Scenario {
                    scenario: name,
                    message: format!("first step `{first_step}` must not be terminal"),
                })
            }
            Some(_) => {}
        }

        for step in by_name.values() {
            if let StepTransition::Next { next_step, .. } = &step.transition {
                if !by_name.contains_key(next_step) {
                    return Err(step_error(
                        &name,
                        &step.name,
                        &format!("next step `{next_step}` is not defined"),
                    ));
                }
            }
            for source in step.templates() {
                template::check(source).map_err(|source| CatalogError::Template {
                    owner: format!("scenario `{name}` step `{}`", step.name),
                    source,
                })?;
            }
        }

        Ok(Self { name, first_step, steps: by_name, profile: ProfileBinding::default() })
    }

    pub fn with_profile(mut self, profile: ProfileBinding) -> Self {
        self.profile = profile;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &ProfileBinding {
        &self.profile
    }

    pub fn first_step(&self) -> &StepDefinition {
        // `new` guarantees the first step exists.
        &self.steps[&self.first_step]
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    /// Checks every capability the steps refer to against the registry.
    pub fn validate_capabilities(&self, registry: &CapabilityRegistry) -> Result<(), CatalogError> {
        for step in self.steps.values() {
            let owner = format!("scenario `{}` step `{}`", self.name, step.name);
            let mut required = Vec::new();
            if let Some(image) = &step.image {
                required.push((image.as_str(), CapabilityKind::ImageProducer));
            }
            match &step.transition {
                StepTransition::Next { validator, .. } => {
                    required.push((validator.as_str(), CapabilityKind::Validator));
                }
                StepTransition::Terminal { on_complete: Some(hook) } => {
                    required.push((hook.as_str(), CapabilityKind::Validator));
                }
                StepTransition::Terminal { on_complete: None } => {}
            }

            for (capability, kind) in required {
                registry
                    .require(capability, kind)
                    .map_err(|source| CatalogError::Capability { owner: owner.clone(), source })?;
            }
        }
        Ok(())
    }
}

/// All scenarios known to the bot, keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScenarioBook {
    scenarios: BTreeMap<String, ScenarioDefinition>,
}

impl ScenarioBook {
    pub fn new(scenarios: Vec<ScenarioDefinition>) -> Result<Self, CatalogError> {
        let mut book = Self::default();
        for scenario in scenarios {
            if book.scenarios.contains_key(scenario.name()) {
                return Err(CatalogError::Scenario {
                    scenario: scenario.name().to_owned(),
                    message: "duplicate scenario name".to_owned(),
                });
            }
            book.scenarios.insert(scenario.name().to_owned(), scenario);
        }
        Ok(book)
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioDefinition> {
        self.scenarios.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scenarios.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScenarioDefinition> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn validate_capabilities(&self, registry: &CapabilityRegistry) -> Result<(), CatalogError> {
        self.scenarios.values().try_for_each(|scenario| scenario.validate_capabilities(registry))
    }
}

fn step_error(scenario: &str, step: &str, message: &str) -> CatalogError {
    CatalogError::Step {
        scenario: scenario.to_owned(),
        step: step.to_owned(),
        message: message.to_owned(),
    }
}
