pub mod engine;
pub mod steps;

pub use engine::{ScenarioEngine, ScenarioError, ScenarioTransition, StepOutcome};
pub use steps::{
    ProfileBinding, ScenarioBook, ScenarioDefinition, StepDefinition, StepTransition,
};
