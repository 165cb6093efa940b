pub mod capability;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod domain;
pub mod errors;
pub mod matcher;
pub mod router;
pub mod scenarios;
pub mod session;
pub mod template;

pub use capability::{
    Capability, CapabilityError, CapabilityKind, CapabilityRegistry, ImageArtifact, ImageProducer,
    Responder, Validator, ValidatorInput,
};
pub use catalog::{
    BotDefinition, CatalogError, IntentAction, IntentCatalog, IntentDefinition, IntentTrigger,
};
pub use channel::{ChannelError, OutboundChannel, ProfileDirectory, RecordingChannel};
pub use domain::event::{Event, EventId, NewEvent};
pub use errors::{ApplicationError, InterfaceError};
pub use router::{Action, IntentRouter, RouteDecision};
pub use scenarios::{
    ProfileBinding, ScenarioBook, ScenarioDefinition, ScenarioEngine, ScenarioError,
    ScenarioTransition, StepDefinition, StepOutcome, StepTransition,
};
pub use session::{
    ProfileFields, ScenarioContext, ScenarioState, SessionChanges, SessionMutation, UserId,
    UserSession,
};
