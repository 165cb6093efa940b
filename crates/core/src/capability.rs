use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{ScenarioContext, UserId, UserSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Validator,
    Responder,
    ImageProducer,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validator => "validator",
            Self::Responder => "responder",
            Self::ImageProducer => "image producer",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability `{name}` is not registered")]
    Unknown { name: String },
    #[error("capability `{name}` is a {actual}, expected a {expected}")]
    KindMismatch { name: String, expected: CapabilityKind, actual: CapabilityKind },
    #[error("capability `{name}` failed: {message}")]
    Failed { name: String, message: String },
}

impl CapabilityError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed { name: name.into(), message: message.into() }
    }
}

/// What a validator sees of the current turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatorInput<'a> {
    pub user_id: UserId,
    pub utterance: &'a str,
}

/// Binary artifact attached to an outgoing message.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImageArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageArtifact")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Accepts (`Ok(true)`) or rejects (`Ok(false)`) the utterance; may record fields in the
/// context when accepting. `Err` is reserved for collaborator failures.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        input: ValidatorInput<'_>,
        context: &mut ScenarioContext,
    ) -> Result<bool, CapabilityError>;
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        session: &UserSession,
        utterance: &str,
    ) -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait ImageProducer: Send + Sync {
    async fn produce(&self, context: &ScenarioContext) -> Result<ImageArtifact, CapabilityError>;
}

#[derive(Clone)]
pub enum Capability {
    Validator(Arc<dyn Validator>),
    Responder(Arc<dyn Responder>),
    ImageProducer(Arc<dyn ImageProducer>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Validator(_) => CapabilityKind::Validator,
            Self::Responder(_) => CapabilityKind::Responder,
            Self::ImageProducer(_) => CapabilityKind::ImageProducer,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability::{:?}", self.kind())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, capability: Capability) {
        self.capabilities.insert(name.into(), capability);
    }

    pub fn register_validator<V>(&mut self, name: impl Into<String>, validator: V)
    where
        V: Validator + 'static,
    {
        self.register(name, Capability::Validator(Arc::new(validator)));
    }

    pub fn register_responder<R>(&mut self, name: impl Into<String>, responder: R)
    where
        R: Responder + 'static,
    {
        self.register(name, Capability::Responder(Arc::new(responder)));
    }

    pub fn register_image_producer<P>(&mut self, name: impl Into<String>, producer: P)
    where
        P: ImageProducer + 'static,
    {
        self.register(name, Capability::ImageProducer(Arc::new(producer)));
    }

    pub fn kind_of(&self, name: &str) -> Option<CapabilityKind> {
        self.capabilities.get(name).map(Capability::kind)
    }

    /// Fails unless `name` is registered with the `expected` kind.
    pub fn require(&self, name: &str, expected: CapabilityKind) -> Result<(), CapabilityError> {
        match self.kind_of(name) {
            None => Err(CapabilityError::Unknown { name: name.to_owned() }),
            Some(actual) if actual != expected => {
                Err(CapabilityError::KindMismatch { name: name.to_owned(), expected, actual })
            }
            Some(_) => Ok(()),
        }
    }

    pub fn validator(&self, name: &str) -> Result<Arc<dyn Validator>, CapabilityError> {
        match self.capabilities.get(name) {
            Some(Capability::Validator(validator)) => Ok(Arc::clone(validator)),
            other => Err(lookup_error(name, other, CapabilityKind::Validator)),
        }
    }

    pub fn responder(&self, name: &str) -> Result<Arc<dyn Responder>, CapabilityError> {
        match self.capabilities.get(name) {
            Some(Capability::Responder(responder)) => Ok(Arc::clone(responder)),
            other => Err(lookup_error(name, other, CapabilityKind::Responder)),
        }
    }

    pub fn image_producer(&self, name: &str) -> Result<Arc<dyn ImageProducer>, CapabilityError> {
        match self.capabilities.get(name) {
            Some(Capability::ImageProducer(producer)) => Ok(Arc::clone(producer)),
            other => Err(lookup_error(name, other, CapabilityKind::ImageProducer)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

fn lookup_error(
    name: &str,
    found: Option<&Capability>,
    expected: CapabilityKind,
) -> CapabilityError {
    match found {
        None => CapabilityError::Unknown { name: name.to_owned() },
        Some(capability) => CapabilityError::KindMismatch {
            name: name.to_owned(),
            expected,
            actual: capability.kind(),
        },
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::{
        CapabilityError, CapabilityKind, CapabilityRegistry, Responder, Validator, ValidatorInput,
    };
    use crate::session::{ScenarioContext, UserId, UserSession};

    struct Echo;

    #[async_trait]
    impl Responder for Echo {
        async fn respond(
            &self,
            _session: &UserSession,
            utterance: &str,
        ) -> Result<String, CapabilityError> {
            Ok(utterance.to_owned())
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl Validator for AcceptAll {
        async fn validate(
            &self,
            input: ValidatorInput<'_>,
            context: &mut ScenarioContext,
        ) -> Result<bool, CapabilityError> {
            context.insert("last".to_owned(), input.utterance.to_owned());
            Ok(true)
        }
    }

    #[tokio::test]
    async fn typed_lookup_returns_registered_capability() {
        let mut registry = CapabilityRegistry::new();
        registry.register_responder("echo", Echo);
        registry.register_validator("accept", AcceptAll);

        let reply = registry
            .responder("echo")
            .expect("responder")
            .respond(&UserSession::new(UserId(1)), "ping")
            .await
            .expect("respond");
        assert_eq!(reply, "ping");

        let mut context = ScenarioContext::new();
        let accepted = registry
            .validator("accept")
            .expect("validator")
            .validate(ValidatorInput { user_id: UserId(1), utterance: "x" }, &mut context)
            .await
            .expect("validate");
        assert!(accepted);
        assert_eq!(context.get("last").map(String::as_str), Some("x"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_and_mismatched_names_are_distinguished() {
        let mut registry = CapabilityRegistry::new();
        registry.register_responder("echo", Echo);

        assert_eq!(
            registry.require("missing", CapabilityKind::Responder),
            Err(CapabilityError::Unknown { name: "missing".to_owned() })
        );
        assert_eq!(
            registry.require("echo", CapabilityKind::Validator),
            Err(CapabilityError::KindMismatch {
                name: "echo".to_owned(),
                expected: CapabilityKind::Validator,
                actual: CapabilityKind::Responder,
            })
        );
        assert!(matches!(
            registry.image_producer("echo"),
            Err(CapabilityError::KindMismatch { .. })
        ));
    }
}
