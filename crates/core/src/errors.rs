use thiserror::Error;

use crate::capability::CapabilityError;
use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::scenarios::ScenarioError;
use crate::template::TemplateError;

/// Coarse failure classes used when a turn or a command has to be reported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    /// Configuration failures need an operator; the others may clear up on the next turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

impl From<ConfigError> for ApplicationError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<CatalogError> for ApplicationError {
    fn from(value: CatalogError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<TemplateError> for ApplicationError {
    fn from(value: TemplateError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<CapabilityError> for ApplicationError {
    fn from(value: CapabilityError) -> Self {
        match value {
            CapabilityError::Failed { .. } => Self::Integration(value.to_string()),
            CapabilityError::Unknown { .. } | CapabilityError::KindMismatch { .. } => {
                Self::Configuration(value.to_string())
            }
        }
    }
}

impl From<ScenarioError> for ApplicationError {
    fn from(value: ScenarioError) -> Self {
        match value {
            ScenarioError::Capability { source: CapabilityError::Failed { .. }, .. } => {
                Self::Integration(value.to_string())
            }
            other => Self::Configuration(other.to_string()),
        }
    }
}
