pub mod chat;
pub mod config;
pub mod doctor;
pub mod migrate;
pub mod seed;
pub mod start;

use std::sync::Arc;

use meetbot_agent::{default_registry, CapabilitySettings};
use meetbot_core::capability::CapabilityRegistry;
use meetbot_core::catalog::BotDefinition;
use meetbot_core::config::{AppConfig, LoadOptions};
use meetbot_db::{connect_with_settings, migrations, DbPool, EventRepository};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// Error class, message and exit code of a failed step.
pub(crate) type StepFailure = (&'static str, String, u8);

pub(crate) fn load_config(command: &str, offline: bool) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions { offline, ..LoadOptions::default() }).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

/// Connects and applies pending migrations.
pub(crate) async fn open_database(config: &AppConfig) -> Result<DbPool, StepFailure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    Ok(pool)
}

/// Loads the configured catalog and checks it against the capability registry.
pub(crate) fn load_bot(
    config: &AppConfig,
    events: Arc<dyn EventRepository>,
) -> Result<(BotDefinition, CapabilityRegistry), StepFailure> {
    let definition = BotDefinition::from_config(&config.bot)
        .map_err(|error| ("catalog", error.to_string(), 7u8))?;
    let registry = default_registry(events, CapabilitySettings::from_config(&config.bot))
        .map_err(|error| ("capabilities", error.to_string(), 7u8))?;
    definition.validate(&registry).map_err(|error| ("catalog", error.to_string(), 7u8))?;
    Ok((definition, registry))
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
