use std::sync::Arc;

use async_trait::async_trait;
use meetbot_agent::{default_registry, AgentRuntime, CapabilitySettings};
use meetbot_core::capability::CapabilityError;
use meetbot_core::catalog::{BotDefinition, CatalogError};
use meetbot_core::config::{AppConfig, ConfigError};
use meetbot_core::errors::ApplicationError;
use meetbot_core::session::UserId;
use meetbot_db::{
    connect_with_settings, migrations, DbPool, SqlEventRepository, SqlSessionStore,
};
use meetbot_vk::{
    events::conversation_dispatcher, ConversationService, EventContext, EventHandlerError,
    LongPollRunner, MessageNewEvent, ReconnectPolicy, VkApiClient, VkApiError,
    VkLongPollTransport,
};
use thiserror::Error;
use tracing::{error, info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub agent_runtime: Arc<AgentRuntime>,
    pub vk_runner: LongPollRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("catalog is unusable: {0}")]
    Catalog(#[from] CatalogError),
    #[error("capability registry failed to build: {0}")]
    Capabilities(#[from] CapabilityError),
    #[error("vk client failed to initialize: {0}")]
    VkClient(#[from] VkApiError),
}

/// Feeds VK messages into the agent runtime.
pub struct BotService {
    runtime: Arc<AgentRuntime>,
}

impl BotService {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ConversationService for BotService {
    async fn handle_message(
        &self,
        message: &MessageNewEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        info!(
            event_name = "ingress.vk.message_received",
            correlation_id = %ctx.correlation_id,
            user_id = message.from_id,
            message_id = message.message_id,
            "incoming vk message"
        );

        let report = match self
            .runtime
            .handle_message(UserId(message.from_id), &message.text, &ctx.correlation_id)
            .await
        {
            Ok(report) => report,
            Err(error) => {
                let failure = ApplicationError::from(error);
                if failure.is_fatal() {
                    error!(
                        event_name = "agent.turn.configuration_error",
                        correlation_id = %ctx.correlation_id,
                        user_id = message.from_id,
                        error = %failure,
                        "turn abandoned: bot configuration needs an operator"
                    );
                }
                let failure = failure.into_interface(ctx.correlation_id.clone());
                return Err(EventHandlerError::Conversation(failure.to_string()));
            }
        };

        if !report.delivered {
            warn!(
                event_name = "egress.vk.reply_not_delivered",
                correlation_id = %ctx.correlation_id,
                user_id = message.from_id,
                "reply was not delivered; session state was still saved"
            );
        }
        Ok(())
    }
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let definition = BotDefinition::from_config(&config.bot)?;
    let registry = default_registry(
        Arc::new(SqlEventRepository::new(db_pool.clone())),
        CapabilitySettings::from_config(&config.bot),
    )?;
    let vk_client = Arc::new(VkApiClient::new(&config.vk)?);

    let agent_runtime = Arc::new(AgentRuntime::new(
        definition,
        registry,
        Arc::new(SqlSessionStore::new(db_pool.clone())),
        vk_client.clone(),
        vk_client.clone(),
    )?);
    info!(
        event_name = "system.bootstrap.catalog_loaded",
        correlation_id = "bootstrap",
        intents = agent_runtime.router().catalog().intents().len(),
        "intent catalog validated against capabilities"
    );

    let vk_runner = LongPollRunner::new(
        Arc::new(VkLongPollTransport::new(vk_client)),
        conversation_dispatcher(BotService::new(agent_runtime.clone())),
        ReconnectPolicy::default(),
    );

    Ok(Application { config, db_pool, agent_runtime, vk_runner })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meetbot_agent::{default_registry, AgentRuntime, CapabilitySettings};
    use meetbot_core::catalog::BotDefinition;
    use meetbot_core::channel::RecordingChannel;
    use meetbot_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use meetbot_core::session::UserId;
    use meetbot_db::{InMemoryEventRepository, InMemorySessionStore, SessionStore};
    use meetbot_vk::{ConversationService, EventContext, MessageNewEvent};

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError, BotService};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_vk_token() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                vk_group_id: Some(42),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("vk.access_token"));
    }

    #[tokio::test]
    async fn bootstrap_prepares_schema_and_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let database_url = format!("sqlite://{}", dir.path().join("meetbot.db").display());
        let app = bootstrap(valid_overrides(&database_url))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('dialogs', 'events', 'event_visitors')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected tables to be available after bootstrap");
        assert_eq!(table_count, 3);
        assert!(!app.agent_runtime.router().catalog().intents().is_empty());

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_a_missing_catalog_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options =
            valid_overrides(&format!("sqlite://{}", dir.path().join("meetbot.db").display()));
        options.overrides.catalog_path = Some(dir.path().join("absent.toml"));

        let message = bootstrap(options).await.err().expect("error").to_string();
        assert!(message.starts_with("catalog is unusable"), "{message}");
    }

    #[tokio::test]
    async fn bot_service_runs_a_turn_per_message() {
        let channel = Arc::new(RecordingChannel::new());
        let store = Arc::new(InMemorySessionStore::default());
        let registry = default_registry(
            Arc::new(InMemoryEventRepository::default()),
            CapabilitySettings::default(),
        )
        .expect("registry");
        let runtime = AgentRuntime::new(
            BotDefinition::builtin().expect("catalog"),
            registry,
            store.clone(),
            channel.clone(),
            channel.clone(),
        )
        .expect("runtime");
        let service = BotService::new(Arc::new(runtime));

        let message = MessageNewEvent {
            from_id: 8023886,
            peer_id: 8023886,
            text: "Привет".to_owned(),
            ..MessageNewEvent::default()
        };
        service
            .handle_message(&message, &EventContext { correlation_id: "evt-1".to_owned() })
            .await
            .expect("turn");

        assert_eq!(channel.texts(), vec!["Привет!".to_owned()]);
        assert!(store.load_session(UserId(8023886)).await.expect("load").is_some());
    }

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                vk_access_token: Some("vk1.a.test".to_string()),
                vk_group_id: Some(42),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }
}
