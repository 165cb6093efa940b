use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use meetbot_agent::AgentRuntime;
use meetbot_core::capability::ImageArtifact;
use meetbot_core::channel::{ChannelError, OutboundChannel, ProfileDirectory};
use meetbot_core::session::UserId;
use meetbot_db::{SqlEventRepository, SqlSessionStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    build_runtime, load_bot, load_config, open_database, CommandResult, StepFailure,
};

const QUIT: &str = "/quit";

/// Interactive conversation over stdin/stdout against the configured database.
pub fn run(user_id: i64, output_dir: &Path) -> CommandResult {
    let config = match load_config("chat", true) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("chat") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::new(&config.logging.level))
        .try_init();

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let events = Arc::new(SqlEventRepository::new(pool.clone()));
        let (definition, registry) = load_bot(&config, events)?;

        let channel = Arc::new(ConsoleChannel::new(output_dir, std::io::stdout()));
        let agent = AgentRuntime::new(
            definition,
            registry,
            Arc::new(SqlSessionStore::new(pool.clone())),
            channel.clone(),
            channel,
        )
        .map_err(|error| ("catalog", error.to_string(), 7u8))?;

        let turns = converse(&agent, UserId(user_id)).await;
        pool.close().await;
        turns
    });

    match result {
        Ok(turns) => CommandResult::success("chat", format!("conversation ended after {turns} turns")),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chat", error_class, message, exit_code)
        }
    }
}

async fn converse(agent: &AgentRuntime, user_id: UserId) -> Result<usize, StepFailure> {
    info!(event_name = "cli.chat.started", user_id = user_id.0, "console chat started");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turns = 0_usize;

    while let Some(line) =
        lines.next_line().await.map_err(|error| ("stdin", error.to_string(), 8u8))?
    {
        if line.trim() == QUIT {
            break;
        }
        turns += 1;
        let correlation_id = format!("console-{turns}");
        if let Err(error) = agent.handle_message(user_id, &line, &correlation_id).await {
            warn!(
                event_name = "cli.chat.turn_failed",
                correlation_id = %correlation_id,
                error = %error,
                "turn failed"
            );
        }
    }

    Ok(turns)
}

/// Prints replies and saves images under `output_dir`.
pub struct ConsoleChannel<W> {
    output_dir: PathBuf,
    writer: Mutex<W>,
    images: AtomicUsize,
}

impl<W> ConsoleChannel<W>
where
    W: Write + Send,
{
    pub fn new(output_dir: impl Into<PathBuf>, writer: W) -> Self {
        Self { output_dir: output_dir.into(), writer: Mutex::new(writer), images: AtomicUsize::new(0) }
    }

    fn print(&self, line: &str) -> Result<(), ChannelError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ChannelError::Delivery("console writer is poisoned".to_owned()))?;
        writeln!(writer, "bot> {line}")
            .and_then(|()| writer.flush())
            .map_err(|error| ChannelError::Delivery(error.to_string()))
    }
}

#[async_trait]
impl<W> OutboundChannel for ConsoleChannel<W>
where
    W: Write + Send,
{
    async fn send_text(&self, _user_id: UserId, text: &str) -> Result<(), ChannelError> {
        self.print(text)
    }

    async fn send_image(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<(), ChannelError> {
        let index = self.images.fetch_add(1, Ordering::Relaxed) + 1;
        let path = self.output_dir.join(format!("{user_id}-{index}-{}", image.file_name));
        tokio::fs::write(&path, &image.bytes)
            .await
            .map_err(|error| ChannelError::Delivery(format!("{}: {error}", path.display())))?;
        self.print(&format!("[{} saved to {}]", image.content_type, path.display()))
    }
}

#[async_trait]
impl<W> ProfileDirectory for ConsoleChannel<W>
where
    W: Write + Send,
{
    async fn display_name(&self, _user_id: UserId) -> Result<Option<String>, ChannelError> {
        Ok(None)
    }
}
