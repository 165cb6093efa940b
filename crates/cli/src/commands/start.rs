use std::sync::Arc;

use meetbot_db::SqlEventRepository;

use crate::commands::{
    build_runtime, load_bot, load_config, open_database, CommandResult, StepFailure,
};

/// Preflight for the bot process: full config (VK credentials included), database and catalog.
pub fn run() -> CommandResult {
    let config = match load_config("start", false) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("start") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let loaded = load_bot(&config, Arc::new(SqlEventRepository::new(pool.clone())));
        pool.close().await;
        let (definition, _) = loaded?;
        Ok::<usize, StepFailure>(definition.catalog.intents().len())
    });

    match result {
        Ok(intents) => CommandResult::success(
            "start",
            format!(
                "preflight passed for community {}: database ready, {intents} intents loaded; run `meetbot-server` to serve",
                config.vk.group_id
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("start", error_class, message, exit_code)
        }
    }
}
