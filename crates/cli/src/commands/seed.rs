use chrono::Local;
use meetbot_db::{seed_demo_events, SeedResult, SqlEventRepository};

use crate::commands::{build_runtime, load_config, open_database, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let config = match load_config("seed", true) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let repository = SqlEventRepository::new(pool.clone());

        let seeded = seed_demo_events(&repository, Local::now().date_naive())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8));

        pool.close().await;
        Ok::<SeedResult, StepFailure>(seeded?)
    });

    match result {
        Ok(seeded) => CommandResult::success("seed", describe_seed(&seeded)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn describe_seed(seeded: &SeedResult) -> String {
    let mut lines = vec![format!(
        "demo events: {} inserted, {} already present",
        seeded.inserted.len(),
        seeded.skipped.len()
    )];
    lines.extend(
        seeded.inserted.iter().map(|event| format!("  - inserted: {} ({})", event.title, event.date)),
    );
    lines.extend(seeded.skipped.iter().map(|title| format!("  - present: {title}")));
    lines.join("\n")
}
