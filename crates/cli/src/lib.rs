pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "meetbot",
    about = "Meetbot operator CLI",
    long_about = "Operate the meetup bot: readiness checks, migrations, demo data, config inspection and a console chat.",
    after_help = "Examples:\n  meetbot doctor --json\n  meetbot seed\n  meetbot chat --user-id 8023886"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Insert the demo meetups that are not in the database yet")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, catalog and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Talk to the bot from the console; tickets are written to --output-dir")]
    Chat {
        #[arg(long, default_value_t = 1, help = "User id the conversation is stored under")]
        user_id: i64,
        #[arg(long, default_value = ".", help = "Directory for images the bot sends")]
        output_dir: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Chat { user_id, output_dir } => commands::chat::run(user_id, &output_dir),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
