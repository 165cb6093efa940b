use std::process::ExitCode;

fn main() -> ExitCode {
    meetbot_cli::run()
}
