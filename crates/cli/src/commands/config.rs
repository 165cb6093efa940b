use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use meetbot_core::config::AppConfig;
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::load_config;

pub fn run() -> String {
    let config = match load_config("config", true) {
        Ok(config) => config,
        Err(failure) => return failure.output,
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_keys, value) in effective_values(&config) {
        let source =
            field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }
    lines.join("\n")
}

type ConfigLine = (&'static str, &'static [&'static str], String);

fn effective_values(config: &AppConfig) -> Vec<ConfigLine> {
    let unset = || "<unset>".to_string();
    vec![
        line("database.url", &["MEETBOT_DATABASE_URL"], config.database.url.clone()),
        line(
            "database.max_connections",
            &["MEETBOT_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        line(
            "database.timeout_secs",
            &["MEETBOT_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        line(
            "vk.access_token",
            &["MEETBOT_VK_ACCESS_TOKEN"],
            redact_token(config.vk.access_token.expose_secret()),
        ),
        line("vk.group_id", &["MEETBOT_VK_GROUP_ID"], config.vk.group_id.to_string()),
        line("vk.api_version", &["MEETBOT_VK_API_VERSION"], config.vk.api_version.clone()),
        line("vk.api_base_url", &["MEETBOT_VK_API_BASE_URL"], config.vk.api_base_url.clone()),
        line(
            "vk.long_poll_wait_secs",
            &["MEETBOT_VK_LONG_POLL_WAIT_SECS"],
            config.vk.long_poll_wait_secs.to_string(),
        ),
        line(
            "bot.catalog_path",
            &["MEETBOT_BOT_CATALOG_PATH"],
            config
                .bot
                .catalog_path
                .as_ref()
                .map_or_else(|| "<builtin>".to_string(), |path| path.display().to_string()),
        ),
        line(
            "bot.default_answer",
            &["MEETBOT_BOT_DEFAULT_ANSWER"],
            config.bot.default_answer.clone().unwrap_or_else(unset),
        ),
        line("bot.date_format", &["MEETBOT_BOT_DATE_FORMAT"], config.bot.date_format.clone()),
        line(
            "server.bind_address",
            &["MEETBOT_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        line(
            "server.health_check_port",
            &["MEETBOT_SERVER_HEALTH_CHECK_PORT"],
            config.server.health_check_port.to_string(),
        ),
        line(
            "server.graceful_shutdown_secs",
            &["MEETBOT_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        line(
            "logging.level",
            &["MEETBOT_LOGGING_LEVEL", "MEETBOT_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        line(
            "logging.format",
            &["MEETBOT_LOGGING_FORMAT", "MEETBOT_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn line(key_path: &'static str, env_keys: &'static [&'static str], value: String) -> ConfigLine {
    (key_path, env_keys, value)
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("meetbot.toml"), PathBuf::from("config/meetbot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps the `vk1.` style prefix of a community token and hides the rest.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('.') {
        return format!("{prefix}.***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_token};

    #[test]
    fn token_redaction_keeps_only_the_prefix() {
        assert_eq!(redact_token("vk1.a.secret-value"), "vk1.***");
        assert_eq!(redact_token("opaque"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn dotted_paths_resolve_nested_tables() {
        let doc: Value = "[vk]\ngroup_id = 42\n".parse().expect("toml");
        assert!(contains_path(&doc, "vk.group_id"));
        assert!(!contains_path(&doc, "vk.access_token"));
        assert!(!contains_path(&doc, "bot.date_format"));
    }
}
