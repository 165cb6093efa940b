use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_VK_API_VERSION: &str = "5.103";
pub const DEFAULT_VK_API_BASE_URL: &str = "https://api.vk.com/method";
pub const DEFAULT_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub vk: VkConfig,
    pub bot: BotConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct VkConfig {
    pub access_token: SecretString,
    pub group_id: u64,
    pub api_version: String,
    pub api_base_url: String,
    pub long_poll_wait_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BotConfig {
    /// Catalog file; the built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
    /// Replaces the catalog's default reply when set.
    pub default_answer: Option<String>,
    pub date_format: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub vk_access_token: Option<String>,
    pub vk_group_id: Option<u64>,
    pub catalog_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    /// Skips the `vk` section checks for commands that never talk to VK.
    pub offline: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://meetbot.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            vk: VkConfig {
                access_token: String::new().into(),
                group_id: 0,
                api_version: DEFAULT_VK_API_VERSION.to_string(),
                api_base_url: DEFAULT_VK_API_BASE_URL.to_string(),
                long_poll_wait_secs: 25,
            },
            bot: BotConfig {
                catalog_path: None,
                default_answer: None,
                date_format: DEFAULT_DATE_FORMAT.to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("meetbot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        if options.offline {
            config.validate_offline()?;
        } else {
            config.validate()?;
        }

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(vk) = patch.vk {
            if let Some(access_token) = vk.access_token {
                self.vk.access_token = access_token.into();
            }
            if let Some(group_id) = vk.group_id {
                self.vk.group_id = group_id;
            }
            if let Some(api_version) = vk.api_version {
                self.vk.api_version = api_version;
            }
            if let Some(api_base_url) = vk.api_base_url {
                self.vk.api_base_url = api_base_url;
            }
            if let Some(long_poll_wait_secs) = vk.long_poll_wait_secs {
                self.vk.long_poll_wait_secs = long_poll_wait_secs;
            }
        }

        if let Some(bot) = patch.bot {
            if let Some(catalog_path) = bot.catalog_path {
                self.bot.catalog_path = Some(catalog_path);
            }
            if let Some(default_answer) = bot.default_answer {
                self.bot.default_answer = Some(default_answer);
            }
            if let Some(date_format) = bot.date_format {
                self.bot.date_format = date_format;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("MEETBOT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("MEETBOT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_number("MEETBOT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("MEETBOT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_number("MEETBOT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("MEETBOT_VK_ACCESS_TOKEN") {
            self.vk.access_token = value.into();
        }
        if let Some(value) = read_env("MEETBOT_VK_GROUP_ID") {
            self.vk.group_id = parse_number("MEETBOT_VK_GROUP_ID", &value)?;
        }
        if let Some(value) = read_env("MEETBOT_VK_API_VERSION") {
            self.vk.api_version = value;
        }
        if let Some(value) = read_env("MEETBOT_VK_API_BASE_URL") {
            self.vk.api_base_url = value;
        }
        if let Some(value) = read_env("MEETBOT_VK_LONG_POLL_WAIT_SECS") {
            self.vk.long_poll_wait_secs = parse_number("MEETBOT_VK_LONG_POLL_WAIT_SECS", &value)?;
        }

        if let Some(value) = read_env("MEETBOT_BOT_CATALOG_PATH") {
            self.bot.catalog_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("MEETBOT_BOT_DEFAULT_ANSWER") {
            self.bot.default_answer = Some(value);
        }
        if let Some(value) = read_env("MEETBOT_BOT_DATE_FORMAT") {
            self.bot.date_format = value;
        }

        if let Some(value) = read_env("MEETBOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("MEETBOT_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_number("MEETBOT_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("MEETBOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("MEETBOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("MEETBOT_LOGGING_LEVEL").or_else(|| read_env("MEETBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("MEETBOT_LOGGING_FORMAT").or_else(|| read_env("MEETBOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(access_token) = overrides.vk_access_token {
            self.vk.access_token = access_token.into();
        }
        if let Some(group_id) = overrides.vk_group_id {
            self.vk.group_id = group_id;
        }
        if let Some(catalog_path) = overrides.catalog_path {
            self.bot.catalog_path = Some(catalog_path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_offline()?;
        validate_vk(&self.vk)
    }

    /// Everything except the VK credentials.
    pub fn validate_offline(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_bot(&self.bot)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("meetbot.toml"), PathBuf::from("config/meetbot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_vk(vk: &VkConfig) -> Result<(), ConfigError> {
    if vk.access_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "vk.access_token is required. Create a community token under Manage > API usage > Access tokens with messages and photos rights".to_string(),
        ));
    }

    if vk.group_id == 0 {
        return Err(ConfigError::Validation(
            "vk.group_id is required and must be the numeric id of the community".to_string(),
        ));
    }

    if vk.api_version.trim().is_empty() {
        return Err(ConfigError::Validation("vk.api_version must not be empty".to_string()));
    }

    if !vk.api_base_url.starts_with("http://") && !vk.api_base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "vk.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if vk.long_poll_wait_secs == 0 || vk.long_poll_wait_secs > 90 {
        return Err(ConfigError::Validation(
            "vk.long_poll_wait_secs must be in range 1..=90".to_string(),
        ));
    }

    Ok(())
}

fn validate_bot(bot: &BotConfig) -> Result<(), ConfigError> {
    if let Some(default_answer) = &bot.default_answer {
        if default_answer.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bot.default_answer must not be blank when set".to_string(),
            ));
        }
    }

    let broken = StrftimeItems::new(&bot.date_format).any(|item| matches!(item, Item::Error));
    if bot.date_format.trim().is_empty() || broken {
        return Err(ConfigError::Validation(format!(
            "bot.date_format `{}` is not a valid strftime format",
            bot.date_format
        )));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    vk: Option<VkPatch>,
    bot: Option<BotPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct VkPatch {
    access_token: Option<String>,
    group_id: Option<u64>,
    api_version: Option<String>,
    api_base_url: Option<String>,
    long_poll_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BotPatch {
    catalog_path: Option<PathBuf>,
    default_answer: Option<String>,
    date_format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
