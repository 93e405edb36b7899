use crate::api::Endpoints;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "USERVAULT_CONFIG_PATH";
pub const DEFAULT_FUNCTIONS_URL: &str = "https://api.uservault.cc/functions/v1";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Embedded into a host process: settings are inherited, standalone
    /// validation is skipped.
    pub embedded: bool,
    pub discord: DiscordConfig,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub notifications: NotificationConfig,
    pub otlp: OtlpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub api_base: String,
    pub command_prefix: String,
    pub enable_slash_commands: bool,
    pub admin_user_ids: Vec<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: crate::discord::DEFAULT_API_BASE.to_string(),
            command_prefix: "?".to_string(),
            enable_slash_commands: false,
            admin_user_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub game_url: Option<String>,
    pub reward_url: Option<String>,
    pub verify_url: Option<String>,
    pub notifications_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FUNCTIONS_URL.to_string(),
            game_url: None,
            reward_url: None,
            verify_url: None,
            notifications_url: None,
            webhook_secret: None,
            timeout_secs: 15,
        }
    }
}

impl BackendConfig {
    pub fn endpoints(&self) -> Endpoints {
        let base = self.base_url.trim().trim_end_matches('/');
        let pick = |explicit: &Option<String>, function: &str| match explicit.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => format!("{base}/{function}"),
        };
        Endpoints {
            game: pick(&self.game_url, "minigame-data"),
            reward: pick(&self.reward_url, "minigame-reward"),
            verify: pick(&self.verify_url, "bot-verify-code"),
            notifications: pick(&self.notifications_url, "bot-command-notifications"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub channel_id: Option<u64>,
    pub poll_interval_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_id: None,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OtlpConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub auth_header: String,
    pub auth_value: Option<String>,
    pub push_interval_ms: u64,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            auth_header: "Authorization".to_string(),
            auth_value: None,
            push_interval_ms: 5000,
        }
    }
}

impl Config {
    /// Loads and fully validates the config for running the service.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self::load_unchecked()?;
        if !config.embedded {
            config.validate_standalone()?;
        }
        Ok(config)
    }

    /// Loads `.env`, the config file and environment overrides, checking
    /// structure only. Used by the CLI tools, which need no bot token.
    pub fn load_unchecked() -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "could not read .env file");
            }
        }
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unparseable config file"
                ),
            }
        }

        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("USERVAULT_EMBEDDED") {
            self.embedded = parse_flag(&val);
        }

        // Discord settings
        if let Some(val) = lookup("DISCORD_BOT_TOKEN") {
            self.discord.token = Some(val);
        }
        if let Some(val) = lookup("ENABLE_SLASH_COMMANDS") {
            self.discord.enable_slash_commands = parse_flag(&val);
        }
        if let Some(val) = lookup("ADMIN_USER_IDS") {
            self.discord.admin_user_ids = parse_id_list(&val);
        }

        // Backend settings
        if let Some(val) = ["USERVAULT_FUNCTIONS_URL", "FUNCTIONS_URL", "API_URL"]
            .iter()
            .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
        {
            self.backend.base_url = val;
        }
        if let Some(val) = lookup("MINIGAME_DATA_URL") {
            self.backend.game_url = Some(val);
        }
        if let Some(val) = lookup("MINIGAME_REWARD_URL") {
            self.backend.reward_url = Some(val);
        }
        if let Some(val) = lookup("BOT_VERIFY_CODE_URL") {
            self.backend.verify_url = Some(val);
        }
        if let Some(val) = lookup("BOT_COMMAND_NOTIFICATIONS_URL") {
            self.backend.notifications_url = Some(val);
        }
        if let Some(val) = lookup("DISCORD_WEBHOOK_SECRET") {
            self.backend.webhook_secret = Some(val);
        }

        // Cache and polling
        if let Some(val) = lookup("COMMAND_CACHE_TTL_SECS") {
            if let Ok(ttl) = val.trim().parse() {
                self.cache.ttl_secs = ttl;
            }
        }
        if let Some(val) = lookup("COMMAND_UPDATES_CHANNEL_ID") {
            if let Ok(id) = val.trim().parse() {
                self.notifications.channel_id = Some(id);
            }
        }
        if let Some(val) = lookup("NOTIFICATION_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.trim().parse() {
                self.notifications.poll_interval_secs = secs;
            }
        }

        if let Some(val) = lookup("USERVAULT_OTLP_ENDPOINT") {
            self.otlp.enabled = true;
            self.otlp.endpoint = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be non-zero".into());
        }
        if self.notifications.poll_interval_secs == 0 {
            return Err("notifications.poll_interval_secs must be >= 1".into());
        }
        if self.backend.timeout_secs == 0 {
            return Err("backend.timeout_secs must be non-zero".into());
        }
        let endpoints = self.backend.endpoints();
        for url in [
            &endpoints.game,
            &endpoints.reward,
            &endpoints.verify,
            &endpoints.notifications,
        ] {
            Url::parse(url).map_err(|err| format!("invalid backend url {url}: {err}"))?;
        }
        if self.otlp.enabled && self.otlp.endpoint.as_deref().unwrap_or("").trim().is_empty() {
            return Err("otlp.endpoint is required when otlp.enabled = true".into());
        }
        Ok(())
    }

    /// Extra checks that only apply when this process owns its own Discord
    /// connection.
    pub fn validate_standalone(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.discord.token.as_deref().unwrap_or("").trim().is_empty() {
            return Err("DISCORD_BOT_TOKEN is required".into());
        }
        if self.webhook_secret().is_none() {
            return Err("DISCORD_WEBHOOK_SECRET is required".into());
        }
        Ok(())
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.backend
            .webhook_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE))
    }
}

fn active_config_path() -> PathBuf {
    Config::default_path()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_id_list(raw: &str) -> Vec<u64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}
