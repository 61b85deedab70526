use std::{env, fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use channel_message::Channel;
use dashmap::DashMap;
use rand::{Rng, distr::Alphanumeric, rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{DEFAULT_CACHE_LIMIT, MAX_CACHE_LIMIT};
use crate::error::BotError;

/// A read-only source of configuration keys.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

impl ConfigManager {
    /// Trimmed value, with empty strings treated as unset.
    async fn value(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn flag(&self, key: &str, default: bool) -> Result<bool, BotError> {
        match self.value(key).await {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(BotError::Config(format!("{key}={other} is not a boolean"))),
            },
        }
    }

    async fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, BotError> {
        match self.value(key).await {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| BotError::Config(format!("{key}={v} is not a number"))),
        }
    }
}

/// Reads the process environment after loading an optional `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded environment from {}", env_file.display()),
                Err(e) => warn!(error = %e, "could not parse {}", env_file.display()),
            }
        } else {
            info!("no env file at {}, using process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        mgr
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Which workers to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggles {
    pub web: bool,
    pub telegram: bool,
    pub discord: bool,
    pub slack: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            web: true,
            telegram: true,
            discord: true,
            slack: true,
        }
    }
}

impl Toggles {
    pub fn channel(&self, channel: Channel) -> bool {
        match channel {
            Channel::Telegram => self.telegram,
            Channel::Discord => self.discord,
            Channel::Slack => self.slack,
        }
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.channel(*c))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelegramSettings {
    pub token: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscordSettings {
    pub token: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SlackSettings {
    pub bot_token: String,
}

/// Everything the bot reads from its environment, validated once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub toggles: Toggles,
    pub debug: bool,

    pub webhook_url: Option<String>,
    pub webhook_port: u16,
    pub webhook_secret: Option<String>,
    pub web_telegram_token: Option<String>,
    pub web_secret_ping: String,
    pub web_secret_password: Option<String>,
    pub web_self_test: bool,

    pub telegram: Option<TelegramSettings>,
    pub discord: Option<DiscordSettings>,
    pub slack: Option<SlackSettings>,
    pub ifttt_key: Option<String>,

    pub cache_limit: usize,
    pub queue_poll: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            toggles: Toggles::default(),
            debug: false,
            webhook_url: None,
            webhook_port: 8080,
            webhook_secret: None,
            web_telegram_token: None,
            web_secret_ping: random_path(),
            web_secret_password: None,
            web_self_test: true,
            telegram: None,
            discord: None,
            slack: None,
            ifttt_key: None,
            cache_limit: DEFAULT_CACHE_LIMIT,
            queue_poll: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn random_path() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl Settings {
    /// Reads every key. `cli` switches channels off on top of the
    /// `DISABLE_*` keys. Tokens are only required for enabled channels.
    pub async fn load(config: &ConfigManager, cli: Toggles) -> Result<Self, BotError> {
        debug!(source = ?config, keys = config.0.keys().await.len(), "reading settings");
        let toggles = Toggles {
            web: cli.web && !config.flag("DISABLE_WEB", false).await?,
            telegram: cli.telegram && !config.flag("DISABLE_TELEGRAM", false).await?,
            discord: cli.discord && !config.flag("DISABLE_DISCORD", false).await?,
            slack: cli.slack && !config.flag("DISABLE_SLACK", false).await?,
        };

        let mut missing = Vec::new();
        let mut require = |key: &'static str, value: Option<String>| -> String {
            value.unwrap_or_else(|| {
                missing.push(key);
                String::new()
            })
        };

        let telegram = if toggles.telegram {
            Some(TelegramSettings {
                token: require("TELEGRAM_TOKEN", config.value("TELEGRAM_TOKEN").await),
                user: config.value("TELEGRAM_USER").await,
            })
        } else {
            None
        };
        let discord = if toggles.discord {
            Some(DiscordSettings {
                token: require("DISCORD_TOKEN", config.value("DISCORD_TOKEN").await),
                user: config.value("DISCORD_USER").await,
            })
        } else {
            None
        };
        let slack = if toggles.slack {
            Some(SlackSettings {
                bot_token: require("SLACK_TOKEN_BOT", config.value("SLACK_TOKEN_BOT").await),
            })
        } else {
            None
        };

        if !missing.is_empty() {
            return Err(BotError::Config(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        let cache_limit = config.number("CACHE_LIMIT", DEFAULT_CACHE_LIMIT).await?;
        if !(1..=MAX_CACHE_LIMIT).contains(&cache_limit) {
            return Err(BotError::Config(format!(
                "CACHE_LIMIT={cache_limit} must be between 1 and {MAX_CACHE_LIMIT}"
            )));
        }

        let defaults = Settings::default();
        let settings = Settings {
            toggles,
            debug: config.flag("DEBUG", false).await?,
            webhook_url: config
                .value("WEBHOOK_URL")
                .await
                .map(|u| u.trim_end_matches('/').to_string()),
            webhook_port: config.number("WEBHOOK_PORT", defaults.webhook_port).await?,
            webhook_secret: config.value("WEBHOOK_SECRET").await,
            web_telegram_token: config.value("WEB_TELEGRAM_TOKEN").await,
            web_secret_ping: config
                .value("WEB_SECRET_PING")
                .await
                .unwrap_or(defaults.web_secret_ping),
            web_secret_password: config.value("WEB_SECRET_PASSWORD").await,
            web_self_test: config.flag("WEB_SELF_TEST", true).await?,
            telegram,
            discord,
            slack,
            ifttt_key: config.value("IFTTT_KEY").await,
            cache_limit,
            queue_poll: Duration::from_millis(config.number("QUEUE_POLL_MS", 1000u64).await?),
            shutdown_grace: Duration::from_secs(config.number("SHUTDOWN_GRACE_SECS", 5u64).await?),
        };

        if settings.toggles.telegram && !settings.toggles.web {
            warn!("telegram is enabled but the web server is not; no updates will arrive");
        }
        if settings.toggles.telegram && settings.webhook_url.is_none() {
            warn!("WEBHOOK_URL is not set; telegram webhook will not be registered");
        }
        Ok(settings)
    }

    /// The shared secret expected on a platform's webhook route.
    pub fn inbound_secret(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Telegram => self.web_telegram_token.as_deref(),
            Channel::Discord | Channel::Slack => self.webhook_secret.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    fn manager(pairs: &[(&str, &str)]) -> ConfigManager {
        ConfigManager(MapConfigManager::with(pairs))
    }

    #[tokio::test]
    async fn map_config_manager_basic() {
        let mgr = MapConfigManager::with(&[("foo", "baz")]);
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.get("bar").await, None);
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "BIGMEOW_TEST_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("BIGMEOW_TEST_KEY").await, Some("abc123".to_string()));
        assert!(mgr.keys().await.contains(&"BIGMEOW_TEST_KEY".to_string()));
    }

    #[tokio::test]
    async fn cache_limit_must_be_sane() {
        let cli = Toggles {
            telegram: false,
            discord: false,
            slack: false,
            web: true,
        };
        for bad in ["0", "10000000000", "18446744073709551615"] {
            let config = manager(&[("CACHE_LIMIT", bad)]);
            assert!(
                matches!(Settings::load(&config, cli).await, Err(BotError::Config(_))),
                "CACHE_LIMIT={bad}"
            );
        }
        let config = manager(&[("CACHE_LIMIT", "20")]);
        assert_eq!(Settings::load(&config, cli).await.unwrap().cache_limit, 20);
    }

    #[tokio::test]
    async fn tokens_required_only_for_enabled_channels() {
        let config = manager(&[("DISABLE_DISCORD", "true"), ("SLACK_TOKEN_BOT", "xoxb")]);
        let cli = Toggles {
            telegram: false,
            ..Toggles::default()
        };
        let settings = Settings::load(&config, cli).await.unwrap();
        assert!(!settings.toggles.discord);
        assert!(!settings.toggles.telegram);
        assert_eq!(settings.toggles.enabled_channels(), vec![Channel::Slack]);
        assert_eq!(settings.slack.unwrap().bot_token, "xoxb");
    }

    #[tokio::test]
    async fn missing_tokens_are_listed() {
        let config = manager(&[]);
        let err = Settings::load(&config, Toggles::default()).await.unwrap_err();
        let BotError::Config(msg) = err else {
            panic!("expected config error");
        };
        assert!(msg.contains("TELEGRAM_TOKEN"));
        assert!(msg.contains("DISCORD_TOKEN"));
        assert!(msg.contains("SLACK_TOKEN_BOT"));
    }

    #[tokio::test]
    async fn defaults_and_overrides() {
        let config = manager(&[
            ("TELEGRAM_TOKEN", "t"),
            ("DISCORD_TOKEN", "d"),
            ("SLACK_TOKEN_BOT", "s"),
            ("WEBHOOK_URL", "https://meow.example/"),
            ("WEB_TELEGRAM_TOKEN", "tg-secret"),
            ("QUEUE_POLL_MS", "250"),
            ("DEBUG", "1"),
        ]);
        let settings = Settings::load(&config, Toggles::default()).await.unwrap();
        assert_eq!(settings.webhook_url.as_deref(), Some("https://meow.example"));
        assert_eq!(settings.webhook_port, 8080);
        assert_eq!(settings.queue_poll, Duration::from_millis(250));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
        assert_eq!(settings.cache_limit, 5);
        assert!(settings.debug);
        assert_eq!(settings.web_secret_ping.len(), 32);
        assert_eq!(settings.inbound_secret(Channel::Telegram), Some("tg-secret"));
        assert_eq!(settings.inbound_secret(Channel::Slack), None);
    }

    #[tokio::test]
    async fn rejects_bad_values() {
        let config = manager(&[("DEBUG", "maybe")]);
        let cli = Toggles {
            telegram: false,
            discord: false,
            slack: false,
            web: true,
        };
        assert!(matches!(
            Settings::load(&config, cli).await,
            Err(BotError::Config(_))
        ));
    }
}
