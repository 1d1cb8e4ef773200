use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filter::TagFilter;
use crate::mastodon::Visibility;

/// Smallest message/caption/status limit accepted from the config file.
const MIN_LIMIT: usize = 64;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mastodon: MastodonConfig,
    pub telegram: TelegramConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default = "default_retry_config")]
    pub retry: RetryConfig,
    #[serde(default = "default_mastodon_to_telegram")]
    pub mastodon_to_telegram: MastodonToTelegramConfig,
    #[serde(default = "default_telegram_to_mastodon")]
    pub telegram_to_mastodon: TelegramToMastodonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MastodonConfig {
    pub api_base_url: String,
    pub access_token: String,
}

impl MastodonConfig {
    /// Base URL without a trailing slash, ready for `format!("{}/api/...")`.
    pub fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Attempts per API call within one cycle (transient errors only).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Cycles in which Telegram rejects a status before it is skipped.
    #[serde(default = "default_give_up_after")]
    pub give_up_after: u32,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MastodonToTelegramConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub channel_chat_id: i64,
    #[serde(default)]
    pub pm_chat_id: Option<i64>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_true")]
    pub relay_media: bool,
    #[serde(default = "default_true")]
    pub forward_reblog_link_only: bool,
    #[serde(default = "default_true")]
    pub relay_self_replies: bool,
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    #[serde(default = "default_caption_limit")]
    pub caption_limit: usize,
    #[serde(default = "default_status_filter")]
    pub filter: StatusFilterConfig,
    #[serde(default = "default_telegram_footer")]
    pub footer: TelegramFooterConfig,
}

impl MastodonToTelegramConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusFilterConfig {
    #[serde(default = "default_scope")]
    pub scope: Vec<Visibility>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramFooterConfig {
    #[serde(default = "default_true")]
    pub add_link: bool,
    #[serde(default = "default_footer_tags")]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramToMastodonConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub channel_chat_id: i64,
    #[serde(default)]
    pub pm_chat_id: Option<i64>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default = "default_status_limit")]
    pub status_limit: usize,
    #[serde(default = "default_tag_filter")]
    pub filter: TagFilterConfig,
    #[serde(default = "default_mastodon_footer")]
    pub footer: MastodonFooterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TagFilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_exclude_tags")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MastodonFooterConfig {
    #[serde(default)]
    pub add_link: bool,
    #[serde(default = "default_true")]
    pub show_forward_from: bool,
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("bridge.db")
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_give_up_after() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_pages() -> u32 {
    5
}

// Telegram's limits for message text and media captions.
fn default_message_limit() -> usize {
    4096
}

fn default_caption_limit() -> usize {
    1024
}

// Mastodon's default character limit.
fn default_status_limit() -> usize {
    500
}

fn default_scope() -> Vec<Visibility> {
    vec![Visibility::Public, Visibility::Unlisted]
}

fn default_footer_tags() -> Vec<String> {
    vec!["#mastodon".to_string()]
}

fn default_exclude_tags() -> Vec<String> {
    vec![
        "#nofwd".to_string(),
        "#noforward".to_string(),
        "#mastodon".to_string(),
    ]
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
    }
}

fn default_retry_config() -> RetryConfig {
    RetryConfig {
        attempts: default_attempts(),
        initial_backoff_ms: default_initial_backoff_ms(),
        max_backoff_ms: default_max_backoff_ms(),
        give_up_after: default_give_up_after(),
    }
}

fn default_status_filter() -> StatusFilterConfig {
    StatusFilterConfig {
        scope: default_scope(),
    }
}

fn default_telegram_footer() -> TelegramFooterConfig {
    TelegramFooterConfig {
        add_link: true,
        tags: default_footer_tags(),
    }
}

fn default_tag_filter() -> TagFilterConfig {
    TagFilterConfig {
        include: Vec::new(),
        exclude: default_exclude_tags(),
    }
}

fn default_mastodon_footer() -> MastodonFooterConfig {
    MastodonFooterConfig {
        add_link: false,
        show_forward_from: true,
    }
}

fn default_mastodon_to_telegram() -> MastodonToTelegramConfig {
    MastodonToTelegramConfig {
        disable: false,
        channel_chat_id: 0,
        pm_chat_id: None,
        poll_interval_secs: default_poll_interval_secs(),
        max_pages: default_max_pages(),
        relay_media: true,
        forward_reblog_link_only: true,
        relay_self_replies: true,
        message_limit: default_message_limit(),
        caption_limit: default_caption_limit(),
        filter: default_status_filter(),
        footer: default_telegram_footer(),
    }
}

fn default_telegram_to_mastodon() -> TelegramToMastodonConfig {
    TelegramToMastodonConfig {
        disable: false,
        channel_chat_id: 0,
        pm_chat_id: None,
        visibility: Visibility::Public,
        status_limit: default_status_limit(),
        filter: default_tag_filter(),
        footer: default_mastodon_footer(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a config document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mastodon.access_token.trim().is_empty() {
            bail!("[mastodon] access_token must not be empty");
        }
        let url = reqwest::Url::parse(&self.mastodon.api_base_url).with_context(|| {
            format!(
                "[mastodon] api_base_url is not a valid URL: {}",
                self.mastodon.api_base_url
            )
        })?;
        if url.scheme() != "https" && url.scheme() != "http" {
            bail!("[mastodon] api_base_url must be an http(s) URL");
        }
        if self.telegram.bot_token.trim().is_empty() {
            bail!("[telegram] bot_token must not be empty");
        }
        if self.retry.attempts == 0 {
            bail!("[retry] attempts must be at least 1");
        }
        if self.retry.give_up_after == 0 {
            bail!("[retry] give_up_after must be at least 1");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            bail!("[retry] max_backoff_ms must not be below initial_backoff_ms");
        }

        let m2t = &self.mastodon_to_telegram;
        if !m2t.disable {
            if m2t.channel_chat_id == 0 {
                bail!("[mastodon_to_telegram] channel_chat_id must be set");
            }
            if m2t.poll_interval_secs == 0 {
                bail!("[mastodon_to_telegram] poll_interval_secs must be at least 1");
            }
            if m2t.max_pages == 0 {
                bail!("[mastodon_to_telegram] max_pages must be at least 1");
            }
            if m2t.message_limit < MIN_LIMIT || m2t.caption_limit < MIN_LIMIT {
                bail!(
                    "[mastodon_to_telegram] message_limit and caption_limit must be at least {}",
                    MIN_LIMIT
                );
            }
            if m2t.filter.scope.is_empty() {
                bail!("[mastodon_to_telegram.filter] scope must not be empty");
            }
        }

        let t2m = &self.telegram_to_mastodon;
        if !t2m.disable {
            if t2m.channel_chat_id == 0 {
                bail!("[telegram_to_mastodon] channel_chat_id must be set");
            }
            if t2m.status_limit < MIN_LIMIT {
                bail!(
                    "[telegram_to_mastodon] status_limit must be at least {}",
                    MIN_LIMIT
                );
            }
            TagFilter::new(&t2m.filter.include, &t2m.filter.exclude)
                .context("[telegram_to_mastodon.filter] is invalid")?;
        }

        if m2t.disable && t2m.disable {
            bail!("both directions are disabled; nothing to do");
        }

        Ok(())
    }
}
