//! Telegram channel posts relayed to Mastodon.

use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, MessageOrigin};
use tracing::{error, info, warn};

use crate::config::TelegramToMastodonConfig;
use crate::filter::TagFilter;
use crate::footer::{ForwardOrigin, MastodonFooter};
use crate::mastodon::client::{MastodonClient, NewStatus};
use crate::mastodon::{Status, Visibility};
use crate::relay::retry::RetryPolicy;

const ELLIPSIS: char = '…';

/// The parts of a channel post that make up the Mastodon status text.
#[derive(Debug, Clone, Default)]
pub struct ChannelPost {
    pub text: String,
    pub origin: ForwardOrigin,
    pub link: Option<String>,
}

impl ChannelPost {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            text: msg
                .text()
                .or_else(|| msg.caption())
                .unwrap_or_default()
                .to_string(),
            origin: forward_origin(msg),
            link: msg.url().map(|u| u.to_string()),
        }
    }
}

fn forward_origin(msg: &Message) -> ForwardOrigin {
    match msg.forward_origin() {
        Some(MessageOrigin::User { sender_user, .. }) => ForwardOrigin {
            name: Some(sender_user.full_name()),
            link: None,
        },
        Some(MessageOrigin::HiddenUser {
            sender_user_name, ..
        }) => ForwardOrigin {
            name: Some(sender_user_name.clone()),
            link: None,
        },
        Some(MessageOrigin::Chat { sender_chat, .. }) => ForwardOrigin {
            name: sender_chat.title().map(str::to_string),
            link: None,
        },
        Some(MessageOrigin::Channel {
            chat, message_id, ..
        }) => ForwardOrigin {
            name: chat.title().map(str::to_string),
            link: chat
                .username()
                .map(|username| format!("https://t.me/{}/{}", username, message_id.0)),
        },
        None => ForwardOrigin::default(),
    }
}

/// A media file attached to a channel post.
struct Attachment {
    file_id: FileId,
    file_name: String,
    mime: String,
}

fn attachment(msg: &Message) -> Option<Attachment> {
    let id = msg.id.0;
    if let Some(photos) = msg.photo() {
        let largest = photos.iter().max_by_key(|p| p.width * p.height)?;
        return Some(Attachment {
            file_id: largest.file.id.clone(),
            file_name: format!("photo-{}.jpg", id),
            mime: "image/jpeg".to_string(),
        });
    }
    if let Some(video) = msg.video() {
        return Some(Attachment {
            file_id: video.file.id.clone(),
            file_name: video
                .file_name
                .clone()
                .unwrap_or_else(|| format!("video-{}.mp4", id)),
            mime: video
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "video/mp4".to_string()),
        });
    }
    None
}

/// Forwards posts from the configured Telegram channel to Mastodon.
pub struct ChannelForwarder {
    mastodon: Arc<MastodonClient>,
    retry: RetryPolicy,
    channel: ChatId,
    pm_chat: Option<ChatId>,
    visibility: Visibility,
    status_limit: usize,
    filter: TagFilter,
    footer: MastodonFooter,
}

impl ChannelForwarder {
    pub fn new(
        config: &TelegramToMastodonConfig,
        mastodon: Arc<MastodonClient>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let filter = TagFilter::new(&config.filter.include, &config.filter.exclude)
            .context("Invalid [telegram_to_mastodon.filter]")?;
        Ok(Self {
            mastodon,
            retry,
            channel: ChatId(config.channel_chat_id),
            pm_chat: config.pm_chat_id.map(ChatId),
            visibility: config.visibility,
            status_limit: config.status_limit,
            filter,
            footer: MastodonFooter::new(&config.footer),
        })
    }

    pub fn channel(&self) -> ChatId {
        self.channel
    }

    /// Status text for `post`, or `None` when the tag filter rejects it.
    pub fn compose(&self, post: &ChannelPost) -> Option<String> {
        if !self.filter.accepts(&post.text) {
            return None;
        }
        let footer = self.footer.lines(&post.origin, post.link.as_deref());
        Some(fit_status(post.text.trim(), &footer.join("\n"), self.status_limit))
    }

    /// Forward one channel post, reporting the outcome to the private chat.
    pub async fn handle(&self, bot: &Bot, msg: &Message) {
        match self.forward(bot, msg).await {
            Ok(Some(status)) => {
                info!(
                    "Forwarded channel message {} as status {}",
                    msg.id.0, status.id
                );
                let link = status.url.as_deref().unwrap_or(status.id.as_str());
                self.notify(bot, &format!("Forwarded message to Mastodon: {}", link))
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to forward channel message {}: {:#}", msg.id.0, e);
                self.notify(
                    bot,
                    &format!("Failed to forward message {} to Mastodon: {:#}", msg.id.0, e),
                )
                .await;
            }
        }
    }

    async fn forward(&self, bot: &Bot, msg: &Message) -> Result<Option<Status>> {
        if msg.media_group_id().is_some() {
            info!("Skipping channel message {}: media groups are not forwarded", msg.id.0);
            return Ok(None);
        }

        let media = attachment(msg);
        if media.is_none() && msg.text().is_none() {
            info!("Skipping channel message {}: unsupported content", msg.id.0);
            return Ok(None);
        }

        let post = ChannelPost::from_message(msg);
        let Some(text) = self.compose(&post) else {
            info!("Skipping channel message {}: excluded by tag filter", msg.id.0);
            return Ok(None);
        };

        let mut media_ids = Vec::new();
        if let Some(media) = media {
            media_ids.push(self.upload(bot, media).await?);
        }

        let status = NewStatus {
            status: text,
            visibility: self.visibility,
            media_ids,
            idempotency_key: Some(format!("telegram-{}-{}", msg.chat.id.0, msg.id.0)),
        };
        let posted = self
            .retry
            .run("Posting status", || self.mastodon.post_status(&status))
            .await?;
        Ok(Some(posted))
    }

    async fn upload(&self, bot: &Bot, media: Attachment) -> Result<String> {
        let file = bot
            .get_file(media.file_id)
            .await
            .context("Failed to look up Telegram file")?;
        let mut data = Vec::new();
        bot.download_file(&file.path, &mut data)
            .await
            .context("Failed to download Telegram file")?;

        let id = self
            .mastodon
            .upload_media(data, &media.file_name, &media.mime)
            .await?;
        Ok(id)
    }

    async fn notify(&self, bot: &Bot, text: &str) {
        let Some(chat) = self.pm_chat else {
            return;
        };
        if let Err(e) = bot.send_message(chat, text).await {
            warn!("Failed to send notice to {}: {}", chat.0, e);
        }
    }
}

/// Join `body` and `footer`, shortening the body with an ellipsis so the
/// result has at most `limit` characters.
fn fit_status(body: &str, footer: &str, limit: usize) -> String {
    let join = |body: &str| match (body.is_empty(), footer.is_empty()) {
        (_, true) => body.to_string(),
        (true, false) => footer.to_string(),
        (false, false) => format!("{}\n\n{}", body, footer),
    };

    let full = join(body);
    if full.chars().count() <= limit {
        return full;
    }

    let footer_len = if footer.is_empty() {
        0
    } else {
        footer.chars().count() + 2
    };
    match limit.checked_sub(footer_len + 1) {
        Some(keep) if keep > 0 => {
            let mut short: String = body.chars().take(keep).collect();
            short.push(ELLIPSIS);
            join(&short)
        }
        _ => {
            let mut short: String = full.chars().take(limit.saturating_sub(1)).collect();
            short.push(ELLIPSIS);
            short
        }
    }
}
