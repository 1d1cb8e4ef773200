use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InputFile, InputMedia, InputMediaPhoto, InputMediaVideo, LinkPreviewOptions, MessageId,
    ParseMode, ReplyParameters,
};
use teloxide::{ApiError, RequestError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::forward::ChannelForwarder;
use crate::platform::{PublishProgress, PublishReceipt, Publisher};
use crate::relay::retry::RetryPolicy;
use crate::transform::{MediaRef, MediaType, OutgoingPost};

/// Telegram accepts between 2 and 10 items per media group.
const MEDIA_GROUP_MAX: usize = 10;

/// Classify a Bot API failure.
pub fn classify(err: RequestError) -> RelayError {
    match err {
        RequestError::Api(ApiError::InvalidToken) => {
            RelayError::Auth("Telegram rejected the bot token".to_string())
        }
        RequestError::RetryAfter(seconds) => RelayError::Transient {
            message: "Telegram rate limit hit".to_string(),
            retry_after: Some(seconds.duration()),
        },
        e @ (RequestError::Network(_) | RequestError::Io(_) | RequestError::InvalidJson { .. }) => {
            RelayError::transient(e.to_string())
        }
        other => RelayError::Rejected(other.to_string()),
    }
}

fn media_url(media: &MediaRef) -> Result<InputFile, RelayError> {
    let url = reqwest::Url::parse(&media.url)
        .map_err(|e| RelayError::Rejected(format!("Invalid media URL {}: {}", media.url, e)))?;
    Ok(InputFile::url(url))
}

fn no_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

/// Publishes relayed statuses to a Telegram channel.
///
/// Each Bot API call is retried on its own, so a rate limit on a later part
/// of a post never re-sends the parts before it.
#[derive(Clone)]
pub struct TelegramPublisher {
    bot: Bot,
    channel: ChatId,
    pm_chat: Option<ChatId>,
    retry: RetryPolicy,
}

impl TelegramPublisher {
    pub fn new(bot: Bot, channel: i64, pm_chat: Option<i64>, retry: RetryPolicy) -> Self {
        Self {
            bot,
            channel: ChatId(channel),
            pm_chat: pm_chat.map(ChatId),
            retry,
        }
    }

    async fn send_text(&self, text: &str, reply_to: Option<MessageId>) -> Result<Message, RelayError> {
        let mut request = self
            .bot
            .send_message(self.channel, text)
            .parse_mode(ParseMode::Html)
            .link_preview_options(no_preview());
        if let Some(id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(id));
        }
        request.await.map_err(classify)
    }

    async fn send_one(
        &self,
        media: &MediaRef,
        caption: Option<String>,
        reply_to: Option<MessageId>,
    ) -> Result<Message, RelayError> {
        let file = media_url(media)?;
        let sent = match media.kind {
            MediaType::Photo => {
                let mut request = self.bot.send_photo(self.channel, file);
                if let Some(caption) = caption {
                    request = request.caption(caption).parse_mode(ParseMode::Html);
                }
                if let Some(id) = reply_to {
                    request = request.reply_parameters(ReplyParameters::new(id));
                }
                request.await
            }
            MediaType::Video => {
                let mut request = self.bot.send_video(self.channel, file);
                if let Some(caption) = caption {
                    request = request.caption(caption).parse_mode(ParseMode::Html);
                }
                if let Some(id) = reply_to {
                    request = request.reply_parameters(ReplyParameters::new(id));
                }
                request.await
            }
        };
        sent.map_err(classify)
    }

    async fn send_group(
        &self,
        group: &[MediaRef],
        caption: Option<String>,
        reply_to: Option<MessageId>,
    ) -> Result<Vec<Message>, RelayError> {
        let mut caption = caption;
        let mut items = Vec::with_capacity(group.len());
        for media in group {
            let file = media_url(media)?;
            let item = match (media.kind, caption.take()) {
                (MediaType::Photo, Some(text)) => InputMedia::Photo(
                    InputMediaPhoto::new(file)
                        .caption(text)
                        .parse_mode(ParseMode::Html),
                ),
                (MediaType::Photo, None) => InputMedia::Photo(InputMediaPhoto::new(file)),
                (MediaType::Video, Some(text)) => InputMedia::Video(
                    InputMediaVideo::new(file)
                        .caption(text)
                        .parse_mode(ParseMode::Html),
                ),
                (MediaType::Video, None) => InputMedia::Video(InputMediaVideo::new(file)),
            };
            items.push(item);
        }

        let mut request = self.bot.send_media_group(self.channel, items);
        if let Some(id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(id));
        }
        request.await.map_err(classify)
    }
}

/// One Bot API call of an outgoing post.
enum Part<'a> {
    Media(&'a MediaRef),
    Group(&'a [MediaRef]),
    Text(&'a str),
}

/// The calls needed for `post`, in sending order. Groups hold at most
/// [`MEDIA_GROUP_MAX`] items and a lone leftover item is sent on its own.
fn parts(post: &OutgoingPost) -> Vec<Part<'_>> {
    let mut parts: Vec<Part<'_>> = post
        .media
        .chunks(MEDIA_GROUP_MAX)
        .map(|group| match group {
            [single] => Part::Media(single),
            group => Part::Group(group),
        })
        .collect();
    parts.extend(post.messages.iter().map(|text| Part::Text(text)));
    parts
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(
        &self,
        post: &OutgoingPost,
        reply_to: Option<i32>,
        progress: &mut PublishProgress,
    ) -> Result<PublishReceipt, RelayError> {
        for (index, part) in parts(post).into_iter().enumerate().skip(progress.sent) {
            let first = index == 0;
            let reply_to = reply_to.filter(|_| first).map(MessageId);
            let caption = post.caption.clone().filter(|_| first);

            let id = match part {
                Part::Media(media) => {
                    self.retry
                        .run("Sending media", || {
                            self.send_one(media, caption.clone(), reply_to)
                        })
                        .await?
                        .id
                }
                Part::Group(group) => {
                    let sent = self
                        .retry
                        .run("Sending media group", || {
                            self.send_group(group, caption.clone(), reply_to)
                        })
                        .await?;
                    sent.first().map(|m| m.id).ok_or_else(|| {
                        RelayError::Rejected("Telegram returned an empty media group".to_string())
                    })?
                }
                Part::Text(text) => {
                    self.retry
                        .run("Sending message", || self.send_text(text, reply_to))
                        .await?
                        .id
                }
            };
            debug!("Sent part {} of post as message {}", index + 1, id.0);
            progress.record(id.0);
        }

        progress
            .first_message_id
            .map(|message_id| PublishReceipt { message_id })
            .ok_or_else(|| RelayError::Rejected("Nothing to publish".to_string()))
    }

    async fn notify(&self, text: &str) {
        let Some(chat) = self.pm_chat else {
            return;
        };
        if let Err(e) = self.bot.send_message(chat, text).await {
            warn!("Failed to send notice to {}: {}", chat.0, e);
        }
    }
}

const GREETING: &str = "Hi! I relay posts between a Mastodon account and a Telegram channel.";

async fn handle_message(bot: Bot, msg: Message) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if text.trim() == "/start" {
        bot.send_message(msg.chat.id, GREETING).await?;
    }
    Ok(())
}

async fn handle_channel_post(
    bot: Bot,
    msg: Message,
    forwarder: Arc<ChannelForwarder>,
) -> ResponseResult<()> {
    if msg.chat.id != forwarder.channel() {
        warn!("Received channel post from unexpected chat {}", msg.chat.id.0);
        bot.send_message(msg.chat.id, "This bot is only for specific channel.")
            .await?;
        return Ok(());
    }

    info!("Received channel post {} from {}", msg.id.0, msg.chat.id.0);
    forwarder.handle(&bot, &msg).await;
    Ok(())
}

/// Run the Telegram side of the bridge until `shutdown` is cancelled.
pub async fn run(bot: Bot, forwarder: Arc<ChannelForwarder>, shutdown: CancellationToken) {
    info!("Starting Telegram dispatcher...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_channel_post().endpoint(handle_channel_post));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![forwarder])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        match token.shutdown() {
            Ok(done) => done.await,
            Err(e) => warn!("Telegram dispatcher was not running: {:?}", e),
        }
    });

    dispatcher.dispatch().await;
    info!("Telegram dispatcher stopped");
}
