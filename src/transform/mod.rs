pub mod html;
pub mod render;

use crate::config::MastodonToTelegramConfig;
use crate::footer::TelegramFooter;
use crate::mastodon::{MediaKind, Status};

use self::html::{parse_html, Block, Document, Style};
use self::render::{render_document, render_single};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Photo,
    Video,
}

/// A media file Telegram should fetch by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaType,
    pub url: String,
}

/// What gets sent to Telegram for one status, in order: the media (with
/// `caption` on the first item), then each of `messages`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingPost {
    pub media: Vec<MediaRef>,
    pub caption: Option<String>,
    pub messages: Vec<String>,
}

impl OutgoingPost {
    pub fn is_empty(&self) -> bool {
        self.media.is_empty() && self.caption.is_none() && self.messages.is_empty()
    }
}

/// Turns Mastodon statuses into Telegram posts.
#[derive(Debug, Clone)]
pub struct Transformer {
    message_limit: usize,
    caption_limit: usize,
    relay_media: bool,
    reblog_link_only: bool,
    footer: TelegramFooter,
}

impl Transformer {
    pub fn new(config: &MastodonToTelegramConfig) -> Self {
        Self {
            message_limit: config.message_limit,
            caption_limit: config.caption_limit,
            relay_media: config.relay_media,
            reblog_link_only: config.forward_reblog_link_only,
            footer: TelegramFooter::new(&config.footer),
        }
    }

    pub fn transform(&self, status: &Status) -> OutgoingPost {
        let (doc, media) = self.compose(status);

        if !media.is_empty() {
            if doc.is_empty() {
                return OutgoingPost {
                    media,
                    ..OutgoingPost::default()
                };
            }
            if let Some(caption) = render_single(&doc, self.caption_limit) {
                return OutgoingPost {
                    media,
                    caption: Some(caption),
                    messages: Vec::new(),
                };
            }
        }

        OutgoingPost {
            media,
            caption: None,
            messages: render_document(&doc, self.message_limit),
        }
    }

    fn compose(&self, status: &Status) -> (Document, Vec<MediaRef>) {
        let mut doc = Document::default();
        let mut media = Vec::new();

        let link = match status.reblog.as_deref() {
            Some(original) => {
                let mut header = Block::default();
                header.push(
                    &format!("🔁 Boosted from {}", original.account.name()),
                    Style::bold(),
                );
                doc.push_block(header);

                if self.reblog_link_only {
                    if let Some(url) = original.url.as_deref() {
                        let mut block = Block::default();
                        block.push(url, Style::link(url));
                        doc.push_block(block);
                    }
                    None
                } else {
                    self.push_body(&mut doc, &mut media, original);
                    original.url.as_deref()
                }
            }
            None => {
                self.push_body(&mut doc, &mut media, status);
                status.url.as_deref()
            }
        };

        let footer = self.footer.lines(link);
        if !footer.is_empty() {
            doc.push_block(Block::plain(footer.join("\n")));
        }
        (doc, media)
    }

    fn push_body(&self, doc: &mut Document, media: &mut Vec<MediaRef>, status: &Status) {
        let mut body = parse_html(&status.content);

        let spoiler = status.spoiler_text.trim();
        if !spoiler.is_empty() {
            let mut warning = Block::default();
            warning.push(&format!("CW: {}", spoiler), Style::bold());
            doc.push_block(warning);
            for span in body.blocks.iter_mut().flat_map(|b| b.spans.iter_mut()) {
                span.style.spoiler = true;
            }
        }
        doc.blocks.append(&mut body.blocks);

        let mut links = Vec::new();
        for attachment in &status.media_attachments {
            let Some(url) = attachment.source_url() else {
                continue;
            };
            let kind = match attachment.kind {
                MediaKind::Image if self.relay_media => Some(MediaType::Photo),
                MediaKind::Video | MediaKind::Gifv if self.relay_media => Some(MediaType::Video),
                _ => None,
            };
            match kind {
                Some(kind) => media.push(MediaRef {
                    kind,
                    url: url.to_string(),
                }),
                None => links.push(match attachment.description.as_deref().map(str::trim) {
                    Some(alt) if !alt.is_empty() => format!("📎 {} ({})", url, alt),
                    _ => format!("📎 {}", url),
                }),
            }
        }
        if !links.is_empty() {
            doc.push_block(Block::plain(links.join("\n")));
        }
    }
}
