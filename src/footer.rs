use crate::config::{MastodonFooterConfig, TelegramFooterConfig};

/// Footer lines appended to statuses relayed to Telegram.
#[derive(Debug, Clone)]
pub struct TelegramFooter {
    add_link: bool,
    tags: Vec<String>,
}

impl TelegramFooter {
    pub fn new(config: &TelegramFooterConfig) -> Self {
        Self {
            add_link: config.add_link,
            tags: config.tags.clone(),
        }
    }

    /// `link` is the URL of the status whose content is being relayed.
    pub fn lines(&self, link: Option<&str>) -> Vec<String> {
        let mut lines = Vec::new();
        if self.add_link {
            if let Some(link) = link.filter(|l| !l.is_empty()) {
                lines.push(link.to_string());
            }
        }
        if !self.tags.is_empty() {
            lines.push(self.tags.join(" "));
        }
        lines
    }
}

/// Where a forwarded Telegram post originally came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardOrigin {
    pub name: Option<String>,
    pub link: Option<String>,
}

/// Footer lines appended to channel posts relayed to Mastodon.
#[derive(Debug, Clone)]
pub struct MastodonFooter {
    add_link: bool,
    show_forward_from: bool,
}

impl MastodonFooter {
    pub fn new(config: &MastodonFooterConfig) -> Self {
        Self {
            add_link: config.add_link,
            show_forward_from: config.show_forward_from,
        }
    }

    pub fn lines(&self, origin: &ForwardOrigin, message_link: Option<&str>) -> Vec<String> {
        let mut lines = Vec::new();
        if self.show_forward_from {
            if let Some(name) = &origin.name {
                lines.push(format!("Forwarded from {}", name));
            }
            if let Some(link) = &origin.link {
                lines.push(link.clone());
            }
        }
        if self.add_link {
            if let Some(link) = message_link {
                lines.push(link.to_string());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telegram_footer() {
        let footer = TelegramFooter::new(&TelegramFooterConfig {
            add_link: true,
            tags: vec!["#mastodon".to_string(), "#fedi".to_string()],
        });
        assert_eq!(
            footer.lines(Some("https://m.example/@a/1")),
            vec!["https://m.example/@a/1", "#mastodon #fedi"]
        );
        assert_eq!(footer.lines(None), vec!["#mastodon #fedi"]);

        let bare = TelegramFooter::new(&TelegramFooterConfig {
            add_link: false,
            tags: Vec::new(),
        });
        assert!(bare.lines(Some("https://m.example/@a/1")).is_empty());
    }

    #[test]
    fn test_mastodon_footer() {
        let origin = ForwardOrigin {
            name: Some("News Channel".to_string()),
            link: Some("https://t.me/news/77".to_string()),
        };
        let footer = MastodonFooter::new(&MastodonFooterConfig {
            add_link: true,
            show_forward_from: true,
        });
        assert_eq!(
            footer.lines(&origin, Some("https://t.me/c/123/5")),
            vec![
                "Forwarded from News Channel",
                "https://t.me/news/77",
                "https://t.me/c/123/5"
            ]
        );

        let quiet = MastodonFooter::new(&MastodonFooterConfig {
            add_link: false,
            show_forward_from: false,
        });
        assert!(quiet.lines(&origin, Some("https://t.me/c/123/5")).is_empty());
        assert!(footer.lines(&ForwardOrigin::default(), None).is_empty());
    }
}
