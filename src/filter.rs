use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::StatusFilterConfig;
use crate::mastodon::{Status, Visibility};

/// Decides which of the account's statuses are relayed to Telegram.
#[derive(Debug, Clone)]
pub struct StatusFilter {
    account_id: String,
    app_name: Option<String>,
    scope: Vec<Visibility>,
    relay_self_replies: bool,
}

impl StatusFilter {
    /// `app_name` is the name of the bridge's own Mastodon application;
    /// statuses it posted came from Telegram and are not sent back.
    pub fn new(
        config: &StatusFilterConfig,
        account_id: impl Into<String>,
        app_name: Option<String>,
        relay_self_replies: bool,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            app_name,
            scope: config.scope.clone(),
            relay_self_replies,
        }
    }

    /// Why `status` should not be relayed, or `None` if it should.
    pub fn skip_reason(&self, status: &Status) -> Option<String> {
        if !self.scope.contains(&status.visibility) {
            return Some(format!("visibility {} is out of scope", status.visibility));
        }
        if status.in_reply_to_id.is_some() {
            let self_reply =
                status.in_reply_to_account_id.as_deref() == Some(self.account_id.as_str());
            if !self_reply {
                return Some("reply to another account".to_string());
            }
            if !self.relay_self_replies {
                return Some("self-reply".to_string());
            }
        }
        if let (Some(own), Some(app)) = (&self.app_name, &status.application) {
            if app.name == *own {
                return Some(format!("posted by {}", own));
            }
        }
        None
    }

    #[cfg(test)]
    pub fn accepts(&self, status: &Status) -> bool {
        self.skip_reason(status).is_none()
    }
}

/// Hashtag include/exclude lists for posts going to Mastodon.
#[derive(Debug, Clone)]
pub struct TagFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl TagFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        for tag in include.iter().chain(exclude) {
            if !tag.starts_with('#') || tag.len() < 2 {
                bail!("Tag {:?} must start with '#'", tag);
            }
        }
        if let Some(tag) = include
            .iter()
            .find(|t| exclude.iter().any(|e| e.eq_ignore_ascii_case(t)))
        {
            bail!("Include and exclude tags overlap: {}", tag);
        }

        Ok(Self {
            include: tag_regex(include).context("Invalid include tags")?,
            exclude: tag_regex(exclude).context("Invalid exclude tags")?,
        })
    }

    pub fn accepts(&self, text: &str) -> bool {
        if self.exclude.as_ref().is_some_and(|re| re.is_match(text)) {
            return false;
        }
        self.include.as_ref().map_or(true, |re| re.is_match(text))
    }
}

fn tag_regex(tags: &[String]) -> Result<Option<Regex>> {
    if tags.is_empty() {
        return Ok(None);
    }
    let alternatives: Vec<String> = tags.iter().map(|t| regex::escape(t)).collect();
    let pattern = format!(r"(?i)(?:^|[^\w#])(?:{})(?:$|[^\w])", alternatives.join("|"));
    Ok(Some(Regex::new(&pattern)?))
}
