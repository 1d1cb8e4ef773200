use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{Account, Application, MediaAttachment, Status, StatusId, Visibility};
use crate::config::MastodonConfig;
use crate::error::RelayError;

/// Largest page the statuses endpoint returns.
pub const PAGE_LIMIT: u32 = 40;

const MEDIA_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct NewStatus {
    pub status: String,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_ids: Vec<String>,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

/// Minimal Mastodon REST client covering what the bridge needs.
pub struct MastodonClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    media_poll_interval: Duration,
}

impl MastodonClient {
    pub fn new(config: &MastodonConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mastodon-telegram-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            access_token: config.access_token.clone(),
            media_poll_interval: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    fn with_media_poll_interval(mut self, interval: Duration) -> Self {
        self.media_poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RelayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::from_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::Rejected(format!("Failed to parse Mastodon response: {}", e)))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RelayError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// The account the access token belongs to.
    pub async fn verify_credentials(&self) -> Result<Account, RelayError> {
        self.get("/api/v1/accounts/verify_credentials", &[]).await
    }

    /// The application the access token was issued to.
    pub async fn verify_app(&self) -> Result<Application, RelayError> {
        self.get("/api/v1/apps/verify_credentials", &[]).await
    }

    /// One page of the account's statuses immediately after `min_id`,
    /// as returned by the server (newest first).
    pub async fn statuses_after(
        &self,
        account_id: &str,
        min_id: &StatusId,
        limit: u32,
    ) -> Result<Vec<Status>, RelayError> {
        let path = format!("/api/v1/accounts/{}/statuses", account_id);
        self.get(
            &path,
            &[
                ("min_id", min_id.to_string()),
                ("limit", limit.min(PAGE_LIMIT).to_string()),
            ],
        )
        .await
    }

    /// The account's newest status, if it has any.
    pub async fn latest_status(&self, account_id: &str) -> Result<Option<Status>, RelayError> {
        let path = format!("/api/v1/accounts/{}/statuses", account_id);
        let statuses: Vec<Status> = self.get(&path, &[("limit", "1".to_string())]).await?;
        Ok(statuses.into_iter().next())
    }

    /// Upload a media file and wait until the server has processed it.
    /// Returns the attachment id to reference from a new status.
    pub async fn upload_media(
        &self,
        data: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> Result<String, RelayError> {
        let size = data.len();
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| RelayError::Rejected(format!("Invalid media type {}: {}", mime, e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("/api/v2/media"))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await?;
        let processing = response.status() == reqwest::StatusCode::ACCEPTED;
        let attachment: MediaAttachment = Self::read_json(response).await?;
        info!(
            "Uploaded media {} ({} bytes) as attachment {}",
            file_name, size, attachment.id
        );

        if processing || attachment.url.is_none() {
            self.wait_for_media(&attachment.id).await?;
        }
        Ok(attachment.id)
    }

    async fn wait_for_media(&self, id: &str) -> Result<(), RelayError> {
        let url = self.url(&format!("/api/v1/media/{}", id));
        for attempt in 1..=MEDIA_POLL_ATTEMPTS {
            tokio::time::sleep(self.media_poll_interval).await;
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await?;
            // 206 Partial Content while the server is still processing.
            if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
                debug!("Media {} still processing (attempt {})", id, attempt);
                continue;
            }
            let attachment: MediaAttachment = Self::read_json(response).await?;
            if attachment.url.is_some() {
                return Ok(());
            }
        }
        Err(RelayError::transient(format!(
            "Media {} was not processed after {} checks",
            id, MEDIA_POLL_ATTEMPTS
        )))
    }

    pub async fn post_status(&self, status: &NewStatus) -> Result<Status, RelayError> {
        let mut request = self
            .client
            .post(self.url("/api/v1/statuses"))
            .bearer_auth(&self.access_token)
            .json(status);
        if let Some(key) = &status.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await?;
        Self::read_json(response).await
    }
}
