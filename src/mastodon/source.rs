use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::client::{MastodonClient, PAGE_LIMIT};
use super::{Account, Status, StatusId};
use crate::error::RelayError;

/// Where new statuses come from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Statuses strictly newer than `after`, oldest first. `None` means from
    /// the beginning of the account.
    async fn fetch_after(&self, after: Option<&StatusId>) -> Result<Vec<Status>, RelayError>;

    /// Id of the newest status, used to start without replaying history.
    async fn latest_id(&self) -> Result<Option<StatusId>, RelayError>;
}

/// Polls one account's statuses through the REST API.
pub struct MastodonSource {
    client: Arc<MastodonClient>,
    account: Account,
    max_pages: u32,
}

impl MastodonSource {
    pub fn new(client: Arc<MastodonClient>, account: Account, max_pages: u32) -> Self {
        Self {
            client,
            account,
            max_pages,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }
}

#[async_trait]
impl StatusSource for MastodonSource {
    async fn fetch_after(&self, after: Option<&StatusId>) -> Result<Vec<Status>, RelayError> {
        let mut cursor = after.cloned().unwrap_or_else(|| StatusId::new("0"));
        let mut collected: Vec<Status> = Vec::new();

        for _ in 0..self.max_pages {
            let mut page = self
                .client
                .statuses_after(&self.account.id, &cursor, PAGE_LIMIT)
                .await?;
            let full = page.len() as u32 >= PAGE_LIMIT;
            page.retain(|s| s.id > cursor);
            if page.is_empty() {
                break;
            }
            page.sort_by(|a, b| a.id.cmp(&b.id));
            if let Some(last) = page.last() {
                cursor = last.id.clone();
            }
            collected.extend(page);
            if !full {
                break;
            }
        }

        debug!(
            "Fetched {} status(es) after {}",
            collected.len(),
            after.map(|a| a.as_str()).unwrap_or("<start>")
        );
        Ok(collected)
    }

    async fn latest_id(&self) -> Result<Option<StatusId>, RelayError> {
        Ok(self
            .client
            .latest_status(&self.account.id)
            .await?
            .map(|s| s.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MastodonConfig;
    use crate::mastodon::fixtures;
    use mockito::Matcher;

    fn page(ids: &[u64]) -> String {
        let items: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"id":"{id}","created_at":"2024-05-01T12:00:00Z","content":"","visibility":"public",
                       "account":{{"id":"7","username":"alice","acct":"alice"}}}}"#
                )
            })
            .collect();
        format!("[{}]", items.join(","))
    }

    fn source_for(server: &mockito::ServerGuard, max_pages: u32) -> MastodonSource {
        let client = MastodonClient::new(&MastodonConfig {
            api_base_url: server.url(),
            access_token: "secret".to_string(),
        })
        .unwrap();
        MastodonSource::new(Arc::new(client), fixtures::account("7"), max_pages)
    }

    #[tokio::test]
    async fn test_fetch_after_paginates_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        // First page is full (40 items, newest first), second page is short.
        let first: Vec<u64> = (101..=140).rev().collect();
        server
            .mock("GET", "/api/v1/accounts/7/statuses")
            .match_query(Matcher::UrlEncoded("min_id".into(), "100".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page(&first))
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/accounts/7/statuses")
            .match_query(Matcher::UrlEncoded("min_id".into(), "140".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page(&[142, 141]))
            .create_async()
            .await;

        let source = source_for(&server, 5);
        let statuses = source
            .fetch_after(Some(&StatusId::from("100")))
            .await
            .unwrap();
        assert_eq!(statuses.len(), 42);
        assert_eq!(statuses[0].id, StatusId::from("101"));
        assert_eq!(statuses[41].id, StatusId::from("142"));
        assert!(statuses.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_fetch_after_respects_page_cap() {
        let mut server = mockito::Server::new_async().await;
        let first: Vec<u64> = (101..=140).rev().collect();
        let mock = server
            .mock("GET", "/api/v1/accounts/7/statuses")
            .match_query(Matcher::UrlEncoded("min_id".into(), "100".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page(&first))
            .expect(1)
            .create_async()
            .await;

        let source = source_for(&server, 1);
        let statuses = source
            .fetch_after(Some(&StatusId::from("100")))
            .await
            .unwrap();
        assert_eq!(statuses.len(), 40);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_without_record_starts_from_zero() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/accounts/7/statuses")
            .match_query(Matcher::UrlEncoded("min_id".into(), "0".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let statuses = source_for(&server, 5).fetch_after(None).await.unwrap();
        assert!(statuses.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_latest_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/accounts/7/statuses")
            .match_query(Matcher::UrlEncoded("limit".into(), "1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page(&[150]))
            .create_async()
            .await;

        let latest = source_for(&server, 5).latest_id().await.unwrap();
        assert_eq!(latest, Some(StatusId::from("150")));
    }
}
