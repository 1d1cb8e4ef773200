//! The Mastodon to Telegram bridge loop.
//!
//! Each cycle fetches statuses newer than the stored relay record, publishes
//! them oldest first and moves the record forward after every status. A
//! status that cannot be published stops the cycle so that nothing after
//! it is relayed out of order.

pub mod retry;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::RelayError;
use crate::filter::StatusFilter;
use crate::mastodon::source::StatusSource;
use crate::mastodon::{Status, StatusId};
use crate::platform::{PublishProgress, Publisher};
use crate::transform::Transformer;

use self::retry::RetryPolicy;
use self::store::SqliteRelayStore;

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    pub filtered: usize,
    pub given_up: usize,
    /// The cycle stopped early on a failure and will resume next time.
    pub stalled: bool,
}

impl CycleReport {
    fn is_idle(&self) -> bool {
        self.published == 0 && self.filtered == 0 && self.given_up == 0 && !self.stalled
    }
}

/// A status that failed to publish and will be tried again.
#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    /// Cycles in which Telegram rejected the status.
    rejections: u32,
    progress: PublishProgress,
}

pub struct Bridge<S, P> {
    source: Arc<S>,
    publisher: Arc<P>,
    store: SqliteRelayStore,
    account_id: String,
    filter: StatusFilter,
    transformer: Transformer,
    retry: RetryPolicy,
    give_up_after: u32,
    pending: HashMap<StatusId, Pending>,
}

impl<S: StatusSource, P: Publisher> Bridge<S, P> {
    pub fn new(
        source: Arc<S>,
        publisher: Arc<P>,
        store: SqliteRelayStore,
        account_id: impl Into<String>,
        filter: StatusFilter,
        transformer: Transformer,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            source,
            publisher,
            store,
            account_id: account_id.into(),
            filter,
            transformer,
            retry: RetryPolicy::new(retry),
            give_up_after: retry.give_up_after.max(1),
            pending: HashMap::new(),
        }
    }

    /// Poll every `interval` until `shutdown` is cancelled. Cancellation is
    /// only observed between cycles. Returns an error on authentication
    /// failures and storage errors.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Bridge loop started for account {} (every {:?})",
            self.account_id, interval
        );
        loop {
            let report = self.run_cycle().await?;
            if !report.is_idle() {
                info!(
                    "Cycle done: {} published, {} filtered, {} given up{}",
                    report.published,
                    report.filtered,
                    report.given_up,
                    if report.stalled { ", stalled" } else { "" }
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Bridge loop stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Run a single fetch and publish pass.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let Some(record) = self.store.load(&self.account_id).await? else {
            self.bootstrap(&mut report).await?;
            return Ok(report);
        };

        let mut watermark = record.status_id;
        let statuses = match self
            .retry
            .run("Fetching statuses", || {
                self.source.fetch_after(Some(&watermark))
            })
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                fail_on_auth(e, &mut report)?;
                return Ok(report);
            }
        };

        for status in statuses {
            if status.id <= watermark {
                continue;
            }

            if let Some(reason) = self.filter.skip_reason(&status) {
                debug!("Skipping status {}: {}", status.id, reason);
                self.advance(&status.id, None).await?;
                watermark = status.id;
                report.filtered += 1;
                continue;
            }

            let post = self.transformer.transform(&status);
            if post.is_empty() {
                debug!("Skipping status {}: nothing to send", status.id);
                self.advance(&status.id, None).await?;
                watermark = status.id;
                report.filtered += 1;
                continue;
            }

            let reply_to = self.reply_target(&status).await?;
            let mut progress = self
                .pending
                .get(&status.id)
                .map(|p| p.progress)
                .unwrap_or_default();
            debug!(
                "Publishing status {} from {} (resuming after {} parts)",
                status.id, status.created_at, progress.sent
            );
            let result = self.publisher.publish(&post, reply_to, &mut progress).await;

            match result {
                Ok(receipt) => {
                    info!(
                        "Relayed status {} as message {}",
                        status.id, receipt.message_id
                    );
                    self.pending.remove(&status.id);
                    self.advance(&status.id, Some(receipt.message_id)).await?;
                    watermark = status.id;
                    report.published += 1;
                }
                Err(e) if e.is_auth() => {
                    return Err(e).context("Telegram authentication failed");
                }
                Err(e) => {
                    let pending = self.pending.entry(status.id.clone()).or_default();
                    pending.progress = progress;

                    // Outages hold the status back for as long as they last.
                    if e.is_transient() {
                        warn!("Failed to relay status {}, retrying next cycle: {}", status.id, e);
                        report.stalled = true;
                        break;
                    }

                    pending.rejections += 1;
                    let rejections = pending.rejections;
                    if rejections < self.give_up_after {
                        warn!(
                            "Telegram rejected status {} ({}/{}): {}",
                            status.id, rejections, self.give_up_after, e
                        );
                        report.stalled = true;
                        break;
                    }

                    error!(
                        "Giving up on status {} after {} rejections ({} parts sent): {}",
                        status.id, rejections, progress.sent, e
                    );
                    self.publisher
                        .notify(&format!(
                            "Gave up relaying status {} ({}): {}",
                            status.id,
                            status.url.as_deref().unwrap_or("no url"),
                            e
                        ))
                        .await;
                    self.pending.remove(&status.id);
                    // Parts already in the channel still anchor replies.
                    self.advance(&status.id, progress.first_message_id).await?;
                    watermark = status.id;
                    report.given_up += 1;
                }
            }
        }

        Ok(report)
    }

    /// Start from the newest existing status so history is not replayed.
    async fn bootstrap(&self, report: &mut CycleReport) -> Result<()> {
        let latest = match self
            .retry
            .run("Fetching latest status", || self.source.latest_id())
            .await
        {
            Ok(latest) => latest.unwrap_or_else(|| StatusId::new("0")),
            Err(e) => return fail_on_auth(e, report),
        };

        self.advance(&latest, None).await?;
        info!(
            "No relay record for account {}; starting after status {}",
            self.account_id, latest
        );
        Ok(())
    }

    async fn advance(&self, status_id: &StatusId, message_id: Option<i32>) -> Result<()> {
        self.store
            .advance(&self.account_id, status_id, message_id)
            .await
    }

    /// Telegram message to reply to when `status` continues one of our own
    /// relayed threads.
    async fn reply_target(&self, status: &Status) -> Result<Option<i32>> {
        let (Some(parent), Some(parent_account)) = (
            status.in_reply_to_id.as_ref(),
            status.in_reply_to_account_id.as_deref(),
        ) else {
            return Ok(None);
        };
        if parent_account != self.account_id {
            return Ok(None);
        }
        self.store.message_for(&self.account_id, parent).await
    }
}

/// Authentication failures end the loop; anything else stalls the cycle.
fn fail_on_auth(e: RelayError, report: &mut CycleReport) -> Result<()> {
    if e.is_auth() {
        return Err(e).context("Mastodon authentication failed");
    }
    warn!("Cycle stalled: {}", e);
    report.stalled = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mastodon::fixtures::status;
    use crate::mastodon::Visibility;
    use crate::platform::PublishReceipt;
    use crate::transform::OutgoingPost;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const CONFIG: &str = r#"
[mastodon]
api_base_url = "https://mastodon.example"
access_token = "token"

[telegram]
bot_token = "123:abc"

[retry]
attempts = 2
initial_backoff_ms = 0
max_backoff_ms = 0
give_up_after = 3

[mastodon_to_telegram]
channel_chat_id = -1001

[mastodon_to_telegram.filter]
scope = ["public"]

[telegram_to_mastodon]
disable = true
"#;

    #[derive(Default)]
    struct FakeSource {
        statuses: Mutex<Vec<Status>>,
        latest: Option<StatusId>,
        error: Mutex<Option<RelayError>>,
    }

    impl FakeSource {
        fn with(ids: &[&str]) -> Self {
            let source = Self::default();
            for id in ids {
                source.push(status(id, &format!("<p>status {}</p>", id)));
            }
            source
        }

        fn push(&self, status: Status) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    #[async_trait]
    impl StatusSource for FakeSource {
        async fn fetch_after(&self, after: Option<&StatusId>) -> Result<Vec<Status>, RelayError> {
            if let Some(e) = self.error.lock().unwrap().take() {
                return Err(e);
            }
            let mut statuses: Vec<Status> = self
                .statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|s| after.map_or(true, |a| s.id > *a))
                .cloned()
                .collect();
            statuses.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(statuses)
        }

        async fn latest_id(&self) -> Result<Option<StatusId>, RelayError> {
            Ok(self.latest.clone())
        }
    }

    #[derive(Clone, Copy)]
    enum Fail {
        Transient,
        Rejected,
        Auth,
    }

    /// Sends the caption and each message of a post as separate parts.
    #[derive(Default)]
    struct FakePublisher {
        sent: Mutex<Vec<(String, Option<i32>)>>,
        calls: Mutex<usize>,
        /// Parts containing the text fail this many times.
        failing: Mutex<HashMap<String, (Fail, u32)>>,
        notices: Mutex<Vec<String>>,
    }

    impl FakePublisher {
        fn fail(&self, needle: &str, kind: Fail, times: u32) {
            self.failing
                .lock()
                .unwrap()
                .insert(needle.to_string(), (kind, times));
        }

        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(
            &self,
            post: &OutgoingPost,
            reply_to: Option<i32>,
            progress: &mut PublishProgress,
        ) -> Result<PublishReceipt, RelayError> {
            *self.calls.lock().unwrap() += 1;
            let parts: Vec<&String> = post.caption.iter().chain(&post.messages).collect();

            for (index, text) in parts.into_iter().enumerate().skip(progress.sent) {
                for (needle, (kind, remaining)) in self.failing.lock().unwrap().iter_mut() {
                    if *remaining > 0 && text.contains(needle.as_str()) {
                        *remaining -= 1;
                        return Err(match kind {
                            Fail::Transient => RelayError::transient("timeout"),
                            Fail::Rejected => RelayError::Rejected("HTTP 400: bad".to_string()),
                            Fail::Auth => RelayError::Auth("HTTP 401".to_string()),
                        });
                    }
                }

                let mut sent = self.sent.lock().unwrap();
                sent.push((text.clone(), reply_to.filter(|_| index == 0)));
                progress.record(1000 + sent.len() as i32);
            }

            Ok(PublishReceipt {
                message_id: progress.first_message_id.unwrap_or_default(),
            })
        }

        async fn notify(&self, text: &str) {
            self.notices.lock().unwrap().push(text.to_string());
        }
    }

    async fn bridge(
        source: Arc<FakeSource>,
        publisher: Arc<FakePublisher>,
        record: Option<&str>,
    ) -> (Bridge<FakeSource, FakePublisher>, SqliteRelayStore) {
        let config = Config::parse(CONFIG).unwrap();
        let store = SqliteRelayStore::open_in_memory().unwrap();
        if let Some(id) = record {
            store.advance("1", &StatusId::from(id), None).await.unwrap();
        }
        let m2t = &config.mastodon_to_telegram;
        let filter = StatusFilter::new(&m2t.filter, "1", None, m2t.relay_self_replies);
        let bridge = Bridge::new(
            source,
            publisher,
            store.clone(),
            "1",
            filter,
            Transformer::new(m2t),
            &config.retry,
        );
        (bridge, store)
    }

    async fn record(store: &SqliteRelayStore) -> String {
        store.load("1").await.unwrap().unwrap().status_id.to_string()
    }

    #[tokio::test]
    async fn test_publishes_new_statuses_in_order() {
        let source = Arc::new(FakeSource::with(&["103", "101", "102", "99"]));
        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 3);
        assert!(!report.stalled);

        let texts = publisher.texts();
        assert!(texts[0].starts_with("status 101"));
        assert!(texts[1].starts_with("status 102"));
        assert!(texts[2].starts_with("status 103"));
        assert_eq!(record(&store).await, "103");
        assert_eq!(store.load("1").await.unwrap().unwrap().message_id, Some(1003));
    }

    #[tokio::test]
    async fn test_second_cycle_publishes_nothing() {
        let source = Arc::new(FakeSource::with(&["101", "102"]));
        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, _store) = bridge(source, publisher.clone(), Some("100")).await;

        bridge.run_cycle().await.unwrap();
        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(publisher.texts().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_holds_back_later_statuses() {
        let source = Arc::new(FakeSource::with(&["101", "102", "103"]));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("status 102", Fail::Transient, 1);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(report.stalled);
        assert_eq!(record(&store).await, "101");
        assert_eq!(publisher.texts().len(), 1);

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(record(&store).await, "103");
        let texts = publisher.texts();
        assert!(texts[1].starts_with("status 102"));
        assert!(texts[2].starts_with("status 103"));
    }

    #[tokio::test]
    async fn test_outage_never_gives_up() {
        let source = Arc::new(FakeSource::with(&["101", "102"]));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("status 101", Fail::Transient, u32::MAX);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        // One more cycle than give_up_after.
        for _ in 0..4 {
            let report = bridge.run_cycle().await.unwrap();
            assert!(report.stalled);
            assert_eq!(report.given_up, 0);
            assert_eq!(record(&store).await, "100");
        }
        assert!(publisher.texts().is_empty());
        assert!(publisher.notices.lock().unwrap().is_empty());

        publisher.failing.lock().unwrap().clear();
        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(record(&store).await, "102");
    }

    fn long_status(id: &str) -> Status {
        // Too long for one message: the tail lands in a second part.
        status(
            id,
            &format!("<p>status {} {} TAIL</p>", id, "word ".repeat(1000)),
        )
    }

    #[tokio::test]
    async fn test_partly_sent_status_resumes_at_failed_part() {
        let source = Arc::new(FakeSource::default());
        source.push(long_status("101"));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("TAIL", Fail::Transient, 1);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let report = bridge.run_cycle().await.unwrap();
        assert!(report.stalled);
        assert_eq!(record(&store).await, "100");
        assert_eq!(publisher.texts().len(), 1);

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
        let texts = publisher.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("status 101"));
        assert!(texts[1].contains("TAIL"));
        assert_eq!(store.load("1").await.unwrap().unwrap().message_id, Some(1001));
    }

    #[tokio::test]
    async fn test_given_up_status_keeps_sent_parts() {
        let source = Arc::new(FakeSource::default());
        source.push(long_status("101"));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("TAIL", Fail::Rejected, u32::MAX);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        for _ in 0..2 {
            assert!(bridge.run_cycle().await.unwrap().stalled);
        }
        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.given_up, 1);

        // The first part went out once and still maps to the status.
        assert_eq!(publisher.texts().len(), 1);
        let record = store.load("1").await.unwrap().unwrap();
        assert_eq!(record.status_id.to_string(), "101");
        assert_eq!(record.message_id, Some(1001));
    }

    #[tokio::test]
    async fn test_gives_up_on_poison_status() {
        let source = Arc::new(FakeSource::with(&["101", "102"]));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("status 101", Fail::Rejected, u32::MAX);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        for _ in 0..2 {
            let report = bridge.run_cycle().await.unwrap();
            assert!(report.stalled);
            assert_eq!(record(&store).await, "100");
        }
        // One publish attempt per cycle.
        assert_eq!(*publisher.calls.lock().unwrap(), 2);

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.given_up, 1);
        assert_eq!(report.published, 1);
        assert_eq!(record(&store).await, "102");

        let notices = publisher.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("101"));
    }

    #[tokio::test]
    async fn test_auth_failure_stops_the_loop() {
        let source = Arc::new(FakeSource::with(&["101"]));
        let publisher = Arc::new(FakePublisher::default());
        publisher.fail("status 101", Fail::Auth, 1);
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let err = bridge.run_cycle().await.unwrap_err();
        assert!(format!("{:#}", err).contains("authentication failed"));
        assert_eq!(record(&store).await, "100");
    }

    #[tokio::test]
    async fn test_source_failures() {
        let source = Arc::new(FakeSource::with(&["101"]));
        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, store) = bridge(source.clone(), publisher.clone(), Some("100")).await;

        *source.error.lock().unwrap() = Some(RelayError::Rejected("HTTP 404".to_string()));
        let report = bridge.run_cycle().await.unwrap();
        assert!(report.stalled);
        assert_eq!(record(&store).await, "100");

        *source.error.lock().unwrap() = Some(RelayError::Auth("HTTP 401".to_string()));
        assert!(bridge.run_cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_filtered_statuses_advance_the_record() {
        let source = Arc::new(FakeSource::with(&["101"]));
        let mut private = status("102", "<p>private</p>");
        private.visibility = Visibility::Private;
        source.push(private);
        let mut reply = status("103", "<p>reply to someone</p>");
        reply.in_reply_to_id = Some(StatusId::from("50"));
        reply.in_reply_to_account_id = Some("2".to_string());
        source.push(reply);

        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.filtered, 2);
        assert_eq!(record(&store).await, "103");
        assert_eq!(publisher.texts().len(), 1);
    }

    #[tokio::test]
    async fn test_self_reply_is_threaded() {
        let source = Arc::new(FakeSource::with(&["101"]));
        let mut reply = status("102", "<p>more</p>");
        reply.in_reply_to_id = Some(StatusId::from("101"));
        reply.in_reply_to_account_id = Some("1".to_string());
        source.push(reply);

        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, _store) = bridge(source, publisher.clone(), Some("100")).await;
        bridge.run_cycle().await.unwrap();

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent[0].1, None);
        assert_eq!(sent[1].1, Some(1001));
    }

    #[tokio::test]
    async fn test_first_start_does_not_replay_history() {
        let source = Arc::new(FakeSource {
            latest: Some(StatusId::from("102")),
            ..FakeSource::with(&["101", "102"])
        });
        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, store) = bridge(source.clone(), publisher.clone(), None).await;

        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(record(&store).await, "102");

        source.push(status("103", "<p>status 103</p>"));
        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(publisher.texts()[0].starts_with("status 103"));
    }

    #[tokio::test]
    async fn test_first_start_on_empty_account() {
        let source = Arc::new(FakeSource::default());
        let publisher = Arc::new(FakePublisher::default());
        let (mut bridge, store) = bridge(source.clone(), publisher.clone(), None).await;

        bridge.run_cycle().await.unwrap();
        assert_eq!(record(&store).await, "0");

        source.push(status("5", "<p>status 5</p>"));
        let report = bridge.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let source = Arc::new(FakeSource::with(&["101"]));
        let publisher = Arc::new(FakePublisher::default());
        let (bridge, store) = bridge(source, publisher.clone(), Some("100")).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(Duration::from_secs(3600), shutdown.clone()));
        // The first cycle runs before the loop waits.
        while publisher.texts().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(record(&store).await, "101");
    }
}
