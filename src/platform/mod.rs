pub mod telegram;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::transform::OutgoingPost;

/// Result of publishing one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Id of the first message the post produced.
    pub message_id: i32,
}

/// How much of a multi-part post has been delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishProgress {
    /// Parts already sent.
    pub sent: usize,
    /// Id of the first message sent for the post.
    pub first_message_id: Option<i32>,
}

impl PublishProgress {
    pub fn record(&mut self, message_id: i32) {
        self.sent += 1;
        self.first_message_id.get_or_insert(message_id);
    }
}

/// Destination for relayed statuses.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `post`, threading it under `reply_to` when given.
    ///
    /// Parts already counted in `progress` are skipped and every part sent
    /// is recorded there, so calling again after a failure resumes at the
    /// part that failed.
    async fn publish(
        &self,
        post: &OutgoingPost,
        reply_to: Option<i32>,
        progress: &mut PublishProgress,
    ) -> Result<PublishReceipt, RelayError>;

    /// Best-effort notice to the operator. Failures are only logged.
    async fn notify(&self, _text: &str) {}
}
