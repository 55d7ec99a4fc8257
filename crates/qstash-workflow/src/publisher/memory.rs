// In-memory queue publisher
// Decision: Records every call instead of delivering anything, so tests can assert on
//           exactly what an invocation handed to the queue

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CancelOutcome, MessageId, PublishRequest, PublisherError, QueuePublisher};

/// Queue publisher that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    /// One entry per `publish` or `batch_publish` call
    calls: RwLock<Vec<Vec<PublishRequest>>>,
    cancelled: RwLock<Vec<String>>,
    finished: RwLock<Vec<String>>,
    unknown_runs: RwLock<HashSet<String>>,
    next_id: AtomicU64,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `cancel(run_id)` and `finish(run_id)` report that the queue has no such run
    pub fn with_unknown_run(self, run_id: impl Into<String>) -> Self {
        self.unknown_runs.write().insert(run_id.into());
        self
    }

    /// Every published message, flattened in publish order
    pub fn published(&self) -> Vec<PublishRequest> {
        self.calls.read().iter().flatten().cloned().collect()
    }

    /// Messages grouped by the call that published them
    pub fn publish_calls(&self) -> Vec<Vec<PublishRequest>> {
        self.calls.read().clone()
    }

    /// Run ids passed to `cancel`, in call order
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.read().clone()
    }

    /// Run ids passed to `finish`, in call order
    pub fn finished(&self) -> Vec<String> {
        self.finished.read().clone()
    }

    pub fn clear(&self) {
        self.calls.write().clear();
        self.cancelled.write().clear();
        self.finished.write().clear();
    }

    fn delete_run(&self, run_id: &str, deleted: &RwLock<Vec<String>>) -> CancelOutcome {
        if self.unknown_runs.read().contains(run_id) {
            return CancelOutcome::NotFound;
        }
        deleted.write().push(run_id.to_string());
        CancelOutcome::Cancelled
    }

    fn next_message_id(&self) -> MessageId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        MessageId(format!("msg_{id}"))
    }
}

#[async_trait]
impl QueuePublisher for InMemoryPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<MessageId, PublisherError> {
        self.calls.write().push(vec![request]);
        Ok(self.next_message_id())
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<MessageId>, PublisherError> {
        let ids = requests.iter().map(|_| self.next_message_id()).collect();
        self.calls.write().push(requests);
        Ok(ids)
    }

    async fn cancel(&self, run_id: &str) -> Result<CancelOutcome, PublisherError> {
        Ok(self.delete_run(run_id, &self.cancelled))
    }

    async fn finish(&self, run_id: &str) -> Result<CancelOutcome, PublisherError> {
        Ok(self.delete_run(run_id, &self.finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_publishes_and_batches() {
        let publisher = InMemoryPublisher::new();

        let first = publisher
            .publish(PublishRequest::new("https://a.example.com", "1"))
            .await
            .unwrap();
        let batch = publisher
            .batch_publish(vec![
                PublishRequest::new("https://a.example.com", "2"),
                PublishRequest::new("https://a.example.com", "3"),
            ])
            .await
            .unwrap();

        assert_eq!(first, MessageId("msg_1".to_string()));
        assert_eq!(batch.len(), 2);
        assert_eq!(publisher.publish_calls().len(), 2);

        let bodies: Vec<_> = publisher.published().into_iter().map(|r| r.body).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let publisher = InMemoryPublisher::new().with_unknown_run("wfr_gone");

        assert_eq!(
            publisher.cancel("wfr_gone").await.unwrap(),
            CancelOutcome::NotFound
        );
        assert_eq!(
            publisher.cancel("wfr_live").await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(publisher.cancelled(), vec!["wfr_live".to_string()]);
        assert!(publisher.finished().is_empty());
    }

    #[tokio::test]
    async fn test_finish_is_recorded_apart_from_cancel() {
        let publisher = InMemoryPublisher::new();

        assert_eq!(
            publisher.finish("wfr_done").await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(publisher.finished(), vec!["wfr_done".to_string()]);
        assert!(publisher.cancelled().is_empty());
    }
}
