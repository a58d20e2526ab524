//! Stream broker provider trait: append-only topics with consumer groups

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;
use crate::types::{EntryId, StreamEntry};

/// How long a read waits when no entry is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Wait until at least one entry can be handed out
    Indefinitely,
    /// Wait at most this long, then return an empty batch
    Timeout(Duration),
    /// Return immediately
    Immediate,
}

/// Trait for the durable transport between stages
///
/// Implementations:
/// - `SqliteBroker`: durable, shares the pipeline database
/// - `MemoryBroker`: process-local
///
/// Delivery is at-least-once: an entry claimed by a consumer and not
/// acknowledged within the broker's reclaim idle time is handed out again,
/// ahead of newer entries.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create `group` positioned at the tail of `topic` (creating the topic)
    ///
    /// Returns `false` if the group already existed; that is not an error.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<bool>;

    /// Claim up to `max_count` entries for `consumer`
    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: BlockMode,
    ) -> Result<Vec<StreamEntry>>;

    /// Append an encoded entry to the tail of `topic`, creating it if needed
    async fn append(&self, topic: &str, body: String) -> Result<EntryId>;

    /// Mark an entry processed for `group`; acking twice is harmless
    ///
    /// Returns whether the entry was still pending.
    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<bool>;

    /// Read entries after `after` without claiming them (dead-letter inspection)
    async fn entries(
        &self,
        topic: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Number of delivered-but-unacknowledged entries for `group`
    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Encode `message` as JSON and append it to `topic`
pub async fn publish<M: Serialize + ?Sized>(
    broker: &dyn StreamBroker,
    topic: &str,
    message: &M,
) -> Result<EntryId> {
    let body = serde_json::to_string(message)?;
    broker.append(topic, body).await
}

/// Shared blocking-read loop for broker implementations
///
/// Registers for append notifications before each claim attempt so an append
/// racing the attempt is never missed; `poll_interval` bounds each wait so idle
/// reclaims and appends from other processes are noticed too.
pub(crate) async fn wait_for_entries<F, Fut>(
    notify: &Notify,
    poll_interval: Duration,
    block: BlockMode,
    mut claim: F,
) -> Result<Vec<StreamEntry>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<StreamEntry>>>,
{
    let deadline = match block {
        BlockMode::Timeout(timeout) => Some(Instant::now() + timeout),
        _ => None,
    };

    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = claim().await?;
        if !batch.is_empty() || block == BlockMode::Immediate {
            return Ok(batch);
        }

        let mut wait = poll_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            wait = wait.min(deadline - now);
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
