//! Fan-out of cart invalidations to NATS, one subject per cache tag.

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use crate::domain::events::{CacheTag, Invalidation};

#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn send(&self, subject: String, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
impl InvalidationSink for async_nats::Client {
    async fn send(&self, subject: String, payload: Vec<u8>) -> anyhow::Result<()> {
        self.publish(subject, payload.into()).await?;
        Ok(())
    }
}

pub fn subject_for(prefix: &str, tag: CacheTag) -> String {
    format!("{}.{}", prefix.trim_end_matches('.'), tag.as_str())
}

/// Forwards every invalidation until the bus closes. Publish failures are
/// logged and skipped.
pub async fn forward_invalidations<S: InvalidationSink>(sink: S, mut rx: broadcast::Receiver<Invalidation>, prefix: String) {
    info!(%prefix, "Forwarding cart invalidations");
    loop {
        let invalidation = match rx.recv().await {
            Ok(invalidation) => invalidation,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Invalidation forwarder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let payload = match serde_json::to_vec(&invalidation) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode invalidation");
                continue;
            }
        };
        for tag in &invalidation.tags {
            let subject = subject_for(&prefix, *tag);
            match sink.send(subject.clone(), payload.clone()).await {
                Ok(()) => debug!(%subject, cart = %invalidation.cart_id, "Invalidation published"),
                Err(e) => warn!(%subject, error = %e, "Failed to publish invalidation"),
            }
        }
    }
    info!("Invalidation forwarder stopped");
}
