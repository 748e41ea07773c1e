//! Domain events
//!
//! Every successful cart write publishes an [`Invalidation`] on the
//! [`EventBus`]. Caches and downstream listeners subscribe instead of relying
//! on an ambient revalidation side effect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use crate::domain::value_objects::{BundleId, CartId, SlotId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTag {
    Carts,
    Fulfillment,
}

impl CacheTag {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Carts => "carts", Self::Fulfillment => "fulfillment" }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartEvent {
    BundleAdded { bundle_id: BundleId, lines: usize },
    BundleReplaced { bundle_id: BundleId, lines: usize },
    BundleRemoved { bundle_id: BundleId, slot_id: Option<SlotId> },
    PromoApplied { code: String },
    PromoRemoved,
}

impl CartEvent {
    /// Bundle contents can change shipping eligibility, promos only touch totals.
    pub fn tags(&self) -> Vec<CacheTag> {
        match self {
            Self::BundleAdded { .. } | Self::BundleReplaced { .. } | Self::BundleRemoved { .. } => {
                vec![CacheTag::Carts, CacheTag::Fulfillment]
            }
            Self::PromoApplied { .. } | Self::PromoRemoved => vec![CacheTag::Carts],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Invalidation {
    pub cart_id: CartId,
    pub tags: Vec<CacheTag>,
    pub event: CartEvent,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Invalidation>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> { self.tx.subscribe() }

    /// Publishes the invalidation for `event`; having no subscribers is not an error.
    pub fn publish(&self, cart_id: &CartId, event: CartEvent) -> Invalidation {
        let invalidation = Invalidation { cart_id: cart_id.clone(), tags: event.tags(), event, at: Utc::now() };
        let receivers = self.tx.send(invalidation.clone()).unwrap_or(0);
        debug!(cart = %cart_id, receivers, tags = ?invalidation.tags, "Published cart invalidation");
        invalidation
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new(256) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundle_events_invalidate_fulfillment() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(&"cart_1".into(), CartEvent::BundleRemoved { bundle_id: "b_1".into(), slot_id: None });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.tags, vec![CacheTag::Carts, CacheTag::Fulfillment]);
        assert_eq!(got.cart_id.as_str(), "cart_1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        let inv = bus.publish(&"cart_1".into(), CartEvent::PromoRemoved);
        assert_eq!(inv.tags, vec![CacheTag::Carts]);
    }
}
