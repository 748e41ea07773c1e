//! Cart Synchronization
//!
//! Makes a cart's bundle group match a target selection in one logical
//! operation. Every path runs in the same order:
//!
//! ```text
//! normalize ─▶ merge / replace decision ─▶ remote write ─▶ invalidation ─▶ re-fetch
//! ```
//!
//! Each write carries freshly computed discount stamps for every line of the
//! group, priced from the group's new total quantity. A failed write leaves
//! nothing to undo locally; a failed re-fetch after a successful write is
//! logged and reported through [`SyncOutcome::cart`] being `None`.
//!
//! Mutations on the same (cart, bundle) pair are serialized within the
//! process. Nothing guards against a second process writing the same group.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use crate::domain::aggregates::{check_selection, BundleDefinition, BundleLineMetadata, Cart, SelectionEntry};
use crate::domain::events::{CartEvent, EventBus};
use crate::domain::value_objects::{BundleId, CartId, SlotId};
use crate::pricing::{price_bundle, BundlePrice, CatalogPrices};
use crate::services::{BundleLineRequest, CartService, CatalogService};
use crate::{BundleError, Result};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Cart reads after a write while waiting for discount stamps
    pub confirm_attempts: u32,
    pub confirm_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { confirm_attempts: 3, confirm_delay: Duration::from_millis(250) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPath {
    /// New group created
    Added,
    /// Add on top of an existing group, merged per slot
    Upgraded,
    /// Full replace
    Replaced,
    /// Group or single slot removed
    Removed,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncOutcome {
    pub cart_id: CartId,
    pub bundle_id: BundleId,
    pub path: SyncPath,
    /// Selection the group was written to match
    pub entries: Vec<SelectionEntry>,
    /// Price stamped on the group, `None` once the group is gone
    pub price: Option<BundlePrice>,
    /// Cart as re-read after the write
    pub cart: Option<Cart>,
    /// Whether the re-read cart already carried the expected stamps
    pub stamps_confirmed: bool,
}

pub struct CartSyncEngine {
    carts: Arc<dyn CartService>,
    catalog: Arc<dyn CatalogService>,
    bus: EventBus,
    settings: SyncSettings,
    locks: DashMap<(CartId, BundleId), Arc<Mutex<()>>>,
}

impl CartSyncEngine {
    pub fn new(carts: Arc<dyn CartService>, catalog: Arc<dyn CatalogService>, bus: EventBus, settings: SyncSettings) -> Self {
        Self { carts, catalog, bus, settings, locks: DashMap::new() }
    }

    pub fn bus(&self) -> &EventBus { &self.bus }

    /// Adds `entries` to the bundle group, creating it when absent.
    ///
    /// When the cart already holds part of the bundle the existing lines are
    /// merged with the request (the request wins per slot, quantities are not
    /// summed) and the result goes through the replace path.
    pub async fn add_bundle_to_cart(&self, cart_id: &CartId, bundle_id: &BundleId, entries: Vec<SelectionEntry>) -> Result<SyncOutcome> {
        require_refs(cart_id, bundle_id)?;
        let _guard = self.lock_group(cart_id, bundle_id).await;

        let bundle = self.load_bundle(bundle_id).await?;
        let cart = self.carts.retrieve(cart_id).await?;
        let existing = cart.bundle_entries(bundle_id)?;
        let requested = merge_entries(Vec::new(), entries);

        if existing.is_empty() {
            if requested.is_empty() {
                return Err(BundleError::InvalidSelection("select at least 1 item".into()));
            }
            let price = priced_target(&bundle, &requested)?;
            let lines = line_requests(&bundle, &price);
            self.carts.add_bundle_items(cart_id, bundle_id, &lines).await?;
            info!(cart = %cart_id, bundle = %bundle_id, lines = lines.len(), "Bundle added to cart");
            self.bus.publish(cart_id, CartEvent::BundleAdded { bundle_id: bundle_id.clone(), lines: lines.len() });
            return Ok(self.finish(cart_id, bundle_id, SyncPath::Added, requested, Some(price)).await);
        }

        debug!(cart = %cart_id, bundle = %bundle_id, existing = existing.len(), requested = requested.len(), "Merging into existing bundle group");
        let merged = merge_entries(existing, requested);
        let price = priced_target(&bundle, &merged)?;
        self.write_group(cart_id, &bundle, merged, price, SyncPath::Upgraded, None).await
    }

    /// Replaces the whole bundle group with `entries`.
    ///
    /// Slots missing from `entries` are dropped; an empty target deletes the
    /// group exactly like [`Self::remove_bundle_from_cart`].
    pub async fn update_bundle_in_cart(&self, cart_id: &CartId, bundle_id: &BundleId, entries: Vec<SelectionEntry>) -> Result<SyncOutcome> {
        require_refs(cart_id, bundle_id)?;
        let _guard = self.lock_group(cart_id, bundle_id).await;

        let target = merge_entries(Vec::new(), entries);
        if target.is_empty() {
            return self.delete_group(cart_id, bundle_id, None).await;
        }
        let bundle = self.load_bundle(bundle_id).await?;
        let price = priced_target(&bundle, &target)?;
        self.write_group(cart_id, &bundle, target, price, SyncPath::Replaced, None).await
    }

    /// Removes the whole group, or only `slot_id` from it.
    ///
    /// Removing a slot re-prices the remaining lines, since the group total
    /// may have dropped below a tier threshold. Bundle rules such as the
    /// minimum item count are not enforced on removal. A slot the group does
    /// not hold fails with [`BundleError::ItemNotInCart`] and nothing is written.
    pub async fn remove_bundle_from_cart(&self, cart_id: &CartId, bundle_id: &BundleId, slot_id: Option<&SlotId>) -> Result<SyncOutcome> {
        require_refs(cart_id, bundle_id)?;
        let _guard = self.lock_group(cart_id, bundle_id).await;

        let Some(slot_id) = slot_id else {
            return self.delete_group(cart_id, bundle_id, None).await;
        };
        let bundle = self.load_bundle(bundle_id).await?;
        let cart = self.carts.retrieve(cart_id).await?;
        let existing = cart.bundle_entries(bundle_id)?;
        if !existing.iter().any(|e| &e.slot_id == slot_id) {
            return Err(BundleError::ItemNotInCart { bundle: bundle_id.to_string(), slot: slot_id.to_string() });
        }
        let remaining: Vec<SelectionEntry> = existing.into_iter().filter(|e| &e.slot_id != slot_id).collect();
        if remaining.is_empty() {
            return self.delete_group(cart_id, bundle_id, Some(slot_id)).await;
        }
        let price = price_bundle(&bundle, &remaining, &CatalogPrices)?;
        self.write_group(cart_id, &bundle, remaining, price, SyncPath::Removed, Some(slot_id)).await
    }

    async fn write_group(
        &self,
        cart_id: &CartId,
        bundle: &BundleDefinition,
        entries: Vec<SelectionEntry>,
        price: BundlePrice,
        path: SyncPath,
        removed_slot: Option<&SlotId>,
    ) -> Result<SyncOutcome> {
        let lines = line_requests(bundle, &price);
        self.carts.replace_bundle_items(cart_id, &bundle.id, &lines).await?;
        info!(
            cart = %cart_id, bundle = %bundle.id, ?path, lines = lines.len(),
            total_quantity = price.total_quantity, savings = price.savings,
            "Bundle group replaced"
        );
        let event = match path {
            SyncPath::Removed => CartEvent::BundleRemoved { bundle_id: bundle.id.clone(), slot_id: removed_slot.cloned() },
            _ => CartEvent::BundleReplaced { bundle_id: bundle.id.clone(), lines: lines.len() },
        };
        self.bus.publish(cart_id, event);
        Ok(self.finish(cart_id, &bundle.id, path, entries, Some(price)).await)
    }

    async fn delete_group(&self, cart_id: &CartId, bundle_id: &BundleId, slot_id: Option<&SlotId>) -> Result<SyncOutcome> {
        self.carts.remove_bundle(cart_id, bundle_id).await?;
        info!(cart = %cart_id, bundle = %bundle_id, "Bundle removed from cart");
        self.bus.publish(cart_id, CartEvent::BundleRemoved { bundle_id: bundle_id.clone(), slot_id: slot_id.cloned() });
        Ok(self.finish(cart_id, bundle_id, SyncPath::Removed, Vec::new(), None).await)
    }

    async fn finish(&self, cart_id: &CartId, bundle_id: &BundleId, path: SyncPath, entries: Vec<SelectionEntry>, price: Option<BundlePrice>) -> SyncOutcome {
        let (cart, stamps_confirmed) = self.confirm_stamps(cart_id, bundle_id, price.as_ref()).await;
        SyncOutcome { cart_id: cart_id.clone(), bundle_id: bundle_id.clone(), path, entries, price, cart, stamps_confirmed }
    }

    /// Re-reads the cart until the group carries the expected stamps or the
    /// attempts run out. Read failures are logged, never returned.
    async fn confirm_stamps(&self, cart_id: &CartId, bundle_id: &BundleId, expected: Option<&BundlePrice>) -> (Option<Cart>, bool) {
        let attempts = self.settings.confirm_attempts.max(1);
        let mut latest = None;
        for attempt in 1..=attempts {
            match self.carts.retrieve(cart_id).await {
                Ok(cart) => {
                    let settled = group_matches(&cart, bundle_id, expected);
                    latest = Some(cart);
                    if settled { return (latest, true); }
                    debug!(cart = %cart_id, bundle = %bundle_id, attempt, "Discount stamps not settled yet");
                }
                Err(e) => warn!(cart = %cart_id, attempt, error = %e, "Cart refresh after bundle write failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.confirm_delay).await;
            }
        }
        (latest, false)
    }

    async fn load_bundle(&self, bundle_id: &BundleId) -> Result<BundleDefinition> {
        let bundle = self
            .catalog
            .bundle_by_id(bundle_id)
            .await?
            .ok_or_else(|| BundleError::BundleNotFound(bundle_id.to_string()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    async fn lock_group(&self, cart_id: &CartId, bundle_id: &BundleId) -> GroupGuard<'_> {
        let key = (cart_id.clone(), bundle_id.clone());
        let lock = self.locks.entry(key.clone()).or_default().clone();
        GroupGuard { locks: &self.locks, key, guard: Some(lock.lock_owned().await) }
    }
}

/// Holds a group lock; the map entry is evicted on drop once nobody else
/// holds or waits on it.
struct GroupGuard<'a> {
    locks: &'a DashMap<(CartId, BundleId), Arc<Mutex<()>>>,
    key: (CartId, BundleId),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn require_refs(cart_id: &CartId, bundle_id: &BundleId) -> Result<()> {
    if cart_id.is_blank() { return Err(BundleError::MissingReference("cart id")); }
    if bundle_id.is_blank() { return Err(BundleError::MissingReference("bundle id")); }
    Ok(())
}

/// Applies `overrides` on top of `base`, one entry per slot, last writer wins.
pub fn merge_entries(base: Vec<SelectionEntry>, overrides: Vec<SelectionEntry>) -> Vec<SelectionEntry> {
    let mut merged = Vec::with_capacity(base.len() + overrides.len());
    for entry in base.into_iter().chain(overrides) {
        match merged.iter_mut().find(|e: &&mut SelectionEntry| e.slot_id == entry.slot_id) {
            Some(existing) => *existing = entry,
            None => merged.push(entry),
        }
    }
    merged
}

fn priced_target(bundle: &BundleDefinition, entries: &[SelectionEntry]) -> Result<BundlePrice> {
    let summary = check_selection(bundle, entries);
    if let Some(reason) = summary.violation_reason {
        return Err(BundleError::InvalidSelection(reason));
    }
    Ok(price_bundle(bundle, entries, &CatalogPrices)?)
}

/// Write requests for a priced group, each line stamped with the group tier.
pub fn line_requests(bundle: &BundleDefinition, price: &BundlePrice) -> Vec<BundleLineRequest> {
    price
        .lines
        .iter()
        .map(|line| {
            let title = bundle
                .slot(&line.slot_id)
                .map(|slot| match slot.variant(&line.variant_id) {
                    Some(v) if slot.product.variants.len() > 1 => format!("{} ({})", slot.product.title, v.title),
                    _ => slot.product.title.clone(),
                })
                .unwrap_or_else(|| line.slot_id.to_string());
            BundleLineRequest {
                bundle_item_id: line.slot_id.clone(),
                variant_id: line.variant_id.clone(),
                quantity: line.quantity,
                title,
                unit_price: line.unit_price,
                metadata: BundleLineMetadata::stamped(bundle, price, line).to_metadata(),
            }
        })
        .collect()
}

/// True when the group in `cart` matches `expected` line for line, stamps included.
fn group_matches(cart: &Cart, bundle_id: &BundleId, expected: Option<&BundlePrice>) -> bool {
    let Ok(group) = cart.bundle_group(bundle_id) else { return false };
    let Some(price) = expected else { return group.is_empty() };
    let kind = price.tier.as_ref().map(|t| t.kind);
    let pct = price.tier.as_ref().and_then(|t| t.percentage_value());
    group.len() == price.lines.len()
        && group.iter().all(|line| {
            price.line(&line.meta.bundle_item_id).is_some_and(|lp| {
                line.item.quantity == lp.quantity
                    && line.item.variant_id == lp.variant_id
                    && line.meta.has_stamp()
                    && line.meta.actual_discount_amount == Some(lp.discount_amount)
                    && line.meta.bundle_discount_type == kind
                    && line.meta.bundle_discount_percentage == pct
            })
        })
}
