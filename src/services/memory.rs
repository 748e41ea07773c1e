//! In-process commerce backend
//!
//! Behaves like the remote backend for carts, bundles and promos: bundle
//! groups are materialized from write requests, metadata survives unrelated
//! cart updates, and promo redemptions are counted. Used for local
//! development when no backend URL is configured, and by the test suites.
//!
//! `with_stamp_lag(n)` reproduces the backend's background discount
//! subscriber: stamps written with a bundle only show up on the `n`-th cart
//! read after the write.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;
use super::{BundleLineRequest, CartService, CatalogService, CustomPromo, PromoService, PromoValidation, RemoteError};
use crate::domain::aggregates::{BundleDefinition, BundleLineMetadata, Cart, CartLineItem, Metadata};
use crate::domain::value_objects::{BundleId, CartId, LineItemId, VariantId};

struct PendingStamp {
    bundle_id: BundleId,
    reads_left: u32,
    stamps: Vec<(LineItemId, Metadata)>,
}

struct PromoRecord {
    promo: CustomPromo,
    max_uses: Option<u32>,
    used: u32,
}

/// Generic cart update (contact, shipping, free metadata). Never touches lines.
#[derive(Clone, Debug, Default)]
pub struct CartUpdate {
    pub email: Option<String>,
    pub shipping_method: Option<String>,
    pub shipping_address: Option<Value>,
    pub metadata: Option<Metadata>,
}

#[derive(Default)]
pub struct MemoryCommerce {
    carts: DashMap<CartId, Cart>,
    bundles: DashMap<BundleId, BundleDefinition>,
    promos: DashMap<String, PromoRecord>,
    pending: DashMap<CartId, Vec<PendingStamp>>,
    stamp_lag: u32,
    failing_reads: AtomicU32,
    failing_write: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryCommerce {
    pub fn new() -> Self { Self::default() }

    pub fn with_stamp_lag(mut self, reads: u32) -> Self { self.stamp_lag = reads; self }

    pub fn insert_bundle(&self, bundle: BundleDefinition) {
        self.bundles.insert(bundle.id.clone(), bundle);
    }

    pub fn insert_promo(&self, promo: CustomPromo, max_uses: Option<u32>) {
        self.promos.insert(promo.code.to_uppercase(), PromoRecord { promo, max_uses, used: 0 });
    }

    pub fn create_cart(&self, currency: &str) -> Cart {
        let cart = Cart::new(format!("cart_{}", Uuid::new_v4().simple()), currency);
        self.carts.insert(cart.id.clone(), cart.clone());
        cart
    }

    /// Adds an ordinary (non-bundle) line.
    pub fn add_line_item(&self, cart_id: &CartId, variant_id: impl Into<VariantId>, title: &str, quantity: u32, unit_price: i64) -> Result<LineItemId, RemoteError> {
        let mut cart = self.carts.get_mut(cart_id).ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))?;
        let id = new_line_id();
        cart.items.push(CartLineItem {
            id: id.clone(), variant_id: variant_id.into(), product_id: None, title: title.to_string(),
            quantity, unit_price, metadata: Metadata::new(),
        });
        cart.touch();
        Ok(id)
    }

    pub fn update_cart(&self, cart_id: &CartId, update: CartUpdate) -> Result<Cart, RemoteError> {
        let mut cart = self.carts.get_mut(cart_id).ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))?;
        if let Some(email) = update.email { cart.email = Some(email); }
        if let Some(method) = update.shipping_method { cart.shipping_method = Some(method); }
        if let Some(address) = update.shipping_address { cart.shipping_address = Some(address); }
        if let Some(patch) = update.metadata { cart.merge_metadata(patch); }
        cart.touch();
        Ok(cart.clone())
    }

    /// The next bundle or metadata write fails with `message`.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        *self.failing_write.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// The next `count` cart reads fail.
    pub fn fail_next_reads(&self, count: u32) { self.failing_reads.store(count, Ordering::SeqCst); }

    /// Number of successful bundle and metadata writes.
    pub fn write_count(&self) -> usize { self.writes.load(Ordering::SeqCst) }

    pub fn promo_uses(&self, code: &str) -> u32 {
        self.promos.get(&code.to_uppercase()).map(|r| r.used).unwrap_or(0)
    }

    fn begin_write(&self) -> Result<(), RemoteError> {
        let failure = self.failing_write.lock().unwrap_or_else(PoisonError::into_inner).take();
        match failure {
            Some(message) => Err(RemoteError::Rejected { status: 500, message }),
            None => Ok(()),
        }
    }

    fn finish_write(&self) { self.writes.fetch_add(1, Ordering::SeqCst); }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Applies deferred stamps whose lag has elapsed.
    fn settle_stamps(&self, cart_id: &CartId) {
        let ready: Vec<PendingStamp> = {
            let Some(mut pending) = self.pending.get_mut(cart_id) else { return };
            for p in pending.iter_mut() { p.reads_left = p.reads_left.saturating_sub(1); }
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.reads_left == 0);
            *pending = waiting;
            ready
        };
        if ready.is_empty() { return; }
        if let Some(mut cart) = self.carts.get_mut(cart_id) {
            for (line_id, stamp) in ready.into_iter().flat_map(|p| p.stamps) {
                if let Some(item) = cart.items.iter_mut().find(|i| i.id == line_id) {
                    item.metadata.extend(stamp);
                }
            }
            debug!(cart = %cart_id, "Discount stamps settled");
        }
    }

    fn drop_pending(&self, cart_id: &CartId, bundle_id: &BundleId) {
        if let Some(mut pending) = self.pending.get_mut(cart_id) {
            pending.retain(|p| &p.bundle_id != bundle_id);
        }
    }

    /// Replaces the bundle group with `items`, reusing line ids per slot.
    fn materialize(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError> {
        let mut parsed = Vec::with_capacity(items.len());
        for req in items {
            let meta: BundleLineMetadata = serde_json::from_value(Value::Object(req.metadata.clone()))
                .map_err(|e| RemoteError::Rejected { status: 400, message: format!("invalid bundle metadata: {e}") })?;
            if &meta.bundle_id != bundle_id || meta.bundle_item_id != req.bundle_item_id {
                return Err(RemoteError::Rejected { status: 400, message: "bundle metadata does not match request".into() });
            }
            parsed.push(meta);
        }

        let product_of = |req: &BundleLineRequest| {
            self.bundles
                .get(bundle_id)
                .and_then(|b| b.slot(&req.bundle_item_id).map(|s| s.product.id.clone()))
        };

        let mut deferred = Vec::new();
        {
            let mut cart = self.carts.get_mut(cart_id).ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))?;
            let mut previous: HashMap<String, CartLineItem> = HashMap::new();
            let mut kept = Vec::with_capacity(cart.items.len());
            for item in cart.items.drain(..) {
                match group_slot(&item, bundle_id) {
                    Some(slot) => { previous.insert(slot, item); }
                    None => kept.push(item),
                }
            }
            cart.items = kept;

            for (req, meta) in items.iter().zip(parsed) {
                let reused = previous.remove(req.bundle_item_id.as_str());
                let (id, mut metadata) = match reused {
                    Some(line) => (line.id, line.metadata),
                    None => (new_line_id(), Metadata::new()),
                };
                if self.stamp_lag > 0 {
                    meta.unstamped().write_into(&mut metadata);
                    deferred.push((id.clone(), meta.to_metadata()));
                } else {
                    meta.write_into(&mut metadata);
                }
                cart.items.push(CartLineItem {
                    id, variant_id: req.variant_id.clone(), product_id: product_of(req),
                    title: req.title.clone(), quantity: req.quantity, unit_price: req.unit_price, metadata,
                });
            }
            cart.touch();
        }

        self.drop_pending(cart_id, bundle_id);
        if !deferred.is_empty() {
            self.pending.entry(cart_id.clone()).or_default().push(PendingStamp {
                bundle_id: bundle_id.clone(),
                reads_left: self.stamp_lag,
                stamps: deferred,
            });
        }
        Ok(())
    }
}

fn new_line_id() -> LineItemId { LineItemId::new(format!("item_{}", Uuid::new_v4().simple())) }

/// Slot id of `item` when it belongs to `bundle_id`.
fn group_slot(item: &CartLineItem, bundle_id: &BundleId) -> Option<String> {
    let belongs = item.metadata.get("bundle_id").and_then(Value::as_str) == Some(bundle_id.as_str());
    if !belongs { return None; }
    item.metadata.get("bundle_item_id").and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl CartService for MemoryCommerce {
    async fn retrieve(&self, cart_id: &CartId) -> Result<Cart, RemoteError> {
        if self.take_read_failure() {
            return Err(RemoteError::Rejected { status: 503, message: "cart service unavailable".into() });
        }
        self.settle_stamps(cart_id);
        self.carts.get(cart_id).map(|c| c.clone()).ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))
    }

    async fn add_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError> {
        self.begin_write()?;
        let exists = self
            .carts
            .get(cart_id)
            .map(|c| c.items.iter().any(|i| group_slot(i, bundle_id).is_some()))
            .ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))?;
        if exists {
            return Err(RemoteError::Rejected { status: 409, message: format!("bundle {bundle_id} is already in the cart") });
        }
        self.materialize(cart_id, bundle_id, items)?;
        self.finish_write();
        Ok(())
    }

    async fn replace_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError> {
        self.begin_write()?;
        self.materialize(cart_id, bundle_id, items)?;
        self.finish_write();
        Ok(())
    }

    async fn remove_bundle(&self, cart_id: &CartId, bundle_id: &BundleId) -> Result<(), RemoteError> {
        self.begin_write()?;
        self.materialize(cart_id, bundle_id, &[])?;
        self.finish_write();
        Ok(())
    }

    async fn update_metadata(&self, cart_id: &CartId, patch: Metadata) -> Result<(), RemoteError> {
        self.begin_write()?;
        let mut cart = self.carts.get_mut(cart_id).ok_or_else(|| RemoteError::NotFound(format!("cart {cart_id}")))?;
        cart.merge_metadata(patch);
        self.finish_write();
        Ok(())
    }
}

#[async_trait]
impl CatalogService for MemoryCommerce {
    async fn bundle_by_id(&self, bundle_id: &BundleId) -> Result<Option<BundleDefinition>, RemoteError> {
        Ok(self.bundles.get(bundle_id).map(|b| b.clone()))
    }

    async fn bundle_by_handle(&self, handle: &str) -> Result<Option<BundleDefinition>, RemoteError> {
        Ok(self.bundles.iter().find(|b| b.handle == handle).map(|b| b.value().clone()))
    }
}

#[async_trait]
impl PromoService for MemoryCommerce {
    async fn validate(&self, code: &str, email: &str) -> Result<PromoValidation, RemoteError> {
        if email.trim().is_empty() {
            return Ok(PromoValidation::rejected("An email address is required to use a promo code"));
        }
        let Some(record) = self.promos.get(&code.trim().to_uppercase()) else {
            return Ok(PromoValidation::rejected("Promo code not found"));
        };
        if record.max_uses.is_some_and(|max| record.used >= max) {
            return Ok(PromoValidation::rejected("Promo code has already been used"));
        }
        Ok(PromoValidation::accepted(record.promo.clone()))
    }

    async fn redeem(&self, code: &str, cart_id: &CartId) -> Result<(), RemoteError> {
        let mut record = self
            .promos
            .get_mut(&code.trim().to_uppercase())
            .ok_or_else(|| RemoteError::NotFound(format!("promo {code}")))?;
        if record.max_uses.is_some_and(|max| record.used >= max) {
            return Err(RemoteError::Rejected { status: 409, message: "Promo code has already been used".into() });
        }
        record.used += 1;
        debug!(code, cart = %cart_id, uses = record.used, "Promo redeemed");
        Ok(())
    }
}
