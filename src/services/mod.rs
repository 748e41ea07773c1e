//! Commerce backend collaborators
//!
//! The cart, catalog and promo services are owned by the commerce backend.
//! The engine only talks to them through these traits; [`http`] speaks the
//! backend's REST protocol and [`memory`] keeps everything in process.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::domain::aggregates::{BundleDefinition, Cart, DiscountKind, Metadata, PromoAnnotation};
use crate::domain::value_objects::{BundleId, CartId, SlotId, VariantId};

pub use http::{CommerceHttpClient, HttpSettings};
pub use memory::{CartUpdate, MemoryCommerce};

/// Collaborator failure
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend answered with a failure status
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// One line of a bundle write, already carrying its discount stamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleLineRequest {
    pub bundle_item_id: SlotId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub title: String,
    pub unit_price: i64,
    pub metadata: Metadata,
}

#[async_trait]
pub trait CartService: Send + Sync {
    async fn retrieve(&self, cart_id: &CartId) -> Result<Cart, RemoteError>;

    /// Creates a new bundle group. Fails if the group already exists.
    async fn add_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError>;

    /// Materializes exactly `items` as the bundle group.
    async fn replace_bundle_items(&self, cart_id: &CartId, bundle_id: &BundleId, items: &[BundleLineRequest]) -> Result<(), RemoteError>;

    /// Deletes every line of the bundle group.
    async fn remove_bundle(&self, cart_id: &CartId, bundle_id: &BundleId) -> Result<(), RemoteError>;

    /// Merges `patch` into cart metadata; `null` values delete keys.
    async fn update_metadata(&self, cart_id: &CartId, patch: Metadata) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn bundle_by_id(&self, bundle_id: &BundleId) -> Result<Option<BundleDefinition>, RemoteError>;
    async fn bundle_by_handle(&self, handle: &str) -> Result<Option<BundleDefinition>, RemoteError>;
}

/// Promo code terms as stored by the promo service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomPromo {
    pub code: String,
    pub discount_type: DiscountKind,
    /// Percentage (0-100) or fixed amount in major units
    pub discount_value: Decimal,
}

impl CustomPromo {
    pub fn annotation(&self) -> PromoAnnotation {
        PromoAnnotation { code: self.code.clone(), discount_type: self.discount_type, discount_value: self.discount_value }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromoValidation {
    pub valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub promo: Option<CustomPromo>,
}

impl PromoValidation {
    pub fn rejected(reason: impl Into<String>) -> Self { Self { valid: false, reason: Some(reason.into()), promo: None } }
    pub fn accepted(promo: CustomPromo) -> Self { Self { valid: true, reason: None, promo: Some(promo) } }
}

#[async_trait]
pub trait PromoService: Send + Sync {
    /// Idempotent check; never consumes the code.
    async fn validate(&self, code: &str, email: &str) -> Result<PromoValidation, RemoteError>;

    /// Marks the code used for `cart_id`.
    async fn redeem(&self, code: &str, cart_id: &CartId) -> Result<(), RemoteError>;
}
