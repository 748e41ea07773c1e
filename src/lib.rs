//! Storefront Bundles
//!
//! Flexible bundle engine for a headless storefront.
//!
//! ## Features
//! - Bundle catalog model with quantity-keyed discount tiers
//! - Session selection state with validity summary and change subscription
//! - Pure bundle pricing shared by display and cart stamping
//! - Cart synchronization: add, upgrade-on-add, full replace, removal
//! - Custom promo codes stacked on top of bundle savings

pub mod api;
pub mod config;
pub mod domain;
pub mod notify;
pub mod pricing;
pub mod promo;
pub mod services;
pub mod sync;

use thiserror::Error;
use crate::domain::aggregates::{CatalogError, MetadataError};
use crate::pricing::PricingError;
use crate::services::RemoteError;

pub use crate::domain::aggregates::{
    BundleDefinition, BundleItemSlot, Cart, DiscountKind, DiscountTier, SelectionEntry, SelectionMode,
    SelectionState, SelectionSummary,
};
pub use crate::pricing::{price_bundle, BundlePrice};
pub use crate::promo::{CartTotals, PromoStacker};
pub use crate::sync::{CartSyncEngine, SyncOutcome, SyncPath, SyncSettings};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum BundleError {
    /// Raised before any network call
    #[error("Missing reference: {0}")]
    MissingReference(&'static str),

    #[error("Bundle not found: {0}")]
    BundleNotFound(String),

    #[error("Invalid bundle definition: {0}")]
    InvalidBundle(#[from] CatalogError),

    #[error("Item {slot} is not in the cart's {bundle} bundle")]
    ItemNotInCart { bundle: String, slot: String },

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Invalid promo code: {0}")]
    InvalidCode(String),

    #[error("No cart for this session")]
    NoCart,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub type Result<T> = std::result::Result<T, BundleError>;
