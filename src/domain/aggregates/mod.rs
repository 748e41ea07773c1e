//! Aggregates module
pub mod product;
pub mod bundle;
pub mod selection;
pub mod cart;

pub use product::{Product, ProductOption, Variant};
pub use bundle::{BundleDefinition, BundleItemSlot, CatalogError, DiscountKind, DiscountTier, SelectionMode};
pub use selection::{check_selection, SelectionEntry, SelectionError, SelectionSnapshot, SelectionState, SelectionSummary, SelectionViolation};
pub use cart::{BundleLine, BundleLineMetadata, Cart, CartLineItem, Metadata, MetadataError, PromoAnnotation};
