//! Bundle Aggregate
//!
//! A bundle definition is immutable once fetched from the catalog: the slot
//! list never changes and `slot_id` is the only key that joins a slot to a
//! cart line derived from it.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use crate::domain::aggregates::product::{Product, Variant};
use crate::domain::value_objects::{BundleId, SlotId, VariantId};
use crate::pricing::select_tier;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Flexible,
    RequireAll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Percentage => "percentage", Self::Fixed => "fixed" }
    }
}

/// One step of a discount schedule.
///
/// `value` is a percentage (0-100) for [`DiscountKind::Percentage`] and an
/// amount in minor units for [`DiscountKind::Fixed`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscountTier {
    pub quantity_threshold: u32,
    pub kind: DiscountKind,
    pub value: Decimal,
}

impl DiscountTier {
    pub fn percentage(quantity_threshold: u32, pct: Decimal) -> Self {
        Self { quantity_threshold, kind: DiscountKind::Percentage, value: pct }
    }

    pub fn fixed(quantity_threshold: u32, amount: i64) -> Self {
        Self { quantity_threshold, kind: DiscountKind::Fixed, value: Decimal::from(amount) }
    }

    /// Discount in minor units for `base`, floored and never more than `base`.
    pub fn discount_on(&self, base: i64) -> i64 {
        if base <= 0 { return 0; }
        let raw = match self.kind {
            DiscountKind::Percentage => Decimal::from(base) * self.value / Decimal::ONE_HUNDRED,
            DiscountKind::Fixed => self.value,
        };
        raw.floor().to_i64().unwrap_or_default().clamp(0, base)
    }

    pub fn percentage_value(&self) -> Option<Decimal> {
        matches!(self.kind, DiscountKind::Percentage).then_some(self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleItemSlot {
    pub slot_id: SlotId,
    #[serde(default = "default_quantity")]
    pub default_quantity: u32,
    pub product: Product,
    #[serde(default)]
    pub optional: bool,
}

fn default_quantity() -> u32 { 1 }
fn default_min_items() -> u32 { 1 }

impl BundleItemSlot {
    pub fn new(slot_id: impl Into<SlotId>, product: Product) -> Self {
        Self { slot_id: slot_id.into(), default_quantity: 1, product, optional: false }
    }

    pub fn variant(&self, id: &VariantId) -> Option<&Variant> { self.product.variant(id) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleDefinition {
    pub id: BundleId,
    pub title: String,
    pub handle: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub selection_mode: SelectionMode,
    #[serde(default = "default_min_items")]
    pub min_items: u32,
    #[serde(default)]
    pub max_items: Option<u32>,
    #[serde(default)]
    pub discount_schedule: Vec<DiscountTier>,
    pub items: Vec<BundleItemSlot>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String { "usd".to_string() }

impl BundleDefinition {
    pub fn new(id: impl Into<BundleId>, title: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: id.into(), title: title.into(), handle: handle.into(), description: None,
            selection_mode: SelectionMode::Flexible, min_items: 1, max_items: None,
            discount_schedule: vec![], items: vec![], currency: default_currency(),
        }
    }

    pub fn with_mode(mut self, mode: SelectionMode) -> Self { self.selection_mode = mode; self }
    pub fn with_limits(mut self, min_items: u32, max_items: Option<u32>) -> Self {
        self.min_items = min_items;
        self.max_items = max_items;
        self
    }
    pub fn with_tier(mut self, tier: DiscountTier) -> Self { self.discount_schedule.push(tier); self }
    pub fn with_slot(mut self, slot: BundleItemSlot) -> Self { self.items.push(slot); self }

    pub fn slot(&self, id: &SlotId) -> Option<&BundleItemSlot> { self.items.iter().find(|s| &s.slot_id == id) }

    /// Highest tier whose threshold is at or below `total_quantity`.
    pub fn tier_for(&self, total_quantity: u32) -> Option<&DiscountTier> {
        select_tier(&self.discount_schedule, total_quantity)
    }

    /// Structural checks applied when a definition crosses the catalog boundary.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.id.is_blank() { return Err(CatalogError::MissingId); }
        let mut seen = HashSet::new();
        for slot in &self.items {
            if !seen.insert(&slot.slot_id) { return Err(CatalogError::DuplicateSlot(slot.slot_id.clone())); }
            if slot.default_quantity == 0 { return Err(CatalogError::ZeroDefaultQuantity(slot.slot_id.clone())); }
        }
        if let Some(max) = self.max_items {
            if max < self.min_items { return Err(CatalogError::InvertedLimits { min: self.min_items, max }); }
        }
        for tier in &self.discount_schedule {
            if tier.quantity_threshold == 0 || tier.value.is_sign_negative() {
                return Err(CatalogError::InvalidTier(tier.quantity_threshold));
            }
            if tier.kind == DiscountKind::Percentage && tier.value > Decimal::ONE_HUNDRED {
                return Err(CatalogError::InvalidTier(tier.quantity_threshold));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    MissingId,
    DuplicateSlot(SlotId),
    ZeroDefaultQuantity(SlotId),
    InvertedLimits { min: u32, max: u32 },
    InvalidTier(u32),
}
impl std::error::Error for CatalogError {}
impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingId => write!(f, "Bundle has no id"),
            Self::DuplicateSlot(s) => write!(f, "Duplicate bundle item {s}"),
            Self::ZeroDefaultQuantity(s) => write!(f, "Bundle item {s} has a zero default quantity"),
            Self::InvertedLimits { min, max } => write!(f, "max_items {max} is below min_items {min}"),
            Self::InvalidTier(t) => write!(f, "Invalid discount tier at threshold {t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> BundleDefinition {
        BundleDefinition::new("b_1", "Starter Kit", "starter-kit")
            .with_tier(DiscountTier::percentage(3, Decimal::from(15)))
            .with_tier(DiscountTier::percentage(2, Decimal::from(10)))
            .with_slot(BundleItemSlot::new("s1", Product::new("p1", "Mug").with_variant("v1", "Red", 5000)))
    }

    #[test]
    fn test_tier_lookup_ignores_schedule_order() {
        let b = bundle();
        assert!(b.tier_for(1).is_none());
        assert_eq!(b.tier_for(2).map(|t| t.value), Some(Decimal::from(10)));
        assert_eq!(b.tier_for(7).map(|t| t.value), Some(Decimal::from(15)));
    }

    #[test]
    fn test_discount_on_floors_and_caps() {
        let pct = DiscountTier::percentage(2, Decimal::new(125, 1));
        assert_eq!(pct.discount_on(999), 124);
        let fixed = DiscountTier::fixed(2, 5000);
        assert_eq!(fixed.discount_on(3000), 3000);
        assert_eq!(fixed.discount_on(0), 0);
    }

    #[test]
    fn test_validate_rejects_duplicate_slot() {
        let b = bundle().with_slot(BundleItemSlot::new("s1", Product::new("p2", "Cup")));
        assert_eq!(b.validate(), Err(CatalogError::DuplicateSlot("s1".into())));
        assert!(bundle().validate().is_ok());
    }
}
