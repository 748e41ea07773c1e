//! Cart Aggregate
//!
//! Projection of the persisted cart owned by the commerce backend. Bundle
//! and promo bookkeeping lives in free-form metadata on the wire; this module
//! is the only place that reads or writes those keys.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::domain::aggregates::bundle::{BundleDefinition, DiscountKind, DiscountTier};
use crate::domain::aggregates::selection::SelectionEntry;
use crate::domain::value_objects::{BundleId, CartId, LineItemId, ProductId, SlotId, VariantId};
use crate::pricing::{BundlePrice, LinePrice};

pub type Metadata = Map<String, Value>;

const PROMO_CODE_KEY: &str = "custom_promo_code";
const PROMO_TYPE_KEY: &str = "custom_promo_discount_type";
const PROMO_VALUE_KEY: &str = "custom_promo_discount_value";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    #[serde(default)]
    pub email: Option<String>,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<CartLineItem>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub shipping_method: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartLineItem {
    pub id: LineItemId,
    pub variant_id: VariantId,
    #[serde(default)]
    pub product_id: Option<ProductId>,
    pub title: String,
    pub quantity: u32,
    /// Pre-discount unit price in minor units
    pub unit_price: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CartLineItem {
    pub fn line_total(&self) -> i64 { self.unit_price * i64::from(self.quantity) }

    /// Typed view of the bundle keys, `None` for lines that are not part of a bundle.
    pub fn bundle_metadata(&self) -> Result<Option<BundleLineMetadata>, MetadataError> {
        if !self.metadata.contains_key("bundle_id") { return Ok(None); }
        serde_json::from_value(Value::Object(self.metadata.clone()))
            .map(Some)
            .map_err(|e| MetadataError::Malformed { line: self.id.clone(), reason: e.to_string() })
    }
}

/// Bundle bookkeeping carried on a cart line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleLineMetadata {
    pub bundle_id: BundleId,
    pub bundle_item_id: SlotId,
    #[serde(default = "yes")]
    pub is_from_bundle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discounted_price_cents: Option<i64>,
    #[serde(default)]
    pub discount_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_discount_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_discount_type: Option<DiscountKind>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "rust_decimal::serde::float_option")]
    pub bundle_discount_percentage: Option<Decimal>,
}

fn yes() -> bool { true }

impl BundleLineMetadata {
    /// Stamp for one line of a priced group. Every line of the group gets the
    /// tier of the whole group.
    pub fn stamped(bundle: &BundleDefinition, price: &BundlePrice, line: &LinePrice) -> Self {
        let tier: Option<&DiscountTier> = price.tier.as_ref();
        Self {
            bundle_id: bundle.id.clone(),
            bundle_item_id: line.slot_id.clone(),
            is_from_bundle: true,
            bundle_title: Some(bundle.title.clone()),
            original_price_cents: Some(line.original_total),
            discounted_price_cents: Some(line.discounted_total),
            discount_applied: line.discount_amount > 0,
            actual_discount_amount: Some(line.discount_amount),
            bundle_discount_type: tier.map(|t| t.kind),
            bundle_discount_percentage: tier.and_then(DiscountTier::percentage_value),
        }
    }

    /// Bundle keys only, with the discount stamp dropped.
    pub fn unstamped(&self) -> Self {
        Self {
            bundle_id: self.bundle_id.clone(),
            bundle_item_id: self.bundle_item_id.clone(),
            is_from_bundle: true,
            bundle_title: self.bundle_title.clone(),
            original_price_cents: None,
            discounted_price_cents: None,
            discount_applied: false,
            actual_discount_amount: None,
            bundle_discount_type: None,
            bundle_discount_percentage: None,
        }
    }

    pub fn has_stamp(&self) -> bool { self.original_price_cents.is_some() && self.actual_discount_amount.is_some() }

    pub fn to_metadata(&self) -> Metadata {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Metadata::new(),
        }
    }

    /// Writes the bundle keys over `target`, clearing stale stamp keys.
    pub fn write_into(&self, target: &mut Metadata) {
        for key in STAMP_KEYS { target.remove(*key); }
        target.extend(self.to_metadata());
    }
}

const STAMP_KEYS: &[&str] = &[
    "original_price_cents", "discounted_price_cents", "discount_applied",
    "actual_discount_amount", "bundle_discount_type", "bundle_discount_percentage",
];

/// A cart line paired with its parsed bundle metadata.
#[derive(Clone, Debug)]
pub struct BundleLine<'a> {
    pub item: &'a CartLineItem,
    pub meta: BundleLineMetadata,
}

impl BundleLine<'_> {
    pub fn to_entry(&self) -> SelectionEntry {
        SelectionEntry {
            slot_id: self.meta.bundle_item_id.clone(),
            variant_id: self.item.variant_id.clone(),
            quantity: self.item.quantity,
        }
    }
}

/// Custom promo recorded on cart metadata. Only the code and its terms are
/// stored; the discount amount is derived whenever totals are computed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromoAnnotation {
    pub code: String,
    pub discount_type: DiscountKind,
    /// Percentage (0-100) or fixed amount in major units
    pub discount_value: Decimal,
}

impl PromoAnnotation {
    pub fn to_patch(&self) -> Metadata {
        let mut patch = Metadata::new();
        patch.insert(PROMO_CODE_KEY.into(), Value::String(self.code.clone()));
        patch.insert(PROMO_TYPE_KEY.into(), Value::String(self.discount_type.as_str().into()));
        patch.insert(PROMO_VALUE_KEY.into(), Value::String(self.discount_value.to_string()));
        patch
    }

    /// Patch that removes every promo key when merged.
    pub fn clear_patch() -> Metadata {
        [PROMO_CODE_KEY, PROMO_TYPE_KEY, PROMO_VALUE_KEY]
            .into_iter()
            .map(|k| (k.to_string(), Value::Null))
            .collect()
    }

    pub fn from_metadata(metadata: &Metadata) -> Result<Option<Self>, MetadataError> {
        let Some(code) = metadata.get(PROMO_CODE_KEY).and_then(Value::as_str) else { return Ok(None) };
        let discount_type = metadata
            .get(PROMO_TYPE_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value::<DiscountKind>(v).ok())
            .ok_or_else(|| MetadataError::Promo(format!("promo {code} has no discount type")))?;
        let discount_value = match metadata.get(PROMO_VALUE_KEY) {
            Some(Value::String(s)) => s.parse::<Decimal>().ok(),
            Some(Value::Number(n)) => n.to_string().parse::<Decimal>().ok(),
            _ => None,
        }
        .ok_or_else(|| MetadataError::Promo(format!("promo {code} has no discount value")))?;
        Ok(Some(Self { code: code.to_string(), discount_type, discount_value }))
    }
}

impl Cart {
    pub fn new(id: impl Into<CartId>, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(), email: None, currency: currency.to_lowercase(), items: vec![],
            metadata: Metadata::new(), shipping_method: None, shipping_address: None,
            created_at: now, updated_at: now,
        }
    }

    /// Number of line items, bundle lines included. Quantities are not summed.
    pub fn item_count(&self) -> usize { self.items.len() }

    /// True when the cart holds no lines at all.
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Lines belonging to `bundle_id`, in cart order.
    pub fn bundle_group(&self, bundle_id: &BundleId) -> Result<Vec<BundleLine<'_>>, MetadataError> {
        let mut group = Vec::new();
        for item in &self.items {
            if let Some(meta) = item.bundle_metadata()? {
                if &meta.bundle_id == bundle_id { group.push(BundleLine { item, meta }); }
            }
        }
        Ok(group)
    }

    /// Group normalized back into selection entries.
    pub fn bundle_entries(&self, bundle_id: &BundleId) -> Result<Vec<SelectionEntry>, MetadataError> {
        Ok(self.bundle_group(bundle_id)?.iter().map(BundleLine::to_entry).collect())
    }

    pub fn promo(&self) -> Result<Option<PromoAnnotation>, MetadataError> {
        PromoAnnotation::from_metadata(&self.metadata)
    }

    /// Merges `patch` into the cart metadata; `null` values delete keys.
    pub fn merge_metadata(&mut self, patch: Metadata) {
        for (key, value) in patch {
            if value.is_null() { self.metadata.remove(&key); } else { self.metadata.insert(key, value); }
        }
        self.touch();
    }

    pub fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataError {
    Malformed { line: LineItemId, reason: String },
    Promo(String),
}
impl std::error::Error for MetadataError {}
impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { line, reason } => write!(f, "Malformed bundle metadata on line {line}: {reason}"),
            Self::Promo(reason) => write!(f, "Malformed promo metadata: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(id: &str, meta: Value) -> CartLineItem {
        CartLineItem {
            id: id.into(), variant_id: "v1".into(), product_id: None, title: "Mug".into(),
            quantity: 2, unit_price: 1500,
            metadata: meta.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_bundle_group_filters_by_bundle() {
        let mut cart = Cart::new("cart_1", "USD");
        cart.items.push(line("l1", json!({"bundle_id": "b_1", "bundle_item_id": "s1", "is_from_bundle": true})));
        cart.items.push(line("l2", json!({"bundle_id": "b_2", "bundle_item_id": "s1"})));
        cart.items.push(line("l3", json!({"gift_wrap": true})));
        let group = cart.bundle_group(&"b_1".into()).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].to_entry(), SelectionEntry::new("s1", "v1", 2));
        assert!(!group[0].meta.has_stamp());
        assert_eq!(cart.currency, "usd");
    }

    #[test]
    fn test_malformed_metadata_is_rejected() {
        let item = line("l1", json!({"bundle_id": "b_1"}));
        assert!(matches!(item.bundle_metadata(), Err(MetadataError::Malformed { .. })));
    }

    #[test]
    fn test_write_into_replaces_stale_stamp() {
        let mut meta = json!({
            "bundle_id": "b_1", "bundle_item_id": "s1", "bundle_discount_percentage": 10.0,
            "bundle_discount_type": "percentage", "actual_discount_amount": 300, "gift_note": "hi"
        }).as_object().cloned().unwrap();
        let parsed = line("l1", Value::Object(meta.clone())).bundle_metadata().unwrap().unwrap();
        parsed.unstamped().write_into(&mut meta);
        assert!(!meta.contains_key("bundle_discount_percentage"));
        assert!(!meta.contains_key("actual_discount_amount"));
        assert_eq!(meta.get("gift_note"), Some(&json!("hi")));
    }

    #[test]
    fn test_promo_metadata_merge_and_clear() {
        let mut cart = Cart::new("cart_1", "usd");
        let promo = PromoAnnotation { code: "SAVE10".into(), discount_type: DiscountKind::Percentage, discount_value: Decimal::from(10) };
        cart.merge_metadata(promo.to_patch());
        cart.metadata.insert("source".into(), json!("web"));
        assert_eq!(cart.promo().unwrap(), Some(promo));
        cart.merge_metadata(PromoAnnotation::clear_patch());
        assert_eq!(cart.promo().unwrap(), None);
        assert_eq!(cart.metadata.get("source"), Some(&json!("web")));
    }
}
