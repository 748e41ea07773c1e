//! Bundle Pricing
//!
//! Pure projection of a selection onto money. The same function prices the
//! display preview and the discount stamp written to the cart, so the shown
//! and charged amounts share one threshold table and one rounding rule:
//! discounts are floored to the minor unit.

use serde::Serialize;
use crate::domain::aggregates::{BundleDefinition, BundleItemSlot, DiscountTier, SelectionEntry};
use crate::domain::value_objects::{SlotId, VariantId};

/// Unit price source, in minor units.
pub trait PriceLookup {
    fn unit_price(&self, slot: &BundleItemSlot, variant: &VariantId) -> Option<i64>;
}

impl<F> PriceLookup for F
where
    F: Fn(&BundleItemSlot, &VariantId) -> Option<i64>,
{
    fn unit_price(&self, slot: &BundleItemSlot, variant: &VariantId) -> Option<i64> { self(slot, variant) }
}

/// Prices straight from the variants attached to the bundle definition.
#[derive(Clone, Copy, Debug, Default)]
pub struct CatalogPrices;

impl PriceLookup for CatalogPrices {
    fn unit_price(&self, slot: &BundleItemSlot, variant: &VariantId) -> Option<i64> {
        slot.variant(variant).map(|v| v.unit_price)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinePrice {
    pub slot_id: SlotId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: i64,
    pub original_total: i64,
    /// This line's share of the group discount
    pub discount_amount: i64,
    pub discounted_total: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BundlePrice {
    pub currency: String,
    pub base_total: i64,
    pub total_quantity: u32,
    pub tier: Option<DiscountTier>,
    pub promotional_total: i64,
    pub savings: i64,
    pub lines: Vec<LinePrice>,
}

impl BundlePrice {
    pub fn line(&self, slot: &SlotId) -> Option<&LinePrice> { self.lines.iter().find(|l| &l.slot_id == slot) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    UnknownSlot(SlotId),
    MissingPrice { slot: SlotId, variant: VariantId },
}
impl std::error::Error for PricingError {}
impl std::fmt::Display for PricingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSlot(slot) => write!(f, "Item {slot} is not part of the bundle"),
            Self::MissingPrice { slot, variant } => write!(f, "No price for variant {variant} of item {slot}"),
        }
    }
}

/// Highest tier whose threshold is at or below `total_quantity`.
pub fn select_tier(schedule: &[DiscountTier], total_quantity: u32) -> Option<&DiscountTier> {
    schedule
        .iter()
        .filter(|t| t.quantity_threshold <= total_quantity)
        .max_by_key(|t| t.quantity_threshold)
}

/// Prices `entries` against `bundle`.
///
/// Tiers key off the summed quantity, not the number of entries. The group
/// discount is spread over the lines in proportion to their original totals
/// so that the line shares add up to the group savings exactly.
pub fn price_bundle(
    bundle: &BundleDefinition,
    entries: &[SelectionEntry],
    prices: &impl PriceLookup,
) -> Result<BundlePrice, PricingError> {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let slot = bundle.slot(&entry.slot_id).ok_or_else(|| PricingError::UnknownSlot(entry.slot_id.clone()))?;
        let unit_price = prices.unit_price(slot, &entry.variant_id).ok_or_else(|| PricingError::MissingPrice {
            slot: entry.slot_id.clone(),
            variant: entry.variant_id.clone(),
        })?;
        let original_total = unit_price * i64::from(entry.quantity);
        lines.push(LinePrice {
            slot_id: entry.slot_id.clone(),
            variant_id: entry.variant_id.clone(),
            quantity: entry.quantity,
            unit_price,
            original_total,
            discount_amount: 0,
            discounted_total: original_total,
        });
    }

    let base_total: i64 = lines.iter().map(|l| l.original_total).sum();
    let total_quantity: u32 = entries.iter().map(|e| e.quantity).sum();
    let tier = bundle.tier_for(total_quantity).cloned();
    let savings = tier.as_ref().map_or(0, |t| t.discount_on(base_total));

    let weights: Vec<i64> = lines.iter().map(|l| l.original_total).collect();
    for (line, share) in lines.iter_mut().zip(allocate_discount(savings, &weights)) {
        line.discount_amount = share;
        line.discounted_total = line.original_total - share;
    }

    Ok(BundlePrice {
        currency: bundle.currency.clone(),
        base_total,
        total_quantity,
        tier,
        promotional_total: base_total - savings,
        savings,
        lines,
    })
}

/// Splits `total` across `weights` proportionally, largest remainder first.
///
/// Shares never exceed their weight and always sum to `total` when `total`
/// does not exceed the weight sum.
pub fn allocate_discount(total: i64, weights: &[i64]) -> Vec<i64> {
    let sum: i64 = weights.iter().map(|w| (*w).max(0)).sum();
    if total <= 0 || sum <= 0 {
        return vec![0; weights.len()];
    }
    let total = total.min(sum);
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (idx, weight) in weights.iter().enumerate() {
        let product = i128::from(total) * i128::from((*weight).max(0));
        let share = (product / i128::from(sum)) as i64;
        shares.push(share);
        remainders.push((product % i128::from(sum), idx));
    }
    let mut left = total - shares.iter().sum::<i64>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders {
        if left == 0 { break; }
        if shares[idx] < weights[idx] {
            shares[idx] += 1;
            left -= 1;
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::Product;
    use rust_decimal::Decimal;

    fn slot(id: &str, price: i64) -> BundleItemSlot {
        BundleItemSlot::new(id, Product::new(format!("p_{id}"), id).with_variant(format!("v_{id}"), "Default", price))
    }

    fn bundle() -> BundleDefinition {
        BundleDefinition::new("b_1", "Kit", "kit")
            .with_tier(DiscountTier::percentage(2, Decimal::from(10)))
            .with_tier(DiscountTier::percentage(3, Decimal::from(15)))
            .with_slot(slot("s1", 5000))
            .with_slot(slot("s2", 5000))
            .with_slot(slot("s3", 5000))
    }

    #[test]
    fn test_two_items_reach_first_tier() {
        let entries = vec![SelectionEntry::new("s1", "v_s1", 1), SelectionEntry::new("s2", "v_s2", 1)];
        let price = price_bundle(&bundle(), &entries, &CatalogPrices).unwrap();
        assert_eq!(price.base_total, 10_000);
        assert_eq!(price.promotional_total, 9_000);
        assert_eq!(price.savings, 1_000);
        assert_eq!(price.lines.iter().map(|l| l.discount_amount).collect::<Vec<_>>(), vec![500, 500]);
    }

    #[test]
    fn test_quantity_not_entry_count_drives_tier() {
        let b = bundle();
        let one_slot = price_bundle(&b, &[SelectionEntry::new("s1", "v_s1", 3)], &CatalogPrices).unwrap();
        let three_slots = price_bundle(
            &b,
            &[SelectionEntry::new("s1", "v_s1", 1), SelectionEntry::new("s2", "v_s2", 1), SelectionEntry::new("s3", "v_s3", 1)],
            &CatalogPrices,
        )
        .unwrap();
        assert_eq!(one_slot.tier, three_slots.tier);
        assert_eq!(one_slot.promotional_total, 12_750);
        assert_eq!(three_slots.promotional_total, 12_750);
    }

    #[test]
    fn test_savings_never_decrease_across_threshold() {
        let b = bundle();
        let mut last = 0;
        for qty in 1..=6 {
            let price = price_bundle(&b, &[SelectionEntry::new("s1", "v_s1", qty)], &CatalogPrices).unwrap();
            assert!(price.savings >= last, "savings dropped at quantity {qty}");
            last = price.savings;
        }
    }

    #[test]
    fn test_fixed_discount_never_negative() {
        let b = BundleDefinition::new("b_f", "Fixed", "fixed")
            .with_tier(DiscountTier::fixed(1, 20_000))
            .with_slot(slot("s1", 5000));
        let price = price_bundle(&b, &[SelectionEntry::new("s1", "v_s1", 1)], &CatalogPrices).unwrap();
        assert_eq!(price.promotional_total, 0);
        assert_eq!(price.savings, 5000);
    }

    #[test]
    fn test_percentage_rounds_discount_down() {
        let b = BundleDefinition::new("b_r", "Round", "round")
            .with_tier(DiscountTier::percentage(1, Decimal::from(15)))
            .with_slot(slot("s1", 333));
        let price = price_bundle(&b, &[SelectionEntry::new("s1", "v_s1", 1)], &CatalogPrices).unwrap();
        // 15% of 333 = 49.95
        assert_eq!(price.savings, 49);
        assert_eq!(price.promotional_total, 284);
    }

    #[test]
    fn test_custom_price_lookup() {
        let lookup = |_: &BundleItemSlot, _: &VariantId| Some(100);
        let price = price_bundle(&bundle(), &[SelectionEntry::new("s2", "anything", 2)], &lookup).unwrap();
        assert_eq!(price.base_total, 200);
        let missing = |_: &BundleItemSlot, _: &VariantId| -> Option<i64> { None };
        assert!(matches!(
            price_bundle(&bundle(), &[SelectionEntry::new("s2", "v_s2", 1)], &missing),
            Err(PricingError::MissingPrice { .. })
        ));
    }

    #[test]
    fn test_allocation_sums_to_total() {
        assert_eq!(allocate_discount(10, &[10, 10, 10]), vec![4, 3, 3]);
        assert_eq!(allocate_discount(10, &[1, 1, 1]), vec![1, 1, 1]);
        assert_eq!(allocate_discount(7, &[5000, 2500]).iter().sum::<i64>(), 7);
        assert_eq!(allocate_discount(50, &[10, 20]), vec![10, 20]);
        assert_eq!(allocate_discount(5, &[0, 0]), vec![0, 0]);
    }
}
