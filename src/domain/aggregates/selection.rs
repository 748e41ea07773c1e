//! Selection Aggregate
//!
//! Session-private mapping from bundle slot to the chosen variant and
//! quantity. Never persisted; rebuilt from cart line metadata on load.
//! Observers get every change through [`SelectionState::subscribe`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use crate::domain::aggregates::bundle::{BundleDefinition, SelectionMode};
use crate::domain::aggregates::cart::{Cart, MetadataError};
use crate::domain::value_objects::{SlotId, VariantId};
use crate::pricing::{price_bundle, BundlePrice, CatalogPrices, PricingError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub slot_id: SlotId,
    pub variant_id: VariantId,
    pub quantity: u32,
}

impl SelectionEntry {
    pub fn new(slot_id: impl Into<SlotId>, variant_id: impl Into<VariantId>, quantity: u32) -> Self {
        Self { slot_id: slot_id.into(), variant_id: variant_id.into(), quantity }
    }
}

/// First rule a set of entries breaks, checked in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectionViolation {
    BelowMinimum { min: u32 },
    AboveMaximum { max: u32 },
    RequireAllIncomplete,
    UnknownSlot(SlotId),
    UnknownVariant { slot: SlotId, variant: VariantId },
    ZeroQuantity(SlotId),
}

impl fmt::Display for SelectionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinimum { min } if *min == 1 => write!(f, "select at least 1 item"),
            Self::BelowMinimum { min } => write!(f, "select at least {min} items"),
            Self::AboveMaximum { max } if *max == 1 => write!(f, "select at most 1 item"),
            Self::AboveMaximum { max } => write!(f, "select at most {max} items"),
            Self::RequireAllIncomplete => write!(f, "must select all items"),
            Self::UnknownSlot(slot) => write!(f, "item {slot} is not part of this bundle"),
            Self::UnknownVariant { slot, variant } => write!(f, "variant {variant} is not available for item {slot}"),
            Self::ZeroQuantity(slot) => write!(f, "quantity for item {slot} must be at least 1"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    pub total_entries: usize,
    pub is_valid: bool,
    pub violation_reason: Option<String>,
    #[serde(skip)]
    pub violation: Option<SelectionViolation>,
}

impl SelectionSummary {
    pub fn can_submit(&self) -> bool { self.is_valid && self.total_entries > 0 }
}

/// Runs the bundle rules over `entries`, short-circuiting on the first failure.
pub fn check_selection(bundle: &BundleDefinition, entries: &[SelectionEntry]) -> SelectionSummary {
    let total = entries.len();
    let violation = first_violation(bundle, entries);
    SelectionSummary {
        total_entries: total,
        is_valid: violation.is_none(),
        violation_reason: violation.as_ref().map(ToString::to_string),
        violation,
    }
}

fn first_violation(bundle: &BundleDefinition, entries: &[SelectionEntry]) -> Option<SelectionViolation> {
    let total = entries.len() as u32;
    if total < bundle.min_items {
        return Some(SelectionViolation::BelowMinimum { min: bundle.min_items });
    }
    if let Some(max) = bundle.max_items {
        if total > max { return Some(SelectionViolation::AboveMaximum { max }); }
    }
    if bundle.selection_mode == SelectionMode::RequireAll
        && !bundle.items.iter().all(|slot| entries.iter().any(|e| e.slot_id == slot.slot_id))
    {
        return Some(SelectionViolation::RequireAllIncomplete);
    }
    for entry in entries {
        let Some(slot) = bundle.slot(&entry.slot_id) else {
            return Some(SelectionViolation::UnknownSlot(entry.slot_id.clone()));
        };
        if !slot.product.has_variant(&entry.variant_id) {
            return Some(SelectionViolation::UnknownVariant { slot: entry.slot_id.clone(), variant: entry.variant_id.clone() });
        }
        if entry.quantity == 0 {
            return Some(SelectionViolation::ZeroQuantity(entry.slot_id.clone()));
        }
    }
    None
}

/// What subscribers observe after each change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectionSnapshot {
    pub revision: u64,
    pub entries: Vec<SelectionEntry>,
    pub summary: SelectionSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError { NotSelected(SlotId), InvalidQuantity(u32) }
impl std::error::Error for SelectionError {}
impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSelected(slot) => write!(f, "Item {slot} is not selected"),
            Self::InvalidQuantity(q) => write!(f, "Invalid quantity {q}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Chosen { variant_id: VariantId, quantity: u32 }

pub struct SelectionState {
    bundle: Arc<BundleDefinition>,
    chosen: HashMap<SlotId, Chosen>,
    revision: u64,
    tx: watch::Sender<SelectionSnapshot>,
}

impl SelectionState {
    pub fn new(bundle: Arc<BundleDefinition>) -> Self {
        let initial = SelectionSnapshot { revision: 0, entries: vec![], summary: check_selection(&bundle, &[]) };
        let (tx, _rx) = watch::channel(initial);
        Self { bundle, chosen: HashMap::new(), revision: 0, tx }
    }

    /// Rebuilds the session state from the bundle lines already in `cart`.
    ///
    /// Lines whose slot no longer exists in the definition are skipped.
    pub fn from_cart(bundle: Arc<BundleDefinition>, cart: &Cart) -> Result<Self, MetadataError> {
        let mut state = Self::new(bundle);
        for line in cart.bundle_group(&state.bundle.id)? {
            if state.bundle.slot(&line.meta.bundle_item_id).is_none() {
                warn!(slot = %line.meta.bundle_item_id, "Cart line refers to a slot missing from the bundle");
                continue;
            }
            state.chosen.insert(
                line.meta.bundle_item_id.clone(),
                Chosen { variant_id: line.item.variant_id.clone(), quantity: line.item.quantity.max(1) },
            );
        }
        state.notify();
        Ok(state)
    }

    pub fn bundle(&self) -> &BundleDefinition { &self.bundle }

    pub fn is_selected(&self, slot: &SlotId) -> bool { self.chosen.contains_key(slot) }

    pub fn selected_variant(&self, slot: &SlotId) -> Option<&VariantId> {
        self.chosen.get(slot).map(|c| &c.variant_id)
    }

    /// Entries in the bundle's slot order.
    pub fn entries(&self) -> Vec<SelectionEntry> {
        self.bundle
            .items
            .iter()
            .filter_map(|slot| {
                self.chosen.get(&slot.slot_id).map(|c| SelectionEntry {
                    slot_id: slot.slot_id.clone(),
                    variant_id: c.variant_id.clone(),
                    quantity: c.quantity,
                })
            })
            .collect()
    }

    /// Inserts, replaces or removes the entry for `slot`.
    ///
    /// With a variant the slot is inserted (quantity defaults to the slot's
    /// catalog default) or replaced; without one it is removed. Returns
    /// whether the state changed.
    pub fn toggle(&mut self, slot: &SlotId, variant: Option<VariantId>, quantity: Option<u32>) -> bool {
        let Some(def) = self.bundle.slot(slot) else {
            warn!(%slot, bundle = %self.bundle.id, "Ignoring toggle for unknown bundle item");
            return false;
        };
        let default_quantity = def.default_quantity;
        match variant {
            Some(variant_id) => {
                let quantity = quantity.unwrap_or(default_quantity);
                if quantity == 0 {
                    warn!(%slot, "Ignoring toggle with zero quantity");
                    return false;
                }
                let next = Chosen { variant_id, quantity };
                if self.chosen.get(slot) == Some(&next) { return false; }
                debug!(%slot, variant = %next.variant_id, quantity, "Bundle item selected");
                self.chosen.insert(slot.clone(), next);
            }
            None => {
                if self.chosen.remove(slot).is_none() {
                    warn!(%slot, "Cannot select a bundle item without a variant");
                    return false;
                }
                debug!(%slot, "Bundle item deselected");
            }
        }
        self.notify();
        true
    }

    pub fn set_quantity(&mut self, slot: &SlotId, quantity: u32) -> Result<(), SelectionError> {
        if quantity == 0 { return Err(SelectionError::InvalidQuantity(quantity)); }
        let entry = self.chosen.get_mut(slot).ok_or_else(|| SelectionError::NotSelected(slot.clone()))?;
        if entry.quantity != quantity {
            entry.quantity = quantity;
            self.notify();
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        if self.chosen.is_empty() { return; }
        self.chosen.clear();
        self.notify();
    }

    pub fn summary(&self) -> SelectionSummary { check_selection(&self.bundle, &self.entries()) }

    pub fn can_submit(&self) -> bool { self.summary().can_submit() }

    /// Display price of the current selection using catalog unit prices.
    pub fn price(&self) -> Result<BundlePrice, PricingError> {
        price_bundle(&self.bundle, &self.entries(), &CatalogPrices)
    }

    pub fn subscribe(&self) -> watch::Receiver<SelectionSnapshot> { self.tx.subscribe() }

    fn notify(&mut self) {
        self.revision += 1;
        let entries = self.entries();
        let summary = check_selection(&self.bundle, &entries);
        self.tx.send_replace(SelectionSnapshot { revision: self.revision, entries, summary });
    }
}
