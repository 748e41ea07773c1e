//! Custom Promo Stacking
//!
//! A promo code is a second discount applied at cart-total level, after the
//! bundle discount. Only the code and its terms are written to the cart;
//! the amount is derived from the live cart every time totals are computed,
//! so no unrelated cart write can leave a stale promo amount behind.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use crate::domain::aggregates::{Cart, DiscountKind, MetadataError, PromoAnnotation};
use crate::domain::events::{CartEvent, EventBus};
use crate::domain::value_objects::{CartId, Money};
use crate::services::{CartService, PromoService, PromoValidation};
use crate::{BundleError, Result};

pub struct PromoStacker {
    carts: Arc<dyn CartService>,
    promos: Arc<dyn PromoService>,
    bus: EventBus,
}

impl PromoStacker {
    pub fn new(carts: Arc<dyn CartService>, promos: Arc<dyn PromoService>, bus: EventBus) -> Self {
        Self { carts, promos, bus }
    }

    /// Read-only check; never consumes the code or touches a cart.
    pub async fn validate(&self, code: &str, email: &str) -> Result<PromoValidation> {
        Ok(self.promos.validate(code.trim(), email.trim()).await?)
    }

    /// Validates `code`, redeems it and records it on the cart.
    pub async fn apply(&self, cart_id: Option<&CartId>, code: &str, email: &str) -> Result<PromoAnnotation> {
        let cart_id = cart_id.filter(|id| !id.is_blank()).ok_or(BundleError::NoCart)?;
        let code = code.trim();
        let validation = self.validate(code, email).await?;
        let promo = match validation {
            PromoValidation { valid: true, promo: Some(promo), .. } => promo,
            PromoValidation { reason, .. } => {
                let reason = reason.unwrap_or_else(|| format!("{code} is not valid"));
                warn!(cart = %cart_id, code, %reason, "Promo code rejected");
                return Err(BundleError::InvalidCode(reason));
            }
        };

        self.promos.redeem(&promo.code, cart_id).await?;
        let annotation = promo.annotation();
        self.carts.update_metadata(cart_id, annotation.to_patch()).await?;
        info!(cart = %cart_id, code = %annotation.code, kind = annotation.discount_type.as_str(), "Promo applied");
        self.bus.publish(cart_id, CartEvent::PromoApplied { code: annotation.code.clone() });
        Ok(annotation)
    }

    /// Clears the promo keys from cart metadata. Bundle lines are untouched.
    pub async fn remove(&self, cart_id: Option<&CartId>) -> Result<()> {
        let cart_id = cart_id.filter(|id| !id.is_blank()).ok_or(BundleError::NoCart)?;
        self.carts.update_metadata(cart_id, PromoAnnotation::clear_patch()).await?;
        info!(cart = %cart_id, "Promo removed");
        self.bus.publish(cart_id, CartEvent::PromoRemoved);
        Ok(())
    }

    pub async fn totals(&self, cart_id: &CartId) -> Result<CartTotals> {
        if cart_id.is_blank() { return Err(BundleError::MissingReference("cart id")); }
        let cart = self.carts.retrieve(cart_id).await?;
        Ok(CartTotals::from_cart(&cart)?)
    }
}

/// Promo discount in minor units against the post-bundle total.
///
/// Fixed amounts are converted from major units and capped at the total;
/// percentages are floored.
pub fn promo_discount(after_bundle: i64, promo: &PromoAnnotation, currency: &str) -> i64 {
    if after_bundle <= 0 { return 0; }
    let raw = match promo.discount_type {
        DiscountKind::Fixed => Money::from_major(promo.discount_value, currency).amount(),
        DiscountKind::Percentage => (Decimal::from(after_bundle) * promo.discount_value / Decimal::ONE_HUNDRED)
            .floor()
            .to_i64()
            .unwrap_or_default(),
    };
    raw.clamp(0, after_bundle)
}

/// Cart totals with both discount layers, all in minor units.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CartTotals {
    pub currency: String,
    /// Sum of pre-discount line totals
    pub original_subtotal: i64,
    /// Sum of the discount stamps on bundle lines
    pub bundle_savings: i64,
    pub after_bundle: i64,
    pub promo: Option<PromoAnnotation>,
    pub promo_discount: i64,
    pub total: i64,
}

impl CartTotals {
    pub fn from_cart(cart: &Cart) -> std::result::Result<Self, MetadataError> {
        let mut original_subtotal = 0;
        let mut bundle_savings = 0;
        for item in &cart.items {
            original_subtotal += item.line_total();
            if let Some(meta) = item.bundle_metadata()? {
                bundle_savings += meta.actual_discount_amount.unwrap_or(0).clamp(0, item.line_total());
            }
        }
        let after_bundle = original_subtotal - bundle_savings;
        let promo = cart.promo()?;
        let promo_discount = promo.as_ref().map(|p| promo_discount(after_bundle, p, &cart.currency)).unwrap_or(0);
        Ok(Self {
            currency: cart.currency.clone(),
            original_subtotal,
            bundle_savings,
            after_bundle,
            promo,
            promo_discount,
            total: after_bundle - promo_discount,
        })
    }

    pub fn savings(&self) -> i64 { self.bundle_savings + self.promo_discount }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    Current,
    /// Session amount no longer matches the cart; re-issue it with `live`
    Stale { recorded: i64, live: i64 },
}

/// Compares a recorded payment-session amount with the live cart total.
pub fn check_payment_session(recorded: i64, totals: &CartTotals) -> PaymentSessionStatus {
    if recorded == totals.total {
        PaymentSessionStatus::Current
    } else {
        PaymentSessionStatus::Stale { recorded, live: totals.total }
    }
}
