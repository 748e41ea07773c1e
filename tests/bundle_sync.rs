//! End-to-end bundle flows against the in-memory commerce backend.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use storefront_bundles::domain::aggregates::{
    BundleDefinition, BundleItemSlot, Cart, DiscountKind, DiscountTier, Product, SelectionEntry, SelectionMode, SelectionState,
};
use storefront_bundles::domain::events::{CacheTag, CartEvent, EventBus};
use storefront_bundles::domain::value_objects::{BundleId, CartId};
use storefront_bundles::services::{CartUpdate, CustomPromo, MemoryCommerce, RemoteError};
use storefront_bundles::{BundleError, CartSyncEngine, CartTotals, PromoStacker, SyncPath, SyncSettings};

fn starter_kit() -> BundleDefinition {
    BundleDefinition::new("b_kit", "Starter Kit", "starter-kit")
        .with_tier(DiscountTier::percentage(2, Decimal::from(10)))
        .with_tier(DiscountTier::percentage(3, Decimal::from(15)))
        .with_slot(BundleItemSlot::new("s1", Product::new("p1", "Mug").with_variant("v1", "Default", 5000)))
        .with_slot(BundleItemSlot::new("s2", Product::new("p2", "Tea").with_variant("v2", "Default", 5000)))
        .with_slot(BundleItemSlot::new("s3", Product::new("p3", "Spoon").with_variant("v3", "Default", 5000)))
}

struct Harness {
    backend: Arc<MemoryCommerce>,
    engine: CartSyncEngine,
    promos: PromoStacker,
    bus: EventBus,
    cart_id: CartId,
    bundle_id: BundleId,
}

fn harness_with(backend: MemoryCommerce, settings: SyncSettings) -> Harness {
    let backend = Arc::new(backend);
    backend.insert_bundle(starter_kit());
    let cart = backend.create_cart("usd");
    let bus = EventBus::default();
    Harness {
        engine: CartSyncEngine::new(backend.clone(), backend.clone(), bus.clone(), settings),
        promos: PromoStacker::new(backend.clone(), backend.clone(), bus.clone()),
        backend,
        bus,
        cart_id: cart.id,
        bundle_id: "b_kit".into(),
    }
}

fn harness() -> Harness {
    harness_with(MemoryCommerce::new(), SyncSettings { confirm_attempts: 3, confirm_delay: Duration::from_millis(1) })
}

fn entry(slot: &str) -> SelectionEntry {
    SelectionEntry::new(slot, format!("v{}", &slot[1..]), 1)
}

/// (slot, discount stamp, stamped percentage) per bundle line, in cart order.
fn stamps(cart: &Cart, bundle_id: &BundleId) -> Vec<(String, Option<i64>, Option<Decimal>)> {
    cart.bundle_group(bundle_id)
        .unwrap()
        .iter()
        .map(|l| (l.meta.bundle_item_id.to_string(), l.meta.actual_discount_amount, l.meta.bundle_discount_percentage))
        .collect()
}

impl Harness {
    async fn cart(&self) -> Cart {
        use storefront_bundles::services::CartService;
        self.backend.retrieve(&self.cart_id).await.unwrap()
    }
}

#[tokio::test]
async fn test_add_two_items_applies_first_tier() {
    let h = harness();
    let outcome = h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();

    assert_eq!(outcome.path, SyncPath::Added);
    assert!(outcome.stamps_confirmed);
    let price = outcome.price.unwrap();
    assert_eq!(price.base_total, 10000);
    assert_eq!(price.promotional_total, 9000);
    assert_eq!(price.savings, 1000);

    let cart = outcome.cart.unwrap();
    assert_eq!(
        stamps(&cart, &h.bundle_id),
        vec![("s1".to_string(), Some(500), Some(Decimal::from(10))), ("s2".to_string(), Some(500), Some(Decimal::from(10)))]
    );
    assert_eq!(CartTotals::from_cart(&cart).unwrap().total, 9000);
}

#[tokio::test]
async fn test_upgrade_on_add_restamps_every_line() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();
    let outcome = h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s3")]).await.unwrap();

    assert_eq!(outcome.path, SyncPath::Upgraded);
    assert_eq!(outcome.entries, vec![entry("s1"), entry("s2"), entry("s3")]);
    assert_eq!(outcome.price.as_ref().unwrap().promotional_total, 12750);

    let cart = h.cart().await;
    let pct = Some(Decimal::from(15));
    assert_eq!(
        stamps(&cart, &h.bundle_id),
        vec![("s1".to_string(), Some(750), pct), ("s2".to_string(), Some(750), pct), ("s3".to_string(), Some(750), pct)]
    );
    assert_eq!(cart.item_count(), 3);
}

#[tokio::test]
async fn test_require_all_blocks_partial_selection() {
    let bundle = BundleDefinition::new("b_all", "Full Set", "full-set")
        .with_mode(SelectionMode::RequireAll)
        .with_slot(BundleItemSlot::new("s1", Product::new("p1", "A").with_variant("v1", "Default", 1000)))
        .with_slot(BundleItemSlot::new("s2", Product::new("p2", "B").with_variant("v2", "Default", 1000)))
        .with_slot(BundleItemSlot::new("s3", Product::new("p3", "C").with_variant("v3", "Default", 1000)))
        .with_slot(BundleItemSlot::new("s4", Product::new("p4", "D").with_variant("v4", "Default", 1000)));

    let mut state = SelectionState::new(Arc::new(bundle.clone()));
    for slot in ["s1", "s2", "s3"] {
        assert!(state.toggle(&slot.into(), Some(format!("v{}", &slot[1..]).into()), None));
    }
    assert!(!state.can_submit());
    assert_eq!(state.summary().violation_reason.as_deref(), Some("must select all items"));

    let h = harness();
    h.backend.insert_bundle(bundle);
    let err = h.engine.add_bundle_to_cart(&h.cart_id, &"b_all".into(), state.entries()).await.unwrap_err();
    assert!(matches!(err, BundleError::InvalidSelection(ref reason) if reason == "must select all items"));
    assert_eq!(h.backend.write_count(), 0);
}

#[tokio::test]
async fn test_remove_single_slot_drops_tier() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2"), entry("s3")]).await.unwrap();
    let mut rx = h.bus.subscribe();

    let outcome = h.engine.remove_bundle_from_cart(&h.cart_id, &h.bundle_id, Some(&"s2".into())).await.unwrap();
    assert_eq!(outcome.path, SyncPath::Removed);
    assert_eq!(outcome.price.as_ref().unwrap().total_quantity, 2);

    let cart = h.cart().await;
    let pct = Some(Decimal::from(10));
    assert_eq!(stamps(&cart, &h.bundle_id), vec![("s1".to_string(), Some(500), pct), ("s3".to_string(), Some(500), pct)]);

    let invalidation = rx.recv().await.unwrap();
    assert_eq!(invalidation.tags, vec![CacheTag::Carts, CacheTag::Fulfillment]);
    assert_eq!(invalidation.event, CartEvent::BundleRemoved { bundle_id: h.bundle_id.clone(), slot_id: Some("s2".into()) });
}

#[tokio::test]
async fn test_removing_last_slot_removes_group() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1")]).await.unwrap();
    let outcome = h.engine.remove_bundle_from_cart(&h.cart_id, &h.bundle_id, Some(&"s1".into())).await.unwrap();
    assert!(outcome.price.is_none());
    assert!(outcome.stamps_confirmed);
    assert!(h.cart().await.is_empty());
}

#[tokio::test]
async fn test_repeated_add_is_idempotent() {
    let h = harness();
    let selection = vec![entry("s1"), entry("s2")];
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, selection.clone()).await.unwrap();
    let first = stamps(&h.cart().await, &h.bundle_id);
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, selection).await.unwrap();
    let cart = h.cart().await;
    assert_eq!(cart.item_count(), 2);
    assert_eq!(stamps(&cart, &h.bundle_id), first);
}

#[tokio::test]
async fn test_update_replaces_and_empty_update_removes() {
    let h = harness();
    h.backend.add_line_item(&h.cart_id, "v_gift", "Gift card", 1, 2500).unwrap();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2"), entry("s3")]).await.unwrap();

    let mut bigger = entry("s2");
    bigger.quantity = 2;
    let outcome = h.engine.update_bundle_in_cart(&h.cart_id, &h.bundle_id, vec![bigger.clone()]).await.unwrap();
    assert_eq!(outcome.path, SyncPath::Replaced);
    assert_eq!(h.cart().await.bundle_entries(&h.bundle_id).unwrap(), vec![bigger]);

    let outcome = h.engine.update_bundle_in_cart(&h.cart_id, &h.bundle_id, vec![]).await.unwrap();
    assert_eq!(outcome.path, SyncPath::Removed);
    let cart = h.cart().await;
    assert!(cart.bundle_group(&h.bundle_id).unwrap().is_empty());
    assert_eq!(cart.item_count(), 1);
}

#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let h = harness();
    let mut tea = entry("s2");
    tea.quantity = 2;
    let target = vec![entry("s1"), tea];

    let first = h.engine.update_bundle_in_cart(&h.cart_id, &h.bundle_id, target.clone()).await.unwrap();
    assert_eq!(first.path, SyncPath::Replaced);
    let after_first = h.cart().await;
    let second = h.engine.update_bundle_in_cart(&h.cart_id, &h.bundle_id, target.clone()).await.unwrap();
    assert_eq!(second.path, SyncPath::Replaced);
    let after_second = h.cart().await;

    assert_eq!(after_first.bundle_entries(&h.bundle_id).unwrap(), target);
    assert_eq!(after_second.bundle_entries(&h.bundle_id).unwrap(), target);
    assert_eq!(stamps(&after_second, &h.bundle_id), stamps(&after_first, &h.bundle_id));
    let pct = Some(Decimal::from(15));
    assert_eq!(stamps(&after_second, &h.bundle_id), vec![("s1".to_string(), Some(750), pct), ("s2".to_string(), Some(1500), pct)]);
    assert_eq!(after_second.item_count(), 2);
}

#[tokio::test]
async fn test_stamps_survive_unrelated_updates_and_promo_stacks() {
    let h = harness();
    h.backend.insert_promo(CustomPromo { code: "TEN".into(), discount_type: DiscountKind::Percentage, discount_value: Decimal::from(10) }, None);
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();
    h.promos.apply(Some(&h.cart_id), "TEN", "shopper@example.com").await.unwrap();

    h.backend
        .update_cart(&h.cart_id, CartUpdate { shipping_method: Some("express".into()), email: Some("shopper@example.com".into()), ..Default::default() })
        .unwrap();

    let totals = h.promos.totals(&h.cart_id).await.unwrap();
    assert_eq!(totals.after_bundle, 9000);
    assert_eq!(totals.promo_discount, 900);
    assert_eq!(totals.total, 8100);

    h.promos.remove(Some(&h.cart_id)).await.unwrap();
    let cart = h.cart().await;
    assert!(cart.promo().unwrap().is_none());
    assert_eq!(stamps(&cart, &h.bundle_id).iter().filter_map(|s| s.1).sum::<i64>(), 1000);
}

#[tokio::test]
async fn test_promo_applies_to_bundle_discounted_total() {
    let h = harness();
    h.backend.insert_bundle(
        BundleDefinition::new("b_pair", "Pair", "pair")
            .with_tier(DiscountTier::percentage(2, Decimal::from(20)))
            .with_slot(BundleItemSlot::new("s1", Product::new("p1", "Left").with_variant("v1", "Default", 5000)))
            .with_slot(BundleItemSlot::new("s2", Product::new("p2", "Right").with_variant("v2", "Default", 5000))),
    );
    h.backend.insert_promo(CustomPromo { code: "TEN".into(), discount_type: DiscountKind::Percentage, discount_value: Decimal::from(10) }, None);
    h.engine.add_bundle_to_cart(&h.cart_id, &"b_pair".into(), vec![entry("s1"), entry("s2")]).await.unwrap();
    h.promos.apply(Some(&h.cart_id), "TEN", "shopper@example.com").await.unwrap();

    let totals = h.promos.totals(&h.cart_id).await.unwrap();
    assert_eq!(totals.original_subtotal, 10000);
    assert_eq!(totals.after_bundle, 8000);
    assert_eq!(totals.total, 7200);
}

#[tokio::test]
async fn test_lagging_stamps_are_confirmed() {
    let h = harness_with(
        MemoryCommerce::new().with_stamp_lag(2),
        SyncSettings { confirm_attempts: 3, confirm_delay: Duration::from_millis(1) },
    );
    let outcome = h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();
    assert!(outcome.stamps_confirmed);

    let h = harness_with(
        MemoryCommerce::new().with_stamp_lag(5),
        SyncSettings { confirm_attempts: 2, confirm_delay: Duration::from_millis(1) },
    );
    let outcome = h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();
    assert!(!outcome.stamps_confirmed);
    assert!(outcome.cart.is_some());
}

#[tokio::test]
async fn test_failed_write_leaves_group_unchanged() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s2")]).await.unwrap();
    let before = h.cart().await;
    let mut rx = h.bus.subscribe();

    h.backend.fail_next_write("inventory unavailable");
    let err = h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s3")]).await.unwrap_err();
    assert!(matches!(err, BundleError::Remote(RemoteError::Rejected { ref message, .. }) if message == "inventory unavailable"));
    assert_eq!(h.cart().await.items, before.items);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_refresh_is_not_fatal() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1")]).await.unwrap();
    h.backend.fail_next_reads(10);
    let outcome = h.engine.remove_bundle_from_cart(&h.cart_id, &h.bundle_id, None).await.unwrap();
    assert!(outcome.cart.is_none());
    assert!(!outcome.stamps_confirmed);
    h.backend.fail_next_reads(0);
    assert!(h.cart().await.is_empty());
}

#[tokio::test]
async fn test_blank_references_fail_before_any_call() {
    let h = harness();
    let err = h.engine.add_bundle_to_cart(&"".into(), &h.bundle_id, vec![entry("s1")]).await.unwrap_err();
    assert!(matches!(err, BundleError::MissingReference("cart id")));
    let err = h.engine.remove_bundle_from_cart(&h.cart_id, &" ".into(), None).await.unwrap_err();
    assert!(matches!(err, BundleError::MissingReference("bundle id")));
    assert_eq!(h.backend.write_count(), 0);
}

#[tokio::test]
async fn test_concurrent_adds_on_one_group_both_land() {
    let h = harness();
    let (a, b) = tokio::join!(
        h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1")]),
        h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s2")]),
    );
    a.unwrap();
    b.unwrap();
    let mut slots: Vec<String> = stamps(&h.cart().await, &h.bundle_id).into_iter().map(|s| s.0).collect();
    slots.sort();
    assert_eq!(slots, vec!["s1", "s2"]);
}

#[tokio::test]
async fn test_selection_restored_from_cart() {
    let h = harness();
    h.engine.add_bundle_to_cart(&h.cart_id, &h.bundle_id, vec![entry("s1"), entry("s3")]).await.unwrap();
    let state = SelectionState::from_cart(Arc::new(starter_kit()), &h.cart().await).unwrap();
    assert_eq!(state.entries(), vec![entry("s1"), entry("s3")]);
    assert_eq!(state.price().unwrap().promotional_total, 9000);
}
