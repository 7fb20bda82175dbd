//! Cart behavior across the signed-in boundary, driven through the wired
//! engine: which cart is effective, and how the local cart merges on sign-in.

mod common;

use assert_matches::assert_matches;
use uuid::Uuid;

use advisory_checkout::backend::memory::ops;
use advisory_checkout::errors::ServiceError;
use advisory_checkout::models::PlanType;

use common::{portfolio_item, single_item_cart, Harness};

#[tokio::test]
async fn signed_out_cart_is_local_and_never_touches_the_server() {
    let harness = Harness::new();
    let product_id = Uuid::new_v4();

    harness
        .engine
        .cart
        .add_item(portfolio_item(product_id, PlanType::Yearly))
        .await
        .unwrap();

    let effective = harness.engine.cart.effective_cart().await.unwrap();
    assert!(effective.contains(product_id));
    assert!(harness.backend.server_cart().await.is_empty());
    assert_eq!(harness.backend.call_count(ops::ADD_CART_ITEM).await, 0);
}

#[tokio::test]
async fn sign_in_merges_the_local_cart_and_switches_to_the_server_cart() {
    let harness = Harness::new();
    let on_server = Uuid::new_v4();
    let added_offline = Uuid::new_v4();

    harness
        .backend
        .seed_cart(single_item_cart(on_server, PlanType::Yearly))
        .await;
    harness
        .engine
        .cart
        .add_item(portfolio_item(added_offline, PlanType::Yearly))
        .await
        .unwrap();

    // Signed out, only the local item is visible.
    let before = harness.engine.cart.effective_cart().await.unwrap();
    assert!(before.contains(added_offline));
    assert!(!before.contains(on_server));

    harness.sign_in().await;

    // Signed in, the server cart is authoritative and holds both items.
    let after = harness.engine.cart.effective_cart().await.unwrap();
    assert!(after.contains(on_server));
    assert!(after.contains(added_offline));
    assert_eq!(harness.backend.server_cart().await.len(), 2);
}

#[tokio::test]
async fn merging_an_item_the_server_already_holds_is_idempotent() {
    let harness = Harness::new();
    let product_id = Uuid::new_v4();

    harness
        .backend
        .seed_cart(single_item_cart(product_id, PlanType::Yearly))
        .await;
    // The same product was also added while signed out.
    harness
        .engine
        .cart
        .add_item(portfolio_item(product_id, PlanType::Yearly))
        .await
        .unwrap();

    harness.sign_in().await;

    let cart = harness.engine.cart.effective_cart().await.unwrap();
    assert_eq!(cart.len(), 1);
    assert!(cart.contains(product_id));
}

#[tokio::test]
async fn sign_out_switches_back_to_the_local_cart() {
    let harness = Harness::new();
    let on_server = Uuid::new_v4();
    harness
        .backend
        .seed_cart(single_item_cart(on_server, PlanType::Yearly))
        .await;

    harness.sign_in().await;
    assert!(harness
        .engine
        .cart
        .effective_cart()
        .await
        .unwrap()
        .contains(on_server));

    harness.engine.sign_out().await;

    // The local cart was consumed by the merge-on-sign-in, so the effective
    // cart is now empty; the server cart is untouched.
    assert!(harness.engine.cart.effective_cart().await.unwrap().is_empty());
    assert!(harness.backend.server_cart().await.contains(on_server));
}

#[tokio::test]
async fn signed_in_duplicate_add_is_rejected_by_the_server() {
    let harness = Harness::new();
    let product_id = Uuid::new_v4();
    harness.sign_in().await;

    harness
        .engine
        .cart
        .add_item(portfolio_item(product_id, PlanType::Monthly))
        .await
        .unwrap();
    let err = harness
        .engine
        .cart
        .add_item(portfolio_item(product_id, PlanType::Monthly))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::DuplicateItem(id) if id == product_id);
    assert_eq!(harness.backend.server_cart().await.len(), 1);
}
