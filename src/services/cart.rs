//! Cart/Local-Cart Reconciler.
//!
//! Two carts exist: the server cart (authoritative while signed in) and a
//! locally persisted cart (authoritative while signed out). Exactly one is
//! effective at a time, chosen by auth state. Mutations follow the
//! optimistic-update-then-reconcile discipline: apply locally, call the
//! network, replace the optimistic view with the server-confirmed cart on
//! success, roll back by re-fetching authoritative state on failure.
//! Mutations are serialized per product so rapid double-clicks can never
//! leave both "added" and "removed" optimistic states visible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::BackendApi;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{Cart, CartItem};
use crate::AuthState;

/// Persistence for the signed-out cart. The in-memory implementation stands
/// in for the host's browser storage.
#[async_trait]
pub trait LocalCartStore: Send + Sync {
    async fn load(&self) -> Result<Cart, ServiceError>;
    async fn store(&self, cart: &Cart) -> Result<(), ServiceError>;
    async fn clear(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLocalCart {
    cart: RwLock<Cart>,
}

impl InMemoryLocalCart {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalCartStore for InMemoryLocalCart {
    async fn load(&self) -> Result<Cart, ServiceError> {
        Ok(self.cart.read().await.clone())
    }

    async fn store(&self, cart: &Cart) -> Result<(), ServiceError> {
        *self.cart.write().await = cart.clone();
        Ok(())
    }

    async fn clear(&self) -> Result<(), ServiceError> {
        *self.cart.write().await = Cart::default();
        Ok(())
    }
}

#[derive(Clone)]
pub struct CartService {
    backend: Arc<dyn BackendApi>,
    local: Arc<dyn LocalCartStore>,
    auth: Arc<AuthState>,
    event_sender: Arc<EventSender>,
    /// Optimistic view of the effective cart, shared with UI readers.
    view: Arc<RwLock<Cart>>,
    product_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl CartService {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        local: Arc<dyn LocalCartStore>,
        auth: Arc<AuthState>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            backend,
            local,
            auth,
            event_sender,
            view: Arc::new(RwLock::new(Cart::default())),
            product_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The optimistic view as last reconciled. Cheap; no network.
    pub async fn cached_view(&self) -> Cart {
        self.view.read().await.clone()
    }

    /// Authoritative effective cart: the server cart while signed in, the
    /// local cart otherwise. Refreshes the optimistic view.
    #[instrument(skip(self))]
    pub async fn effective_cart(&self) -> Result<Cart, ServiceError> {
        let cart = if self.auth.is_authenticated().await {
            self.backend.fetch_cart().await?
        } else {
            self.local.load().await?
        };
        *self.view.write().await = cart.clone();
        Ok(cart)
    }

    /// Add a product to the effective cart. Each product is purchasable once
    /// per cart lifetime; a second add fails with `DuplicateItem`.
    #[instrument(skip(self, item), fields(product_id = %item.product.id))]
    pub async fn add_item(&self, item: CartItem) -> Result<Cart, ServiceError> {
        let product_id = item.product.id;
        let lock = self.acquire_product_lock(product_id).await;
        let _guard = lock.lock().await;

        let snapshot = self.effective_cart().await?;
        if snapshot.contains(product_id) {
            self.release_product_lock(product_id, &lock).await;
            return Err(ServiceError::DuplicateItem(product_id));
        }

        let mut item = item;
        item.quantity = 1;
        let plan_type = item.plan_type;

        // Optimistic apply before the network settles.
        {
            let mut view = self.view.write().await;
            view.items.push(item.clone());
        }

        let result = if self.auth.is_authenticated().await {
            self.backend.add_cart_item(&item).await
        } else {
            self.add_local(&snapshot, item).await
        };

        let outcome = self.reconcile(snapshot, result).await;
        self.release_product_lock(product_id, &lock).await;

        if outcome.is_ok() {
            self.event_sender
                .send_or_log(Event::CartItemAdded {
                    product_id,
                    plan_type,
                })
                .await;
        }
        outcome
    }

    /// Remove a product from the effective cart. Removing an absent product
    /// is a no-op that returns the current cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, product_id: Uuid) -> Result<Cart, ServiceError> {
        let lock = self.acquire_product_lock(product_id).await;
        let _guard = lock.lock().await;

        let snapshot = self.effective_cart().await?;
        if !snapshot.contains(product_id) {
            self.release_product_lock(product_id, &lock).await;
            return Ok(snapshot);
        }

        {
            let mut view = self.view.write().await;
            view.items.retain(|i| i.product.id != product_id);
        }

        let result = if self.auth.is_authenticated().await {
            self.backend.remove_cart_item(product_id).await
        } else {
            let mut updated = snapshot.clone();
            updated.items.retain(|i| i.product.id != product_id);
            self.local.store(&updated).await.map(|_| updated)
        };

        let outcome = self.reconcile(snapshot, result).await;
        self.release_product_lock(product_id, &lock).await;

        if outcome.is_ok() {
            self.event_sender
                .send_or_log(Event::CartItemRemoved { product_id })
                .await;
        }
        outcome
    }

    /// Set a line's quantity. Only 0 and 1 are meaningful: advisory products
    /// are not repeatable purchases, so anything else is a validation error
    /// and the cart is left untouched. Zero removes the line.
    #[instrument(skip(self))]
    pub async fn set_quantity(&self, product_id: Uuid, quantity: u8) -> Result<Cart, ServiceError> {
        if quantity > 1 {
            return Err(ServiceError::ValidationError(format!(
                "quantity {quantity} is out of range; products are purchasable at most once"
            )));
        }
        if quantity == 0 {
            return self.remove_item(product_id).await;
        }

        let lock = self.acquire_product_lock(product_id).await;
        let _guard = lock.lock().await;

        let snapshot = self.effective_cart().await?;
        if !snapshot.contains(product_id) {
            self.release_product_lock(product_id, &lock).await;
            return Err(ServiceError::NotFound(format!(
                "no cart item for product {product_id}"
            )));
        }

        {
            let mut view = self.view.write().await;
            if let Some(line) = view.items.iter_mut().find(|i| i.product.id == product_id) {
                line.quantity = 1;
            }
        }

        let result = if self.auth.is_authenticated().await {
            self.backend.set_cart_quantity(product_id, 1).await
        } else {
            let mut updated = snapshot.clone();
            if let Some(line) = updated.items.iter_mut().find(|i| i.product.id == product_id) {
                line.quantity = 1;
            }
            self.local.store(&updated).await.map(|_| updated)
        };

        let outcome = self.reconcile(snapshot, result).await;
        self.release_product_lock(product_id, &lock).await;

        if outcome.is_ok() {
            self.event_sender
                .send_or_log(Event::CartQuantityChanged {
                    product_id,
                    quantity,
                })
                .await;
        }
        outcome
    }

    /// Merge the signed-out cart into the server cart after sign-in.
    ///
    /// All-or-nothing: local storage is cleared only once every item has been
    /// accepted, so a partial failure leaves the local cart intact and the
    /// merge naturally retryable. An item the server already holds counts as
    /// merged, which keeps the retry idempotent. Merging an empty local cart
    /// is a no-op.
    #[instrument(skip(self))]
    pub async fn merge_local_into_server(&self) -> Result<usize, ServiceError> {
        if !self.auth.is_authenticated().await {
            return Err(ServiceError::AuthRequired);
        }

        let local_cart = self.local.load().await?;
        if local_cart.is_empty() {
            return Ok(0);
        }

        let mut merged = 0;
        for item in &local_cart.items {
            match self.backend.add_cart_item(item).await {
                Ok(_) => merged += 1,
                Err(ServiceError::DuplicateItem(id)) => {
                    info!(product_id = %id, "item already on the server cart, skipping");
                    merged += 1;
                }
                Err(e) => {
                    warn!("cart merge interrupted, local cart retained: {}", e);
                    return Err(e);
                }
            }
        }

        self.local.clear().await?;
        let server_cart = self.backend.fetch_cart().await?;
        *self.view.write().await = server_cart;

        self.event_sender
            .send_or_log(Event::CartMerged {
                merged_items: merged,
            })
            .await;
        Ok(merged)
    }

    /// Reconcile an optimistic mutation with its network result. On failure
    /// the authoritative state is re-fetched; if even that fails, the
    /// pre-mutation snapshot is restored.
    async fn reconcile(
        &self,
        snapshot: Cart,
        result: Result<Cart, ServiceError>,
    ) -> Result<Cart, ServiceError> {
        match result {
            Ok(confirmed) => {
                *self.view.write().await = confirmed.clone();
                Ok(confirmed)
            }
            Err(e) => {
                match self.refetch_authoritative().await {
                    Ok(authoritative) => *self.view.write().await = authoritative,
                    Err(refetch_err) => {
                        warn!("rollback refetch failed, restoring snapshot: {}", refetch_err);
                        *self.view.write().await = snapshot;
                    }
                }
                Err(e)
            }
        }
    }

    async fn refetch_authoritative(&self) -> Result<Cart, ServiceError> {
        if self.auth.is_authenticated().await {
            self.backend.fetch_cart().await
        } else {
            self.local.load().await
        }
    }

    async fn add_local(&self, snapshot: &Cart, item: CartItem) -> Result<Cart, ServiceError> {
        let mut updated = snapshot.clone();
        updated.items.push(item);
        self.local.store(&updated).await?;
        Ok(updated)
    }

    async fn acquire_product_lock(&self, product_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.product_locks.lock().await;
        if let Some(lock) = locks.get(&product_id) {
            lock.clone()
        } else {
            let new_lock = Arc::new(Mutex::new(()));
            locks.insert(product_id, new_lock.clone());
            new_lock
        }
    }

    async fn release_product_lock(&self, product_id: Uuid, lock: &Arc<Mutex<()>>) {
        if Arc::strong_count(lock) == 2 {
            let mut locks = self.product_locks.lock().await;
            if let Some(existing) = locks.get(&product_id) {
                if Arc::ptr_eq(existing, lock) {
                    locks.remove(&product_id);
                }
            }
        }
    }
}
