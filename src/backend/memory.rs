//! Scriptable in-memory [`BackendApi`] for tests and the demo binary.
//!
//! State can be seeded (subscriptions, cart, profile, artifacts), upcoming
//! calls can be scripted to fail or to walk a status sequence, individual
//! operations can be held open until released, and every call lands in a
//! journal the caller can assert against.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{BackendApi, CreateMandateRequest, CreateOrderRequest, OrderLine};
use crate::errors::ServiceError;
use crate::models::{
    Cart, CartItem, EsignArtifact, EsignDemand, EsignDocument, EsignStatus, GatewayOrder,
    KycProfile, MandateInit, MandateState, NextAction, PaymentConfirmation, PlanType,
    ProductKind, ProfileUpdate, SubscriptionRecord,
};

/// Operation names accepted by [`MemoryBackend::fail_next`] and
/// [`MemoryBackend::hold`].
pub mod ops {
    pub const FETCH_SUBSCRIPTIONS: &str = "fetch_subscriptions";
    pub const FETCH_PORTFOLIO_ACCESS: &str = "fetch_portfolio_access";
    pub const FETCH_CART: &str = "fetch_cart";
    pub const ADD_CART_ITEM: &str = "add_cart_item";
    pub const REMOVE_CART_ITEM: &str = "remove_cart_item";
    pub const SET_CART_QUANTITY: &str = "set_cart_quantity";
    pub const CREATE_ORDER: &str = "create_order";
    pub const VERIFY_PAYMENT: &str = "verify_payment";
    pub const CREATE_MANDATE: &str = "create_mandate";
    pub const MANDATE_STATUS: &str = "mandate_status";
    pub const CREATE_ESIGN_DOCUMENT: &str = "create_esign_document";
    pub const ESIGN_STATUS: &str = "esign_status";
    pub const FETCH_ESIGN_ARTIFACTS: &str = "fetch_esign_artifacts";
    pub const FETCH_PROFILE: &str = "fetch_profile";
    pub const UPDATE_PROFILE: &str = "update_profile";
}

/// A failure queued for one upcoming call to an operation.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    Network(String),
    Rejected(String),
    EsignRequired(EsignDemand),
    EsignPending(EsignDemand),
    NotFound(String),
}

impl ScriptedFailure {
    fn into_error(self) -> ServiceError {
        match self {
            ScriptedFailure::Network(msg) => ServiceError::NetworkError(msg),
            ScriptedFailure::Rejected(msg) => ServiceError::GatewayRejected(msg),
            ScriptedFailure::EsignRequired(demand) => ServiceError::EsignRequired(demand),
            ScriptedFailure::EsignPending(demand) => ServiceError::EsignPending(demand),
            ScriptedFailure::NotFound(msg) => ServiceError::NotFound(msg),
        }
    }
}

/// Behavior of the next mandate created through [`BackendApi::create_mandate`].
#[derive(Debug, Clone)]
pub struct MandateScript {
    pub next_action: NextAction,
    /// Statuses returned by successive status checks; the last one repeats.
    pub states: Vec<MandateState>,
}

impl Default for MandateScript {
    fn default() -> Self {
        Self {
            next_action: NextAction::PollStatus,
            states: vec![MandateState::Confirmed],
        }
    }
}

struct StoredOrder {
    order: GatewayOrder,
    lines: Vec<OrderLine>,
    settled: bool,
}

struct StoredMandate {
    mandate_id: String,
    product_id: Uuid,
    product_type: ProductKind,
    plan_type: PlanType,
    states: VecDeque<MandateState>,
    settled: bool,
}

#[derive(Default)]
struct MemoryState {
    subscriptions: Vec<SubscriptionRecord>,
    portfolio_ids: Vec<Uuid>,
    cart: Cart,
    profile: KycProfile,
    artifacts: Vec<EsignArtifact>,
    orders: HashMap<String, StoredOrder>,
    mandates: HashMap<String, StoredMandate>,
    mandate_scripts: VecDeque<MandateScript>,
    esign_scripts: VecDeque<Vec<EsignStatus>>,
    esign_queues: HashMap<String, VecDeque<EsignStatus>>,
    failures: HashMap<String, VecDeque<ScriptedFailure>>,
    calls: Vec<String>,
}

/// In-memory platform backend.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    seq: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            gates: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    // ---- seeding and scripting -------------------------------------------

    pub async fn seed_subscriptions(&self, records: Vec<SubscriptionRecord>) {
        self.state.lock().await.subscriptions = records;
    }

    pub async fn seed_portfolio_access(&self, ids: Vec<Uuid>) {
        self.state.lock().await.portfolio_ids = ids;
    }

    pub async fn seed_cart(&self, cart: Cart) {
        self.state.lock().await.cart = cart;
    }

    pub async fn seed_profile(&self, profile: KycProfile) {
        self.state.lock().await.profile = profile;
    }

    pub async fn seed_artifacts(&self, artifacts: Vec<EsignArtifact>) {
        self.state.lock().await.artifacts = artifacts;
    }

    /// Queue a failure for the next call to `op`. Failures pop in order.
    pub async fn fail_next(&self, op: &str, failure: ScriptedFailure) {
        self.state
            .lock()
            .await
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Script the next created mandate. Unscripted mandates confirm on the
    /// first status check.
    pub async fn script_mandate(&self, script: MandateScript) {
        self.state.lock().await.mandate_scripts.push_back(script);
    }

    /// Script the statuses the next created eSign document reports, in order.
    /// When the sequence runs out the stored artifact status is returned.
    pub async fn script_esign_statuses(&self, statuses: Vec<EsignStatus>) {
        self.state.lock().await.esign_scripts.push_back(statuses);
    }

    /// Flip a stored eSign artifact to completed, as the signing provider
    /// would after a successful session.
    pub async fn complete_esign(&self, document_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(artifact) = state
            .artifacts
            .iter_mut()
            .find(|a| a.document_id == document_id)
        {
            artifact.status = EsignStatus::Completed;
        }
    }

    /// Hold every call to `op` until [`Self::release`] is invoked once per
    /// call. Lets a test order a response after some other action.
    pub async fn hold(&self, op: &str) {
        self.gates
            .lock()
            .await
            .insert(op.to_string(), Arc::new(Notify::new()));
    }

    /// Let one held call to `op` proceed.
    pub async fn release(&self, op: &str) {
        if let Some(gate) = self.gates.lock().await.get(op) {
            gate.notify_one();
        }
    }

    // ---- inspection --------------------------------------------------------

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|entry| entry.as_str() == op || entry.starts_with(&prefix))
            .count()
    }

    pub async fn server_cart(&self) -> Cart {
        self.state.lock().await.cart.clone()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    // ---- shared call plumbing ---------------------------------------------

    /// Journal the call, park on a gate if one is registered, then pop any
    /// scripted failure.
    async fn begin(&self, op: &str, detail: Option<String>) -> Result<(), ServiceError> {
        let gate = { self.gates.lock().await.get(op).cloned() };
        let failure = {
            let mut state = self.state.lock().await;
            match detail {
                Some(detail) => state.calls.push(format!("{op}:{detail}")),
                None => state.calls.push(op.to_string()),
            }
            state.failures.get_mut(op).and_then(|queue| queue.pop_front())
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }

        match failure {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn plan_expiry(plan_type: PlanType) -> chrono::DateTime<Utc> {
        let days = match plan_type {
            PlanType::Monthly => 30,
            PlanType::Quarterly => 90,
            PlanType::Yearly => 365,
        };
        Utc::now() + Duration::days(days)
    }

    /// Record a purchased line as an active subscription and, for portfolio
    /// products, grant portfolio access.
    fn settle_line(
        state: &mut MemoryState,
        product_id: Uuid,
        product_type: ProductKind,
        plan_type: PlanType,
        mandate_id: Option<String>,
    ) {
        state.subscriptions.push(SubscriptionRecord {
            id: Uuid::new_v4(),
            product_type,
            product: crate::models::Ref::Id(product_id),
            plan_type,
            tier: None,
            is_active: true,
            expires_at: Self::plan_expiry(plan_type),
            mandate_id,
        });
        if product_type == ProductKind::Portfolio && !state.portfolio_ids.contains(&product_id) {
            state.portfolio_ids.push(product_id);
        }
    }
}

#[async_trait]
impl BackendApi for MemoryBackend {
    async fn fetch_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ServiceError> {
        self.begin(ops::FETCH_SUBSCRIPTIONS, None).await?;
        Ok(self.state.lock().await.subscriptions.clone())
    }

    async fn fetch_portfolio_access(&self) -> Result<Vec<Uuid>, ServiceError> {
        self.begin(ops::FETCH_PORTFOLIO_ACCESS, None).await?;
        Ok(self.state.lock().await.portfolio_ids.clone())
    }

    async fn fetch_cart(&self) -> Result<Cart, ServiceError> {
        self.begin(ops::FETCH_CART, None).await?;
        Ok(self.state.lock().await.cart.clone())
    }

    async fn add_cart_item(&self, item: &CartItem) -> Result<Cart, ServiceError> {
        self.begin(ops::ADD_CART_ITEM, Some(item.product.id.to_string()))
            .await?;
        let mut state = self.state.lock().await;
        if state.cart.contains(item.product.id) {
            return Err(ServiceError::DuplicateItem(item.product.id));
        }
        let mut item = item.clone();
        item.quantity = 1;
        state.cart.items.push(item);
        Ok(state.cart.clone())
    }

    async fn remove_cart_item(&self, product_id: Uuid) -> Result<Cart, ServiceError> {
        self.begin(ops::REMOVE_CART_ITEM, Some(product_id.to_string()))
            .await?;
        let mut state = self.state.lock().await;
        state.cart.items.retain(|i| i.product.id != product_id);
        Ok(state.cart.clone())
    }

    async fn set_cart_quantity(
        &self,
        product_id: Uuid,
        quantity: u8,
    ) -> Result<Cart, ServiceError> {
        self.begin(
            ops::SET_CART_QUANTITY,
            Some(format!("{product_id}={quantity}")),
        )
        .await?;
        let mut state = self.state.lock().await;
        match quantity {
            0 => state.cart.items.retain(|i| i.product.id != product_id),
            1 => match state.cart.items.iter_mut().find(|i| i.product.id == product_id) {
                Some(item) => item.quantity = 1,
                None => {
                    return Err(ServiceError::NotFound(format!(
                        "no cart item for product {product_id}"
                    )))
                }
            },
            other => {
                return Err(ServiceError::ValidationError(format!(
                    "quantity {other} is out of range"
                )))
            }
        }
        Ok(state.cart.clone())
    }

    async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<GatewayOrder, ServiceError> {
        self.begin(ops::CREATE_ORDER, None).await?;
        let order_id = format!("order_{}", self.next_seq());
        let amount = request.lines.iter().map(|l| l.amount).sum();
        let order = GatewayOrder {
            order_id: order_id.clone(),
            amount,
            currency: request.currency.clone(),
            client_key: Some("key_test".to_string()),
        };
        self.state.lock().await.orders.insert(
            order_id,
            StoredOrder {
                order: order.clone(),
                lines: request.lines.clone(),
                settled: false,
            },
        );
        Ok(order)
    }

    async fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<PaymentConfirmation, ServiceError> {
        self.begin(ops::VERIFY_PAYMENT, Some(order_id.to_string()))
            .await?;
        if signature.trim().is_empty() {
            return Err(ServiceError::GatewayRejected(
                "payment signature did not verify".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        let stored = state
            .orders
            .get(order_id)
            .map(|o| (o.order.clone(), o.lines.clone(), o.settled))
            .ok_or_else(|| ServiceError::NotFound(format!("no order {order_id}")))?;
        let (order, lines, settled) = stored;
        if !settled {
            for line in &lines {
                Self::settle_line(
                    &mut state,
                    line.product_id,
                    line.product_type,
                    line.plan_type,
                    None,
                );
            }
            if let Some(entry) = state.orders.get_mut(order_id) {
                entry.settled = true;
            }
        }
        Ok(PaymentConfirmation {
            reference: crate::models::AttemptReference::Order(order_id.to_string()),
            payment_id: Some(payment_id.to_string()),
            amount: order.amount,
            currency: order.currency,
        })
    }

    async fn create_mandate(
        &self,
        request: &CreateMandateRequest,
    ) -> Result<MandateInit, ServiceError> {
        let method = request
            .instrument
            .method()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "hosted".to_string());
        self.begin(ops::CREATE_MANDATE, Some(method)).await?;

        let seq = self.next_seq();
        let subscription_id = format!("sub_{seq}");
        let mut state = self.state.lock().await;
        let script = state.mandate_scripts.pop_front().unwrap_or_default();
        state.mandates.insert(
            subscription_id.clone(),
            StoredMandate {
                mandate_id: format!("mandate_{seq}"),
                product_id: request.product_id,
                product_type: request.product_type,
                plan_type: request.plan_type,
                states: script.states.into_iter().collect(),
                settled: false,
            },
        );
        Ok(MandateInit {
            subscription_id,
            next_action: script.next_action,
        })
    }

    async fn mandate_status(&self, subscription_id: &str) -> Result<MandateState, ServiceError> {
        self.begin(ops::MANDATE_STATUS, Some(subscription_id.to_string()))
            .await?;
        let mut state = self.state.lock().await;
        let mandate = state
            .mandates
            .get_mut(subscription_id)
            .ok_or_else(|| ServiceError::NotFound(format!("no mandate for {subscription_id}")))?;

        // Walk the scripted sequence; the final entry repeats forever.
        let status = if mandate.states.len() > 1 {
            mandate.states.pop_front().unwrap_or(MandateState::Pending)
        } else {
            mandate
                .states
                .front()
                .copied()
                .unwrap_or(MandateState::Pending)
        };

        if status == MandateState::Confirmed && !mandate.settled {
            mandate.settled = true;
            let (product_id, product_type, plan_type, mandate_id) = (
                mandate.product_id,
                mandate.product_type,
                mandate.plan_type,
                mandate.mandate_id.clone(),
            );
            Self::settle_line(&mut state, product_id, product_type, plan_type, Some(mandate_id));
        }
        Ok(status)
    }

    async fn create_esign_document(
        &self,
        demand: &EsignDemand,
    ) -> Result<EsignDocument, ServiceError> {
        self.begin(ops::CREATE_ESIGN_DOCUMENT, Some(demand.product_id.to_string()))
            .await?;
        let document_id = format!("esigndoc_{}", self.next_seq());
        let signing_url = demand
            .authentication_url
            .clone()
            .unwrap_or_else(|| format!("https://esign.example/sign/{document_id}"));

        let mut state = self.state.lock().await;
        state.artifacts.push(EsignArtifact {
            document_id: document_id.clone(),
            product_type: demand.product_type,
            product_id: demand.product_id,
            status: EsignStatus::Pending,
        });
        if let Some(statuses) = state.esign_scripts.pop_front() {
            state
                .esign_queues
                .insert(document_id.clone(), statuses.into_iter().collect());
        }
        Ok(EsignDocument {
            document_id,
            signing_url,
        })
    }

    async fn esign_status(&self, document_id: &str) -> Result<EsignArtifact, ServiceError> {
        self.begin(ops::ESIGN_STATUS, Some(document_id.to_string()))
            .await?;
        let mut state = self.state.lock().await;
        let scripted = state
            .esign_queues
            .get_mut(document_id)
            .and_then(|queue| queue.pop_front());
        let artifact = state
            .artifacts
            .iter_mut()
            .find(|a| a.document_id == document_id)
            .ok_or_else(|| ServiceError::NotFound(format!("no eSign document {document_id}")))?;
        if let Some(status) = scripted {
            artifact.status = status;
        }
        Ok(artifact.clone())
    }

    async fn fetch_esign_artifacts(&self) -> Result<Vec<EsignArtifact>, ServiceError> {
        self.begin(ops::FETCH_ESIGN_ARTIFACTS, None).await?;
        Ok(self.state.lock().await.artifacts.clone())
    }

    async fn fetch_profile(&self) -> Result<KycProfile, ServiceError> {
        self.begin(ops::FETCH_PROFILE, None).await?;
        Ok(self.state.lock().await.profile.clone())
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<KycProfile, ServiceError> {
        self.begin(ops::UPDATE_PROFILE, None).await?;
        let mut state = self.state.lock().await;
        if let Some(pan) = &update.pan {
            state.profile.pan = Some(pan.clone());
        }
        if let Some(dob) = update.date_of_birth {
            state.profile.date_of_birth = Some(dob);
        }
        if let Some(phone) = &update.phone {
            state.profile.phone = Some(phone.clone());
        }
        Ok(state.profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PriceTag, ProductSummary};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn item(product_id: Uuid) -> CartItem {
        CartItem {
            product: ProductSummary {
                id: product_id,
                name: "Dividend Stalwarts".to_string(),
                product_type: ProductKind::Portfolio,
                tier: None,
            },
            plan_type: PlanType::Yearly,
            quantity: 1,
            price: PriceTag {
                amount: dec!(4999),
                currency: "INR".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn adding_same_product_twice_is_a_duplicate() {
        let backend = MemoryBackend::new();
        let product_id = Uuid::new_v4();

        backend.add_cart_item(&item(product_id)).await.unwrap();
        let err = backend.add_cart_item(&item(product_id)).await.unwrap_err();
        assert_matches!(err, ServiceError::DuplicateItem(id) if id == product_id);
        assert_eq!(backend.server_cart().await.len(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_pops_once() {
        let backend = MemoryBackend::new();
        backend
            .fail_next(
                ops::FETCH_SUBSCRIPTIONS,
                ScriptedFailure::Network("connection reset".to_string()),
            )
            .await;

        assert_matches!(
            backend.fetch_subscriptions().await,
            Err(ServiceError::NetworkError(_))
        );
        assert!(backend.fetch_subscriptions().await.is_ok());
        assert_eq!(backend.call_count(ops::FETCH_SUBSCRIPTIONS).await, 2);
    }

    #[tokio::test]
    async fn mandate_script_repeats_its_last_state() {
        let backend = MemoryBackend::new();
        backend
            .script_mandate(MandateScript {
                next_action: NextAction::PollStatus,
                states: vec![MandateState::Pending],
            })
            .await;

        let init = backend
            .create_mandate(&CreateMandateRequest {
                product_id: Uuid::new_v4(),
                product_type: ProductKind::Portfolio,
                plan_type: PlanType::Monthly,
                amount: dec!(499),
                currency: "INR".to_string(),
                instrument: crate::models::PaymentInstrument::Upi { vpa: None },
                idempotency_key: "k".to_string(),
            })
            .await
            .unwrap();

        for _ in 0..4 {
            let status = backend.mandate_status(&init.subscription_id).await.unwrap();
            assert_eq!(status, MandateState::Pending);
        }
    }

    #[tokio::test]
    async fn confirmed_mandate_settles_a_subscription_once() {
        let backend = MemoryBackend::new();
        backend
            .script_mandate(MandateScript {
                next_action: NextAction::PollStatus,
                states: vec![MandateState::Pending, MandateState::Confirmed],
            })
            .await;

        let init = backend
            .create_mandate(&CreateMandateRequest {
                product_id: Uuid::new_v4(),
                product_type: ProductKind::Portfolio,
                plan_type: PlanType::Quarterly,
                amount: dec!(1499),
                currency: "INR".to_string(),
                instrument: crate::models::PaymentInstrument::Upi { vpa: None },
                idempotency_key: "k".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            backend.mandate_status(&init.subscription_id).await.unwrap(),
            MandateState::Pending
        );
        assert_eq!(backend.subscription_count().await, 0);

        assert_eq!(
            backend.mandate_status(&init.subscription_id).await.unwrap(),
            MandateState::Confirmed
        );
        assert_eq!(backend.subscription_count().await, 1);

        // Repeat confirmations must not duplicate the record.
        backend.mandate_status(&init.subscription_id).await.unwrap();
        assert_eq!(backend.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn esign_script_drives_the_artifact_status() {
        let backend = MemoryBackend::new();
        backend
            .script_esign_statuses(vec![EsignStatus::Pending, EsignStatus::Completed])
            .await;

        let demand = EsignDemand {
            product_type: ProductKind::Bundle,
            product_id: Uuid::new_v4(),
            authentication_url: None,
        };
        let document = backend.create_esign_document(&demand).await.unwrap();

        let first = backend.esign_status(&document.document_id).await.unwrap();
        assert_eq!(first.status, EsignStatus::Pending);

        let second = backend.esign_status(&document.document_id).await.unwrap();
        assert_eq!(second.status, EsignStatus::Completed);

        // Script exhausted: the stored status is now authoritative.
        let third = backend.esign_status(&document.document_id).await.unwrap();
        assert_eq!(third.status, EsignStatus::Completed);
    }

    #[tokio::test]
    async fn verified_order_settles_each_line() {
        let backend = MemoryBackend::new();
        let product_id = Uuid::new_v4();
        let order = backend
            .create_order(&CreateOrderRequest {
                lines: vec![OrderLine {
                    product_id,
                    product_type: ProductKind::Portfolio,
                    plan_type: PlanType::Yearly,
                    amount: dec!(4999),
                }],
                currency: "INR".to_string(),
                idempotency_key: "k".to_string(),
            })
            .await
            .unwrap();

        let confirmation = backend
            .verify_payment(&order.order_id, "pay_1", "sig_ok")
            .await
            .unwrap();
        assert_eq!(confirmation.amount, dec!(4999));
        assert_eq!(backend.subscription_count().await, 1);

        let portfolio_ids = backend.fetch_portfolio_access().await.unwrap();
        assert!(portfolio_ids.contains(&product_id));
    }
}
