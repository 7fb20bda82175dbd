//! Order-based hosted-checkout adapter.
//!
//! Creates a server-side order, opens the hosted overlay through the
//! surface, and feeds the callback's `payment_id` + `signature` straight
//! into the mandatory server-side verification call. The overlay's own
//! success report is never trusted standalone.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{hash_idempotency_key, PaymentGateway, PaymentIntent, PaymentOutcome};
use crate::backend::{BackendApi, CreateOrderRequest, OrderLine};
use crate::errors::ServiceError;
use crate::models::{Cart, GatewayKind, PaymentInstrument, PlanType, UserIdentity};
use crate::services::CancelFlag;
use crate::surface::{CheckoutSurface, SurfaceError};

pub struct HostedCheckoutGateway {
    backend: Arc<dyn BackendApi>,
    surface: Arc<dyn CheckoutSurface>,
}

impl HostedCheckoutGateway {
    pub fn new(backend: Arc<dyn BackendApi>, surface: Arc<dyn CheckoutSurface>) -> Self {
        Self { backend, surface }
    }
}

#[async_trait]
impl PaymentGateway for HostedCheckoutGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::HostedCheckout
    }

    /// One-time cadences only; recurring plans need a debit mandate this
    /// gateway cannot set up.
    fn supports_plan(&self, plan: PlanType) -> bool {
        !plan.requires_mandate()
    }

    fn validate_instrument(&self, instrument: &PaymentInstrument) -> Result<(), ServiceError> {
        match instrument {
            PaymentInstrument::HostedCheckout => Ok(()),
            other => Err(ServiceError::ValidationError(format!(
                "the hosted checkout collects its own payment details; got {:?}",
                other.method()
            ))),
        }
    }

    fn create_intent(
        &self,
        cart: &Cart,
        plan: PlanType,
        instrument: PaymentInstrument,
        customer: &UserIdentity,
        client_key: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        self.validate_instrument(&instrument)?;
        if cart.is_empty() {
            return Err(ServiceError::ValidationError(
                "the cart is empty".to_string(),
            ));
        }
        Ok(PaymentIntent {
            gateway: self.kind(),
            cart: cart.clone(),
            plan,
            instrument,
            customer: customer.clone(),
            idempotency_key: hash_idempotency_key(client_key)?,
        })
    }

    #[instrument(skip_all, fields(lines = intent.cart.len()))]
    async fn execute(
        &self,
        intent: &PaymentIntent,
        cancel: &CancelFlag,
    ) -> Result<PaymentOutcome, ServiceError> {
        cancel.guard()?;

        let currency = intent
            .cart
            .currency()
            .unwrap_or("INR")
            .to_string();
        let request = CreateOrderRequest {
            lines: intent
                .cart
                .items
                .iter()
                .filter(|item| item.quantity > 0)
                .map(|item| OrderLine {
                    product_id: item.product.id,
                    product_type: item.product.product_type,
                    plan_type: item.plan_type,
                    amount: item.price.amount,
                })
                .collect(),
            currency,
            idempotency_key: intent.idempotency_key.clone(),
        };

        let order = self.backend.create_order(&request).await?;
        cancel.guard()?;
        info!(order_id = %order.order_id, "hosted order created, opening overlay");

        let callback = match self
            .surface
            .collect_hosted_payment(&order, &intent.customer)
            .await
        {
            Ok(callback) => callback,
            Err(SurfaceError::Dismissed) => return Err(ServiceError::Cancelled),
            Err(e) => return Err(ServiceError::Surface(e)),
        };
        cancel.guard()?;

        // Server-side proof check. The overlay callback alone proves nothing.
        let confirmation = self
            .backend
            .verify_payment(&order.order_id, &callback.payment_id, &callback.signature)
            .await?;
        cancel.guard()?;

        Ok(PaymentOutcome::Confirmed {
            reference: confirmation.reference,
        })
    }
}
