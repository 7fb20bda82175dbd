//! Server-to-server adapter: UPI, card, and the two mandate methods.
//!
//! Mandate/charge creation answers with a `next_action` that decides the
//! rest of the flow: a full-page redirect to bank authorization, a UPI deep
//! link, or a poll-until-confirmed handoff. Every path that leaves the
//! document first persists a correlation record in the session store so a
//! reload can resume verification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use super::{
    hash_idempotency_key, validate_bank_mandate, validate_card, validate_vpa, PaymentGateway,
    PaymentIntent, PaymentOutcome,
};
use crate::backend::{BackendApi, CreateMandateRequest};
use crate::errors::ServiceError;
use crate::models::{
    AttemptReference, Cart, GatewayKind, MandateState, NextAction, PaymentInstrument,
    PaymentMethodKind, PendingVerification, PlanType, UserIdentity,
};
use crate::services::CancelFlag;
use crate::session::{save_pending_verification, SessionStore};
use crate::surface::CheckoutSurface;

pub struct DirectApiGateway {
    backend: Arc<dyn BackendApi>,
    surface: Arc<dyn CheckoutSurface>,
    sessions: Arc<dyn SessionStore>,
}

impl DirectApiGateway {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        surface: Arc<dyn CheckoutSurface>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            backend,
            surface,
            sessions,
        }
    }

    async fn persist_correlation(
        &self,
        subscription_id: &str,
        method: PaymentMethodKind,
    ) -> Result<(), ServiceError> {
        let pending = PendingVerification {
            subscription_id: subscription_id.to_string(),
            gateway: GatewayKind::DirectApi,
            method,
            created_at: Utc::now(),
        };
        save_pending_verification(self.sessions.as_ref(), &pending).await
    }
}

#[async_trait]
impl PaymentGateway for DirectApiGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::DirectApi
    }

    /// Serves every cadence: one-time charges and recurring mandates alike.
    fn supports_plan(&self, _plan: PlanType) -> bool {
        true
    }

    fn validate_instrument(&self, instrument: &PaymentInstrument) -> Result<(), ServiceError> {
        match instrument {
            PaymentInstrument::HostedCheckout => Err(ServiceError::ValidationError(
                "the direct gateway needs an explicit payment method".to_string(),
            )),
            PaymentInstrument::Upi { vpa } => validate_vpa(vpa),
            PaymentInstrument::Card(card) => validate_card(card),
            PaymentInstrument::NetbankingMandate(details) => validate_bank_mandate(details, false),
            PaymentInstrument::PhysicalMandate(details) => validate_bank_mandate(details, true),
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
        if cart.items.iter().filter(|item| item.quantity > 0).count() != 1 {
            return Err(ServiceError::ValidationError(
                "the direct gateway processes exactly one product per attempt".to_string(),
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

    #[instrument(skip_all, fields(method = ?intent.instrument.method()))]
    async fn execute(
        &self,
        intent: &PaymentIntent,
        cancel: &CancelFlag,
    ) -> Result<PaymentOutcome, ServiceError> {
        cancel.guard()?;
        self.validate_instrument(&intent.instrument)?;

        let line = intent
            .cart
            .items
            .iter()
            .find(|item| item.quantity > 0)
            .ok_or_else(|| ServiceError::ValidationError("the cart is empty".to_string()))?;
        let method = intent
            .instrument
            .method()
            .ok_or_else(|| ServiceError::ValidationError(
                "the direct gateway needs an explicit payment method".to_string(),
            ))?;

        let request = CreateMandateRequest {
            product_id: line.product.id,
            product_type: line.product.product_type,
            plan_type: intent.plan,
            amount: line.price.amount,
            currency: line.price.currency.clone(),
            instrument: intent.instrument.clone(),
            idempotency_key: intent.idempotency_key.clone(),
        };

        let init = self.backend.create_mandate(&request).await?;
        cancel.guard()?;

        match init.next_action {
            NextAction::Redirect { url } => {
                self.persist_correlation(&init.subscription_id, method)
                    .await?;
                info!(subscription_id = %init.subscription_id, "leaving for bank authorization");
                self.surface.redirect(&url).await?;
                cancel.guard()?;
                Ok(PaymentOutcome::AwaitingReturn {
                    subscription_id: init.subscription_id,
                })
            }
            NextAction::ShowLink { url } => {
                self.persist_correlation(&init.subscription_id, method)
                    .await?;
                info!(subscription_id = %init.subscription_id, "leaving for the payment link");
                self.surface.redirect(&url).await?;
                cancel.guard()?;
                Ok(PaymentOutcome::AwaitingReturn {
                    subscription_id: init.subscription_id,
                })
            }
            NextAction::PollStatus => {
                // One immediate check; anything short of confirmation is
                // parked for background verification, never a blocking loop.
                let status = self.backend.mandate_status(&init.subscription_id).await?;
                cancel.guard()?;
                match status {
                    MandateState::Confirmed => Ok(PaymentOutcome::Confirmed {
                        reference: AttemptReference::Subscription(init.subscription_id),
                    }),
                    MandateState::Rejected => Err(ServiceError::GatewayRejected(
                        "the bank rejected the mandate".to_string(),
                    )),
                    MandateState::Pending => {
                        self.persist_correlation(&init.subscription_id, method)
                            .await?;
                        Ok(PaymentOutcome::PendingConfirmation {
                            subscription_id: init.subscription_id,
                        })
                    }
                }
            }
        }
    }
}
