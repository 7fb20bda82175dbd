//! Contract with the advisory platform's REST backend.
//!
//! Everything the engine needs from the server goes through [`BackendApi`]:
//! subscription and portfolio-access listings, cart CRUD, order creation and
//! verification, mandate creation and status, eSign documents, and the KYC
//! profile. Payloads are normalized at this boundary — loosely-shaped
//! responses become tagged types before any business logic sees them.

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{
    Cart, CartItem, EsignArtifact, EsignDemand, EsignDocument, GatewayOrder, KycProfile,
    MandateInit, MandateState, NextAction, PaymentConfirmation, PaymentInstrument, PlanType,
    ProductKind, ProfileUpdate, SubscriptionRecord,
};

/// Error code carried by an HTTP 412 when payment is blocked on eSign.
pub const CODE_ESIGN_REQUIRED: &str = "ESIGN_REQUIRED";
/// Error code carried by a 200-with-`success:false` body when an eSign
/// document already exists and is awaiting signature.
pub const CODE_ESIGN_PENDING: &str = "ESIGN_PENDING";

/// Standard response envelope used by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            code: None,
        }
    }
}

/// One purchasable line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: Uuid,
    pub product_type: ProductKind,
    pub plan_type: PlanType,
    pub amount: Decimal,
}

/// Server-side order creation for the hosted checkout overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub lines: Vec<OrderLine>,
    pub currency: String,
    pub idempotency_key: String,
}

/// Body of the mandatory server-side verification call after the hosted
/// overlay reports success. The order id travels in the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub payment_id: String,
    pub signature: String,
}

/// Mandate or one-shot charge creation against the direct gateway. Recurring
/// checkout covers one product at a time, so this is a single line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMandateRequest {
    pub product_id: Uuid,
    pub product_type: ProductKind,
    pub plan_type: PlanType,
    pub amount: Decimal,
    pub currency: String,
    pub instrument: PaymentInstrument,
    pub idempotency_key: String,
}

/// Raw direct-gateway initiation response. `next_action` arrives as a bare
/// string with the url split across two optional fields; [`Self::normalize`]
/// folds it into [`NextAction`] once, here at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MandateInitResponse {
    pub subscription_id: String,
    pub next_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_link: Option<String>,
}

impl MandateInitResponse {
    pub fn normalize(self) -> Result<MandateInit, ServiceError> {
        let next_action = match self.next_action.as_str() {
            "REDIRECT" => {
                let url = self.redirect_url.ok_or_else(|| {
                    ServiceError::InternalError(
                        "backend asked for REDIRECT without a redirectUrl".to_string(),
                    )
                })?;
                NextAction::Redirect { url }
            }
            "SHOW_LINK" => {
                let url = self.payment_link.ok_or_else(|| {
                    ServiceError::InternalError(
                        "backend asked for SHOW_LINK without a paymentLink".to_string(),
                    )
                })?;
                NextAction::ShowLink { url }
            }
            "POLL_STATUS" => NextAction::PollStatus,
            other => {
                return Err(ServiceError::InternalError(format!(
                    "backend returned an unrecognized nextAction: {other}"
                )))
            }
        };

        Ok(MandateInit {
            subscription_id: self.subscription_id,
            next_action,
        })
    }
}

/// Status poll response for a mandate under confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MandateStatusResponse {
    pub subscription_id: String,
    pub status: MandateState,
}

/// Everything the engine asks of the platform backend.
///
/// Implementations must surface the two structured eSign signals as
/// [`ServiceError::EsignRequired`] and [`ServiceError::EsignPending`] so the
/// orchestrator can intercept them uniformly.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ServiceError>;

    async fn fetch_portfolio_access(&self) -> Result<Vec<Uuid>, ServiceError>;

    async fn fetch_cart(&self) -> Result<Cart, ServiceError>;

    async fn add_cart_item(&self, item: &CartItem) -> Result<Cart, ServiceError>;

    async fn remove_cart_item(&self, product_id: Uuid) -> Result<Cart, ServiceError>;

    async fn set_cart_quantity(&self, product_id: Uuid, quantity: u8)
        -> Result<Cart, ServiceError>;

    async fn create_order(&self, request: &CreateOrderRequest)
        -> Result<GatewayOrder, ServiceError>;

    /// Server-side proof check for a hosted-overlay callback. Success from
    /// the overlay alone is never trusted.
    async fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<PaymentConfirmation, ServiceError>;

    async fn create_mandate(
        &self,
        request: &CreateMandateRequest,
    ) -> Result<MandateInit, ServiceError>;

    async fn mandate_status(&self, subscription_id: &str) -> Result<MandateState, ServiceError>;

    async fn create_esign_document(
        &self,
        demand: &EsignDemand,
    ) -> Result<EsignDocument, ServiceError>;

    async fn esign_status(&self, document_id: &str) -> Result<EsignArtifact, ServiceError>;

    async fn fetch_esign_artifacts(&self) -> Result<Vec<EsignArtifact>, ServiceError>;

    async fn fetch_profile(&self) -> Result<KycProfile, ServiceError>;

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<KycProfile, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_redirect_action() {
        let response = MandateInitResponse {
            subscription_id: "sub_1".to_string(),
            next_action: "REDIRECT".to_string(),
            redirect_url: Some("https://bank.example/authorize".to_string()),
            payment_link: None,
        };

        let init = response.normalize().unwrap();
        assert_eq!(init.subscription_id, "sub_1");
        assert_eq!(
            init.next_action,
            NextAction::Redirect {
                url: "https://bank.example/authorize".to_string()
            }
        );
    }

    #[test]
    fn normalizes_show_link_action() {
        let response = MandateInitResponse {
            subscription_id: "sub_2".to_string(),
            next_action: "SHOW_LINK".to_string(),
            redirect_url: None,
            payment_link: Some("upi://pay?pa=merchant@bank".to_string()),
        };

        let init = response.normalize().unwrap();
        assert_eq!(
            init.next_action,
            NextAction::ShowLink {
                url: "upi://pay?pa=merchant@bank".to_string()
            }
        );
    }

    #[test]
    fn redirect_without_url_is_rejected() {
        let response = MandateInitResponse {
            subscription_id: "sub_3".to_string(),
            next_action: "REDIRECT".to_string(),
            redirect_url: None,
            payment_link: None,
        };

        assert!(response.normalize().is_err());
    }

    #[test]
    fn unknown_next_action_is_rejected() {
        let response = MandateInitResponse {
            subscription_id: "sub_4".to_string(),
            next_action: "DO_NOTHING".to_string(),
            redirect_url: None,
            payment_link: None,
        };

        assert!(response.normalize().is_err());
    }

    #[test]
    fn envelope_round_trips_with_code() {
        let raw = r#"{"success":false,"message":"eSign pending","code":"ESIGN_PENDING"}"#;
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.code.as_deref(), Some(CODE_ESIGN_PENDING));
        assert!(envelope.data.is_none());
    }
}
