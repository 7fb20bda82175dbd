//! reqwest-backed [`BackendApi`] implementation.
//!
//! Response handling is centralized in [`classify_failure`], which turns the
//! two structured eSign signals (HTTP 412 `ESIGN_REQUIRED`, 200-with-
//! `success:false` `ESIGN_PENDING`) and plain HTTP failures into the
//! [`ServiceError`] taxonomy before any payload is deserialized.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::{
    ApiEnvelope, BackendApi, CreateMandateRequest, CreateOrderRequest, MandateInitResponse,
    MandateStatusResponse, VerifyPaymentRequest, CODE_ESIGN_PENDING, CODE_ESIGN_REQUIRED,
};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::models::{
    Cart, CartItem, EsignArtifact, EsignDemand, EsignDocument, GatewayOrder, KycProfile,
    MandateInit, MandateState, PaymentConfirmation, ProfileUpdate, SubscriptionRecord,
};
use async_trait::async_trait;

/// HTTP client for the platform backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    bearer: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .gzip(true)
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("failed to construct http client: {e}"))
            })?;
        Self::with_client(&config.api_base_url, client)
    }

    /// Build from an existing client; used by tests pointing at a mock server.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self, ServiceError> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized).map_err(|e| {
            ServiceError::ConfigurationError(format!("invalid api base url {base_url:?}: {e}"))
        })?;

        Ok(Self {
            client,
            base,
            bearer: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base.join(path).map_err(|e| {
            ServiceError::InternalError(format!("could not build url for {path}: {e}"))
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let url = self.endpoint(path)?;
        self.execute(self.client.request(Method::GET, url), path)
            .await
    }

    async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let url = self.endpoint(path)?;
        self.execute(self.client.request(method, url).json(body), path)
            .await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let url = self.endpoint(path)?;
        self.execute(self.client.request(Method::DELETE, url), path)
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, ServiceError> {
        let request = match &self.bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::NetworkError(format!("request to {path} timed out"))
            } else {
                ServiceError::NetworkError(format!("request to {path} failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ServiceError::NetworkError(format!("failed to read response from {path}: {e}"))
        })?;

        if let Some(err) = classify_failure(status, &body) {
            debug!(%status, path, "backend call classified as failure");
            return Err(err);
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
        envelope.data.ok_or_else(|| {
            ServiceError::InternalError(format!("{path} response was missing its data payload"))
        })
    }
}

/// Map a response to an error, or `None` when the caller should go on to
/// deserialize the payload. Bodies are inspected as loose JSON so a
/// half-formed error shape still classifies on status alone.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> Option<ServiceError> {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let success = value
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| status.is_success());
    let code = value
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let demand = value
        .get("data")
        .and_then(|data| serde_json::from_value::<EsignDemand>(data.clone()).ok());

    if status == StatusCode::PRECONDITION_FAILED {
        if code == CODE_ESIGN_REQUIRED {
            if let Some(demand) = demand {
                return Some(ServiceError::EsignRequired(demand));
            }
            warn!("412 ESIGN_REQUIRED arrived without a demand payload");
        }
        return Some(ServiceError::GatewayRejected(message.unwrap_or_else(
            || "a precondition for this payment was not met".to_string(),
        )));
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(ServiceError::AuthRequired);
    }

    if status == StatusCode::NOT_FOUND {
        return Some(ServiceError::NotFound(
            message.unwrap_or_else(|| "resource not found".to_string()),
        ));
    }

    if status.is_server_error() {
        return Some(ServiceError::NetworkError(format!(
            "backend returned {status}"
        )));
    }

    if !status.is_success() {
        return Some(ServiceError::GatewayRejected(
            message.unwrap_or_else(|| format!("backend returned {status}")),
        ));
    }

    if !success {
        if code == CODE_ESIGN_PENDING {
            if let Some(demand) = demand {
                return Some(ServiceError::EsignPending(demand));
            }
            warn!("ESIGN_PENDING arrived without a demand payload");
        }
        return Some(ServiceError::GatewayRejected(
            message.unwrap_or_else(|| "request was not accepted".to_string()),
        ));
    }

    None
}

#[async_trait]
impl BackendApi for HttpBackend {
    #[instrument(skip(self))]
    async fn fetch_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, ServiceError> {
        self.get("subscriptions").await
    }

    #[instrument(skip(self))]
    async fn fetch_portfolio_access(&self) -> Result<Vec<Uuid>, ServiceError> {
        self.get("portfolio-access").await
    }

    #[instrument(skip(self))]
    async fn fetch_cart(&self) -> Result<Cart, ServiceError> {
        self.get("cart").await
    }

    #[instrument(skip(self, item), fields(product_id = %item.product.id))]
    async fn add_cart_item(&self, item: &CartItem) -> Result<Cart, ServiceError> {
        self.send(Method::POST, "cart/items", item).await
    }

    #[instrument(skip(self))]
    async fn remove_cart_item(&self, product_id: Uuid) -> Result<Cart, ServiceError> {
        self.delete(&format!("cart/items/{product_id}")).await
    }

    #[instrument(skip(self))]
    async fn set_cart_quantity(
        &self,
        product_id: Uuid,
        quantity: u8,
    ) -> Result<Cart, ServiceError> {
        self.send(
            Method::PUT,
            &format!("cart/items/{product_id}"),
            &serde_json::json!({ "quantity": quantity }),
        )
        .await
    }

    #[instrument(skip(self, request), fields(lines = request.lines.len()))]
    async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<GatewayOrder, ServiceError> {
        self.send(Method::POST, "orders", request).await
    }

    #[instrument(skip(self, signature))]
    async fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<PaymentConfirmation, ServiceError> {
        let body = VerifyPaymentRequest {
            payment_id: payment_id.to_string(),
            signature: signature.to_string(),
        };
        self.send(Method::POST, &format!("orders/{order_id}/verify"), &body)
            .await
    }

    // The instrument carries card/bank details, so only safe fields are logged.
    #[instrument(skip_all, fields(product_id = %request.product_id, method = ?request.instrument.method()))]
    async fn create_mandate(
        &self,
        request: &CreateMandateRequest,
    ) -> Result<MandateInit, ServiceError> {
        let raw: MandateInitResponse = self.send(Method::POST, "mandates", request).await?;
        raw.normalize()
    }

    #[instrument(skip(self))]
    async fn mandate_status(&self, subscription_id: &str) -> Result<MandateState, ServiceError> {
        let raw: MandateStatusResponse = self.get(&format!("mandates/{subscription_id}")).await?;
        Ok(raw.status)
    }

    #[instrument(skip(self, demand), fields(product_id = %demand.product_id))]
    async fn create_esign_document(
        &self,
        demand: &EsignDemand,
    ) -> Result<EsignDocument, ServiceError> {
        self.send(Method::POST, "esign/documents", demand).await
    }

    #[instrument(skip(self))]
    async fn esign_status(&self, document_id: &str) -> Result<EsignArtifact, ServiceError> {
        self.get(&format!("esign/documents/{document_id}")).await
    }

    #[instrument(skip(self))]
    async fn fetch_esign_artifacts(&self) -> Result<Vec<EsignArtifact>, ServiceError> {
        self.get("esign/documents").await
    }

    #[instrument(skip(self))]
    async fn fetch_profile(&self) -> Result<KycProfile, ServiceError> {
        self.get("profile").await
    }

    #[instrument(skip(self, update))]
    async fn update_profile(&self, update: &ProfileUpdate) -> Result<KycProfile, ServiceError> {
        self.send(Method::PUT, "profile", update).await
    }
}
