//! HTTP boundary tests against a mock server: envelope decoding, the two
//! structured eSign signals, nextAction normalization, and auth headers.

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use advisory_checkout::backend::{BackendApi, CreateMandateRequest, HttpBackend};
use advisory_checkout::errors::ServiceError;
use advisory_checkout::models::{NextAction, PaymentInstrument, PlanType, ProductKind};

fn backend_for(server: &MockServer) -> HttpBackend {
    HttpBackend::with_client(&server.uri(), reqwest::Client::new()).unwrap()
}

fn mandate_request() -> CreateMandateRequest {
    CreateMandateRequest {
        product_id: Uuid::new_v4(),
        product_type: ProductKind::Portfolio,
        plan_type: PlanType::Monthly,
        amount: dec!(499.00),
        currency: "INR".to_string(),
        instrument: PaymentInstrument::Upi {
            vpa: Some("investor@okbank".to_string()),
        },
        idempotency_key: "a".repeat(64),
    }
}

#[tokio::test]
async fn envelope_data_is_unwrapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [{
                "id": Uuid::new_v4(),
                "productType": "bundle",
                "product": Uuid::new_v4(),
                "planType": "monthly",
                "tier": "basic",
                "isActive": true,
                "expiryDate": "2030-01-01T00:00:00Z"
            }]
        })))
        .mount(&server)
        .await;

    let records = backend_for(&server).fetch_subscriptions().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_active);
}

#[tokio::test]
async fn precondition_failed_surfaces_the_esign_demand() {
    let server = MockServer::start().await;
    let product_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/mandates"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "success": false,
            "code": "ESIGN_REQUIRED",
            "message": "eSign must be completed before payment",
            "data": {
                "productType": "portfolio",
                "productId": product_id
            }
        })))
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .create_mandate(&mandate_request())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::EsignRequired(demand) => {
        assert_eq!(demand.product_id, product_id);
        assert_eq!(demand.authentication_url, None);
    });
}

#[tokio::test]
async fn pending_esign_carries_the_resume_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mandates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "code": "ESIGN_PENDING",
            "message": "document awaiting signature",
            "data": {
                "productType": "portfolio",
                "productId": Uuid::new_v4(),
                "authenticationUrl": "https://esign.example/resume/xyz"
            }
        })))
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .create_mandate(&mandate_request())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::EsignPending(demand) => {
        assert_eq!(
            demand.authentication_url.as_deref(),
            Some("https://esign.example/resume/xyz")
        );
    });
}

#[tokio::test]
async fn next_action_is_normalized_at_the_boundary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mandates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "subscriptionId": "sub_42",
                "nextAction": "REDIRECT",
                "redirectUrl": "https://bank.example/authorize"
            }
        })))
        .mount(&server)
        .await;

    let init = backend_for(&server)
        .create_mandate(&mandate_request())
        .await
        .unwrap();
    assert_eq!(init.subscription_id, "sub_42");
    assert_eq!(
        init.next_action,
        NextAction::Redirect {
            url: "https://bank.example/authorize".to_string()
        }
    );
}

#[tokio::test]
async fn server_errors_map_to_network_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cart"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = backend_for(&server).fetch_cart().await.unwrap_err();
    assert_matches!(err, ServiceError::NetworkError(_));
}

#[tokio::test]
async fn unauthorized_maps_to_auth_required() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "message": "session expired"
        })))
        .mount(&server)
        .await;

    let err = backend_for(&server).fetch_profile().await.unwrap_err();
    assert_matches!(err, ServiceError::AuthRequired);
}

#[tokio::test]
async fn bearer_token_is_attached_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cart"))
        .and(header("authorization", "Bearer tok_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "items": [] }
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server).with_bearer_token("tok_123");
    let cart = backend.fetch_cart().await.unwrap();
    assert!(cart.is_empty());
}

#[tokio::test]
async fn quantity_update_sends_the_expected_body() {
    let server = MockServer::start().await;
    let product_id = Uuid::new_v4();
    Mock::given(method("PUT"))
        .and(path(format!("/cart/items/{product_id}")))
        .and(body_partial_json(json!({ "quantity": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "items": [] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    backend_for(&server)
        .set_cart_quantity(product_id, 1)
        .await
        .unwrap();
}
