//! Gateway Adapter Interface: one contract over the two payment backends.
//!
//! Adapters validate the payment instrument locally before any network call,
//! create an intent, and `execute` it to a terminal outcome. The callback
//! flows of the hosted overlay and the bank redirects are modelled as
//! explicit suspension points: `execute` suspends until the attempt is
//! verified, handed off to a redirect, or parked for background
//! confirmation.

pub mod direct;
pub mod hosted;

pub use direct::DirectApiGateway;
pub use hosted::HostedCheckoutGateway;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::errors::ServiceError;
use crate::models::{
    AttemptReference, BankMandateDetails, CardDetails, Cart, GatewayKind, PaymentInstrument,
    PlanType, UserIdentity,
};
use crate::services::CancelFlag;

const MIN_IDEMPOTENCY_KEY_LENGTH: usize = 8;
const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 255;

static PAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{5}[0-9]{4}[A-Z]$").unwrap());
static IFSC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{4}0[A-Z0-9]{6}$").unwrap());
static EXPIRY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(0[1-9]|1[0-2])/[0-9]{2}$").unwrap());
static VPA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{2,}@[A-Za-z]{2,}$").unwrap());

/// A validated, ready-to-execute payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub gateway: GatewayKind,
    pub cart: Cart,
    pub plan: PlanType,
    pub instrument: PaymentInstrument,
    pub customer: UserIdentity,
    /// SHA-256 hash of the client idempotency key, sent with order/mandate
    /// creation so a retried attempt cannot double-charge.
    pub idempotency_key: String,
}

/// Terminal result of executing an intent.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// Backend-verified success. The only outcome the success phase may be
    /// entered from.
    Confirmed { reference: AttemptReference },
    /// The attempt left the document for a bank/UPI page; status must be
    /// re-checked on return using the persisted correlation record.
    AwaitingReturn { subscription_id: String },
    /// No redirect, no immediate confirmation: the mandate is parked for
    /// background confirmation (physical mandates can take days).
    PendingConfirmation { subscription_id: String },
}

/// Uniform adapter contract over the concrete payment backends.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Whether this gateway may serve the given plan cadence. Mandate-capable
    /// gateways are filtered out for one-time cadences by returning false.
    fn supports_plan(&self, plan: PlanType) -> bool;

    /// Local instrument validation. Failures never reach the network.
    fn validate_instrument(&self, instrument: &PaymentInstrument) -> Result<(), ServiceError>;

    /// Validate inputs and assemble an intent. No network traffic.
    fn create_intent(
        &self,
        cart: &Cart,
        plan: PlanType,
        instrument: PaymentInstrument,
        customer: &UserIdentity,
        client_key: &str,
    ) -> Result<PaymentIntent, ServiceError>;

    /// Drive the intent to a terminal outcome. Suspends across every network
    /// call and surface wait; checks `cancel` before applying any result.
    async fn execute(
        &self,
        intent: &PaymentIntent,
        cancel: &CancelFlag,
    ) -> Result<PaymentOutcome, ServiceError>;
}

/// Gateways from `configured` that may serve the plan, in configured order.
pub fn eligible_gateways(
    configured: &[std::sync::Arc<dyn PaymentGateway>],
    plan: PlanType,
) -> Vec<std::sync::Arc<dyn PaymentGateway>> {
    configured
        .iter()
        .filter(|g| g.supports_plan(plan))
        .cloned()
        .collect()
}

/// Hash a client-supplied idempotency key the way the backend expects it.
pub fn hash_idempotency_key(key: &str) -> Result<String, ServiceError> {
    let key = key.trim();
    if key.len() < MIN_IDEMPOTENCY_KEY_LENGTH {
        return Err(ServiceError::ValidationError(format!(
            "idempotency key must be at least {MIN_IDEMPOTENCY_KEY_LENGTH} characters long"
        )));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
        return Err(ServiceError::ValidationError(format!(
            "idempotency key must be {MAX_IDEMPOTENCY_KEY_LENGTH} characters or fewer"
        )));
    }
    if !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ServiceError::ValidationError(
            "idempotency key must contain visible ASCII characters only".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn is_valid_pan(pan: &str) -> bool {
    PAN_RE.is_match(pan)
}

pub(crate) fn validate_card(card: &CardDetails) -> Result<(), ServiceError> {
    let number: String = card.number.chars().filter(|c| !c.is_whitespace()).collect();
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::ValidationError(
            "card number is required and must be numeric".to_string(),
        ));
    }
    if !(12..=19).contains(&number.len()) {
        return Err(ServiceError::ValidationError(
            "card number length is out of range".to_string(),
        ));
    }
    if card.holder.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "card holder name is required".to_string(),
        ));
    }
    if !EXPIRY_RE.is_match(&card.expiry) {
        return Err(ServiceError::ValidationError(
            "card expiry must be in MM/YY format".to_string(),
        ));
    }
    if !(card.cvv.len() == 3 || card.cvv.len() == 4)
        || !card.cvv.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ServiceError::ValidationError(
            "card CVV must be 3 or 4 digits".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_bank_mandate(
    details: &BankMandateDetails,
    require_ifsc: bool,
) -> Result<(), ServiceError> {
    if details.account_number.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "bank account number is required".to_string(),
        ));
    }
    if details.account_number != details.confirm_account_number {
        return Err(ServiceError::ValidationError(
            "account number and its confirmation do not match".to_string(),
        ));
    }
    if details.holder.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "account holder name is required".to_string(),
        ));
    }
    if require_ifsc {
        match &details.ifsc {
            Some(ifsc) if IFSC_RE.is_match(ifsc) => {}
            Some(_) => {
                return Err(ServiceError::ValidationError(
                    "IFSC code is not in a valid format".to_string(),
                ))
            }
            None => {
                return Err(ServiceError::ValidationError(
                    "IFSC code is required for physical mandates".to_string(),
                ))
            }
        }
    }
    Ok(())
}

pub(crate) fn validate_vpa(vpa: &Option<String>) -> Result<(), ServiceError> {
    match vpa {
        Some(value) if !VPA_RE.is_match(value) => Err(ServiceError::ValidationError(
            "UPI id is not in a valid format".to_string(),
        )),
        _ => Ok(()),
    }
}
