use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Billing cadence of a subscription plan.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanType {
    Monthly,
    Quarterly,
    Yearly,
}

impl PlanType {
    /// Recurring cadences are collected through a debit mandate; yearly plans
    /// are charged once up front.
    pub fn requires_mandate(&self) -> bool {
        matches!(self, PlanType::Monthly | PlanType::Quarterly)
    }
}

/// What kind of product a subscription row points at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductKind {
    Portfolio,
    Bundle,
}

/// Tier granted by a bundle product.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessTier {
    Basic,
    Premium,
}

/// Overall classification of a user's subscription posture, in precedence
/// order: premium > basic > individual > none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionKind {
    Premium,
    Basic,
    Individual,
    None,
}

/// Product payload as embedded by the backend inside carts and subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: Uuid,
    pub name: String,
    pub product_type: ProductKind,
    /// Present on bundle products; the tier the bundle grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<AccessTier>,
}

/// Backend fields that are sometimes a bare id and sometimes an embedded
/// object, depending on which endpoint produced the payload. Normalized once
/// at the boundary; business logic only ever sees `id()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ref<T> {
    Id(Uuid),
    Embedded(T),
}

impl Ref<ProductSummary> {
    pub fn id(&self) -> Uuid {
        match self {
            Ref::Id(id) => *id,
            Ref::Embedded(product) => product.id,
        }
    }

    pub fn embedded(&self) -> Option<&ProductSummary> {
        match self {
            Ref::Id(_) => None,
            Ref::Embedded(product) => Some(product),
        }
    }
}

/// One subscription row as returned by the backend. Never mutated client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub product_type: ProductKind,
    pub product: Ref<ProductSummary>,
    pub plan_type: PlanType,
    /// Tier granted by this row, normalized at the boundary: bundle rows carry
    /// the tier they grant, portfolio rows carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<AccessTier>,
    pub is_active: bool,
    #[serde(rename = "expiryDate")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate_id: Option<String>,
}

impl SubscriptionRecord {
    pub fn product_id(&self) -> Uuid {
        self.product.id()
    }

    /// A row only counts while the backend flags it active and it has not
    /// lapsed. Expired-but-still-flagged rows are a known backend artifact.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Derived access profile. Computed, cached briefly, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAccess {
    pub has_basic: bool,
    pub has_premium: bool,
    /// Portfolio ids the user may open, verbatim from the backend. Tier never
    /// feeds this set: portfolio products are sold individually even under
    /// premium.
    pub portfolio_access: HashSet<Uuid>,
    pub kind: SubscriptionKind,
}

impl SubscriptionAccess {
    /// The fail-closed profile: no tiers, no portfolios.
    pub fn none() -> Self {
        Self {
            has_basic: false,
            has_premium: false,
            portfolio_access: HashSet::new(),
            kind: SubscriptionKind::None,
        }
    }

    pub fn can_view_portfolio(&self, portfolio_id: Uuid) -> bool {
        self.portfolio_access.contains(&portfolio_id)
    }

    pub fn has_tier(&self, tier: AccessTier) -> bool {
        match tier {
            AccessTier::Basic => self.has_basic,
            AccessTier::Premium => self.has_premium,
        }
    }
}

impl Default for SubscriptionAccess {
    fn default() -> Self {
        Self::none()
    }
}

/// Price attached to a cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTag {
    pub amount: Decimal,
    pub currency: String,
}

/// One line in the cart. Quantity is only ever 0 or 1: advisory products are
/// subscriptions, not inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product: ProductSummary,
    pub plan_type: PlanType,
    pub quantity: u8,
    pub price: PriceTag,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub items: Vec<CartItem>,
}

impl Cart {
    pub fn contains(&self, product_id: Uuid) -> bool {
        self.items.iter().any(|i| i.product.id == product_id)
    }

    pub fn item(&self, product_id: Uuid) -> Option<&CartItem> {
        self.items.iter().find(|i| i.product.id == product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn total(&self) -> Decimal {
        self.items
            .iter()
            .map(|i| i.price.amount * Decimal::from(i.quantity))
            .sum()
    }

    /// Carts are single-currency; the backend rejects mixed lines upstream.
    pub fn currency(&self) -> Option<&str> {
        self.items.first().map(|i| i.price.currency.as_str())
    }
}

/// Authenticated user as reported by the backend session endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// KYC fields the payment flow needs before an order can be placed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KycProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl KycProfile {
    pub fn missing_fields(&self) -> Vec<ProfileField> {
        let mut missing = Vec::new();
        if self.pan.as_deref().map_or(true, |v| v.trim().is_empty()) {
            missing.push(ProfileField::Pan);
        }
        if self.date_of_birth.is_none() {
            missing.push(ProfileField::DateOfBirth);
        }
        if self.phone.as_deref().map_or(true, |v| v.trim().is_empty()) {
            missing.push(ProfileField::Phone);
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProfileField {
    Pan,
    DateOfBirth,
    Phone,
}

/// Partial profile update collected from the user during checkout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EsignStatus {
    Pending,
    Completed,
    Failed,
}

/// Outcome of an identity-verification (eSign) pass, scoped to one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsignArtifact {
    pub document_id: String,
    pub product_type: ProductKind,
    pub product_id: Uuid,
    pub status: EsignStatus,
}

impl EsignArtifact {
    /// A completed artifact satisfies a later demand for the same product.
    pub fn covers(&self, product_type: ProductKind, product_id: Uuid) -> bool {
        self.status == EsignStatus::Completed
            && self.product_type == product_type
            && self.product_id == product_id
    }
}

/// Structured signal the backend raises when a payment call needs an eSign
/// pass first. `authentication_url` is present on the resumable
/// "already pending" shape and is reused instead of creating a new document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsignDemand {
    pub product_type: ProductKind,
    pub product_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_url: Option<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayKind {
    HostedCheckout,
    DirectApi,
}

/// Methods offered by the server-to-server gateway.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethodKind {
    Upi,
    Card,
    NetbankingMandate,
    PhysicalMandate,
}

/// Card fields collected for a card mandate. Validated locally before any
/// network call; never logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    pub number: String,
    pub holder: String,
    /// MM/YY
    pub expiry: String,
    pub cvv: String,
}

/// Bank account fields for netbanking and physical mandates. The confirmation
/// field exists only to catch typos client-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankMandateDetails {
    pub account_number: String,
    pub confirm_account_number: String,
    pub holder: String,
    /// Required for physical mandates only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifsc: Option<String>,
}

/// What the user pays with. The hosted overlay collects its own details; the
/// direct methods carry theirs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentInstrument {
    HostedCheckout,
    Upi {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vpa: Option<String>,
    },
    Card(CardDetails),
    NetbankingMandate(BankMandateDetails),
    PhysicalMandate(BankMandateDetails),
}

impl PaymentInstrument {
    /// Direct-gateway method kind; the hosted overlay has none.
    pub fn method(&self) -> Option<PaymentMethodKind> {
        match self {
            PaymentInstrument::HostedCheckout => None,
            PaymentInstrument::Upi { .. } => Some(PaymentMethodKind::Upi),
            PaymentInstrument::Card(_) => Some(PaymentMethodKind::Card),
            PaymentInstrument::NetbankingMandate(_) => Some(PaymentMethodKind::NetbankingMandate),
            PaymentInstrument::PhysicalMandate(_) => Some(PaymentMethodKind::PhysicalMandate),
        }
    }
}

/// Server-side order created for the hosted overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOrder {
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Publishable key the overlay is initialized with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// Follow-up the direct gateway demands after a mandate/charge is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NextAction {
    #[serde(rename = "REDIRECT")]
    Redirect { url: String },
    #[serde(rename = "SHOW_LINK")]
    ShowLink { url: String },
    #[serde(rename = "POLL_STATUS")]
    PollStatus,
}

/// Response to a direct-gateway mandate/charge creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MandateInit {
    pub subscription_id: String,
    pub next_action: NextAction,
}

/// Backend-reported state of a mandate under confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MandateState {
    Pending,
    Confirmed,
    Rejected,
}

/// Freshly created eSign document with its signing URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsignDocument {
    pub document_id: String,
    pub signing_url: String,
}

/// Gateway-side identifier a payment attempt is keyed by: hosted checkouts
/// produce an order id, mandate flows a subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AttemptReference {
    Order(String),
    Subscription(String),
}

impl AttemptReference {
    pub fn id(&self) -> &str {
        match self {
            AttemptReference::Order(id) | AttemptReference::Subscription(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Redirected,
    Succeeded,
    Failed,
    Superseded,
}

/// Audit record of one gateway attempt within a checkout session. A new
/// attempt supersedes the previous one; superseded attempts are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub gateway: GatewayKind,
    pub method: Option<PaymentMethodKind>,
    pub reference: Option<AttemptReference>,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn new(gateway: GatewayKind, method: Option<PaymentMethodKind>) -> Self {
        Self {
            id: Uuid::new_v4(),
            gateway,
            method,
            reference: None,
            outcome: AttemptOutcome::Pending,
            started_at: Utc::now(),
        }
    }
}

/// Backend-verified terminal proof of payment. The only value from which the
/// success phase may be entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmation {
    pub reference: AttemptReference,
    pub payment_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}

/// Correlation record persisted across full-page redirects and reloads so a
/// mandate attempt can be re-verified after the document context is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub subscription_id: String,
    pub gateway: GatewayKind,
    pub method: PaymentMethodKind,
    pub created_at: DateTime<Utc>,
}

/// Top-level checkout phases, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckoutPhase {
    Consent,
    Auth,
    ProfileCompletion,
    GatewaySelection,
    Processing,
    Success,
    Error,
}

/// Phases of the eSign sub-machine, observable while a checkout attempt is
/// suspended on identity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EsignPhase {
    Idle,
    ConsentShown,
    SigningInProgress,
    Completed,
    Failed,
    Cancelled,
}
