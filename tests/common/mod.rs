//! Shared harness for the integration suites: a fully wired engine over the
//! in-memory backend and a scriptable surface, with timings tightened so the
//! poll and retry loops run in milliseconds.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use advisory_checkout::backend::MemoryBackend;
use advisory_checkout::config::AppConfig;
use advisory_checkout::events::Event;
use advisory_checkout::models::{
    BankMandateDetails, Cart, CartItem, EsignDemand, GatewayKind, GatewayOrder, KycProfile,
    PaymentInstrument, PlanType, PriceTag, ProductKind, ProductSummary, ProfileField,
    ProfileUpdate, UserIdentity,
};
use advisory_checkout::session::InMemorySessionStore;
use advisory_checkout::surface::{
    CheckoutSurface, HostedCallback, SigningHandle, SurfaceController, SurfaceError, SurfaceMode,
};
use advisory_checkout::EngineContext;

/// How the scripted surface answers the gateway-choice prompt.
#[derive(Debug, Clone, Copy)]
pub enum GatewayChoice {
    First,
    Pick(GatewayKind),
    Cancel,
}

/// How the scripted surface handles the hosted overlay.
#[derive(Debug, Clone, Copy)]
pub enum HostedBehavior {
    Pay,
    Dismiss,
}

/// Deterministic [`CheckoutSurface`] with per-prompt scripting and counters.
pub struct ScriptedSurface {
    pub consent: AtomicBool,
    pub esign_consent: AtomicBool,
    pub sign_in_user: Mutex<Option<UserIdentity>>,
    pub profile_update: Mutex<Option<ProfileUpdate>>,
    pub gateway_choice: Mutex<GatewayChoice>,
    pub instrument_override: Mutex<Option<PaymentInstrument>>,
    pub hosted_behavior: Mutex<HostedBehavior>,
    /// Block the first popup attempt, as a browser would.
    pub block_popup: AtomicBool,
    /// Close the signing window as soon as it opens.
    pub close_signing_immediately: AtomicBool,

    pub sign_in_calls: AtomicUsize,
    pub collect_profile_calls: AtomicUsize,
    pub choose_gateway_calls: AtomicUsize,
    pub collect_instrument_calls: AtomicUsize,
    pub signing_modes: Mutex<Vec<SurfaceMode>>,
    pub redirects: Mutex<Vec<String>>,
    pub controllers: Mutex<Vec<SurfaceController>>,
}

impl Default for ScriptedSurface {
    fn default() -> Self {
        Self {
            consent: AtomicBool::new(true),
            esign_consent: AtomicBool::new(true),
            sign_in_user: Mutex::new(Some(test_user())),
            profile_update: Mutex::new(Some(complete_profile_update())),
            gateway_choice: Mutex::new(GatewayChoice::First),
            instrument_override: Mutex::new(None),
            hosted_behavior: Mutex::new(HostedBehavior::Pay),
            block_popup: AtomicBool::new(false),
            close_signing_immediately: AtomicBool::new(false),
            sign_in_calls: AtomicUsize::new(0),
            collect_profile_calls: AtomicUsize::new(0),
            choose_gateway_calls: AtomicUsize::new(0),
            collect_instrument_calls: AtomicUsize::new(0),
            signing_modes: Mutex::new(Vec::new()),
            redirects: Mutex::new(Vec::new()),
            controllers: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckoutSurface for ScriptedSurface {
    async fn confirm_checkout_consent(&self, _cart: &Cart) -> Result<bool, SurfaceError> {
        Ok(self.consent.load(Ordering::SeqCst))
    }

    async fn confirm_esign_consent(&self, _demand: &EsignDemand) -> Result<bool, SurfaceError> {
        Ok(self.esign_consent.load(Ordering::SeqCst))
    }

    async fn request_sign_in(&self) -> Result<Option<UserIdentity>, SurfaceError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sign_in_user.lock().await.clone())
    }

    async fn collect_profile(
        &self,
        _missing: &[ProfileField],
    ) -> Result<Option<ProfileUpdate>, SurfaceError> {
        self.collect_profile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.profile_update.lock().await.clone())
    }

    async fn choose_gateway(
        &self,
        options: &[GatewayKind],
    ) -> Result<Option<GatewayKind>, SurfaceError> {
        self.choose_gateway_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match *self.gateway_choice.lock().await {
            GatewayChoice::First => options.first().copied(),
            GatewayChoice::Pick(kind) => Some(kind),
            GatewayChoice::Cancel => None,
        })
    }

    async fn collect_instrument(
        &self,
        gateway: GatewayKind,
        plan: PlanType,
    ) -> Result<Option<PaymentInstrument>, SurfaceError> {
        self.collect_instrument_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(instrument) = self.instrument_override.lock().await.clone() {
            return Ok(Some(instrument));
        }
        let instrument = match gateway {
            GatewayKind::HostedCheckout => PaymentInstrument::HostedCheckout,
            GatewayKind::DirectApi if plan.requires_mandate() => {
                PaymentInstrument::NetbankingMandate(bank_details())
            }
            GatewayKind::DirectApi => PaymentInstrument::Upi {
                vpa: Some("investor@okbank".to_string()),
            },
        };
        Ok(Some(instrument))
    }

    async fn collect_hosted_payment(
        &self,
        order: &GatewayOrder,
        _customer: &UserIdentity,
    ) -> Result<HostedCallback, SurfaceError> {
        match *self.hosted_behavior.lock().await {
            HostedBehavior::Pay => Ok(HostedCallback {
                order_id: order.order_id.clone(),
                payment_id: format!("pay_{}", order.order_id),
                signature: "sig_ok".to_string(),
            }),
            HostedBehavior::Dismiss => Err(SurfaceError::Dismissed),
        }
    }

    async fn open_signing(
        &self,
        url: &str,
        mode: SurfaceMode,
    ) -> Result<SigningHandle, SurfaceError> {
        self.signing_modes.lock().await.push(mode);
        if mode == SurfaceMode::Popup && self.block_popup.load(Ordering::SeqCst) {
            return Err(SurfaceError::PopupBlocked {
                url: url.to_string(),
            });
        }
        let (handle, controller) = SigningHandle::pair();
        if self.close_signing_immediately.load(Ordering::SeqCst) {
            controller.mark_closed();
        }
        self.controllers.lock().await.push(controller);
        Ok(handle)
    }

    async fn redirect(&self, url: &str) -> Result<(), SurfaceError> {
        self.redirects.lock().await.push(url.to_string());
        Ok(())
    }
}

/// Wired engine plus handles on its collaborators.
pub struct Harness {
    pub engine: EngineContext,
    pub backend: Arc<MemoryBackend>,
    pub surface: Arc<ScriptedSurface>,
    pub sessions: Arc<InMemorySessionStore>,
    /// Held so event sends never hit a closed channel.
    pub events_rx: mpsc::Receiver<Event>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let surface = Arc::new(ScriptedSurface::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let (engine, events_rx) = EngineContext::new(
            config,
            backend.clone(),
            surface.clone(),
            sessions.clone(),
        );
        Self {
            engine,
            backend,
            surface,
            sessions,
            events_rx,
        }
    }

    /// Sign in without going through the surface dialog.
    pub async fn sign_in(&self) {
        self.engine.sign_in(test_user()).await.unwrap();
    }

    /// Seed a complete KYC profile so the profile phase is skipped.
    pub async fn seed_complete_profile(&self) {
        self.backend
            .seed_profile(KycProfile {
                pan: Some("ABCPE1234F".to_string()),
                date_of_birth: chrono::NaiveDate::from_ymd_opt(1988, 6, 2),
                phone: Some("+919800000000".to_string()),
            })
            .await;
    }
}

/// Engine timings tightened for tests.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.esign.poll_interval_ms = 10;
    config.esign.max_poll_attempts = 20;
    config.esign.completion_grace_ms = 1;
    config.verification.max_attempts = 3;
    config.verification.base_delay_ms = 5;
    config.verification.jitter = false;
    config
}

pub fn test_user() -> UserIdentity {
    UserIdentity {
        id: Uuid::new_v4(),
        email: "investor@example.com".to_string(),
        name: Some("A Kumar".to_string()),
        phone: Some("+919800000000".to_string()),
    }
}

pub fn complete_profile_update() -> ProfileUpdate {
    ProfileUpdate {
        pan: Some("ABCPE1234F".to_string()),
        date_of_birth: chrono::NaiveDate::from_ymd_opt(1988, 6, 2),
        phone: Some("+919800000000".to_string()),
    }
}

pub fn bank_details() -> BankMandateDetails {
    BankMandateDetails {
        account_number: "002301567890".to_string(),
        confirm_account_number: "002301567890".to_string(),
        holder: "A Kumar".to_string(),
        ifsc: Some("HDFC0001234".to_string()),
    }
}

pub fn portfolio_item(product_id: Uuid, plan: PlanType) -> CartItem {
    CartItem {
        product: ProductSummary {
            id: product_id,
            name: "Momentum Large Cap".to_string(),
            product_type: ProductKind::Portfolio,
            tier: None,
        },
        plan_type: plan,
        quantity: 1,
        price: PriceTag {
            amount: dec!(4999.00),
            currency: "INR".to_string(),
        },
    }
}

pub fn single_item_cart(product_id: Uuid, plan: PlanType) -> Cart {
    Cart {
        items: vec![portfolio_item(product_id, plan)],
    }
}
