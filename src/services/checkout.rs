//! Checkout State Machine: the top-level orchestrator.
//!
//! Sequences `Consent → Auth → ProfileCompletion → GatewaySelection →
//! Processing → {Success | Error}`, branching on server-signaled conditions.
//! The eSign Gate is embedded as a sub-machine entered from `Processing`;
//! on its completion the *same* gateway attempt resumes — never a silent
//! fallback to a different gateway. Cancellation is cooperative: a tripped
//! flag makes any continuation that resolves afterwards a no-op, so a slow
//! verification response can never flip a cancelled checkout to success.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::BackendApi;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{
    AttemptOutcome, AttemptReference, Cart, CheckoutPhase, GatewayKind, MandateState,
    PaymentAttempt, PaymentInstrument, PlanType, UserIdentity,
};
use crate::services::cart::CartService;
use crate::services::entitlements::EntitlementService;
use crate::services::esign::EsignGate;
use crate::services::gateways::{eligible_gateways, PaymentGateway, PaymentOutcome};
use crate::services::CancelFlag;
use crate::session::{clear_pending_verification, load_pending_verification, SessionStore};
use crate::surface::CheckoutSurface;
use crate::AuthState;

/// Terminal failure payload. Restarting from consent keeps the cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutFailure {
    pub message: String,
    pub can_retry: bool,
    /// Cancellations end the flow without an error toast.
    pub silent: bool,
}

/// How a checkout run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    /// Backend-verified success.
    Completed { reference: AttemptReference },
    /// The mandate is parked for background confirmation; resume later with
    /// [`CheckoutService::resume_pending_verification`].
    PendingConfirmation { subscription_id: String },
    Failed(CheckoutFailure),
}

#[derive(Clone)]
pub struct CheckoutService {
    backend: Arc<dyn BackendApi>,
    surface: Arc<dyn CheckoutSurface>,
    sessions: Arc<dyn SessionStore>,
    auth: Arc<AuthState>,
    cart: Arc<CartService>,
    entitlements: Arc<EntitlementService>,
    esign: Arc<EsignGate>,
    gateways: Vec<Arc<dyn PaymentGateway>>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    phase_tx: Arc<watch::Sender<CheckoutPhase>>,
    cancel: CancelFlag,
    attempts: Arc<Mutex<Vec<PaymentAttempt>>>,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn BackendApi>,
        surface: Arc<dyn CheckoutSurface>,
        sessions: Arc<dyn SessionStore>,
        auth: Arc<AuthState>,
        cart: Arc<CartService>,
        entitlements: Arc<EntitlementService>,
        esign: Arc<EsignGate>,
        gateways: Vec<Arc<dyn PaymentGateway>>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CheckoutPhase::Consent);
        Self {
            backend,
            surface,
            sessions,
            auth,
            cart,
            entitlements,
            esign,
            gateways,
            event_sender,
            config,
            phase_tx: Arc::new(phase_tx),
            cancel: CancelFlag::new(),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Observable top-level phase.
    pub fn phase(&self) -> watch::Receiver<CheckoutPhase> {
        self.phase_tx.subscribe()
    }

    /// Cooperative cancel. Any async step still in flight becomes a no-op
    /// when it resolves.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Audit trail of this session's payment attempts, newest last.
    pub async fn attempts(&self) -> Vec<PaymentAttempt> {
        self.attempts.lock().await.clone()
    }

    /// Run one checkout for the effective cart under the given plan cadence.
    /// Never returns an `Err`: every failure is folded into the terminal
    /// outcome with a user-displayable message.
    #[instrument(skip(self))]
    pub async fn run(&self, plan: PlanType) -> CheckoutOutcome {
        let session_id = Uuid::new_v4();
        self.cancel.reset();
        self.attempts.lock().await.clear();
        self.event_sender
            .send_or_log(Event::CheckoutStarted { session_id })
            .await;

        match self.drive(session_id, plan).await {
            Ok(DriveResult::Completed(reference)) => {
                self.set_phase(session_id, CheckoutPhase::Success).await;
                self.entitlements.invalidate("successful payment").await;
                self.event_sender
                    .send_or_log(Event::CheckoutCompleted { session_id })
                    .await;
                if let Err(e) = self
                    .surface
                    .redirect(&self.config.success_redirect_url)
                    .await
                {
                    warn!("success redirect failed: {}", e);
                }
                CheckoutOutcome::Completed { reference }
            }
            Ok(DriveResult::Pending(subscription_id)) => {
                self.event_sender
                    .send_or_log(Event::MandatePending {
                        subscription_id: subscription_id.clone(),
                    })
                    .await;
                CheckoutOutcome::PendingConfirmation { subscription_id }
            }
            Err(e) => {
                let failure = CheckoutFailure {
                    message: e.user_message(),
                    can_retry: e.is_retryable(),
                    silent: e.is_silent(),
                };
                self.set_phase(session_id, CheckoutPhase::Error).await;
                self.event_sender
                    .send_or_log(Event::CheckoutFailed {
                        session_id,
                        reason: e.to_string(),
                        silent: failure.silent,
                    })
                    .await;
                CheckoutOutcome::Failed(failure)
            }
        }
    }

    /// Resume a mandate verification left behind by a redirect or reload,
    /// from the correlation record in session storage. `Ok(None)` when
    /// nothing is pending.
    #[instrument(skip(self))]
    pub async fn resume_pending_verification(
        &self,
    ) -> Result<Option<AttemptReference>, ServiceError> {
        let pending = match load_pending_verification(self.sessions.as_ref()).await? {
            Some(pending) => pending,
            None => return Ok(None),
        };
        info!(subscription_id = %pending.subscription_id, "resuming mandate verification");

        let reference = self.confirm_mandate(&pending.subscription_id).await?;
        self.entitlements.invalidate("successful payment").await;
        self.event_sender
            .send_or_log(Event::PaymentVerified {
                session_id: Uuid::nil(),
                reference: reference.clone(),
            })
            .await;
        Ok(Some(reference))
    }

    async fn drive(
        &self,
        session_id: Uuid,
        plan: PlanType,
    ) -> Result<DriveResult, ServiceError> {
        // Consent. The signed-out view may be missing server-side items, so
        // emptiness is only decided here when the effective cart is already
        // the authoritative one.
        self.set_phase(session_id, CheckoutPhase::Consent).await;
        let cart = self.cart.effective_cart().await?;
        if self.auth.is_authenticated().await && Self::nothing_to_buy(&cart) {
            return Err(ServiceError::ValidationError(
                "the cart is empty".to_string(),
            ));
        }
        let consented = self.surface.confirm_checkout_consent(&cart).await?;
        self.cancel.guard()?;
        if !consented {
            return Err(ServiceError::Cancelled);
        }

        // Auth, skipped entirely when already signed in.
        let user = self.ensure_signed_in(session_id).await?;
        let cart = self.cart.effective_cart().await?;
        if Self::nothing_to_buy(&cart) {
            return Err(ServiceError::ValidationError(
                "the cart is empty".to_string(),
            ));
        }

        // Profile completion, only when the backend reports gaps.
        self.ensure_profile_complete(session_id).await?;

        // Gateway selection.
        let gateway = self.select_gateway(session_id, plan).await?;

        // Processing.
        self.set_phase(session_id, CheckoutPhase::Processing).await;
        let instrument = self
            .surface
            .collect_instrument(gateway.kind(), plan)
            .await?
            .ok_or(ServiceError::Cancelled)?;
        self.cancel.guard()?;

        self.process_payment(session_id, plan, &cart, &user, gateway, instrument)
            .await
    }

    fn nothing_to_buy(cart: &Cart) -> bool {
        cart.items.iter().all(|item| item.quantity == 0)
    }

    async fn ensure_signed_in(&self, session_id: Uuid) -> Result<UserIdentity, ServiceError> {
        if let Some(user) = self.auth.user().await {
            return Ok(user);
        }

        self.set_phase(session_id, CheckoutPhase::Auth).await;
        let user = self
            .surface
            .request_sign_in()
            .await?
            .ok_or(ServiceError::Cancelled)?;
        self.cancel.guard()?;

        self.auth.set_user(user.clone()).await;
        self.event_sender
            .send_or_log(Event::SignedIn { user_id: user.id })
            .await;
        self.cart.merge_local_into_server().await?;
        self.entitlements.invalidate("login").await;
        Ok(user)
    }

    async fn ensure_profile_complete(&self, session_id: Uuid) -> Result<(), ServiceError> {
        let profile = self.backend.fetch_profile().await?;
        self.cancel.guard()?;
        let missing = profile.missing_fields();
        if missing.is_empty() {
            return Ok(());
        }

        self.set_phase(session_id, CheckoutPhase::ProfileCompletion)
            .await;
        let update = self
            .surface
            .collect_profile(&missing)
            .await?
            .ok_or(ServiceError::Cancelled)?;
        self.cancel.guard()?;

        if let Some(pan) = &update.pan {
            if !crate::services::gateways::is_valid_pan(pan) {
                return Err(ServiceError::ValidationError(
                    "PAN must match the format AAAPA9999A".to_string(),
                ));
            }
        }

        let updated = self.backend.update_profile(&update).await?;
        self.cancel.guard()?;
        if !updated.is_complete() {
            return Err(ServiceError::ValidationError(format!(
                "profile is still missing: {}",
                updated
                    .missing_fields()
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }

    /// Pick the gateway for this plan. Two or more eligible gateways go to
    /// the surface; exactly one is automatic; zero is an explicit
    /// configuration error rather than a silent default.
    async fn select_gateway(
        &self,
        session_id: Uuid,
        plan: PlanType,
    ) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        let eligible = eligible_gateways(&self.gateways, plan);
        match eligible.len() {
            0 => Err(ServiceError::ConfigurationError(format!(
                "no payment gateway is eligible for {plan} plans"
            ))),
            1 => Ok(eligible.into_iter().next().expect("len checked")),
            _ => {
                self.set_phase(session_id, CheckoutPhase::GatewaySelection)
                    .await;
                let kinds: Vec<GatewayKind> = eligible.iter().map(|g| g.kind()).collect();
                let chosen = self
                    .surface
                    .choose_gateway(&kinds)
                    .await?
                    .ok_or(ServiceError::Cancelled)?;
                self.cancel.guard()?;
                eligible
                    .into_iter()
                    .find(|g| g.kind() == chosen)
                    .ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "gateway {chosen} is not among the eligible options"
                        ))
                    })
            }
        }
    }

    /// Execute the attempt, intercepting eSign demands. On a demand the
    /// attempt is suspended, the gate runs, and the *same* gateway and
    /// instrument are retried with a fresh intent.
    async fn process_payment(
        &self,
        session_id: Uuid,
        plan: PlanType,
        cart: &Cart,
        user: &UserIdentity,
        gateway: Arc<dyn PaymentGateway>,
        instrument: PaymentInstrument,
    ) -> Result<DriveResult, ServiceError> {
        let mut esign_satisfied = false;
        loop {
            self.cancel.guard()?;
            let attempt_id = self
                .begin_attempt(session_id, gateway.kind(), &instrument)
                .await;
            let client_key = format!("checkout-{session_id}-{attempt_id}");
            let intent =
                gateway.create_intent(cart, plan, instrument.clone(), user, &client_key)?;

            match gateway.execute(&intent, &self.cancel).await {
                Ok(PaymentOutcome::Confirmed { reference }) => {
                    self.finish_attempt(attempt_id, AttemptOutcome::Succeeded, Some(&reference))
                        .await;
                    self.event_sender
                        .send_or_log(Event::PaymentVerified {
                            session_id,
                            reference: reference.clone(),
                        })
                        .await;
                    return Ok(DriveResult::Completed(reference));
                }
                Ok(PaymentOutcome::AwaitingReturn { subscription_id }) => {
                    let reference = AttemptReference::Subscription(subscription_id.clone());
                    self.finish_attempt(attempt_id, AttemptOutcome::Redirected, Some(&reference))
                        .await;
                    self.event_sender
                        .send_or_log(Event::PaymentRedirectIssued {
                            session_id,
                            subscription_id: subscription_id.clone(),
                        })
                        .await;
                    // The redirect has returned; confirm with bounded retry.
                    let reference = self.confirm_mandate(&subscription_id).await?;
                    self.mark_attempt(attempt_id, AttemptOutcome::Succeeded).await;
                    self.event_sender
                        .send_or_log(Event::PaymentVerified {
                            session_id,
                            reference: reference.clone(),
                        })
                        .await;
                    return Ok(DriveResult::Completed(reference));
                }
                Ok(PaymentOutcome::PendingConfirmation { subscription_id }) => {
                    let reference = AttemptReference::Subscription(subscription_id.clone());
                    self.finish_attempt(attempt_id, AttemptOutcome::Pending, Some(&reference))
                        .await;
                    return Ok(DriveResult::Pending(subscription_id));
                }
                Err(e) => {
                    if let Some(demand) = e.esign_demand() {
                        if !esign_satisfied {
                            let demand = demand.clone();
                            self.mark_attempt(attempt_id, AttemptOutcome::Failed).await;
                            info!(
                                gateway = %gateway.kind(),
                                product_id = %demand.product_id,
                                "payment blocked on identity verification, entering the eSign gate"
                            );
                            self.esign.start_verification(&demand, &self.cancel).await?;
                            self.cancel.guard()?;
                            esign_satisfied = true;
                            // Resume the same gateway with a fresh intent.
                            continue;
                        }
                    }
                    self.mark_attempt(attempt_id, AttemptOutcome::Failed).await;
                    return Err(e);
                }
            }
        }
    }

    /// Bounded mandate confirmation with increasing delay. Always terminates:
    /// an always-pending mandate surfaces `VerificationTimeout` after the
    /// configured cap, with the correlation record retained for a later
    /// resume. Status checks are idempotent, so transient network failures
    /// count against the same attempt budget instead of aborting.
    async fn confirm_mandate(
        &self,
        subscription_id: &str,
    ) -> Result<AttemptReference, ServiceError> {
        let max_attempts = self.config.verification.max_attempts;
        for attempt in 1..=max_attempts {
            self.cancel.guard()?;
            let status = self.backend.mandate_status(subscription_id).await;
            // Stale-response guard: a cancel that landed while the check was
            // in flight wins over whatever the check returned.
            self.cancel.guard()?;

            match status {
                Ok(MandateState::Confirmed) => {
                    clear_pending_verification(self.sessions.as_ref()).await?;
                    return Ok(AttemptReference::Subscription(subscription_id.to_string()));
                }
                Ok(MandateState::Rejected) => {
                    clear_pending_verification(self.sessions.as_ref()).await?;
                    return Err(ServiceError::GatewayRejected(
                        "the bank rejected the mandate".to_string(),
                    ));
                }
                Ok(MandateState::Pending) => {
                    info!(subscription_id, attempt, "mandate still pending");
                }
                Err(ServiceError::NetworkError(msg)) if attempt < max_attempts => {
                    warn!(subscription_id, attempt, "status check failed, will retry: {}", msg);
                }
                Err(e) => return Err(e),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }
        }
        Err(ServiceError::VerificationTimeout {
            attempts: max_attempts,
        })
    }

    fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.verification_base_delay();
        let mut delay = base * attempt;
        if self.config.verification.jitter {
            let jitter_cap = (base.as_millis() as u64 / 2).max(1);
            delay += std::time::Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        }
        delay
    }

    async fn set_phase(&self, session_id: Uuid, phase: CheckoutPhase) {
        let _ = self.phase_tx.send(phase);
        self.event_sender
            .send_or_log(Event::CheckoutPhaseChanged { session_id, phase })
            .await;
    }

    /// Record a new attempt, superseding any still-live predecessor. The
    /// superseded attempt stays in the trail for audit.
    async fn begin_attempt(
        &self,
        session_id: Uuid,
        gateway: GatewayKind,
        instrument: &PaymentInstrument,
    ) -> Uuid {
        let mut attempts = self.attempts.lock().await;
        if let Some(last) = attempts.last_mut() {
            if matches!(
                last.outcome,
                AttemptOutcome::Pending | AttemptOutcome::Redirected
            ) {
                last.outcome = AttemptOutcome::Superseded;
            }
        }
        let attempt = PaymentAttempt::new(gateway, instrument.method());
        let attempt_id = attempt.id;
        self.event_sender
            .send_or_log(Event::PaymentAttemptStarted {
                session_id,
                attempt_id,
                gateway,
                method: instrument.method(),
            })
            .await;
        attempts.push(attempt);
        attempt_id
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        reference: Option<&AttemptReference>,
    ) {
        let mut attempts = self.attempts.lock().await;
        if let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.outcome = outcome;
            attempt.reference = reference.cloned();
        }
    }

    async fn mark_attempt(&self, attempt_id: Uuid, outcome: AttemptOutcome) {
        let mut attempts = self.attempts.lock().await;
        if let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.outcome = outcome;
        }
    }
}

enum DriveResult {
    Completed(AttemptReference),
    Pending(String),
}
