//! Drives a full checkout against the in-memory backend with a scripted,
//! auto-approving surface. Useful for watching the phase machine and event
//! stream without a real backend or UI.

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use rust_decimal_macros::dec;
use tracing::info;
use uuid::Uuid;

use advisory_checkout::backend::memory::{MandateScript, MemoryBackend, ScriptedFailure};
use advisory_checkout::backend::memory::ops;
use advisory_checkout::config::{init_tracing, AppConfig};
use advisory_checkout::events::process_events;
use advisory_checkout::models::{
    BankMandateDetails, Cart, CartItem, EsignDemand, EsignStatus, GatewayKind, GatewayOrder,
    MandateState, NextAction, PaymentInstrument, PlanType, PriceTag, ProductKind, ProductSummary,
    ProfileField, ProfileUpdate, UserIdentity,
};
use advisory_checkout::session::InMemorySessionStore;
use advisory_checkout::surface::{
    CheckoutSurface, HostedCallback, SigningHandle, SurfaceError, SurfaceMode,
};
use advisory_checkout::EngineContext;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlanArg {
    Monthly,
    Quarterly,
    Yearly,
}

impl From<PlanArg> for PlanType {
    fn from(value: PlanArg) -> Self {
        match value {
            PlanArg::Monthly => PlanType::Monthly,
            PlanArg::Quarterly => PlanType::Quarterly,
            PlanArg::Yearly => PlanType::Yearly,
        }
    }
}

/// Simulate one checkout run end to end.
#[derive(Debug, Parser)]
#[command(name = "checkout-sim", version, about)]
struct Args {
    /// Billing cadence to purchase.
    #[arg(long, value_enum, default_value = "monthly")]
    plan: PlanArg,

    /// Make the first payment call demand an eSign pass.
    #[arg(long)]
    require_esign: bool,

    /// Number of pending polls before the mandate confirms.
    #[arg(long, default_value_t = 1)]
    pending_polls: u32,

    /// Emit structured JSON logs.
    #[arg(long)]
    json_logs: bool,
}

/// Surface that approves every prompt and fills in canned details.
struct SimSurface;

#[async_trait]
impl CheckoutSurface for SimSurface {
    async fn confirm_checkout_consent(&self, cart: &Cart) -> Result<bool, SurfaceError> {
        info!(total = %cart.total(), "consent: accepted");
        Ok(true)
    }

    async fn confirm_esign_consent(&self, demand: &EsignDemand) -> Result<bool, SurfaceError> {
        info!(product_id = %demand.product_id, "eSign consent: accepted");
        Ok(true)
    }

    async fn request_sign_in(&self) -> Result<Option<UserIdentity>, SurfaceError> {
        Ok(Some(UserIdentity {
            id: Uuid::new_v4(),
            email: "demo@example.com".to_string(),
            name: Some("Demo Investor".to_string()),
            phone: Some("+919800000000".to_string()),
        }))
    }

    async fn collect_profile(
        &self,
        missing: &[ProfileField],
    ) -> Result<Option<ProfileUpdate>, SurfaceError> {
        info!(?missing, "filling profile gaps");
        Ok(Some(ProfileUpdate {
            pan: Some("ABCPE1234F".to_string()),
            date_of_birth: Some(chrono::NaiveDate::from_ymd_opt(1990, 1, 15).unwrap()),
            phone: Some("+919800000000".to_string()),
        }))
    }

    async fn choose_gateway(
        &self,
        options: &[GatewayKind],
    ) -> Result<Option<GatewayKind>, SurfaceError> {
        info!(?options, "gateway choice offered, taking the first");
        Ok(options.first().copied())
    }

    async fn collect_instrument(
        &self,
        gateway: GatewayKind,
        plan: PlanType,
    ) -> Result<Option<PaymentInstrument>, SurfaceError> {
        let instrument = match gateway {
            GatewayKind::HostedCheckout => PaymentInstrument::HostedCheckout,
            GatewayKind::DirectApi if plan.requires_mandate() => {
                PaymentInstrument::NetbankingMandate(BankMandateDetails {
                    account_number: "002301567890".to_string(),
                    confirm_account_number: "002301567890".to_string(),
                    holder: "Demo Investor".to_string(),
                    ifsc: None,
                })
            }
            GatewayKind::DirectApi => PaymentInstrument::Upi {
                vpa: Some("demo@okbank".to_string()),
            },
        };
        Ok(Some(instrument))
    }

    async fn collect_hosted_payment(
        &self,
        order: &GatewayOrder,
        _customer: &UserIdentity,
    ) -> Result<HostedCallback, SurfaceError> {
        info!(order_id = %order.order_id, "hosted overlay: paying");
        Ok(HostedCallback {
            order_id: order.order_id.clone(),
            payment_id: format!("pay_{}", order.order_id),
            signature: "sig_demo".to_string(),
        })
    }

    async fn open_signing(
        &self,
        url: &str,
        mode: SurfaceMode,
    ) -> Result<SigningHandle, SurfaceError> {
        info!(url, ?mode, "signing window opened");
        let (handle, _controller) = SigningHandle::pair();
        Ok(handle)
    }

    async fn redirect(&self, url: &str) -> Result<(), SurfaceError> {
        info!(url, "redirect");
        Ok(())
    }
}

fn demo_cart(plan: PlanType) -> (Cart, Uuid) {
    let product_id = Uuid::new_v4();
    let cart = Cart {
        items: vec![CartItem {
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
        }],
    };
    (cart, product_id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let plan: PlanType = args.plan.into();

    let mut config = AppConfig::default();
    config.esign.poll_interval_ms = 200;
    config.esign.completion_grace_ms = 100;
    config.verification.base_delay_ms = 200;
    init_tracing(&config.log_level, args.json_logs);

    let backend = Arc::new(MemoryBackend::new());
    let (cart, product_id) = demo_cart(plan);
    backend.seed_cart(cart).await;

    if args.require_esign {
        let demand = EsignDemand {
            product_type: ProductKind::Portfolio,
            product_id,
            authentication_url: None,
        };
        let blocked_op = if plan.requires_mandate() {
            ops::CREATE_MANDATE
        } else {
            ops::CREATE_ORDER
        };
        backend
            .fail_next(blocked_op, ScriptedFailure::EsignRequired(demand))
            .await;
        backend
            .script_esign_statuses(vec![EsignStatus::Pending, EsignStatus::Completed])
            .await;
    }

    if plan.requires_mandate() {
        let mut states = vec![MandateState::Pending; args.pending_polls as usize];
        states.push(MandateState::Confirmed);
        backend
            .script_mandate(MandateScript {
                next_action: NextAction::PollStatus,
                states,
            })
            .await;
    }

    let surface = Arc::new(SimSurface);
    let sessions = Arc::new(InMemorySessionStore::new());
    let (engine, events_rx) = EngineContext::new(config, backend.clone(), surface, sessions);
    let event_loop = tokio::spawn(process_events(events_rx));

    let outcome = engine.checkout.run(plan).await;
    println!("outcome: {outcome:?}");

    for attempt in engine.checkout.attempts().await {
        println!(
            "attempt {} via {} ({:?}): {}",
            attempt.id, attempt.gateway, attempt.method, attempt.outcome
        );
    }

    let access = engine.entitlements.refresh().await;
    println!(
        "access: kind={} portfolios={}",
        access.kind,
        access.portfolio_access.len()
    );

    drop(engine);
    event_loop.abort();
    Ok(())
}
