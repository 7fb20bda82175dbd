//! Subscription checkout and entitlement engine for an investment-advisory
//! storefront.
//!
//! The engine owns everything between "the user tapped subscribe" and a
//! backend-verified payment: entitlement resolution, cart reconciliation
//! across the signed-in boundary, the identity-verification (eSign) gate,
//! and a checkout state machine orchestrating two payment gateway adapters.
//! Presentation stays behind the [`surface::CheckoutSurface`] seam; the
//! platform backend behind [`backend::BackendApi`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod services;
pub mod session;
pub mod surface;

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::backend::BackendApi;
use crate::cache::InMemoryCache;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{GatewayKind, UserIdentity};
use crate::services::cart::InMemoryLocalCart;
use crate::services::gateways::{DirectApiGateway, HostedCheckoutGateway, PaymentGateway};
use crate::services::{CartService, CheckoutService, EntitlementService, EsignGate};
use crate::session::SessionStore;
use crate::surface::CheckoutSurface;

/// Who is signed in right now. Shared by every service that branches on the
/// signed-in boundary.
#[derive(Debug, Default)]
pub struct AuthState {
    user: RwLock<Option<UserIdentity>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user(&self) -> Option<UserIdentity> {
        self.user.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.user.read().await.is_some()
    }

    pub async fn set_user(&self, user: UserIdentity) {
        *self.user.write().await = Some(user);
    }

    /// Returns the user that was signed in, if any.
    pub async fn clear(&self) -> Option<UserIdentity> {
        self.user.write().await.take()
    }
}

/// Fully wired engine. Construction is the only place the object graph is
/// assembled; everything downstream holds `Arc`s.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthState>,
    pub cart: Arc<CartService>,
    pub entitlements: Arc<EntitlementService>,
    pub esign: Arc<EsignGate>,
    pub checkout: Arc<CheckoutService>,
    event_sender: Arc<EventSender>,
}

impl EngineContext {
    /// Wire the engine over a backend and a surface. Returns the receiving
    /// end of the event stream; hand it to [`events::process_events`] or a
    /// custom consumer.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn BackendApi>,
        surface: Arc<dyn CheckoutSurface>,
        sessions: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let event_sender = Arc::new(EventSender::new(tx));

        let auth = Arc::new(AuthState::new());
        let cache = Arc::new(InMemoryCache::new());

        let cart = Arc::new(CartService::new(
            backend.clone(),
            Arc::new(InMemoryLocalCart::new()),
            auth.clone(),
            event_sender.clone(),
        ));
        let entitlements = Arc::new(EntitlementService::new(
            backend.clone(),
            cache,
            event_sender.clone(),
            config.entitlement_ttl(),
        ));
        let esign = Arc::new(EsignGate::new(
            backend.clone(),
            surface.clone(),
            event_sender.clone(),
            &config,
        ));

        let gateways: Vec<Arc<dyn PaymentGateway>> = config
            .enabled_gateways()
            .into_iter()
            .map(|kind| match kind {
                GatewayKind::HostedCheckout => Arc::new(HostedCheckoutGateway::new(
                    backend.clone(),
                    surface.clone(),
                )) as Arc<dyn PaymentGateway>,
                GatewayKind::DirectApi => Arc::new(DirectApiGateway::new(
                    backend.clone(),
                    surface.clone(),
                    sessions.clone(),
                )) as Arc<dyn PaymentGateway>,
            })
            .collect();
        info!(gateways = gateways.len(), "engine wired");

        let checkout = Arc::new(CheckoutService::new(
            backend,
            surface,
            sessions,
            auth.clone(),
            cart.clone(),
            entitlements.clone(),
            esign.clone(),
            gateways,
            event_sender.clone(),
            config.clone(),
        ));

        (
            Self {
                config,
                auth,
                cart,
                entitlements,
                esign,
                checkout,
                event_sender,
            },
            rx,
        )
    }

    /// Record a sign-in: merge the anonymous cart into the server cart and
    /// drop the cached access profile so the next read resolves fresh.
    pub async fn sign_in(&self, user: UserIdentity) -> Result<(), ServiceError> {
        let user_id = user.id;
        self.auth.set_user(user).await;
        self.event_sender
            .send_or_log(Event::SignedIn { user_id })
            .await;
        self.cart.merge_local_into_server().await?;
        self.entitlements.invalidate("login").await;
        Ok(())
    }

    /// Record a sign-out. Entitlements fall back to the signed-out profile on
    /// the next read.
    pub async fn sign_out(&self) {
        if let Some(user) = self.auth.clear().await {
            self.event_sender
                .send_or_log(Event::SignedOut { user_id: user.id })
                .await;
        }
        self.entitlements.invalidate("logout").await;
    }
}

pub mod prelude {
    pub use crate::backend::{BackendApi, HttpBackend, MemoryBackend};
    pub use crate::config::{load_config, AppConfig};
    pub use crate::errors::ServiceError;
    pub use crate::events::{process_events, Event};
    pub use crate::models::*;
    pub use crate::services::{
        CheckoutFailure, CheckoutOutcome, CheckoutService, EntitlementService, EsignGate,
        PaymentGateway,
    };
    pub use crate::session::{InMemorySessionStore, SessionStore};
    pub use crate::surface::{CheckoutSurface, SurfaceError, SurfaceMode};
    pub use crate::{AuthState, EngineContext};
}
