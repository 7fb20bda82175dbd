//! Seam between the engine and the host user interface.
//!
//! Everything presentational lives behind [`CheckoutSurface`]: consent
//! sheets, the sign-in dialog, profile forms, the hosted payment overlay,
//! external signing windows and full-page redirects. The engine only ever
//! awaits these calls; tests script them.

use crate::models::{
    Cart, EsignDemand, GatewayKind, GatewayOrder, PaymentInstrument, PlanType, ProfileField,
    ProfileUpdate, UserIdentity,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The host environment refused to open a new window. Carries the URL so
    /// callers can retry in same-tab mode.
    #[error("Popup blocked (url: {url})")]
    PopupBlocked { url: String },

    /// The user dismissed the surface without completing it.
    #[error("Dismissed by the user")]
    Dismissed,

    #[error("Surface unavailable: {0}")]
    Unavailable(String),
}

/// How an external page is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceMode {
    Popup,
    SameTab,
}

/// Callback payload the hosted overlay hands back on user completion.
/// Client-reported only; worthless until verified server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedCallback {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Engine-side handle to an open signing window. The surface implementation
/// keeps the paired [`SurfaceController`] and reports user closes through it.
#[derive(Debug, Clone)]
pub struct SigningHandle {
    closed_rx: watch::Receiver<bool>,
    close_tx: Arc<watch::Sender<bool>>,
}

/// Surface-side half of a signing window pair.
#[derive(Debug, Clone)]
pub struct SurfaceController {
    close_tx: Arc<watch::Sender<bool>>,
}

impl SigningHandle {
    pub fn pair() -> (SigningHandle, SurfaceController) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            SigningHandle {
                closed_rx: rx,
                close_tx: tx.clone(),
            },
            SurfaceController { close_tx: tx },
        )
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Dismiss the window from the engine side (cancel, or auto-close after
    /// the completion grace period).
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Resolves once the window is closed, by either side.
    pub async fn wait_closed(&mut self) {
        while !*self.closed_rx.borrow_and_update() {
            if self.closed_rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl SurfaceController {
    /// Report that the user closed the external window.
    pub fn mark_closed(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }
}

/// Host-UI contract the checkout engine drives.
#[async_trait]
pub trait CheckoutSurface: Send + Sync {
    /// Terms-and-conditions consent for the checkout itself. `false` declines.
    async fn confirm_checkout_consent(&self, cart: &Cart) -> Result<bool, SurfaceError>;

    /// Consent sheet preceding an identity-verification pass. `false` declines.
    async fn confirm_esign_consent(&self, demand: &EsignDemand) -> Result<bool, SurfaceError>;

    /// Run the sign-in dialog. `Ok(None)` when the user backs out.
    async fn request_sign_in(&self) -> Result<Option<UserIdentity>, SurfaceError>;

    /// Collect missing KYC fields. `Ok(None)` when the user backs out.
    async fn collect_profile(
        &self,
        missing: &[ProfileField],
    ) -> Result<Option<ProfileUpdate>, SurfaceError>;

    /// Let the user pick between eligible gateways. Called only with two or
    /// more options. `Ok(None)` cancels.
    async fn choose_gateway(
        &self,
        options: &[GatewayKind],
    ) -> Result<Option<GatewayKind>, SurfaceError>;

    /// Collect the payment instrument for the chosen gateway. `Ok(None)`
    /// cancels.
    async fn collect_instrument(
        &self,
        gateway: GatewayKind,
        plan: PlanType,
    ) -> Result<Option<PaymentInstrument>, SurfaceError>;

    /// Open the hosted payment overlay for a created order and wait for its
    /// callback. A user dismissal surfaces as [`SurfaceError::Dismissed`].
    async fn collect_hosted_payment(
        &self,
        order: &GatewayOrder,
        customer: &UserIdentity,
    ) -> Result<HostedCallback, SurfaceError>;

    /// Open an external signing window and hand back its handle.
    async fn open_signing(
        &self,
        url: &str,
        mode: SurfaceMode,
    ) -> Result<SigningHandle, SurfaceError>;

    /// Leave the current document for an external URL (bank authorization,
    /// UPI link, success page).
    async fn redirect(&self, url: &str) -> Result<(), SurfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn controller_close_wakes_waiter() {
        let (mut handle, controller) = SigningHandle::pair();
        assert!(!handle.is_closed());

        let waiter = tokio::spawn(async move {
            handle.wait_closed().await;
            handle
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.mark_closed();

        let handle = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn engine_close_is_visible_to_controller() {
        let (handle, controller) = SigningHandle::pair();
        handle.close();
        assert!(controller.is_closed());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn wait_closed_returns_immediately_when_already_closed() {
        let (mut handle, controller) = SigningHandle::pair();
        controller.mark_closed();
        tokio::time::timeout(Duration::from_millis(50), handle.wait_closed())
            .await
            .expect("already-closed handle must not block");
    }
}
