//! eSign Gate: the identity-verification sub-machine a payment attempt
//! suspends on when the backend raises `ESIGN_REQUIRED` or `ESIGN_PENDING`.
//!
//! Per attempt the gate walks `Idle → ConsentShown → SigningInProgress →
//! {Completed | Failed | Cancelled}`. While signing it watches two
//! independent event sources — a fixed-interval status poll and the external
//! window's closed signal — and feeds both into one status check. The
//! backend status is the single source of truth: a closed window without a
//! completed status is a failure, never an assumed success.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::backend::BackendApi;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{EsignArtifact, EsignDemand, EsignDocument, EsignPhase, EsignStatus};
use crate::services::CancelFlag;
use crate::surface::{CheckoutSurface, SigningHandle, SurfaceError, SurfaceMode};

#[derive(Clone)]
pub struct EsignGate {
    backend: Arc<dyn BackendApi>,
    surface: Arc<dyn CheckoutSurface>,
    event_sender: Arc<EventSender>,
    poll_interval: Duration,
    max_poll_attempts: u32,
    completion_grace: Duration,
    phase_tx: Arc<watch::Sender<EsignPhase>>,
}

impl EsignGate {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        surface: Arc<dyn CheckoutSurface>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(EsignPhase::Idle);
        Self {
            backend,
            surface,
            event_sender,
            poll_interval: config.esign_poll_interval(),
            max_poll_attempts: config.esign.max_poll_attempts,
            completion_grace: config.esign_completion_grace(),
            phase_tx: Arc::new(phase_tx),
        }
    }

    /// Observable phase of the in-flight verification attempt.
    pub fn phase(&self) -> watch::Receiver<EsignPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: EsignPhase) {
        let _ = self.phase_tx.send(phase);
    }

    /// Run one verification pass for the demanded product and return the
    /// backend-confirmed artifact.
    ///
    /// If the backend already holds a completed artifact covering the same
    /// `(product_type, product_id)` the pass is skipped outright. When the
    /// demand carries a resumable `authentication_url` (the already-pending
    /// shape) the existing document is reused instead of creating a new one.
    /// A declined consent or a tripped cancel flag ends the pass with
    /// `Cancelled` and no partial state: the next call starts from `Idle`.
    #[instrument(skip(self, demand, cancel), fields(product_id = %demand.product_id))]
    pub async fn start_verification(
        &self,
        demand: &EsignDemand,
        cancel: &CancelFlag,
    ) -> Result<EsignArtifact, ServiceError> {
        self.set_phase(EsignPhase::Idle);

        let held = self.backend.fetch_esign_artifacts().await?;
        cancel.guard().map_err(|e| self.cancelled(e))?;
        if let Some(artifact) = held
            .iter()
            .find(|a| a.covers(demand.product_type, demand.product_id))
        {
            info!(document_id = %artifact.document_id, "completed artifact already held, skipping verification");
            self.set_phase(EsignPhase::Completed);
            return Ok(artifact.clone());
        }

        self.set_phase(EsignPhase::ConsentShown);
        let consented = self.surface.confirm_esign_consent(demand).await?;
        cancel.guard().map_err(|e| self.cancelled(e))?;
        if !consented {
            return Err(self.cancelled(ServiceError::Cancelled));
        }

        let document = self.obtain_document(demand, &held).await?;
        cancel.guard().map_err(|e| self.cancelled(e))?;

        self.set_phase(EsignPhase::SigningInProgress);
        self.event_sender
            .send_or_log(Event::EsignStarted {
                document_id: document.document_id.clone(),
                product_id: demand.product_id,
            })
            .await;

        let handle = self.open_signing_surface(&document.signing_url).await?;
        cancel.guard().map_err(|e| self.cancelled(e))?;

        match self.await_confirmation(&document, handle, cancel).await {
            Ok(artifact) => {
                self.set_phase(EsignPhase::Completed);
                self.event_sender
                    .send_or_log(Event::EsignCompleted {
                        document_id: artifact.document_id.clone(),
                        product_id: demand.product_id,
                    })
                    .await;
                Ok(artifact)
            }
            Err(e) => {
                let phase = if matches!(e, ServiceError::Cancelled) {
                    EsignPhase::Cancelled
                } else {
                    EsignPhase::Failed
                };
                self.set_phase(phase);
                if phase == EsignPhase::Failed {
                    self.event_sender
                        .send_or_log(Event::EsignFailed {
                            product_id: demand.product_id,
                            reason: e.to_string(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Reuse the pending document when the demand carries its resumable
    /// signing URL; otherwise create a fresh one.
    async fn obtain_document(
        &self,
        demand: &EsignDemand,
        held: &[EsignArtifact],
    ) -> Result<EsignDocument, ServiceError> {
        if let Some(url) = &demand.authentication_url {
            let pending = held.iter().find(|a| {
                a.status == EsignStatus::Pending
                    && a.product_type == demand.product_type
                    && a.product_id == demand.product_id
            });
            if let Some(artifact) = pending {
                info!(document_id = %artifact.document_id, "resuming pending signing document");
                return Ok(EsignDocument {
                    document_id: artifact.document_id.clone(),
                    signing_url: url.clone(),
                });
            }
            warn!("demand carried a resume url but no pending artifact was found; creating a new document");
        }
        self.backend
            .create_esign_document(demand)
            .await
            .map_err(|e| {
                self.set_phase(EsignPhase::Failed);
                e
            })
    }

    /// Open the signing window, falling back to same-tab presentation when
    /// the host blocks popups. Only a blocked same-tab attempt is terminal.
    async fn open_signing_surface(&self, url: &str) -> Result<SigningHandle, ServiceError> {
        match self.surface.open_signing(url, SurfaceMode::Popup).await {
            Ok(handle) => Ok(handle),
            Err(SurfaceError::PopupBlocked { url }) => {
                warn!("popup blocked, retrying in same-tab mode");
                self.surface
                    .open_signing(&url, SurfaceMode::SameTab)
                    .await
                    .map_err(|e| {
                        self.set_phase(EsignPhase::Failed);
                        ServiceError::Surface(e)
                    })
            }
            Err(e) => {
                self.set_phase(EsignPhase::Failed);
                Err(ServiceError::Surface(e))
            }
        }
    }

    /// Poll the status endpoint on a fixed interval and watch for the window
    /// closing; either signal triggers a status check. Bounded; on completion
    /// the window is held open for a short grace period before closing.
    async fn await_confirmation(
        &self,
        document: &EsignDocument,
        mut handle: SigningHandle,
        cancel: &CancelFlag,
    ) -> Result<EsignArtifact, ServiceError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it so
        // the user has a chance to sign before the first check.
        interval.tick().await;

        for _attempt in 0..self.max_poll_attempts {
            tokio::select! {
                _ = interval.tick() => {}
                _ = handle.wait_closed() => {}
            }

            if cancel.is_cancelled() {
                handle.close();
                return Err(ServiceError::Cancelled);
            }

            let artifact = self.backend.esign_status(&document.document_id).await?;
            if cancel.is_cancelled() {
                handle.close();
                return Err(ServiceError::Cancelled);
            }

            match artifact.status {
                EsignStatus::Completed => {
                    // Leave the provider's confirmation screen up briefly.
                    tokio::time::sleep(self.completion_grace).await;
                    handle.close();
                    return Ok(artifact);
                }
                EsignStatus::Failed => {
                    handle.close();
                    return Err(ServiceError::EsignFailed(
                        "the signing provider reported failure".to_string(),
                    ));
                }
                EsignStatus::Pending => {
                    // A closed window that never reached completion is a
                    // failure, not an assumed success.
                    if handle.is_closed() {
                        return Err(ServiceError::EsignFailed(
                            "the signing window was closed before completion".to_string(),
                        ));
                    }
                }
            }
        }

        handle.close();
        Err(ServiceError::VerificationTimeout {
            attempts: self.max_poll_attempts,
        })
    }

    fn cancelled(&self, e: ServiceError) -> ServiceError {
        self.set_phase(EsignPhase::Cancelled);
        e
    }
}
