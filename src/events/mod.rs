use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    AttemptReference, CheckoutPhase, GatewayKind, PaymentMethodKind, PlanType, SubscriptionKind,
};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the receiver is gone.
    /// Event delivery is never load-bearing for checkout correctness.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

// The events the engine emits while a session progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        product_id: Uuid,
        plan_type: PlanType,
    },
    CartItemRemoved {
        product_id: Uuid,
    },
    CartQuantityChanged {
        product_id: Uuid,
        quantity: u8,
    },
    CartMerged {
        merged_items: usize,
    },

    // Session events
    SignedIn {
        user_id: Uuid,
    },
    SignedOut {
        user_id: Uuid,
    },

    // Entitlement events
    EntitlementsResolved {
        kind: SubscriptionKind,
    },
    EntitlementsInvalidated {
        reason: String,
    },

    // eSign events
    EsignStarted {
        document_id: String,
        product_id: Uuid,
    },
    EsignCompleted {
        document_id: String,
        product_id: Uuid,
    },
    EsignFailed {
        product_id: Uuid,
        reason: String,
    },

    // Checkout events
    CheckoutStarted {
        session_id: Uuid,
    },
    CheckoutPhaseChanged {
        session_id: Uuid,
        phase: CheckoutPhase,
    },
    PaymentAttemptStarted {
        session_id: Uuid,
        attempt_id: Uuid,
        gateway: GatewayKind,
        method: Option<PaymentMethodKind>,
    },
    PaymentRedirectIssued {
        session_id: Uuid,
        subscription_id: String,
    },
    MandatePending {
        subscription_id: String,
    },
    PaymentVerified {
        session_id: Uuid,
        reference: AttemptReference,
    },
    CheckoutCompleted {
        session_id: Uuid,
    },
    CheckoutFailed {
        session_id: Uuid,
        reason: String,
        silent: bool,
    },
}

// Event handler trait for processing events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

// Consumes the session event stream and fans events out to the log handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::PaymentVerified {
                session_id,
                ref reference,
            } => {
                if let Err(e) = handle_payment_verified(session_id, reference).await {
                    warn!(
                        "Failed to handle payment verified event: session_id={}, error={}",
                        session_id, e
                    );
                }
            }
            Event::CheckoutCompleted { session_id } => {
                if let Err(e) = handle_checkout_completed(session_id).await {
                    warn!(
                        "Failed to handle checkout completed event: session_id={}, error={}",
                        session_id, e
                    );
                }
            }
            Event::CheckoutFailed {
                session_id,
                ref reason,
                silent,
            } => {
                if silent {
                    info!("Checkout {} ended silently: {}", session_id, reason);
                } else {
                    warn!("Checkout {} failed: {}", session_id, reason);
                }
            }
            Event::EsignFailed {
                product_id,
                ref reason,
            } => {
                warn!(
                    "eSign failed for product {}: {}",
                    product_id, reason
                );
            }
            Event::MandatePending { ref subscription_id } => {
                info!(
                    "Mandate {} awaiting confirmation; will be re-checked on resume",
                    subscription_id
                );
            }
            other => {
                info!("Event: {:?}", other);
            }
        }
    }

    info!("Event processing loop stopped");
}

async fn handle_payment_verified(
    session_id: Uuid,
    reference: &AttemptReference,
) -> Result<(), String> {
    info!(
        "Payment verified for session {}: reference {}",
        session_id,
        reference.id()
    );
    Ok(())
}

async fn handle_checkout_completed(session_id: Uuid) -> Result<(), String> {
    info!("Checkout {} completed", session_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        sender
            .send(Event::CheckoutStarted {
                session_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Event::CheckoutStarted { .. })
        ));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        // Must not panic or error out.
        sender
            .send_or_log(Event::CartMerged { merged_items: 2 })
            .await;
    }
}
