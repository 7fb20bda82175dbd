// Engine services. Each service is a cloneable struct over Arc-shared
// collaborators; the checkout service is the only one that drives the others.
pub mod cart;
pub mod checkout;
pub mod entitlements;
pub mod esign;
pub mod gateways;

pub use cart::{CartService, InMemoryLocalCart, LocalCartStore};
pub use checkout::{CheckoutFailure, CheckoutOutcome, CheckoutService};
pub use entitlements::{resolve, EntitlementService};
pub use esign::EsignGate;
pub use gateways::{
    DirectApiGateway, HostedCheckoutGateway, PaymentGateway, PaymentIntent, PaymentOutcome,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::ServiceError;

/// Cooperative cancellation flag shared between the orchestrator and every
/// async continuation it spawns. Once set, any continuation that resolves
/// afterwards must discard its result instead of applying stale state.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for a fresh run. Previous cancellations do not leak
    /// into a restarted checkout.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Checked after every await before the result is applied.
    pub fn guard(&self) -> Result<(), ServiceError> {
        if self.is_cancelled() {
            Err(ServiceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn guard_trips_only_after_cancel() {
        let flag = CancelFlag::new();
        assert!(flag.guard().is_ok());

        flag.cancel();
        assert_matches!(flag.guard(), Err(ServiceError::Cancelled));

        flag.reset();
        assert!(flag.guard().is_ok());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
