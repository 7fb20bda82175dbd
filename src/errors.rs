use crate::cache::CacheError;
use crate::models::EsignDemand;
use crate::surface::SurfaceError;
use uuid::Uuid;

/// Unified error taxonomy for the engine. Services return this everywhere;
/// the orchestrator maps it to terminal checkout states at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Sign-in required")]
    AuthRequired,

    /// The backend demands an identity-verification pass before the payment
    /// call it was raised from can succeed (HTTP 412 shape).
    #[error("Identity verification required for product {}", .0.product_id)]
    EsignRequired(EsignDemand),

    /// A verification pass is already pending on the backend; the demand
    /// carries the resumable signing URL (200 + success:false shape).
    #[error("Identity verification pending for product {}", .0.product_id)]
    EsignPending(EsignDemand),

    /// A verification pass ran and ended without backend confirmation: the
    /// provider reported failure, or the window closed before completion.
    #[error("Identity verification failed: {0}")]
    EsignFailed(String),

    #[error("Item {0} is already in the cart")]
    DuplicateItem(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment rejected: {0}")]
    GatewayRejected(String),

    #[error("Verification not confirmed after {attempts} attempts")]
    VerificationTimeout { attempts: u32 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Message suitable for direct display. Internal failures collapse to a
    /// generic line so raw backend payloads never reach the user.
    /// This is the single source of truth for error copy.
    pub fn user_message(&self) -> String {
        match self {
            Self::ValidationError(msg) => msg.clone(),
            Self::AuthRequired => "Please sign in to continue".to_string(),
            Self::EsignRequired(_) | Self::EsignPending(_) => {
                "Identity verification is required to complete this purchase".to_string()
            }
            Self::EsignFailed(_) => {
                "Identity verification could not be completed. Please try again".to_string()
            }
            Self::DuplicateItem(_) => "This item is already in your cart".to_string(),
            Self::NotFound(msg) => msg.clone(),
            Self::GatewayRejected(msg) => format!("Payment failed: {}", msg),
            Self::VerificationTimeout { .. } => {
                "We could not confirm your payment yet. Please check again in a few minutes"
                    .to_string()
            }
            Self::NetworkError(_) => {
                "Something went wrong. Please check your connection and try again".to_string()
            }
            Self::Cancelled => "Payment cancelled".to_string(),
            Self::Surface(SurfaceError::PopupBlocked { .. }) => {
                "Your browser blocked the payment window. Please allow popups and retry"
                    .to_string()
            }
            Self::Surface(_) => "The payment window could not be opened".to_string(),
            Self::ConfigurationError(_)
            | Self::CacheError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Something went wrong. Please try again".to_string(),
        }
    }

    /// Whether the user may restart the flow from the consent step after this
    /// failure. Only operator-level misconfiguration is unrecoverable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConfigurationError(_))
    }

    /// Cancellations end the flow without an error toast.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The structured eSign demand, when this error carries one.
    pub fn esign_demand(&self) -> Option<&EsignDemand> {
        match self {
            Self::EsignRequired(demand) | Self::EsignPending(demand) => Some(demand),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductKind;

    fn demand() -> EsignDemand {
        EsignDemand {
            product_type: ProductKind::Bundle,
            product_id: Uuid::new_v4(),
            authentication_url: None,
        }
    }

    #[test]
    fn user_message_hides_internal_details() {
        assert_eq!(
            ServiceError::InternalError("connection pool exhausted".into()).user_message(),
            "Something went wrong. Please try again"
        );
        assert_eq!(
            ServiceError::NetworkError("dns lookup failed for api.internal".into()).user_message(),
            "Something went wrong. Please check your connection and try again"
        );
        assert_eq!(
            ServiceError::ConfigurationError("no gateway enabled".into()).user_message(),
            "Something went wrong. Please try again"
        );
    }

    #[test]
    fn user_message_keeps_user_facing_details() {
        assert_eq!(
            ServiceError::ValidationError("PAN must be 10 characters".into()).user_message(),
            "PAN must be 10 characters"
        );
        assert_eq!(
            ServiceError::GatewayRejected("card declined".into()).user_message(),
            "Payment failed: card declined"
        );
    }

    #[test]
    fn only_configuration_errors_are_unrecoverable() {
        assert!(!ServiceError::ConfigurationError("x".into()).is_retryable());
        assert!(ServiceError::GatewayRejected("declined".into()).is_retryable());
        assert!(ServiceError::VerificationTimeout { attempts: 5 }.is_retryable());
        assert!(ServiceError::Cancelled.is_retryable());
    }

    #[test]
    fn cancellation_is_silent() {
        assert!(ServiceError::Cancelled.is_silent());
        assert!(!ServiceError::GatewayRejected("declined".into()).is_silent());
    }

    #[test]
    fn esign_errors_expose_their_demand() {
        let err = ServiceError::EsignRequired(demand());
        assert!(err.esign_demand().is_some());
        assert!(ServiceError::Cancelled.esign_demand().is_none());
    }
}
