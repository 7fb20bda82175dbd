//! Entitlement Resolver: merges raw subscription rows and the backend's
//! portfolio-access list into a single [`SubscriptionAccess`] profile.
//!
//! The resolver itself is a pure function. [`EntitlementService`] wraps it
//! with the short-TTL cache every protected view reads from, and fails closed
//! when either upstream fetch is unavailable: absence of data means no
//! access, never "unknown, so allow".

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::BackendApi;
use crate::cache::InMemoryCache;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{AccessTier, ProductKind, SubscriptionAccess, SubscriptionKind, SubscriptionRecord};

const ACCESS_CACHE_KEY: &str = "entitlements:access";

/// Resolve the access profile from the current subscription rows plus the
/// independently fetched portfolio-access list.
///
/// `portfolio_access` is carried over verbatim: portfolio products are sold
/// individually even under a premium plan, so tier never widens the set.
pub fn resolve(
    subscriptions: &[SubscriptionRecord],
    portfolio_access: &HashSet<Uuid>,
    now: DateTime<Utc>,
) -> SubscriptionAccess {
    let current: Vec<&SubscriptionRecord> = subscriptions
        .iter()
        .filter(|record| record.is_current(now))
        .collect();

    let has_basic = current
        .iter()
        .any(|record| record.tier == Some(AccessTier::Basic));
    let has_premium = current
        .iter()
        .any(|record| record.tier == Some(AccessTier::Premium));
    let has_individual = !portfolio_access.is_empty()
        || current
            .iter()
            .any(|record| record.product_type == ProductKind::Portfolio);

    let kind = if has_premium {
        SubscriptionKind::Premium
    } else if has_basic {
        SubscriptionKind::Basic
    } else if has_individual {
        SubscriptionKind::Individual
    } else {
        SubscriptionKind::None
    };

    SubscriptionAccess {
        has_basic,
        has_premium,
        portfolio_access: portfolio_access.clone(),
        kind,
    }
}

/// Cached access profile over [`resolve`].
///
/// Callers invalidate on login, logout, successful payment and explicit
/// refresh; everything else reads through the TTL cache.
#[derive(Clone)]
pub struct EntitlementService {
    backend: Arc<dyn BackendApi>,
    cache: Arc<InMemoryCache>,
    event_sender: Arc<EventSender>,
    ttl: Duration,
}

impl EntitlementService {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        cache: Arc<InMemoryCache>,
        event_sender: Arc<EventSender>,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            cache,
            event_sender,
            ttl,
        }
    }

    /// The current access profile, served from cache inside the TTL.
    ///
    /// Upstream failures resolve to the fail-closed `None` profile and are
    /// never cached, so the next read retries the backend.
    #[instrument(skip(self))]
    pub async fn current_access(&self) -> SubscriptionAccess {
        match self.cache.get(ACCESS_CACHE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<SubscriptionAccess>(&raw) {
                Ok(access) => return access,
                Err(e) => warn!("cached access profile failed to decode: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("access profile cache read failed: {}", e),
        }

        match self.fetch_and_resolve().await {
            Ok(access) => {
                if let Ok(raw) = serde_json::to_string(&access) {
                    if let Err(e) = self.cache.set(ACCESS_CACHE_KEY, &raw, Some(self.ttl)).await {
                        warn!("could not cache access profile: {}", e);
                    }
                }
                self.event_sender
                    .send_or_log(Event::EntitlementsResolved { kind: access.kind })
                    .await;
                access
            }
            Err(e) => {
                warn!("entitlement fetch failed, failing closed: {}", e);
                SubscriptionAccess::none()
            }
        }
    }

    /// Drop the cached profile. The next `current_access` hits the backend.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, reason: &str) {
        if let Err(e) = self.cache.delete(ACCESS_CACHE_KEY).await {
            warn!("access profile cache invalidation failed: {}", e);
        }
        info!(reason, "access profile invalidated");
        self.event_sender
            .send_or_log(Event::EntitlementsInvalidated {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Explicit refresh: invalidate then re-resolve.
    pub async fn refresh(&self) -> SubscriptionAccess {
        self.invalidate("explicit refresh").await;
        self.current_access().await
    }

    async fn fetch_and_resolve(&self) -> Result<SubscriptionAccess, ServiceError> {
        // The two upstream reads are independent; either failing fails the
        // whole resolve (closed).
        let (subscriptions, portfolio_ids) = futures::try_join!(
            self.backend.fetch_subscriptions(),
            self.backend.fetch_portfolio_access(),
        )?;
        let portfolio_access: HashSet<Uuid> = portfolio_ids.into_iter().collect();
        Ok(resolve(&subscriptions, &portfolio_access, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanType, Ref};
    use chrono::Duration as ChronoDuration;

    fn record(
        product_type: ProductKind,
        tier: Option<AccessTier>,
        is_active: bool,
    ) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            product_type,
            product: Ref::Id(Uuid::new_v4()),
            plan_type: PlanType::Monthly,
            tier,
            is_active,
            expires_at: Utc::now() + ChronoDuration::days(30),
            mandate_id: None,
        }
    }

    #[test]
    fn premium_outranks_basic_and_individual() {
        let subs = vec![
            record(ProductKind::Bundle, Some(AccessTier::Basic), true),
            record(ProductKind::Bundle, Some(AccessTier::Premium), true),
            record(ProductKind::Portfolio, None, true),
        ];
        let portfolio_id = Uuid::new_v4();
        let access = resolve(&subs, &HashSet::from([portfolio_id]), Utc::now());

        assert!(access.has_basic);
        assert!(access.has_premium);
        assert_eq!(access.kind, SubscriptionKind::Premium);
        assert!(access.can_view_portfolio(portfolio_id));
    }

    #[test]
    fn inactive_premium_with_active_basic_resolves_to_basic() {
        let subs = vec![
            record(ProductKind::Bundle, Some(AccessTier::Premium), false),
            record(ProductKind::Bundle, Some(AccessTier::Basic), true),
        ];
        let x = Uuid::new_v4();
        let access = resolve(&subs, &HashSet::from([x]), Utc::now());

        assert!(access.has_basic);
        assert!(!access.has_premium);
        assert_eq!(access.kind, SubscriptionKind::Basic);
        assert!(access.can_view_portfolio(x));
        assert!(!access.can_view_portfolio(Uuid::new_v4()));
    }

    #[test]
    fn premium_does_not_imply_portfolio_access() {
        let subs = vec![record(ProductKind::Bundle, Some(AccessTier::Premium), true)];
        let access = resolve(&subs, &HashSet::new(), Utc::now());

        assert!(access.has_premium);
        assert!(!access.can_view_portfolio(Uuid::new_v4()));
        assert!(access.portfolio_access.is_empty());
    }

    #[test]
    fn portfolio_only_user_is_individual() {
        let access = resolve(&[], &HashSet::from([Uuid::new_v4()]), Utc::now());
        assert!(!access.has_basic);
        assert!(!access.has_premium);
        assert_eq!(access.kind, SubscriptionKind::Individual);
    }

    #[test]
    fn nothing_active_resolves_to_none() {
        let subs = vec![record(ProductKind::Bundle, Some(AccessTier::Premium), false)];
        let access = resolve(&subs, &HashSet::new(), Utc::now());
        assert_eq!(access, SubscriptionAccess::none());
    }

    #[test]
    fn expired_rows_are_ignored_even_when_flagged_active() {
        let mut expired = record(ProductKind::Bundle, Some(AccessTier::Premium), true);
        expired.expires_at = Utc::now() - ChronoDuration::days(1);
        let access = resolve(&[expired], &HashSet::new(), Utc::now());
        assert_eq!(access.kind, SubscriptionKind::None);
    }
}
