//! Session-scoped persistence that survives full-page redirects and reloads.
//!
//! Mandate flows leave the document for a bank page and come back with
//! nothing but this store, so the correlation record written here is the
//! only way to resume verification. The in-memory implementation stands in
//! for the host's session storage.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::ServiceError;
use crate::models::PendingVerification;

const PENDING_VERIFICATION_KEY: &str = "checkout:pending_verification";

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), ServiceError>;
    async fn remove(&self, key: &str) -> Result<(), ServiceError>;
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    entries: DashMap<String, String>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), ServiceError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ServiceError> {
        self.entries.remove(key);
        Ok(())
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn SessionStore,
    key: &str,
    value: &T,
) -> Result<(), ServiceError> {
    let data = serde_json::to_string(value)?;
    store.put(key, &data).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn SessionStore,
    key: &str,
) -> Result<Option<T>, ServiceError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_pending_verification(
    store: &dyn SessionStore,
    pending: &PendingVerification,
) -> Result<(), ServiceError> {
    put_json(store, PENDING_VERIFICATION_KEY, pending).await
}

pub async fn load_pending_verification(
    store: &dyn SessionStore,
) -> Result<Option<PendingVerification>, ServiceError> {
    get_json(store, PENDING_VERIFICATION_KEY).await
}

pub async fn clear_pending_verification(store: &dyn SessionStore) -> Result<(), ServiceError> {
    store.remove(PENDING_VERIFICATION_KEY).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GatewayKind, PaymentMethodKind};
    use chrono::Utc;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let store = InMemorySessionStore::new();
        store.put("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pending_verification_survives_serialization() {
        let store = InMemorySessionStore::new();
        let pending = PendingVerification {
            subscription_id: "sub_9001".to_string(),
            gateway: GatewayKind::DirectApi,
            method: PaymentMethodKind::NetbankingMandate,
            created_at: Utc::now(),
        };

        save_pending_verification(&store, &pending).await.unwrap();
        let loaded = load_pending_verification(&store).await.unwrap();
        assert_eq!(loaded, Some(pending));

        clear_pending_verification(&store).await.unwrap();
        assert_eq!(load_pending_verification(&store).await.unwrap(), None);
    }
}
