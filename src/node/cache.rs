//! Per-adapter read caches
//!
//! Decoded payment requests and resolved peer aliases never change for a
//! given key, so each adapter keeps them for its whole lifetime. There is no
//! eviction.

use super::types::PaymentRequest;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Caches owned by one adapter instance
#[derive(Default)]
pub struct AdapterCache {
    pay_requests: Arc<RwLock<HashMap<String, PaymentRequest>>>,
    aliases: Arc<RwLock<HashMap<String, String>>>,
}

impl AdapterCache {
    /// Empty caches
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached decode result for `pay_req`
    pub async fn decoded(&self, pay_req: &str) -> Option<PaymentRequest> {
        self.pay_requests.read().await.get(pay_req).cloned()
    }

    /// Remember a decode result
    pub async fn store_decoded(&self, pay_req: &str, decoded: PaymentRequest) {
        debug!("Caching decoded payment request {}", decoded.payment_hash);
        self.pay_requests
            .write()
            .await
            .insert(pay_req.to_string(), decoded);
    }

    /// Cached alias for `pubkey`
    pub async fn alias(&self, pubkey: &str) -> Option<String> {
        self.aliases.read().await.get(pubkey).cloned()
    }

    /// Remember an alias
    pub async fn store_alias(&self, pubkey: &str, alias: String) {
        self.aliases.write().await.insert(pubkey.to_string(), alias);
    }

    /// Number of cached payment requests
    pub async fn decoded_len(&self) -> usize {
        self.pay_requests.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alias_cache() {
        let cache = AdapterCache::new();
        assert_eq!(cache.alias("02aa").await, None);
        cache.store_alias("02aa", "alice".to_string()).await;
        assert_eq!(cache.alias("02aa").await.as_deref(), Some("alice"));
    }
}
