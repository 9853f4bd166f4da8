//! Customer-product cache refresh.
//!
//! A cache entry is always rebuilt from the eligible transaction history of
//! its pair, never from the product matrix, so the two stores can be checked
//! against each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use affinity_core::domain::affinity::{AffinityKey, CustomerProductAffinity};
use affinity_core::scoring::{AffinityScorer, PurchaseHistory};
use affinity_db::repositories::{AffinityCacheRepository, TransactionStore};

use crate::error::AffinityError;

#[derive(Clone, Debug, PartialEq)]
pub enum CacheUpdate {
    Updated(Box<CustomerProductAffinity>),
    /// No eligible purchase exists for the pair. Any prior entry is kept.
    Skipped,
}

#[derive(Clone)]
pub struct CacheUpdater {
    transactions: Arc<dyn TransactionStore>,
    cache: Arc<dyn AffinityCacheRepository>,
    scorer: Arc<AffinityScorer>,
}

impl CacheUpdater {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        cache: Arc<dyn AffinityCacheRepository>,
        scorer: AffinityScorer,
    ) -> Self {
        Self { transactions, cache, scorer: Arc::new(scorer) }
    }

    pub fn scorer(&self) -> &AffinityScorer {
        &self.scorer
    }

    /// Recomputes the cache entry for `key` as of `now` and replaces whatever
    /// was stored before.
    pub async fn refresh(
        &self,
        key: &AffinityKey,
        now: DateTime<Utc>,
    ) -> Result<CacheUpdate, AffinityError> {
        let purchases = self.transactions.eligible_purchases(key).await?;
        let Some(history) = PurchaseHistory::from_transactions(&purchases, &key.product_id) else {
            tracing::debug!(
                event_name = "affinity.cache.skipped",
                tenant_id = %key.tenant_id,
                customer_id = %key.customer_id,
                product_id = %key.product_id,
                "no eligible purchases for pair"
            );
            return Ok(CacheUpdate::Skipped);
        };

        // Latest line item wins for display metadata.
        let latest = purchases
            .iter()
            .rev()
            .find_map(|transaction| transaction.contribution_for(&key.product_id));
        let (product_name, product_category) = match latest {
            Some(contribution) => (contribution.product_name, contribution.category),
            None => (key.product_id.0.clone(), None),
        };

        let affinity =
            self.scorer.assess(key.clone(), product_name, product_category, &history, now);
        self.cache.upsert(&affinity).await?;

        tracing::debug!(
            event_name = "affinity.cache.updated",
            tenant_id = %key.tenant_id,
            customer_id = %key.customer_id,
            product_id = %key.product_id,
            affinity_score = affinity.affinity_score,
            segment = %affinity.customer_segment,
            engagement = %affinity.engagement_level,
            "cache entry refreshed"
        );

        Ok(CacheUpdate::Updated(Box::new(affinity)))
    }
}
