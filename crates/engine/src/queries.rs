//! Read paths over the matrix and the cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use affinity_core::domain::affinity::{
    CacheQuery, CustomerProductAffinity, CustomerSegment, EngagementLevel,
};
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::matrix::{
    CoPurchasePattern, CustomerPurchaseRecord, ProductAffinityMatrix,
};
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;
use affinity_db::repositories::{AffinityCacheRepository, MatrixRepository};

use crate::error::AffinityError;

pub const DEFAULT_TOP_LIMIT: usize = 10;
pub const DEFAULT_CO_PURCHASE_LIMIT: usize = 10;
pub const DEFAULT_AFFINITY_LIMIT: usize = 50;
pub const DEFAULT_RECOMMENDATION_LIMIT: usize = 10;

const RECOMMENDATION_MIN_SCORE: u32 = 60;
const RECOMMENDATION_WINDOW_DAYS: i64 = 7;
const AT_RISK_MIN_SCORE: u32 = 50;
const RECOMMENDATION_REASON: &str = "predicted repurchase window";

/// Filters over per-customer purchase records. Unset fields do not constrain.
#[derive(Clone, Debug, Default)]
pub struct PurchaseFilter {
    pub min_purchase_count: Option<u32>,
    pub min_total_spent: Option<Decimal>,
    pub last_purchase_from: Option<DateTime<Utc>>,
    pub last_purchase_to: Option<DateTime<Utc>>,
    /// Only applies to Customer→Products.
    pub category: Option<String>,
}

impl PurchaseFilter {
    fn matches(&self, record: &CustomerPurchaseRecord) -> bool {
        self.min_purchase_count.map_or(true, |min| record.total_purchase_count >= min)
            && self.min_total_spent.map_or(true, |min| record.total_spent >= min)
            && self.last_purchase_from.map_or(true, |from| record.last_purchase_date >= from)
            && self.last_purchase_to.map_or(true, |to| record.last_purchase_date <= to)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CoPurchaseFilter {
    pub min_affinity_score: Option<f64>,
    /// Only patterns this customer took part in.
    pub customer_id: Option<CustomerId>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct AffinityListFilter {
    pub min_score: Option<u32>,
    pub category: Option<String>,
    pub segment: Option<CustomerSegment>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProductCustomers {
    pub product_id: ProductId,
    pub product_name: String,
    /// Customers left after filtering.
    pub total_customers: usize,
    pub customers: Vec<CustomerPurchaseRecord>,
    pub total_unique_customers: u32,
    pub total_transactions: u32,
    pub total_revenue: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomerProduct {
    pub product_id: ProductId,
    pub product_name: String,
    pub product_categories: Vec<String>,
    pub purchase: CustomerPurchaseRecord,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomerProducts {
    pub customer_id: CustomerId,
    pub products: Vec<CustomerProduct>,
    pub total_products: usize,
    pub total_spent: Decimal,
    pub total_transactions: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendation {
    pub affinity: CustomerProductAffinity,
    /// Negative when the predicted date has already passed.
    pub days_until_predicted_purchase: i64,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AtRiskCustomer {
    pub affinity: CustomerProductAffinity,
    pub days_past_expected: i64,
}

pub struct AffinityQueries {
    matrices: Arc<dyn MatrixRepository>,
    cache: Arc<dyn AffinityCacheRepository>,
}

impl AffinityQueries {
    pub fn new(
        matrices: Arc<dyn MatrixRepository>,
        cache: Arc<dyn AffinityCacheRepository>,
    ) -> Self {
        Self { matrices, cache }
    }

    /// Customers of one product, highest spend first.
    pub async fn product_customers(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        filter: &PurchaseFilter,
    ) -> Result<ProductCustomers, AffinityError> {
        let matrix = self.require_matrix(tenant_id, product_id).await?;

        let mut customers: Vec<CustomerPurchaseRecord> = matrix
            .customer_purchase_matrix
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();
        customers.sort_by(|left, right| {
            right
                .total_spent
                .cmp(&left.total_spent)
                .then_with(|| left.customer_id.cmp(&right.customer_id))
        });

        Ok(ProductCustomers {
            product_id: matrix.product_id,
            product_name: matrix.product_name,
            total_customers: customers.len(),
            customers,
            total_unique_customers: matrix.total_unique_customers,
            total_transactions: matrix.total_transactions,
            total_revenue: matrix.total_revenue,
        })
    }

    /// Products one customer bought, found through the reverse index,
    /// highest spend first.
    pub async fn customer_products(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        filter: &PurchaseFilter,
    ) -> Result<CustomerProducts, AffinityError> {
        let matrices = self.matrices.find_for_customer(tenant_id, customer_id).await?;

        let mut products: Vec<CustomerProduct> = matrices
            .into_iter()
            .filter(|matrix| {
                filter
                    .category
                    .as_ref()
                    .map_or(true, |category| matrix.product_categories.contains(category))
            })
            .filter_map(|matrix| {
                let purchase = matrix.customer_record(customer_id)?.clone();
                filter.matches(&purchase).then(|| CustomerProduct {
                    product_id: matrix.product_id,
                    product_name: matrix.product_name,
                    product_categories: matrix.product_categories.into_iter().collect(),
                    purchase,
                })
            })
            .collect();
        products.sort_by(|left, right| {
            right
                .purchase
                .total_spent
                .cmp(&left.purchase.total_spent)
                .then_with(|| left.product_id.cmp(&right.product_id))
        });

        Ok(CustomerProducts {
            customer_id: customer_id.clone(),
            total_products: products.len(),
            total_spent: products.iter().map(|product| product.purchase.total_spent).sum(),
            total_transactions: products
                .iter()
                .map(|product| product.purchase.total_purchase_count)
                .sum(),
            products,
        })
    }

    pub async fn top_customers_for_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        limit: Option<usize>,
    ) -> Result<Vec<CustomerPurchaseRecord>, AffinityError> {
        let mut ranked =
            self.product_customers(tenant_id, product_id, &PurchaseFilter::default()).await?;
        ranked.customers.truncate(limit.unwrap_or(DEFAULT_TOP_LIMIT));
        Ok(ranked.customers)
    }

    pub async fn top_products_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        limit: Option<usize>,
    ) -> Result<Vec<CustomerProduct>, AffinityError> {
        let mut ranked =
            self.customer_products(tenant_id, customer_id, &PurchaseFilter::default()).await?;
        ranked.products.truncate(limit.unwrap_or(DEFAULT_TOP_LIMIT));
        Ok(ranked.products)
    }

    /// Products bought together with `product_id`, strongest first.
    pub async fn co_purchases(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        filter: &CoPurchaseFilter,
    ) -> Result<Vec<CoPurchasePattern>, AffinityError> {
        let matrix = self.require_matrix(tenant_id, product_id).await?;

        let mut patterns: Vec<CoPurchasePattern> = matrix
            .co_purchase_patterns
            .into_iter()
            .filter(|pattern| {
                filter.min_affinity_score.map_or(true, |min| pattern.affinity_score >= min)
            })
            .filter(|pattern| {
                filter
                    .customer_id
                    .as_ref()
                    .map_or(true, |customer_id| pattern.customer_ids.contains(customer_id))
            })
            .collect();
        patterns.sort_by(|left, right| {
            right
                .affinity_score
                .total_cmp(&left.affinity_score)
                .then_with(|| right.co_purchase_count.cmp(&left.co_purchase_count))
                .then_with(|| left.other_product_id.cmp(&right.other_product_id))
        });
        patterns.truncate(filter.limit.unwrap_or(DEFAULT_CO_PURCHASE_LIMIT));

        Ok(patterns)
    }

    /// Cache entries of one customer, highest score first.
    pub async fn customer_affinities(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        filter: &AffinityListFilter,
    ) -> Result<Vec<CustomerProductAffinity>, AffinityError> {
        let query = CacheQuery {
            min_score: filter.min_score,
            segment: filter.segment,
            category: filter.category.clone(),
            ..CacheQuery::default()
        };
        let mut entries = self.cache.list_for_customer(tenant_id, customer_id, &query).await?;
        entries.sort_by(|left, right| {
            right
                .affinity_score
                .cmp(&left.affinity_score)
                .then_with(|| left.key.product_id.cmp(&right.key.product_id))
        });
        entries.truncate(filter.limit.unwrap_or(DEFAULT_AFFINITY_LIMIT));
        Ok(entries)
    }

    /// Products the customer is expected to buy again within the next week,
    /// including ones already overdue.
    pub async fn predictive_recommendations(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Recommendation>, AffinityError> {
        let query = CacheQuery {
            min_score: Some(RECOMMENDATION_MIN_SCORE),
            min_frequency_days: Some(1),
            predicted_on_or_before: Some(now + Duration::days(RECOMMENDATION_WINDOW_DAYS)),
            ..CacheQuery::default()
        };
        let mut entries = self.cache.list_for_customer(tenant_id, customer_id, &query).await?;
        entries.sort_by(|left, right| {
            right
                .affinity_score
                .cmp(&left.affinity_score)
                .then_with(|| {
                    left.next_predicted_purchase_date.cmp(&right.next_predicted_purchase_date)
                })
                .then_with(|| left.key.product_id.cmp(&right.key.product_id))
        });
        entries.truncate(limit.unwrap_or(DEFAULT_RECOMMENDATION_LIMIT));

        Ok(entries
            .into_iter()
            .filter_map(|affinity| {
                let predicted = affinity.next_predicted_purchase_date?;
                Some(Recommendation {
                    days_until_predicted_purchase: (predicted - now).num_days(),
                    reason: RECOMMENDATION_REASON,
                    affinity,
                })
            })
            .collect())
    }

    /// Valuable customers of a product whose expected repurchase has passed
    /// and who have gone quiet, longest silence first.
    pub async fn at_risk_customers(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<AtRiskCustomer>, AffinityError> {
        let query = CacheQuery {
            min_score: Some(AT_RISK_MIN_SCORE),
            predicted_before: Some(now),
            engagement_levels: vec![EngagementLevel::Low, EngagementLevel::AtRisk],
            ..CacheQuery::default()
        };
        let mut entries = self.cache.list_for_product(tenant_id, product_id, &query).await?;
        entries.sort_by(|left, right| {
            right
                .days_since_last_purchase
                .cmp(&left.days_since_last_purchase)
                .then_with(|| left.key.customer_id.cmp(&right.key.customer_id))
        });
        if let Some(limit) = limit {
            entries.truncate(limit);
        }

        Ok(entries
            .into_iter()
            .filter_map(|affinity| {
                let predicted = affinity.next_predicted_purchase_date?;
                Some(AtRiskCustomer { days_past_expected: (now - predicted).num_days(), affinity })
            })
            .collect())
    }

    async fn require_matrix(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<ProductAffinityMatrix, AffinityError> {
        self.matrices.find(tenant_id, product_id).await?.ok_or_else(|| AffinityError::NotFound {
            entity: "product affinity matrix",
            id: product_id.0.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use affinity_core::config::PipelineConfig;
    use affinity_core::domain::affinity::{
        AffinityKey, CustomerProductAffinity, CustomerSegment, EngagementLevel,
    };
    use affinity_core::domain::customer::CustomerId;
    use affinity_core::domain::product::ProductId;
    use affinity_core::domain::tenant::TenantId;
    use affinity_core::domain::transaction::{
        LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
    };
    use affinity_db::repositories::{
        AffinityCacheRepository, InMemoryAffinityCacheRepository, InMemoryMatrixRepository,
        InMemoryTransactionStore,
    };

    use super::{AffinityQueries, CoPurchaseFilter, PurchaseFilter};
    use crate::error::AffinityError;
    use crate::pipeline::IncrementalUpdatePipeline;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 15, 12, 0, 0).single().expect("valid date")
    }

    fn tenant() -> TenantId {
        TenantId("t-1".to_string())
    }

    fn item(product: &str, category: &str, cents: i64) -> LineItem {
        LineItem {
            product_id: ProductId(product.to_string()),
            product_name: product.to_uppercase(),
            category: Some(category.to_string()),
            quantity: 1,
            unit_price: Decimal::new(cents, 2),
            total_price: Decimal::new(cents, 2),
        }
    }

    fn sale(id: &str, customer: &str, days_ago: i64, items: Vec<LineItem>) -> Transaction {
        Transaction {
            id: TransactionId(id.to_string()),
            tenant_id: tenant(),
            customer_id: CustomerId(customer.to_string()),
            order_id: OrderId(format!("order-{id}")),
            order_number: id.to_uppercase(),
            order_date: now() - Duration::days(days_ago),
            status: TransactionStatus::Completed,
            is_paid: true,
            items,
            created_at: now() - Duration::days(days_ago),
        }
    }

    async fn seeded_matrices() -> AffinityQueries {
        let matrices = Arc::new(InMemoryMatrixRepository::default());
        let pipeline = IncrementalUpdatePipeline::new(
            Arc::new(InMemoryTransactionStore::default()),
            matrices.clone(),
            &PipelineConfig { refresh_cache: false, max_write_retries: 3 },
        );
        for transaction in [
            sale("tx-1", "c-1", 40, vec![item("bread", "bakery", 300), item("jam", "spreads", 450)]),
            sale("tx-2", "c-2", 30, vec![item("bread", "bakery", 300)]),
            sale("tx-3", "c-2", 20, vec![item("bread", "bakery", 300), item("butter", "dairy", 200)]),
            sale("tx-4", "c-1", 10, vec![item("bread", "bakery", 300), item("jam", "spreads", 450)]),
        ] {
            pipeline.apply(&transaction, now()).await.expect("apply");
        }
        AffinityQueries::new(matrices, Arc::new(InMemoryAffinityCacheRepository::default()))
    }

    fn cached(
        customer: &str,
        product: &str,
        score: u32,
        predicted_in_days: Option<i64>,
        days_since: i64,
        level: EngagementLevel,
    ) -> CustomerProductAffinity {
        CustomerProductAffinity {
            key: AffinityKey::new(
                tenant(),
                CustomerId(customer.to_string()),
                ProductId(product.to_string()),
            ),
            product_name: product.to_string(),
            product_category: Some("pantry".to_string()),
            purchase_count: 6,
            total_quantity_purchased: 6,
            total_spent: Decimal::new(6000, 2),
            average_quantity: 1.0,
            average_order_value: Decimal::new(1000, 2),
            first_purchase_date: now() - Duration::days(200),
            last_purchase_date: now() - Duration::days(days_since),
            exact_frequency_days: 30,
            days_since_last_purchase: days_since,
            affinity_score: score,
            customer_segment: CustomerSegment::Regular,
            engagement_level: level,
            next_predicted_purchase_date: predicted_in_days.map(|days| now() + Duration::days(days)),
            purchase_trend: None,
            last_calculated: now(),
        }
    }

    #[tokio::test]
    async fn product_customers_sort_by_spend_and_filter() {
        let queries = seeded_matrices().await;

        let all = queries
            .product_customers(&tenant(), &ProductId("bread".to_string()), &PurchaseFilter::default())
            .await
            .expect("customers");
        assert_eq!(all.total_customers, 2);
        let spent: Vec<Decimal> = all.customers.iter().map(|record| record.total_spent).collect();
        assert_eq!(spent, vec![Decimal::new(600, 2), Decimal::new(600, 2)]);
        assert_eq!(all.total_unique_customers, 2);
        assert_eq!(all.total_transactions, 4);
        assert_eq!(all.total_revenue, Decimal::new(1200, 2));

        let repeat = queries
            .product_customers(
                &tenant(),
                &ProductId("jam".to_string()),
                &PurchaseFilter { min_purchase_count: Some(2), ..PurchaseFilter::default() },
            )
            .await
            .expect("customers");
        assert_eq!(repeat.customers.len(), 1);
        assert_eq!(repeat.customers[0].customer_id, CustomerId("c-1".to_string()));
        assert_eq!(repeat.total_unique_customers, 1);
        assert_eq!(repeat.total_transactions, 2);
        assert_eq!(repeat.total_revenue, Decimal::new(900, 2));

        let missing = queries
            .product_customers(&tenant(), &ProductId("ghost".to_string()), &PurchaseFilter::default())
            .await
            .expect_err("unknown product");
        assert!(matches!(missing, AffinityError::NotFound { .. }));
    }

    #[tokio::test]
    async fn customer_products_use_reverse_index_and_category() {
        let queries = seeded_matrices().await;
        let customer = CustomerId("c-1".to_string());

        let all = queries
            .customer_products(&tenant(), &customer, &PurchaseFilter::default())
            .await
            .expect("products");
        let ids: Vec<&str> = all.products.iter().map(|entry| entry.product_id.0.as_str()).collect();
        assert_eq!(ids, vec!["jam", "bread"]);
        assert_eq!(all.total_products, 2);
        assert_eq!(all.total_spent, Decimal::new(1500, 2));
        assert_eq!(all.total_transactions, 4);

        let spreads = queries
            .customer_products(
                &tenant(),
                &customer,
                &PurchaseFilter { category: Some("spreads".to_string()), ..PurchaseFilter::default() },
            )
            .await
            .expect("products");
        assert_eq!(spreads.total_products, 1);

        let top = queries.top_products_for_customer(&tenant(), &customer, Some(1)).await.expect("top");
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].product_id, ProductId("jam".to_string()));
    }

    #[tokio::test]
    async fn co_purchases_rank_and_filter_by_customer() {
        let queries = seeded_matrices().await;
        let bread = ProductId("bread".to_string());

        let patterns =
            queries.co_purchases(&tenant(), &bread, &CoPurchaseFilter::default()).await.expect("patterns");
        let others: Vec<&str> =
            patterns.iter().map(|pattern| pattern.other_product_id.0.as_str()).collect();
        assert_eq!(others, vec!["jam", "butter"]);
        assert!(patterns[0].affinity_score > patterns[1].affinity_score);

        let for_c2 = queries
            .co_purchases(
                &tenant(),
                &bread,
                &CoPurchaseFilter {
                    customer_id: Some(CustomerId("c-2".to_string())),
                    ..CoPurchaseFilter::default()
                },
            )
            .await
            .expect("patterns");
        assert_eq!(for_c2.len(), 1);
        assert_eq!(for_c2[0].other_product_id, ProductId("butter".to_string()));

        let capped = queries
            .co_purchases(&tenant(), &bread, &CoPurchaseFilter { limit: Some(1), ..CoPurchaseFilter::default() })
            .await
            .expect("patterns");
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn recommendations_cover_the_next_week_best_first() {
        let cache = Arc::new(InMemoryAffinityCacheRepository::default());
        for entry in [
            cached("c-1", "coffee", 85, Some(3), 27, EngagementLevel::High),
            cached("c-1", "tea", 85, Some(-2), 32, EngagementLevel::Medium),
            cached("c-1", "sugar", 70, Some(6), 24, EngagementLevel::High),
            cached("c-1", "flour", 90, Some(20), 10, EngagementLevel::High),
            cached("c-1", "salt", 40, Some(1), 29, EngagementLevel::High),
        ] {
            cache.upsert(&entry).await.expect("upsert");
        }
        let queries = AffinityQueries::new(Arc::new(InMemoryMatrixRepository::default()), cache);

        let recommendations = queries
            .predictive_recommendations(&tenant(), &CustomerId("c-1".to_string()), now(), None)
            .await
            .expect("recommendations");

        let products: Vec<&str> = recommendations
            .iter()
            .map(|entry| entry.affinity.key.product_id.0.as_str())
            .collect();
        assert_eq!(products, vec!["tea", "coffee", "sugar"]);
        assert_eq!(recommendations[0].days_until_predicted_purchase, -2);
        assert_eq!(recommendations[1].days_until_predicted_purchase, 3);
        assert_eq!(recommendations[0].reason, "predicted repurchase window");
    }

    #[tokio::test]
    async fn at_risk_lists_quiet_valuable_customers() {
        let cache = Arc::new(InMemoryAffinityCacheRepository::default());
        for entry in [
            cached("c-1", "rice", 60, Some(-40), 120, EngagementLevel::Low),
            cached("c-2", "rice", 55, Some(-90), 200, EngagementLevel::AtRisk),
            cached("c-3", "rice", 80, Some(-5), 35, EngagementLevel::Medium),
            cached("c-4", "rice", 45, Some(-100), 250, EngagementLevel::AtRisk),
            cached("c-5", "rice", 70, Some(10), 150, EngagementLevel::Low),
        ] {
            cache.upsert(&entry).await.expect("upsert");
        }
        let queries = AffinityQueries::new(Arc::new(InMemoryMatrixRepository::default()), cache);

        let at_risk = queries
            .at_risk_customers(&tenant(), &ProductId("rice".to_string()), now(), None)
            .await
            .expect("at risk");

        let customers: Vec<&str> =
            at_risk.iter().map(|entry| entry.affinity.key.customer_id.0.as_str()).collect();
        assert_eq!(customers, vec!["c-2", "c-1"]);
        assert_eq!(at_risk[0].days_past_expected, 90);
    }
}
