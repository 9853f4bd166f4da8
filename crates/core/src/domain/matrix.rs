//! Product-centric affinity records.
//!
//! One [`ProductAffinityMatrix`] exists per `(tenant, product)`. It owns the
//! purchase stats of every customer who bought the product and the outgoing
//! co-purchase edges to other products. Edges are stored on the source product
//! only, so the co-purchase graph is an adjacency list keyed by product id.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;
use crate::domain::product::ProductId;
use crate::domain::tenant::TenantId;
use crate::domain::transaction::{ProductContribution, Transaction};
use crate::errors::DomainError;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerPurchaseRecord {
    pub customer_id: CustomerId,
    pub total_purchase_count: u32,
    pub total_quantity_purchased: u64,
    pub total_spent: Decimal,
    pub first_purchase_date: DateTime<Utc>,
    pub last_purchase_date: DateTime<Utc>,
    pub average_order_value: Decimal,
    /// Running approximation: span between first and last purchase divided by
    /// the purchase count. The cache's exact mean gap is authoritative.
    pub approx_frequency_days: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoPurchasePattern {
    pub other_product_id: ProductId,
    pub co_purchase_count: u32,
    /// 0–100
    pub affinity_score: f64,
    pub last_co_purchase_date: DateTime<Utc>,
    pub customer_ids: BTreeSet<CustomerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductAffinityMatrix {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub product_name: String,
    pub product_categories: BTreeSet<String>,
    pub customer_purchase_matrix: Vec<CustomerPurchaseRecord>,
    /// Flat reverse-lookup index (customer -> products). Mirrors the ids in
    /// `customer_purchase_matrix`.
    pub customer_ids: Vec<CustomerId>,
    pub co_purchase_patterns: Vec<CoPurchasePattern>,
    pub total_unique_customers: u32,
    pub total_transactions: u32,
    pub total_quantity_sold: u64,
    pub total_revenue: Decimal,
    pub first_sale_date: Option<DateTime<Utc>>,
    pub last_sale_date: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, owned by the storage layer.
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

/// `min(100, co_purchase_count / total_transactions * 100)`.
pub fn co_purchase_score(co_purchase_count: u32, total_transactions: u32) -> f64 {
    if total_transactions == 0 {
        return 0.0;
    }
    (f64::from(co_purchase_count) / f64::from(total_transactions) * 100.0).min(100.0)
}

impl ProductAffinityMatrix {
    pub fn new(
        tenant_id: TenantId,
        product_id: ProductId,
        product_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            product_id,
            product_name: product_name.into(),
            product_categories: BTreeSet::new(),
            customer_purchase_matrix: Vec::new(),
            customer_ids: Vec::new(),
            co_purchase_patterns: Vec::new(),
            total_unique_customers: 0,
            total_transactions: 0,
            total_quantity_sold: 0,
            total_revenue: Decimal::ZERO,
            first_sale_date: None,
            last_sale_date: None,
            version: 0,
            last_updated: now,
        }
    }

    pub fn customer_record(&self, customer_id: &CustomerId) -> Option<&CustomerPurchaseRecord> {
        self.customer_purchase_matrix.iter().find(|record| &record.customer_id == customer_id)
    }

    pub fn co_purchase(&self, other_product_id: &ProductId) -> Option<&CoPurchasePattern> {
        self.co_purchase_patterns
            .iter()
            .find(|pattern| &pattern.other_product_id == other_product_id)
    }

    /// Applies everything `transaction` contributes to this product: the
    /// customer's purchase stats, the aggregates and the co-purchase edges to
    /// every other product in the same transaction. Returns `false` when the
    /// transaction does not reference this product. The matrix is unchanged
    /// when an amount would overflow.
    pub fn apply_transaction(
        &mut self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let contributions = transaction.contributions();
        let Some(own) = contributions.iter().find(|entry| entry.product_id == self.product_id)
        else {
            return Ok(false);
        };

        self.record_purchase(&transaction.customer_id, own, transaction.order_date)?;

        let own_id = own.product_id.clone();
        for other in contributions.iter().filter(|entry| entry.product_id != own_id) {
            self.record_co_purchase(
                &other.product_id,
                &transaction.customer_id,
                transaction.order_date,
            );
        }

        self.last_updated = now;
        Ok(true)
    }

    pub fn record_purchase(
        &mut self,
        customer_id: &CustomerId,
        contribution: &ProductContribution,
        order_date: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let position =
            self.customer_purchase_matrix.iter().position(|record| &record.customer_id == customer_id);
        let total_revenue = self
            .total_revenue
            .checked_add(contribution.amount)
            .ok_or_else(|| self.amount_overflow())?;
        let customer_spent = match position {
            Some(index) => self.customer_purchase_matrix[index]
                .total_spent
                .checked_add(contribution.amount)
                .ok_or_else(|| self.amount_overflow())?,
            None => contribution.amount,
        };

        if self.product_name.trim().is_empty() {
            self.product_name = contribution.product_name.clone();
        }
        if let Some(category) = &contribution.category {
            self.product_categories.insert(category.clone());
        }

        match position {
            Some(index) => {
                let record = &mut self.customer_purchase_matrix[index];
                record.total_purchase_count += 1;
                record.total_quantity_purchased += contribution.quantity;
                record.total_spent = customer_spent;
                record.first_purchase_date = record.first_purchase_date.min(order_date);
                record.last_purchase_date = record.last_purchase_date.max(order_date);
                record.average_order_value =
                    record.total_spent / Decimal::from(record.total_purchase_count);
                let span_seconds =
                    (record.last_purchase_date - record.first_purchase_date).num_seconds();
                record.approx_frequency_days = span_seconds as f64
                    / SECONDS_PER_DAY
                    / f64::from(record.total_purchase_count);
            }
            None => {
                self.customer_purchase_matrix.push(CustomerPurchaseRecord {
                    customer_id: customer_id.clone(),
                    total_purchase_count: 1,
                    total_quantity_purchased: contribution.quantity,
                    total_spent: customer_spent,
                    first_purchase_date: order_date,
                    last_purchase_date: order_date,
                    average_order_value: customer_spent,
                    approx_frequency_days: 0.0,
                });
                self.customer_ids.push(customer_id.clone());
                self.total_unique_customers += 1;
            }
        }

        self.total_transactions += 1;
        self.total_quantity_sold += contribution.quantity;
        self.total_revenue = total_revenue;
        self.first_sale_date =
            Some(self.first_sale_date.map_or(order_date, |first| first.min(order_date)));
        self.last_sale_date =
            Some(self.last_sale_date.map_or(order_date, |last| last.max(order_date)));

        self.refresh_co_purchase_scores();
        Ok(())
    }

    fn amount_overflow(&self) -> DomainError {
        DomainError::InvalidTransaction(format!(
            "accumulated amount for product {} exceeds the supported range",
            self.product_id
        ))
    }

    pub fn record_co_purchase(
        &mut self,
        other_product_id: &ProductId,
        customer_id: &CustomerId,
        order_date: DateTime<Utc>,
    ) {
        if other_product_id == &self.product_id {
            return;
        }

        let total_transactions = self.total_transactions;
        match self
            .co_purchase_patterns
            .iter_mut()
            .find(|pattern| &pattern.other_product_id == other_product_id)
        {
            Some(pattern) => {
                pattern.co_purchase_count += 1;
                pattern.customer_ids.insert(customer_id.clone());
                pattern.last_co_purchase_date = pattern.last_co_purchase_date.max(order_date);
                pattern.affinity_score =
                    co_purchase_score(pattern.co_purchase_count, total_transactions);
            }
            None => self.co_purchase_patterns.push(CoPurchasePattern {
                other_product_id: other_product_id.clone(),
                co_purchase_count: 1,
                affinity_score: co_purchase_score(1, total_transactions),
                last_co_purchase_date: order_date,
                customer_ids: BTreeSet::from([customer_id.clone()]),
            }),
        }
    }

    // Every edge's score depends on `total_transactions`, so a purchase
    // without co-purchases still dilutes the existing edges.
    fn refresh_co_purchase_scores(&mut self) {
        let total_transactions = self.total_transactions;
        for pattern in &mut self.co_purchase_patterns {
            pattern.affinity_score =
                co_purchase_score(pattern.co_purchase_count, total_transactions);
        }
    }

    pub fn verify_invariants(&self) -> Result<(), DomainError> {
        let unique = self.customer_purchase_matrix.len();
        if usize::try_from(self.total_unique_customers).ok() != Some(unique) {
            return Err(DomainError::InvariantViolation(format!(
                "matrix {}/{} counts {} unique customers but holds {} records",
                self.tenant_id, self.product_id, self.total_unique_customers, unique
            )));
        }

        let distinct: BTreeSet<&CustomerId> =
            self.customer_purchase_matrix.iter().map(|record| &record.customer_id).collect();
        if distinct.len() != unique {
            return Err(DomainError::InvariantViolation(format!(
                "matrix {}/{} holds duplicate customer records",
                self.tenant_id, self.product_id
            )));
        }

        if let Some(missing) =
            distinct.iter().find(|customer_id| !self.customer_ids.contains(customer_id))
        {
            return Err(DomainError::InvariantViolation(format!(
                "customer {missing} is missing from the reverse index of {}/{}",
                self.tenant_id, self.product_id
            )));
        }

        let edges: BTreeSet<&ProductId> =
            self.co_purchase_patterns.iter().map(|pattern| &pattern.other_product_id).collect();
        if edges.len() != self.co_purchase_patterns.len() {
            return Err(DomainError::InvariantViolation(format!(
                "matrix {}/{} holds duplicate co-purchase patterns",
                self.tenant_id, self.product_id
            )));
        }

        Ok(())
    }
}
