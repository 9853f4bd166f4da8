use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;
use crate::domain::product::ProductId;
use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(DomainError::UnknownLiteral {
                kind: "transaction status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub category: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

/// A completed purchase event. Immutable once recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub order_id: OrderId,
    pub order_number: String,
    pub order_date: DateTime<Utc>,
    pub status: TransactionStatus,
    pub is_paid: bool,
    pub items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
}

/// What one transaction contributes to one product: every line item for that
/// product folded into a single purchase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductContribution {
    pub product_id: ProductId,
    pub product_name: String,
    pub category: Option<String>,
    pub quantity: u64,
    pub amount: Decimal,
}

impl Transaction {
    /// Paid and not reversed. Only these feed the affinity index.
    pub fn is_eligible(&self) -> bool {
        self.is_paid
            && !matches!(self.status, TransactionStatus::Cancelled | TransactionStatus::Refunded)
    }

    /// Structural checks applied before a transaction is recorded.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.items.is_empty() {
            return Err(DomainError::InvalidTransaction(format!(
                "transaction {} has no line items",
                self.id
            )));
        }
        for item in &self.items {
            if item.product_id.0.trim().is_empty() {
                return Err(DomainError::InvalidTransaction(format!(
                    "transaction {} has a line item without product id",
                    self.id
                )));
            }
            if item.quantity == 0 {
                return Err(DomainError::InvalidTransaction(format!(
                    "transaction {} has a zero quantity line for product {}",
                    self.id, item.product_id
                )));
            }
            if item.total_price.is_sign_negative() {
                return Err(DomainError::InvalidTransaction(format!(
                    "transaction {} has a negative total for product {}",
                    self.id, item.product_id
                )));
            }
        }
        if self.checked_total_amount().is_none() {
            return Err(DomainError::InvalidTransaction(format!(
                "transaction {} total exceeds the supported amount range",
                self.id
            )));
        }
        Ok(())
    }

    /// `None` when the line totals overflow.
    pub fn checked_total_amount(&self) -> Option<Decimal> {
        self.items.iter().try_fold(Decimal::ZERO, |total, item| total.checked_add(item.total_price))
    }

    pub fn total_amount(&self) -> Decimal {
        self.items.iter().map(|item| item.total_price).sum()
    }

    /// Per-product contributions in order of first appearance.
    pub fn contributions(&self) -> Vec<ProductContribution> {
        let mut contributions: Vec<ProductContribution> = Vec::new();

        for item in &self.items {
            match contributions.iter_mut().find(|entry| entry.product_id == item.product_id) {
                Some(entry) => {
                    entry.quantity += u64::from(item.quantity);
                    entry.amount += item.total_price;
                    if entry.category.is_none() {
                        entry.category = item.category.clone();
                    }
                }
                None => contributions.push(ProductContribution {
                    product_id: item.product_id.clone(),
                    product_name: item.product_name.clone(),
                    category: item.category.clone(),
                    quantity: u64::from(item.quantity),
                    amount: item.total_price,
                }),
            }
        }

        contributions
    }

    pub fn contribution_for(&self, product_id: &ProductId) -> Option<ProductContribution> {
        self.contributions().into_iter().find(|entry| &entry.product_id == product_id)
    }

    pub fn distinct_product_ids(&self) -> Vec<ProductId> {
        self.contributions().into_iter().map(|entry| entry.product_id).collect()
    }

    pub fn contains_product(&self, product_id: &ProductId) -> bool {
        self.items.iter().any(|item| &item.product_id == product_id)
    }
}
