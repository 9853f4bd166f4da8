use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;
use crate::domain::product::ProductId;
use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

/// Loyalty tier derived from purchase count. Variants are declared in rank
/// order so `Ord` compares tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerSegment {
    New,
    Occasional,
    Regular,
    Frequent,
    Champion,
}

impl CustomerSegment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Occasional => "occasional",
            Self::Regular => "regular",
            Self::Frequent => "frequent",
            Self::Champion => "champion",
        }
    }
}

impl FromStr for CustomerSegment {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "occasional" => Ok(Self::Occasional),
            "regular" => Ok(Self::Regular),
            "frequent" => Ok(Self::Frequent),
            "champion" => Ok(Self::Champion),
            other => Err(DomainError::UnknownLiteral {
                kind: "customer segment",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CustomerSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recency bucket. Declared from least to most engaged, so a larger value
/// is a better engagement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    AtRisk,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl EngagementLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtRisk => "at_risk",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

impl FromStr for EngagementLevel {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "at_risk" => Ok(Self::AtRisk),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "very_high" => Ok(Self::VeryHigh),
            other => Err(DomainError::UnknownLiteral {
                kind: "engagement level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EngagementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseTrend {
    Increasing,
    Stable,
    Decreasing,
}

impl PurchaseTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Stable => "stable",
            Self::Decreasing => "decreasing",
        }
    }
}

impl FromStr for PurchaseTrend {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "increasing" => Ok(Self::Increasing),
            "stable" => Ok(Self::Stable),
            "decreasing" => Ok(Self::Decreasing),
            other => Err(DomainError::UnknownLiteral {
                kind: "purchase trend",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AffinityKey {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub product_id: ProductId,
}

impl AffinityKey {
    pub fn new(tenant_id: TenantId, customer_id: CustomerId, product_id: ProductId) -> Self {
        Self { tenant_id, customer_id, product_id }
    }
}

impl fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.customer_id, self.product_id)
    }
}

/// Cache entry for one `(tenant, customer, product)`. Every recompute
/// replaces the whole record; derived fields are never edited on their own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerProductAffinity {
    pub key: AffinityKey,
    pub product_name: String,
    pub product_category: Option<String>,
    pub purchase_count: u32,
    pub total_quantity_purchased: u64,
    pub total_spent: Decimal,
    pub average_quantity: f64,
    pub average_order_value: Decimal,
    pub first_purchase_date: DateTime<Utc>,
    pub last_purchase_date: DateTime<Utc>,
    /// Mean gap between consecutive purchases, rounded to whole days.
    pub exact_frequency_days: i64,
    pub days_since_last_purchase: i64,
    pub affinity_score: u32,
    pub customer_segment: CustomerSegment,
    pub engagement_level: EngagementLevel,
    pub next_predicted_purchase_date: Option<DateTime<Utc>>,
    pub purchase_trend: Option<PurchaseTrend>,
    pub last_calculated: DateTime<Utc>,
}

/// Secondary filters over the cache. Empty fields do not constrain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheQuery {
    pub min_score: Option<u32>,
    pub max_score: Option<u32>,
    pub segment: Option<CustomerSegment>,
    pub engagement_levels: Vec<EngagementLevel>,
    pub category: Option<String>,
    pub predicted_before: Option<DateTime<Utc>>,
    pub predicted_on_or_before: Option<DateTime<Utc>>,
    pub predicted_on_or_after: Option<DateTime<Utc>>,
    pub min_frequency_days: Option<i64>,
}

impl CacheQuery {
    pub fn matches(&self, affinity: &CustomerProductAffinity) -> bool {
        if self.min_score.is_some_and(|min| affinity.affinity_score < min) {
            return false;
        }
        if self.max_score.is_some_and(|max| affinity.affinity_score > max) {
            return false;
        }
        if self.segment.is_some_and(|segment| affinity.customer_segment != segment) {
            return false;
        }
        if !self.engagement_levels.is_empty()
            && !self.engagement_levels.contains(&affinity.engagement_level)
        {
            return false;
        }
        if let Some(category) = &self.category {
            if affinity.product_category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if self.min_frequency_days.is_some_and(|min| affinity.exact_frequency_days < min) {
            return false;
        }

        let has_date_filter = self.predicted_before.is_some()
            || self.predicted_on_or_before.is_some()
            || self.predicted_on_or_after.is_some();
        if has_date_filter {
            let Some(predicted) = affinity.next_predicted_purchase_date else {
                return false;
            };
            if self.predicted_before.is_some_and(|bound| predicted >= bound) {
                return false;
            }
            if self.predicted_on_or_before.is_some_and(|bound| predicted > bound) {
                return false;
            }
            if self.predicted_on_or_after.is_some_and(|bound| predicted < bound) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use crate::domain::customer::CustomerId;
    use crate::domain::product::ProductId;
    use crate::domain::tenant::TenantId;

    use super::{
        AffinityKey, CacheQuery, CustomerProductAffinity, CustomerSegment, EngagementLevel,
        PurchaseTrend,
    };

    fn entry() -> CustomerProductAffinity {
        let now = Utc::now();
        CustomerProductAffinity {
            key: AffinityKey::new(
                TenantId("t".to_string()),
                CustomerId("c".to_string()),
                ProductId("p".to_string()),
            ),
            product_name: "Coffee".to_string(),
            product_category: Some("beverages".to_string()),
            purchase_count: 6,
            total_quantity_purchased: 12,
            total_spent: Decimal::new(6000, 2),
            average_quantity: 2.0,
            average_order_value: Decimal::new(1000, 2),
            first_purchase_date: now - Duration::days(100),
            last_purchase_date: now - Duration::days(10),
            exact_frequency_days: 18,
            days_since_last_purchase: 10,
            affinity_score: 65,
            customer_segment: CustomerSegment::Regular,
            engagement_level: EngagementLevel::High,
            next_predicted_purchase_date: Some(now + Duration::days(8)),
            purchase_trend: Some(PurchaseTrend::Stable),
            last_calculated: now,
        }
    }

    #[test]
    fn segment_and_engagement_order_by_rank() {
        assert!(CustomerSegment::New < CustomerSegment::Occasional);
        assert!(CustomerSegment::Frequent < CustomerSegment::Champion);
        assert!(EngagementLevel::AtRisk < EngagementLevel::Low);
        assert!(EngagementLevel::High < EngagementLevel::VeryHigh);
    }

    #[test]
    fn literals_parse_back() {
        assert_eq!("very_high".parse::<EngagementLevel>().ok(), Some(EngagementLevel::VeryHigh));
        assert_eq!("champion".parse::<CustomerSegment>().ok(), Some(CustomerSegment::Champion));
        assert_eq!("decreasing".parse::<PurchaseTrend>().ok(), Some(PurchaseTrend::Decreasing));
        assert!("loyal".parse::<CustomerSegment>().is_err());
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(CacheQuery::default().matches(&entry()));
    }

    #[test]
    fn score_segment_and_engagement_filters_apply() {
        let affinity = entry();

        assert!(!CacheQuery { min_score: Some(70), ..CacheQuery::default() }.matches(&affinity));
        assert!(!CacheQuery { max_score: Some(60), ..CacheQuery::default() }.matches(&affinity));
        assert!(CacheQuery { segment: Some(CustomerSegment::Regular), ..CacheQuery::default() }
            .matches(&affinity));
        assert!(!CacheQuery {
            engagement_levels: vec![EngagementLevel::Low, EngagementLevel::AtRisk],
            ..CacheQuery::default()
        }
        .matches(&affinity));
        assert!(!CacheQuery { category: Some("dairy".to_string()), ..CacheQuery::default() }
            .matches(&affinity));
    }

    #[test]
    fn predicted_date_filters_exclude_entries_without_prediction() {
        let mut affinity = entry();
        let query = CacheQuery {
            predicted_on_or_before: Some(Utc::now() + Duration::days(30)),
            ..CacheQuery::default()
        };
        assert!(query.matches(&affinity));

        affinity.next_predicted_purchase_date = None;
        assert!(!query.matches(&affinity));
    }
}
