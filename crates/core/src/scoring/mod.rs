//! Affinity Scoring Engine
//!
//! Converts a customer-product purchase summary into a bounded affinity
//! score, a loyalty segment, an engagement level and a predicted next
//! purchase date. Everything here is deterministic and free of I/O; the
//! thresholds live in [`ScoringConfig`] so they can be tuned from config.

mod history;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::affinity::{AffinityKey, CustomerProductAffinity, CustomerSegment, EngagementLevel};
use crate::errors::DomainError;

pub use history::{PurchaseHistory, PurchasePoint};

/// Awards `points` when the measured value is at least `at_least`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtLeastTier {
    pub at_least: u64,
    pub points: u32,
}

/// Awards `points` when the measured value is at most `at_most`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtMostTier {
    pub at_most: i64,
    pub points: u32,
}

/// Tiers ordered from the highest threshold down; first match wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtLeastTable {
    pub tiers: Vec<AtLeastTier>,
    pub fallback: u32,
}

/// Tiers ordered from the lowest threshold up; first match wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtMostTable {
    pub tiers: Vec<AtMostTier>,
    pub fallback: u32,
}

impl AtLeastTable {
    pub fn points_for(&self, value: u64) -> u32 {
        self.tiers
            .iter()
            .find(|tier| value >= tier.at_least)
            .map_or(self.fallback, |tier| tier.points)
    }

    pub fn max_points(&self) -> u32 {
        self.tiers.iter().map(|tier| tier.points).max().unwrap_or(0).max(self.fallback)
    }

    fn validate(&self, name: &str) -> Result<(), DomainError> {
        for pair in self.tiers.windows(2) {
            if pair[1].at_least >= pair[0].at_least || pair[1].points > pair[0].points {
                return Err(DomainError::InvalidScoringConfig(format!(
                    "scoring.{name} tiers must have strictly decreasing thresholds and non-increasing points"
                )));
            }
        }
        if self.tiers.last().is_some_and(|last| self.fallback > last.points) {
            return Err(DomainError::InvalidScoringConfig(format!(
                "scoring.{name}.fallback must not exceed the lowest tier"
            )));
        }
        Ok(())
    }
}

impl AtMostTable {
    pub fn points_for(&self, value: i64) -> u32 {
        self.tiers
            .iter()
            .find(|tier| value <= tier.at_most)
            .map_or(self.fallback, |tier| tier.points)
    }

    pub fn max_points(&self) -> u32 {
        self.tiers.iter().map(|tier| tier.points).max().unwrap_or(0).max(self.fallback)
    }

    fn validate(&self, name: &str) -> Result<(), DomainError> {
        for pair in self.tiers.windows(2) {
            if pair[1].at_most <= pair[0].at_most || pair[1].points > pair[0].points {
                return Err(DomainError::InvalidScoringConfig(format!(
                    "scoring.{name} tiers must have strictly increasing thresholds and non-increasing points"
                )));
            }
        }
        if self.tiers.last().is_some_and(|last| self.fallback > last.points) {
            return Err(DomainError::InvalidScoringConfig(format!(
                "scoring.{name}.fallback must not exceed the last tier"
            )));
        }
        Ok(())
    }
}

/// Minimum purchase count for each segment above `new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentThresholds {
    pub champion: u32,
    pub frequent: u32,
    pub regular: u32,
    pub occasional: u32,
}

/// Maximum days since last purchase for each level above `at_risk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementThresholds {
    pub very_high: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Purchase count sub-score.
    pub frequency: AtLeastTable,
    /// Days-since-last-purchase sub-score.
    pub recency: AtMostTable,
    /// Total quantity sub-score.
    pub quantity: AtLeastTable,
    /// Purchase interval sub-score, only awarded when an interval exists.
    pub consistency: AtMostTable,
    pub max_score: u32,
    pub segments: SegmentThresholds,
    pub engagement: EngagementThresholds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            frequency: AtLeastTable {
                tiers: vec![
                    AtLeastTier { at_least: 20, points: 40 },
                    AtLeastTier { at_least: 10, points: 35 },
                    AtLeastTier { at_least: 5, points: 25 },
                    AtLeastTier { at_least: 3, points: 15 },
                ],
                fallback: 10,
            },
            recency: AtMostTable {
                tiers: vec![
                    AtMostTier { at_most: 7, points: 30 },
                    AtMostTier { at_most: 30, points: 25 },
                    AtMostTier { at_most: 90, points: 15 },
                    AtMostTier { at_most: 180, points: 10 },
                ],
                fallback: 5,
            },
            quantity: AtLeastTable {
                tiers: vec![
                    AtLeastTier { at_least: 100, points: 20 },
                    AtLeastTier { at_least: 50, points: 15 },
                    AtLeastTier { at_least: 20, points: 10 },
                ],
                fallback: 5,
            },
            consistency: AtMostTable {
                tiers: vec![
                    AtMostTier { at_most: 30, points: 10 },
                    AtMostTier { at_most: 60, points: 7 },
                    AtMostTier { at_most: 90, points: 5 },
                ],
                fallback: 3,
            },
            max_score: 100,
            segments: SegmentThresholds { champion: 20, frequent: 11, regular: 6, occasional: 3 },
            engagement: EngagementThresholds { very_high: 7, high: 30, medium: 90, low: 180 },
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        self.frequency.validate("frequency")?;
        self.recency.validate("recency")?;
        self.quantity.validate("quantity")?;
        self.consistency.validate("consistency")?;

        if self.max_score == 0 || self.max_score > 100 {
            return Err(DomainError::InvalidScoringConfig(
                "scoring.max_score must be in range 1..=100".to_string(),
            ));
        }

        let segments = self.segments;
        let ordered = segments.champion > segments.frequent
            && segments.frequent > segments.regular
            && segments.regular > segments.occasional
            && segments.occasional >= 1;
        if !ordered {
            return Err(DomainError::InvalidScoringConfig(
                "scoring.segments must satisfy champion > frequent > regular > occasional >= 1"
                    .to_string(),
            ));
        }

        let engagement = self.engagement;
        let ordered = engagement.very_high >= 0
            && engagement.very_high < engagement.high
            && engagement.high < engagement.medium
            && engagement.medium < engagement.low;
        if !ordered {
            return Err(DomainError::InvalidScoringConfig(
                "scoring.engagement must satisfy 0 <= very_high < high < medium < low".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreInput {
    pub purchase_count: u32,
    pub days_since_last_purchase: i64,
    pub total_quantity_purchased: u64,
    pub purchase_frequency_days: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub frequency_points: u32,
    pub recency_points: u32,
    pub quantity_points: u32,
    pub consistency_points: u32,
    pub affinity_score: u32,
    pub segment: CustomerSegment,
    pub engagement_level: EngagementLevel,
}

#[derive(Clone, Debug, Default)]
pub struct AffinityScorer {
    config: ScoringConfig,
}

impl AffinityScorer {
    pub fn new(config: ScoringConfig) -> Result<Self, DomainError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, input: &ScoreInput) -> ScoreBreakdown {
        let frequency_points = self.config.frequency.points_for(u64::from(input.purchase_count));
        let recency_points = self.config.recency.points_for(input.days_since_last_purchase);
        let quantity_points = self.config.quantity.points_for(input.total_quantity_purchased);
        let consistency_points = if input.purchase_frequency_days > 0 {
            self.config.consistency.points_for(input.purchase_frequency_days)
        } else {
            0
        };

        let total = frequency_points
            .saturating_add(recency_points)
            .saturating_add(quantity_points)
            .saturating_add(consistency_points);

        ScoreBreakdown {
            frequency_points,
            recency_points,
            quantity_points,
            consistency_points,
            affinity_score: total.min(self.config.max_score),
            segment: self.segment_for(input.purchase_count),
            engagement_level: self.engagement_for(input.days_since_last_purchase),
        }
    }

    pub fn segment_for(&self, purchase_count: u32) -> CustomerSegment {
        let thresholds = &self.config.segments;
        if purchase_count >= thresholds.champion {
            CustomerSegment::Champion
        } else if purchase_count >= thresholds.frequent {
            CustomerSegment::Frequent
        } else if purchase_count >= thresholds.regular {
            CustomerSegment::Regular
        } else if purchase_count >= thresholds.occasional {
            CustomerSegment::Occasional
        } else {
            CustomerSegment::New
        }
    }

    pub fn engagement_for(&self, days_since_last_purchase: i64) -> EngagementLevel {
        let thresholds = &self.config.engagement;
        if days_since_last_purchase <= thresholds.very_high {
            EngagementLevel::VeryHigh
        } else if days_since_last_purchase <= thresholds.high {
            EngagementLevel::High
        } else if days_since_last_purchase <= thresholds.medium {
            EngagementLevel::Medium
        } else if days_since_last_purchase <= thresholds.low {
            EngagementLevel::Low
        } else {
            EngagementLevel::AtRisk
        }
    }

    pub fn predict_next_purchase(
        last_purchase_date: DateTime<Utc>,
        purchase_frequency_days: i64,
    ) -> Option<DateTime<Utc>> {
        if purchase_frequency_days <= 0 {
            return None;
        }
        last_purchase_date.checked_add_signed(Duration::days(purchase_frequency_days))
    }

    /// Builds the full cache entry for `key` from its purchase history as of
    /// `now`.
    pub fn assess(
        &self,
        key: AffinityKey,
        product_name: impl Into<String>,
        product_category: Option<String>,
        history: &PurchaseHistory,
        now: DateTime<Utc>,
    ) -> CustomerProductAffinity {
        let purchase_count = history.purchase_count();
        let exact_frequency_days = history.exact_frequency_days();
        let days_since_last_purchase = history.days_since_last_purchase(now);
        let last_purchase_date = history.last_purchase_date();

        let breakdown = self.score(&ScoreInput {
            purchase_count,
            days_since_last_purchase,
            total_quantity_purchased: history.total_quantity(),
            purchase_frequency_days: exact_frequency_days,
        });

        CustomerProductAffinity {
            key,
            product_name: product_name.into(),
            product_category,
            purchase_count,
            total_quantity_purchased: history.total_quantity(),
            total_spent: history.total_spent(),
            average_quantity: history.average_quantity(),
            average_order_value: history.average_order_value(),
            first_purchase_date: history.first_purchase_date(),
            last_purchase_date,
            exact_frequency_days,
            days_since_last_purchase,
            affinity_score: breakdown.affinity_score,
            customer_segment: breakdown.segment,
            engagement_level: breakdown.engagement_level,
            next_predicted_purchase_date: Self::predict_next_purchase(
                last_purchase_date,
                exact_frequency_days,
            ),
            purchase_trend: history.trend(),
            last_calculated: now,
        }
    }
}
