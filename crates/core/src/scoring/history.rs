use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::affinity::PurchaseTrend;
use crate::domain::product::ProductId;
use crate::domain::transaction::Transaction;

const SECONDS_PER_DAY: f64 = 86_400.0;
const TREND_TOLERANCE: f64 = 0.10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchasePoint {
    pub order_date: DateTime<Utc>,
    pub quantity: u64,
    pub amount: Decimal,
}

/// Chronological purchases of one product by one customer. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseHistory {
    points: Vec<PurchasePoint>,
}

impl PurchaseHistory {
    pub fn new(mut points: Vec<PurchasePoint>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        points.sort_by_key(|point| point.order_date);
        Some(Self { points })
    }

    /// Builds the history of `product_id` from a customer's transactions,
    /// folding repeated lines of the same transaction into one purchase.
    pub fn from_transactions(transactions: &[Transaction], product_id: &ProductId) -> Option<Self> {
        let points = transactions
            .iter()
            .filter_map(|transaction| {
                transaction.contribution_for(product_id).map(|contribution| PurchasePoint {
                    order_date: transaction.order_date,
                    quantity: contribution.quantity,
                    amount: contribution.amount,
                })
            })
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[PurchasePoint] {
        &self.points
    }

    pub fn purchase_count(&self) -> u32 {
        u32::try_from(self.points.len()).unwrap_or(u32::MAX)
    }

    pub fn total_quantity(&self) -> u64 {
        self.points.iter().map(|point| point.quantity).sum()
    }

    pub fn total_spent(&self) -> Decimal {
        self.points.iter().map(|point| point.amount).sum()
    }

    pub fn first_purchase_date(&self) -> DateTime<Utc> {
        self.points.first().map(|point| point.order_date).unwrap_or_default()
    }

    pub fn last_purchase_date(&self) -> DateTime<Utc> {
        self.points.last().map(|point| point.order_date).unwrap_or_default()
    }

    pub fn average_quantity(&self) -> f64 {
        self.total_quantity() as f64 / self.points.len() as f64
    }

    pub fn average_order_value(&self) -> Decimal {
        self.total_spent() / Decimal::from(self.purchase_count())
    }

    /// Mean of the gaps between consecutive purchases, rounded to whole
    /// days. Zero for a single purchase.
    pub fn exact_frequency_days(&self) -> i64 {
        let gaps = self.gap_days();
        if gaps.is_empty() {
            return 0;
        }
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        mean.round() as i64
    }

    /// Whole days since the latest purchase, never negative.
    pub fn days_since_last_purchase(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_purchase_date()).num_days().max(0)
    }

    /// Compares the mean gap of the later half of the history with the
    /// earlier half. Needs at least three purchases.
    pub fn trend(&self) -> Option<PurchaseTrend> {
        let gaps = self.gap_days();
        if gaps.len() < 2 {
            return None;
        }

        let half = gaps.len() / 2;
        let earlier = mean(&gaps[..half]);
        let later = mean(&gaps[gaps.len() - half..]);

        if earlier <= f64::EPSILON {
            return Some(if later > f64::EPSILON {
                PurchaseTrend::Decreasing
            } else {
                PurchaseTrend::Stable
            });
        }

        let ratio = later / earlier;
        Some(if ratio < 1.0 - TREND_TOLERANCE {
            PurchaseTrend::Increasing
        } else if ratio > 1.0 + TREND_TOLERANCE {
            PurchaseTrend::Decreasing
        } else {
            PurchaseTrend::Stable
        })
    }

    fn gap_days(&self) -> Vec<f64> {
        self.points
            .windows(2)
            .map(|pair| (pair[1].order_date - pair[0].order_date).num_seconds() as f64 / SECONDS_PER_DAY)
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use crate::domain::affinity::PurchaseTrend;

    use super::{PurchaseHistory, PurchasePoint};

    fn history(days: &[i64]) -> PurchaseHistory {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid date");
        PurchaseHistory::new(
            days.iter()
                .map(|day| PurchasePoint {
                    order_date: base + Duration::days(*day),
                    quantity: 2,
                    amount: Decimal::new(1000, 2),
                })
                .collect(),
        )
        .expect("non-empty history")
    }

    #[test]
    fn empty_history_is_none() {
        assert!(PurchaseHistory::new(Vec::new()).is_none());
    }

    #[test]
    fn points_are_sorted_chronologically() {
        let history = history(&[60, 0, 30]);
        assert_eq!(history.first_purchase_date() + Duration::days(60), history.last_purchase_date());
    }

    #[test]
    fn frequency_is_mean_of_consecutive_gaps() {
        assert_eq!(history(&[0, 30, 60]).exact_frequency_days(), 30);
        assert_eq!(history(&[0, 10, 40]).exact_frequency_days(), 20);
        assert_eq!(history(&[0]).exact_frequency_days(), 0);
    }

    #[test]
    fn aggregates_sum_every_point() {
        let history = history(&[0, 30, 60]);
        assert_eq!(history.purchase_count(), 3);
        assert_eq!(history.total_quantity(), 6);
        assert_eq!(history.total_spent(), Decimal::new(3000, 2));
        assert_eq!(history.average_order_value(), Decimal::new(1000, 2));
        assert!((history.average_quantity() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn days_since_last_purchase_is_clamped() {
        let history = history(&[0]);
        let last = history.last_purchase_date();
        assert_eq!(history.days_since_last_purchase(last + Duration::hours(47)), 1);
        assert_eq!(history.days_since_last_purchase(last - Duration::days(3)), 0);
    }

    #[test]
    fn trend_detects_shrinking_and_growing_gaps() {
        assert_eq!(history(&[0, 30, 45, 50]).trend(), Some(PurchaseTrend::Increasing));
        assert_eq!(history(&[0, 5, 20, 50]).trend(), Some(PurchaseTrend::Decreasing));
        assert_eq!(history(&[0, 30, 60, 90]).trend(), Some(PurchaseTrend::Stable));
        assert_eq!(history(&[0, 30]).trend(), None);
    }
}
