use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};

use affinity_core::config::RecalculationConfig;

use crate::cancel::CancellationToken;
use crate::recalculation::RecalculationJob;

/// Fixed time of day, in UTC, for the scheduled recalculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|at| Self { at })
    }

    pub fn from_config(config: &RecalculationConfig) -> Option<Self> {
        Self::new(config.schedule_hour_utc, config.schedule_minute)
    }

    /// First scheduled instant strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

/// Runs the scheduled recalculation once a day until `shutdown` fires. The
/// same token cancels a run that is in progress at shutdown.
pub async fn run_daily(
    job: Arc<RecalculationJob>,
    schedule: DailySchedule,
    shutdown: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let next_run = schedule.next_run_after(now);
        let wait = (next_run - now).to_std().unwrap_or_default();
        tracing::info!(
            event_name = "affinity.scheduler.next_run",
            next_run = %next_run.to_rfc3339(),
            wait_secs = wait.as_secs(),
            "recalculation scheduled"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(event_name = "affinity.scheduler.stopped", "scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match job.run_scheduled(Utc::now(), &shutdown).await {
            Ok(report) => tracing::info!(
                event_name = "affinity.scheduler.run_completed",
                tenants = report.tenants.len(),
                processed = report.processed,
                updated = report.updated,
                errors = report.errors,
                tenant_errors = report.tenant_errors.len(),
                cancelled = report.cancelled,
                "scheduled recalculation completed"
            ),
            Err(failure) => tracing::error!(
                event_name = "affinity.scheduler.run_failed",
                processed = failure.report.processed,
                error = %failure.source,
                "scheduled recalculation aborted"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::DailySchedule;

    #[test]
    fn next_run_is_later_today_when_time_has_not_passed() {
        let schedule = DailySchedule::new(3, 0).expect("valid time");
        let now = Utc.with_ymd_and_hms(2026, 8, 10, 1, 15, 0).single().expect("valid date");

        assert_eq!(
            schedule.next_run_after(now),
            Utc.with_ymd_and_hms(2026, 8, 10, 3, 0, 0).single().expect("valid date")
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_at_or_after_the_slot() {
        let schedule = DailySchedule::new(3, 0).expect("valid time");
        let exactly = Utc.with_ymd_and_hms(2026, 8, 31, 3, 0, 0).single().expect("valid date");

        assert_eq!(
            schedule.next_run_after(exactly),
            Utc.with_ymd_and_hms(2026, 9, 1, 3, 0, 0).single().expect("valid date")
        );
    }

    #[test]
    fn out_of_range_times_are_rejected() {
        assert!(DailySchedule::new(24, 0).is_none());
        assert!(DailySchedule::new(23, 60).is_none());
    }
}
