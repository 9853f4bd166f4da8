use chrono::Utc;
use serde_json::json;

use crate::commands::{build_runtime, init_logging, load_config, CommandResult, Failure};
use affinity_core::domain::tenant::TenantId;
use affinity_db::{connect_with_config, migrations};
use affinity_engine::{AffinityError, AffinityServices, CancellationToken};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecalculateTarget {
    Tenant(String),
    All,
}

pub fn run(target: RecalculateTarget) -> CommandResult {
    let config = match load_config("recalculate") {
        Ok(config) => config,
        Err(result) => return result,
    };
    init_logging(&config.logging);
    let runtime = match build_runtime("recalculate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let pending = migrations::pending_count(&pool)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        if pending > 0 {
            pool.close().await;
            return Err((
                "schema_not_ready",
                format!("{pending} migrations pending; run `affinity migrate` first"),
                5u8,
            ));
        }

        let services = AffinityServices::sqlite(pool.clone(), &config)
            .map_err(|error| ("config_validation", error.to_string(), 2u8))?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(
                    event_name = "affinity.cli.interrupted",
                    "interrupt received; finishing in-flight pairs"
                );
                on_interrupt.cancel();
            }
        });

        let outcome = match &target {
            RecalculateTarget::Tenant(tenant_id) => {
                recalculate_tenant(&services, tenant_id, &cancel).await
            }
            RecalculateTarget::All => recalculate_all(&services, &cancel).await,
        };

        interrupt.abort();
        pool.close().await;
        outcome
    });

    match result {
        Ok((message, details)) => {
            CommandResult::success_with_details("recalculate", message, Some(details))
        }
        Err(failure) => CommandResult::from_failure("recalculate", failure),
    }
}

async fn recalculate_tenant(
    services: &AffinityServices,
    tenant_id: &str,
    cancel: &CancellationToken,
) -> Result<(String, serde_json::Value), Failure> {
    let report = services
        .recalculation
        .run_for_tenant(&TenantId(tenant_id.to_string()), Utc::now(), cancel)
        .await
        .map_err(classify)?;

    let message = format!(
        "tenant {tenant_id}: processed {}, updated {}, skipped {}, errors {}",
        report.processed, report.updated, report.skipped, report.errors
    );
    let details = json!({
        "tenant_id": tenant_id,
        "processed": report.processed,
        "updated": report.updated,
        "skipped": report.skipped,
        "errors": report.errors,
        "cancelled": report.cancelled,
    });
    Ok((message, details))
}

async fn recalculate_all(
    services: &AffinityServices,
    cancel: &CancellationToken,
) -> Result<(String, serde_json::Value), Failure> {
    let report = services.recalculation.run_scheduled(Utc::now(), cancel).await.map_err(
        |failure| {
            (
                "recalculation_aborted",
                format!("{} after {} pairs", failure.source, failure.report.processed),
                4u8,
            )
        },
    )?;

    let message = format!(
        "{} tenants: processed {}, updated {}, skipped {}, errors {}",
        report.tenants.len(),
        report.processed,
        report.updated,
        report.skipped,
        report.errors
    );
    let details = json!({
        "tenants": report.tenants.len(),
        "tenant_errors": report.tenant_errors.len(),
        "processed": report.processed,
        "updated": report.updated,
        "skipped": report.skipped,
        "errors": report.errors,
        "cancelled": report.cancelled,
    });
    Ok((message, details))
}

fn classify(error: AffinityError) -> Failure {
    match error {
        AffinityError::NotFound { .. } => ("not_found", error.to_string(), 7u8),
        AffinityError::Repository(_) => ("db_connectivity", error.to_string(), 4u8),
        other => ("recalculation", other.to_string(), 3u8),
    }
}

#[cfg(test)]
mod tests {
    use affinity_engine::AffinityError;

    use super::classify;

    #[test]
    fn missing_tenant_maps_to_not_found_exit_code() {
        let (class, message, code) =
            classify(AffinityError::NotFound { entity: "tenant", id: "t-9".to_string() });

        assert_eq!((class, code), ("not_found", 7));
        assert!(message.contains("t-9"));
    }

    #[test]
    fn other_engine_errors_are_runtime_failures() {
        let (class, _, code) =
            classify(AffinityError::NotEligible { transaction_id: "tx-1".to_string() });

        assert_eq!((class, code), ("recalculation", 3));
    }
}
