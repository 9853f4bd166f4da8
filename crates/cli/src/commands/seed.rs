use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::commands::{build_runtime, init_logging, load_config, CommandResult, Failure};
use affinity_core::config::AppConfig;
use affinity_db::{connect_with_config, migrations, DbPool, DemoSeedDataset};
use affinity_engine::AffinityServices;

#[derive(Debug, Serialize)]
struct SeedOutput {
    tenants_seeded: usize,
    transactions_seeded: usize,
    newly_recorded: usize,
    indexed: usize,
}

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(result) => return result,
    };
    init_logging(&config.logging);
    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let outcome = seed_and_index(&pool, &config).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok(output) => {
            let message = format!(
                "demo dataset ready: {} tenants, {} transactions ({} newly recorded, {} indexed)",
                output.tenants_seeded,
                output.transactions_seeded,
                output.newly_recorded,
                output.indexed
            );
            CommandResult::success_with_details("seed", message, Some(json!(output)))
        }
        Err(failure) => CommandResult::from_failure("seed", failure),
    }
}

/// Saves the demo tenants, then records each demo transaction through the
/// recorder so new paid orders flow through the incremental pipeline.
async fn seed_and_index(pool: &DbPool, config: &AppConfig) -> Result<SeedOutput, Failure> {
    let services = AffinityServices::sqlite(pool.clone(), config)
        .map_err(|error| ("config_validation", error.to_string(), 2u8))?;

    let tenants = DemoSeedDataset::tenants();
    let tenants_seeded = tenants.len();
    for tenant in tenants {
        services
            .stores
            .tenants
            .save(tenant)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
    }

    let transactions = DemoSeedDataset::transactions();
    let transactions_seeded = transactions.len();
    let mut newly_recorded = 0;
    let mut indexed = 0;
    for transaction in transactions {
        let receipt = services
            .recorder
            .record(transaction, Utc::now())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        if !receipt.duplicate {
            newly_recorded += 1;
        }
        if receipt.affinity.is_some() {
            indexed += 1;
        }
    }

    let verification = DemoSeedDataset::verify(
        services.stores.tenants.as_ref(),
        services.stores.transactions.as_ref(),
    )
    .await
    .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

    if !verification.all_present {
        return Err(("seed_verification", verification_failure_message(&verification.checks), 6u8));
    }

    Ok(SeedOutput { tenants_seeded, transactions_seeded, newly_recorded, indexed })
}

fn verification_failure_message(checks: &[(&'static str, bool)]) -> String {
    let failed_checks =
        checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
