use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
use affinity_core::domain::transaction::{
    LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
};

use crate::repositories::{RecordOutcome, RepositoryError, TenantDirectory, TransactionStore};

pub const DEMO_TENANT_ID: &str = "tenant-northwind";
pub const SUSPENDED_TENANT_ID: &str = "tenant-paused";

const SEED_TENANTS: &[(&str, &str, TenantStatus)] = &[
    (DEMO_TENANT_ID, "Northwind Grocers", TenantStatus::Active),
    (SUSPENDED_TENANT_ID, "Paused Pantry", TenantStatus::Suspended),
];

/// `(product_id, product_name, category)`
const SEED_PRODUCTS: &[(&str, &str, &str)] = &[
    ("prod-coffee", "House Coffee Beans", "beverages"),
    ("prod-oat-milk", "Oat Milk 1L", "dairy"),
    ("prod-croissant", "Butter Croissant", "bakery"),
];

struct SeedLine {
    product_id: &'static str,
    quantity: u32,
    unit_price_cents: i64,
}

struct SeedTransactionContract {
    id: &'static str,
    tenant_id: &'static str,
    customer_id: &'static str,
    day: i64,
    status: TransactionStatus,
    is_paid: bool,
    lines: &'static [SeedLine],
}

const fn line(product_id: &'static str, quantity: u32, unit_price_cents: i64) -> SeedLine {
    SeedLine { product_id, quantity, unit_price_cents }
}

const SEED_TRANSACTIONS: &[SeedTransactionContract] = &[
    SeedTransactionContract {
        id: "tx-nw-001",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ana",
        day: 0,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-coffee", 1, 1000)],
    },
    SeedTransactionContract {
        id: "tx-nw-002",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ben",
        day: 10,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-coffee", 2, 1000), line("prod-croissant", 3, 250)],
    },
    SeedTransactionContract {
        id: "tx-nw-003",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-cho",
        day: 20,
        status: TransactionStatus::Refunded,
        is_paid: true,
        lines: &[line("prod-oat-milk", 2, 350)],
    },
    SeedTransactionContract {
        id: "tx-nw-004",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ana",
        day: 30,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-coffee", 1, 1000), line("prod-oat-milk", 1, 350)],
    },
    SeedTransactionContract {
        id: "tx-nw-005",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ben",
        day: 40,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-croissant", 2, 250)],
    },
    SeedTransactionContract {
        id: "tx-nw-006",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ben",
        day: 50,
        status: TransactionStatus::Pending,
        is_paid: false,
        lines: &[line("prod-croissant", 6, 250)],
    },
    SeedTransactionContract {
        id: "tx-nw-007",
        tenant_id: DEMO_TENANT_ID,
        customer_id: "cust-ana",
        day: 60,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-coffee", 1, 1000)],
    },
    SeedTransactionContract {
        id: "tx-pp-001",
        tenant_id: SUSPENDED_TENANT_ID,
        customer_id: "cust-dev",
        day: 5,
        status: TransactionStatus::Completed,
        is_paid: true,
        lines: &[line("prod-coffee", 4, 900)],
    },
];

/// Deterministic demo dataset: one active tenant with a small purchase
/// history covering repeat buyers, co-purchases, a refund and an unpaid
/// order, plus a suspended tenant the scheduled recalculation must skip.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    /// Day zero of the dataset. Transaction dates are offsets from here.
    pub fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).single().unwrap_or_default()
    }

    pub fn tenants() -> Vec<Tenant> {
        SEED_TENANTS
            .iter()
            .map(|(id, name, status)| Tenant {
                id: TenantId((*id).to_string()),
                name: (*name).to_string(),
                status: *status,
                created_at: Self::anchor() - Duration::days(30),
            })
            .collect()
    }

    /// Seed transactions in chronological order.
    pub fn transactions() -> Vec<Transaction> {
        let anchor = Self::anchor();
        SEED_TRANSACTIONS
            .iter()
            .map(|contract| {
                let order_date = anchor + Duration::days(contract.day);
                Transaction {
                    id: TransactionId(contract.id.to_string()),
                    tenant_id: TenantId(contract.tenant_id.to_string()),
                    customer_id: CustomerId(contract.customer_id.to_string()),
                    order_id: OrderId(contract.id.replacen("tx-", "ord-", 1)),
                    order_number: contract.id.replacen("tx-", "", 1).to_uppercase(),
                    order_date,
                    status: contract.status,
                    is_paid: contract.is_paid,
                    items: contract.lines.iter().map(seed_line_item).collect(),
                    created_at: order_date,
                }
            })
            .collect()
    }

    /// Writes tenants and transactions straight into the stores without
    /// running any affinity processing. Safe to call repeatedly.
    pub async fn load(
        tenants: &dyn TenantDirectory,
        store: &dyn TransactionStore,
    ) -> Result<SeedResult, RepositoryError> {
        for tenant in Self::tenants() {
            tenants.save(tenant).await?;
        }

        let mut newly_recorded = 0;
        for transaction in Self::transactions() {
            if store.record(transaction).await? == RecordOutcome::Recorded {
                newly_recorded += 1;
            }
        }

        Ok(SeedResult {
            tenants_seeded: SEED_TENANTS.len(),
            transactions_seeded: SEED_TRANSACTIONS.len(),
            newly_recorded,
        })
    }

    /// Checks that every seed tenant and transaction is present.
    pub async fn verify(
        tenants: &dyn TenantDirectory,
        store: &dyn TransactionStore,
    ) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for (id, _, status) in SEED_TENANTS {
            let found = tenants.find_by_id(&TenantId((*id).to_string())).await?;
            checks.push((*id, found.is_some_and(|tenant| tenant.status == *status)));
        }

        for transaction in Self::transactions() {
            let found = store.find_by_id(&transaction.tenant_id, &transaction.id).await?;
            let label = SEED_TRANSACTIONS
                .iter()
                .find(|contract| contract.id == transaction.id.0)
                .map_or("transaction", |contract| contract.id);
            checks.push((label, found.as_ref() == Some(&transaction)));
        }

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(VerificationResult { all_present, checks })
    }
}

fn seed_line_item(seed: &SeedLine) -> LineItem {
    let (name, category) = SEED_PRODUCTS
        .iter()
        .find(|(id, _, _)| *id == seed.product_id)
        .map_or((seed.product_id, None), |(_, name, category)| (*name, Some(*category)));
    let unit_price = Decimal::new(seed.unit_price_cents, 2);

    LineItem {
        product_id: ProductId(seed.product_id.to_string()),
        product_name: name.to_string(),
        category: category.map(str::to_string),
        quantity: seed.quantity,
        unit_price,
        total_price: unit_price * Decimal::from(seed.quantity),
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub tenants_seeded: usize,
    pub transactions_seeded: usize,
    pub newly_recorded: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
