use sqlx::{sqlite::SqliteRow, Row};

use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::matrix::ProductAffinityMatrix;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;

use super::columns::{
    encode_timestamp, encode_u64, parse_decimal, parse_optional_timestamp, parse_timestamp,
    parse_u32, parse_u64,
};
use super::{MatrixRepository, RepositoryError, SaveOutcome};
use crate::DbPool;

const MATRIX_COLUMNS: &str = "m.tenant_id, m.product_id, m.product_name, m.product_categories_json,
     m.customer_purchase_matrix_json, m.co_purchase_patterns_json, m.total_unique_customers,
     m.total_transactions, m.total_quantity_sold, m.total_revenue, m.first_sale_date,
     m.last_sale_date, m.version, m.last_updated";

pub struct SqlMatrixRepository {
    pool: DbPool,
}

impl SqlMatrixRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_customer_ids(
        &self,
        mut matrix: ProductAffinityMatrix,
    ) -> Result<ProductAffinityMatrix, RepositoryError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT customer_id FROM product_affinity_customer
             WHERE tenant_id = ? AND product_id = ?
             ORDER BY position ASC",
        )
        .bind(&matrix.tenant_id.0)
        .bind(&matrix.product_id.0)
        .fetch_all(&self.pool)
        .await?;

        matrix.customer_ids = ids.into_iter().map(CustomerId).collect();
        Ok(matrix)
    }
}

#[async_trait::async_trait]
impl MatrixRepository for SqlMatrixRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<ProductAffinityMatrix>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {MATRIX_COLUMNS} FROM product_affinity_matrix m
             WHERE m.tenant_id = ? AND m.product_id = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&product_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.with_customer_ids(matrix_from_row(row)?).await?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        matrix: &ProductAffinityMatrix,
        expected_version: i64,
    ) -> Result<SaveOutcome, RepositoryError> {
        let next_version = expected_version + 1;
        let categories = serde_json::to_string(&matrix.product_categories)?;
        let customers = serde_json::to_string(&matrix.customer_purchase_matrix)?;
        let patterns = serde_json::to_string(&matrix.co_purchase_patterns)?;
        let total_quantity_sold = encode_u64("total_quantity_sold", matrix.total_quantity_sold)?;

        let mut tx = self.pool.begin().await?;

        let written = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO product_affinity_matrix (
                    tenant_id,
                    product_id,
                    product_name,
                    product_categories_json,
                    customer_purchase_matrix_json,
                    co_purchase_patterns_json,
                    total_unique_customers,
                    total_transactions,
                    total_quantity_sold,
                    total_revenue,
                    first_sale_date,
                    last_sale_date,
                    version,
                    last_updated
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(tenant_id, product_id) DO NOTHING",
            )
            .bind(&matrix.tenant_id.0)
            .bind(&matrix.product_id.0)
            .bind(&matrix.product_name)
            .bind(&categories)
            .bind(&customers)
            .bind(&patterns)
            .bind(i64::from(matrix.total_unique_customers))
            .bind(i64::from(matrix.total_transactions))
            .bind(total_quantity_sold)
            .bind(matrix.total_revenue.to_string())
            .bind(matrix.first_sale_date.map(encode_timestamp))
            .bind(matrix.last_sale_date.map(encode_timestamp))
            .bind(next_version)
            .bind(encode_timestamp(matrix.last_updated))
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE product_affinity_matrix SET
                    product_name = ?,
                    product_categories_json = ?,
                    customer_purchase_matrix_json = ?,
                    co_purchase_patterns_json = ?,
                    total_unique_customers = ?,
                    total_transactions = ?,
                    total_quantity_sold = ?,
                    total_revenue = ?,
                    first_sale_date = ?,
                    last_sale_date = ?,
                    version = ?,
                    last_updated = ?
                 WHERE tenant_id = ? AND product_id = ? AND version = ?",
            )
            .bind(&matrix.product_name)
            .bind(&categories)
            .bind(&customers)
            .bind(&patterns)
            .bind(i64::from(matrix.total_unique_customers))
            .bind(i64::from(matrix.total_transactions))
            .bind(total_quantity_sold)
            .bind(matrix.total_revenue.to_string())
            .bind(matrix.first_sale_date.map(encode_timestamp))
            .bind(matrix.last_sale_date.map(encode_timestamp))
            .bind(next_version)
            .bind(encode_timestamp(matrix.last_updated))
            .bind(&matrix.tenant_id.0)
            .bind(&matrix.product_id.0)
            .bind(expected_version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if written == 0 {
            tx.rollback().await?;
            return Ok(SaveOutcome::VersionConflict);
        }

        sqlx::query("DELETE FROM product_affinity_customer WHERE tenant_id = ? AND product_id = ?")
            .bind(&matrix.tenant_id.0)
            .bind(&matrix.product_id.0)
            .execute(&mut *tx)
            .await?;

        for (position, customer_id) in matrix.customer_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO product_affinity_customer (tenant_id, product_id, customer_id, position)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(tenant_id, product_id, customer_id) DO NOTHING",
            )
            .bind(&matrix.tenant_id.0)
            .bind(&matrix.product_id.0)
            .bind(&customer_id.0)
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(SaveOutcome::Saved { version: next_version })
    }

    async fn find_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<ProductAffinityMatrix>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MATRIX_COLUMNS}
             FROM product_affinity_matrix m
             JOIN product_affinity_customer c
               ON c.tenant_id = m.tenant_id AND c.product_id = m.product_id
             WHERE c.tenant_id = ? AND c.customer_id = ?
             ORDER BY m.product_id ASC"
        ))
        .bind(&tenant_id.0)
        .bind(&customer_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut matrices = Vec::with_capacity(rows.len());
        for row in rows {
            matrices.push(self.with_customer_ids(matrix_from_row(row)?).await?);
        }
        Ok(matrices)
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query(
            "DELETE FROM product_affinity_matrix WHERE tenant_id = ? AND product_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&product_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted > 0)
    }
}

fn matrix_from_row(row: SqliteRow) -> Result<ProductAffinityMatrix, RepositoryError> {
    let categories: String = row.try_get("product_categories_json")?;
    let customers: String = row.try_get("customer_purchase_matrix_json")?;
    let patterns: String = row.try_get("co_purchase_patterns_json")?;

    Ok(ProductAffinityMatrix {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        product_id: ProductId(row.try_get("product_id")?),
        product_name: row.try_get("product_name")?,
        product_categories: serde_json::from_str(&categories)?,
        customer_purchase_matrix: serde_json::from_str(&customers)?,
        customer_ids: Vec::new(),
        co_purchase_patterns: serde_json::from_str(&patterns)?,
        total_unique_customers: parse_u32(
            "total_unique_customers",
            row.try_get("total_unique_customers")?,
        )?,
        total_transactions: parse_u32("total_transactions", row.try_get("total_transactions")?)?,
        total_quantity_sold: parse_u64("total_quantity_sold", row.try_get("total_quantity_sold")?)?,
        total_revenue: parse_decimal("total_revenue", row.try_get("total_revenue")?)?,
        first_sale_date: parse_optional_timestamp("first_sale_date", row.try_get("first_sale_date")?)?,
        last_sale_date: parse_optional_timestamp("last_sale_date", row.try_get("last_sale_date")?)?,
        version: row.try_get("version")?,
        last_updated: parse_timestamp("last_updated", row.try_get("last_updated")?)?,
    })
}
