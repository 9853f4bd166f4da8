use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use affinity_db::{migrations, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub schema: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let schema = if database.status == "ready" {
        schema_check(&state.db_pool).await
    } else {
        HealthCheck { status: "unknown", detail: "database unreachable".to_string() }
    };
    let ready = database.status == "ready" && schema.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "affinity-server runtime initialized".to_string(),
        },
        database,
        schema,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn schema_check(pool: &DbPool) -> HealthCheck {
    match migrations::pending_count(pool).await {
        Ok(0) => HealthCheck { status: "ready", detail: "all migrations applied".to_string() },
        Ok(pending) => {
            HealthCheck { status: "degraded", detail: format!("{pending} migrations pending") }
        }
        Err(error) => HealthCheck {
            status: "degraded",
            detail: format!("could not read migration state: {error}"),
        },
    }
}
