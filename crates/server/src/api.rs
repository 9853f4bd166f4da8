use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;
use affinity_core::domain::transaction::{
    LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
};
use affinity_core::errors::{ApplicationError, DomainError, InterfaceError};
use affinity_engine::{AffinityError, AffinityServices, CancellationToken, RecordReceipt, TenantReport};

#[derive(Clone)]
pub struct ApiState {
    services: AffinityServices,
    admin_token: Option<Arc<SecretString>>,
    shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(
        services: AffinityServices,
        admin_token: Option<SecretString>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { services, admin_token: admin_token.map(Arc::new), shutdown }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordTransactionRequest {
    /// Generated when absent.
    pub transaction_id: Option<String>,
    pub customer_id: String,
    pub order_id: String,
    pub order_number: Option<String>,
    pub order_date: DateTime<Utc>,
    pub status: TransactionStatus,
    pub is_paid: bool,
    pub items: Vec<LineItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct LineItemRequest {
    pub product_id: String,
    pub product_name: String,
    pub category: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
    /// Defaults to `unit_price * quantity`.
    pub total_price: Option<Decimal>,
}

impl RecordTransactionRequest {
    fn into_transaction(
        self,
        tenant_id: TenantId,
        received_at: DateTime<Utc>,
    ) -> Result<Transaction, DomainError> {
        let id = self.transaction_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let order_number = self.order_number.unwrap_or_else(|| self.order_id.clone());
        let items = self
            .items
            .into_iter()
            .map(|item| {
                let total_price = match item.total_price {
                    Some(total) => total,
                    None => item.unit_price.checked_mul(Decimal::from(item.quantity)).ok_or_else(
                        || {
                            DomainError::InvalidTransaction(format!(
                                "line total for product {} exceeds the supported range",
                                item.product_id
                            ))
                        },
                    )?,
                };
                Ok(LineItem {
                    total_price,
                    product_id: ProductId(item.product_id),
                    product_name: item.product_name,
                    category: item.category,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        Ok(Transaction {
            id: TransactionId(id),
            tenant_id,
            customer_id: CustomerId(self.customer_id),
            order_id: OrderId(self.order_id),
            order_number,
            order_date: self.order_date,
            status: self.status,
            is_paid: self.is_paid,
            items,
            created_at: received_at,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub detail: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug)]
pub enum ApiError {
    Interface(InterfaceError),
    Unauthorized,
}

impl From<AffinityError> for ApiError {
    fn from(error: AffinityError) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        Self::Interface(ApplicationError::from(error).into_interface(correlation_id))
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        Self::from(AffinityError::from(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiErrorBody {
                    error: "A valid admin bearer token is required.".to_string(),
                    detail: None,
                    correlation_id: Uuid::new_v4().to_string(),
                },
            ),
            Self::Interface(error) => {
                let (status, detail) = match &error {
                    InterfaceError::BadRequest { message, .. } => {
                        (StatusCode::BAD_REQUEST, Some(message.clone()))
                    }
                    InterfaceError::NotFound { message, .. } => {
                        (StatusCode::NOT_FOUND, Some(message.clone()))
                    }
                    InterfaceError::ServiceUnavailable { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, None)
                    }
                    InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
                };
                if status.is_server_error() {
                    warn!(
                        event_name = "affinity.api.request_failed",
                        correlation_id = error.correlation_id(),
                        error = %error,
                        "request failed"
                    );
                }
                let body = ApiErrorBody {
                    error: error.user_message().to_string(),
                    detail,
                    correlation_id: error.correlation_id().to_string(),
                };
                (status, body)
            }
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tenants/{tenant_id}/transactions", post(record_transaction))
        .route("/admin/tenants/{tenant_id}/recalculate", post(recalculate_tenant))
        .with_state(state)
}

pub async fn record_transaction(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(request): Json<RecordTransactionRequest>,
) -> Result<(StatusCode, Json<RecordReceipt>), ApiError> {
    let now = Utc::now();
    let transaction = request.into_transaction(TenantId(tenant_id), now)?;
    let receipt = state.services.recorder.record(transaction, now).await?;

    let status = if receipt.duplicate { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(receipt)))
}

pub async fn recalculate_tenant(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TenantReport>, ApiError> {
    authorize_admin(state.admin_token.as_deref(), &headers)?;

    let tenant_id = TenantId(tenant_id);
    info!(
        event_name = "affinity.api.manual_recalculation",
        tenant_id = %tenant_id,
        "manual recalculation requested"
    );
    let report =
        state.services.recalculation.run_for_tenant(&tenant_id, Utc::now(), &state.shutdown).await?;
    Ok(Json(report))
}

/// Admin routes are open when no token is configured.
fn authorize_admin(expected: Option<&SecretString>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if token == expected.expose_secret() => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use affinity_core::config::AppConfig;
    use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
    use affinity_db::repositories::{
        InMemoryAffinityCacheRepository, InMemoryMatrixRepository, InMemoryTenantDirectory,
        InMemoryTransactionStore,
    };
    use affinity_engine::{AffinityServices, CancellationToken, Stores};

    use super::{router, ApiState};

    const ADMIN_TOKEN: &str = "admin-token-0123456789";

    async fn app() -> Router {
        let stores = Stores {
            tenants: Arc::new(InMemoryTenantDirectory::default()),
            transactions: Arc::new(InMemoryTransactionStore::default()),
            matrices: Arc::new(InMemoryMatrixRepository::default()),
            cache: Arc::new(InMemoryAffinityCacheRepository::default()),
        };
        stores
            .tenants
            .save(Tenant {
                id: TenantId("t-1".to_string()),
                name: "Harbor Books".to_string(),
                status: TenantStatus::Suspended,
                created_at: Utc::now(),
            })
            .await
            .expect("save tenant");
        let services = AffinityServices::new(stores, &AppConfig::default()).expect("wire");

        router(ApiState::new(
            services,
            Some(ADMIN_TOKEN.to_string().into()),
            CancellationToken::new(),
        ))
    }

    fn order_body(order_id: &str) -> Value {
        json!({
            "customer_id": "c-1",
            "order_id": order_id,
            "order_date": (Utc::now() - Duration::days(3)).to_rfc3339(),
            "status": "completed",
            "is_paid": true,
            "items": [
                { "product_id": "p-1", "product_name": "Atlas", "category": "maps",
                  "quantity": 2, "unit_price": "12.50" }
            ]
        })
    }

    fn post(uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
        let mut builder =
            Request::builder().method("POST").uri(uri).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn new_order_is_created_and_replay_is_reported_as_duplicate() {
        let app = app().await;

        let first = app
            .clone()
            .oneshot(post("/tenants/t-1/transactions", &order_body("o-1"), None))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::CREATED);
        let receipt = read_json(first).await;
        assert_eq!(receipt["duplicate"], false);
        assert_eq!(receipt["affinity"]["products_updated"][0]["product_id"], "p-1");

        let replay = app
            .oneshot(post("/tenants/t-1/transactions", &order_body("o-1"), None))
            .await
            .expect("response");
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(read_json(replay).await["duplicate"], true);
    }

    #[tokio::test]
    async fn unknown_tenant_and_empty_orders_are_rejected() {
        let app = app().await;

        let unknown = app
            .clone()
            .oneshot(post("/tenants/t-404/transactions", &order_body("o-1"), None))
            .await
            .expect("response");
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let body = read_json(unknown).await;
        assert!(!body["correlation_id"].as_str().unwrap_or_default().is_empty());

        let mut empty = order_body("o-2");
        empty["items"] = json!([]);
        let invalid = app
            .oneshot(post("/tenants/t-1/transactions", &empty, None))
            .await
            .expect("response");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn out_of_range_amounts_are_rejected_as_bad_requests() {
        let app = app().await;
        let max = rust_decimal::Decimal::MAX.to_string();

        let mut computed = order_body("o-3");
        computed["items"][0]["unit_price"] = json!(max);
        let response = app
            .clone()
            .oneshot(post("/tenants/t-1/transactions", &computed, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut summed = order_body("o-4");
        summed["items"] = json!([
            { "product_id": "p-1", "product_name": "Atlas", "quantity": 1,
              "unit_price": max, "total_price": max },
            { "product_id": "p-2", "product_name": "Globe", "quantity": 1,
              "unit_price": max, "total_price": max }
        ]);
        let response = app
            .oneshot(post("/tenants/t-1/transactions", &summed, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_recalculation_requires_the_bearer_token() {
        let app = app().await;
        app.clone()
            .oneshot(post("/tenants/t-1/transactions", &order_body("o-1"), None))
            .await
            .expect("response");

        let anonymous = app
            .clone()
            .oneshot(post("/admin/tenants/t-1/recalculate", &json!({}), None))
            .await
            .expect("response");
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(post("/admin/tenants/t-1/recalculate", &json!({}), Some("nope")))
            .await
            .expect("response");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let authorized = app
            .oneshot(post("/admin/tenants/t-1/recalculate", &json!({}), Some(ADMIN_TOKEN)))
            .await
            .expect("response");
        assert_eq!(authorized.status(), StatusCode::OK);
        let report = read_json(authorized).await;
        assert_eq!(report["tenant_id"], "t-1");
        assert_eq!(report["processed"], 1);
        assert_eq!(report["updated"], 1);
    }

    #[tokio::test]
    async fn admin_recalculation_of_unknown_tenant_is_not_found() {
        let response = app()
            .await
            .oneshot(post("/admin/tenants/t-404/recalculate", &json!({}), Some(ADMIN_TOKEN)))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
