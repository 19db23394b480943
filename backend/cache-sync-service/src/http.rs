/// Operator HTTP endpoints: health, readiness, metrics and read-only collection views
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, SyncServiceError};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::models::{EntityKind, EntityRecord};
use crate::services::cdc::{ConsumerHealth, ConsumerStatus};
use crate::store::StoreAdapter;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsRecorder>,
    pub store: Arc<dyn StoreAdapter>,
    pub consumers: Vec<Arc<ConsumerHealth>>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub metrics: MetricsSnapshot,
    pub consumers: Vec<ConsumerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    pub collection: &'static str,
    pub size: usize,
    pub records: Vec<EntityRecord>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(metrics_handler))
        .service(
            web::scope("/api/v1")
                .route("/sync/metrics", web::get().to(sync_status))
                .route("/collections/{name}", web::get().to(get_collection)),
        );
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Ready while at least one consume loop is healthy
pub async fn ready(state: web::Data<AppState>) -> HttpResponse {
    let healthy = state.consumers.is_empty() || state.consumers.iter().any(|c| c.is_healthy());

    if healthy {
        HttpResponse::Ok().body("READY")
    } else {
        let consumers: Vec<ConsumerStatus> = state.consumers.iter().map(|c| c.status()).collect();
        HttpResponse::ServiceUnavailable().json(consumers)
    }
}

pub async fn metrics_handler(state: web::Data<AppState>) -> Result<HttpResponse> {
    let body = state.metrics.render()?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

pub async fn sync_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(SyncStatusResponse {
        metrics: state.metrics.snapshot(),
        consumers: state.consumers.iter().map(|c| c.status()).collect(),
    })
}

/// Size of a collection and its first `limit` records by key
pub async fn get_collection(
    state: web::Data<AppState>,
    name: web::Path<String>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse> {
    let kind = EntityKind::from_collection(&name)
        .ok_or_else(|| SyncServiceError::NotFound(format!("Unknown collection '{}'", name)))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit > MAX_LIST_LIMIT {
        return Err(SyncServiceError::Validation(format!(
            "limit must be at most {}",
            MAX_LIST_LIMIT
        )));
    }

    let collection = kind.collection();
    let size = state.store.size(collection).await?;
    let records = state.store.list(collection, limit).await?;

    Ok(HttpResponse::Ok().json(CollectionResponse {
        collection,
        size,
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;
    use crate::models::Customer;
    use crate::store::MemoryStore;
    use actix_web::{http::StatusCode, test, App};

    async fn state_with_customers(ids: &[i64]) -> AppState {
        let store = MemoryStore::new();
        for &id in ids {
            let record: EntityRecord = Customer {
                id,
                name: Some(format!("customer-{}", id)),
                email: None,
                city: None,
            }
            .into();
            store.put("customers", id, None, record).await.unwrap();
        }

        AppState {
            metrics: Arc::new(MetricsRecorder::new()),
            store: Arc::new(store),
            consumers: vec![Arc::new(ConsumerHealth::new(0))],
        }
    }

    #[actix_web::test]
    async fn test_collection_listing_respects_limit() {
        let state = state_with_customers(&[3, 1, 2]).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/collections/customers?limit=2")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["size"], 3);
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["records"][0]["id"], 1);
    }

    #[actix_web::test]
    async fn test_unknown_collection_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with_customers(&[]).await))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/collections/widgets")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_sync_metrics_snapshot() {
        let state = state_with_customers(&[]).await;
        state.metrics.increment(MetricKind::Processed);
        state.metrics.increment(MetricKind::Inserted);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/sync/metrics")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["metrics"]["processed"], 1);
        assert_eq!(body["metrics"]["inserted"], 1);
        assert_eq!(body["consumers"][0]["healthy"], true);
    }

    #[actix_web::test]
    async fn test_ready_turns_unavailable_when_consumers_fail() {
        let state = state_with_customers(&[]).await;
        for _ in 0..crate::services::cdc::UNHEALTHY_ERROR_THRESHOLD {
            state.consumers[0].record_error();
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/ready").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
