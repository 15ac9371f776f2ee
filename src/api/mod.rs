//! API endpoints for the adaptive throttling service.
//!
//! Runtime configuration, history views, stats and the two admin
//! one-shots (recalculate and reset) under `/api/v1/adaptive-throttling`.

use std::future::Future;
use std::sync::Arc;

use actix_web::error::InternalError;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::engine::{AdaptiveEngine, EngineError};
use crate::core::monitoring::check_health;
use crate::core::throttle_config::{FieldViolation, ThrottleConfig};
use crate::models::{Baseline, DimensionQuery, HistoryQuery};

pub struct ApiState {
    pub engine: Arc<AdaptiveEngine>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req: &HttpRequest| {
        let response = bad_request(err.to_string());
        InternalError::from_response(err, response).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _req: &HttpRequest| {
        let response = bad_request(err.to_string());
        InternalError::from_response(err, response).into()
    }))
    .service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(
                web::scope("/adaptive-throttling")
                    .service(
                        web::resource("")
                            .route(web::get().to(get_config))
                            .route(web::put().to(put_config))
                            .route(web::patch().to(patch_config))
                            .route(web::delete().to(delete_config)),
                    )
                    .service(web::resource("/patterns").route(web::get().to(list_patterns)))
                    .service(web::resource("/baselines").route(web::get().to(list_baselines)))
                    .service(web::resource("/logs").route(web::get().to(list_logs)))
                    .service(web::resource("/stats").route(web::get().to(get_stats)))
                    .service(web::resource("/recalculate").route(web::post().to(recalculate)))
                    .service(web::resource("/reset").route(web::post().to(reset))),
            ),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Error body shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Vec<String>,
}

/// Acknowledgement for admin operations
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecalculateResponse {
    pub message: String,
    pub baselines: Vec<Baseline>,
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: message,
        details: Vec::new(),
    })
}

fn describe(violation: &FieldViolation) -> String {
    format!("{}: {}", violation.field, violation.message)
}

fn error_response(err: &EngineError) -> HttpResponse {
    match err {
        EngineError::NotConfigured => HttpResponse::NotFound().json(ErrorResponse {
            error: err.to_string(),
            details: Vec::new(),
        }),
        EngineError::Validation(e) => HttpResponse::BadRequest().json(ErrorResponse {
            error: err.to_string(),
            details: e.violations().iter().map(describe).collect(),
        }),
        EngineError::InvalidQuery(_) => bad_request(err.to_string()),
        _ if err.is_retryable() => {
            error!("Retryable failure: {}", err);
            HttpResponse::ServiceUnavailable().json(ErrorResponse {
                error: err.to_string(),
                details: vec!["retry the request".to_string()],
            })
        }
        _ => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: err.to_string(),
                details: Vec::new(),
            })
        }
    }
}

/// Run an admin operation on its own task.
///
/// The handler only awaits the result; a client disconnect drops the
/// handler future but not the operation.
async fn run_detached<T, F>(operation: F) -> Result<T, HttpResponse>
where
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(&e)),
        Err(e) => {
            error!("Admin task aborted: {}", e);
            Err(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "operation aborted".to_string(),
                details: vec![e.to_string()],
            }))
        }
    }
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    let report = check_health(state.engine.store()).await;
    if report.status == "ok" {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

async fn get_config(state: web::Data<ApiState>) -> impl Responder {
    match state.engine.get_config() {
        Ok(config) => HttpResponse::Ok().json(config.as_ref()),
        Err(e) => error_response(&e),
    }
}

/// Create or replace the whole configuration
async fn put_config(
    state: web::Data<ApiState>,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let config = match ThrottleConfig::from_document(body.into_inner()) {
        Ok(config) => config,
        Err(e) => return error_response(&EngineError::from(e)),
    };
    let engine = Arc::clone(&state.engine);
    match run_detached(async move { engine.put_config(config, Utc::now()).await }).await {
        Ok(config) => HttpResponse::Ok().json(config.as_ref()),
        Err(response) => response,
    }
}

/// Merge a partial configuration over the current one
async fn patch_config(
    state: web::Data<ApiState>,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let engine = Arc::clone(&state.engine);
    let patch = body.into_inner();
    match run_detached(async move { engine.patch_config(patch, Utc::now()).await }).await {
        Ok(config) => HttpResponse::Ok().json(config.as_ref()),
        Err(response) => response,
    }
}

async fn delete_config(state: web::Data<ApiState>) -> impl Responder {
    let engine = Arc::clone(&state.engine);
    match run_detached(async move { engine.delete_config().await }).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(response) => response,
    }
}

async fn list_patterns(
    state: web::Data<ApiState>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    match state.engine.patterns(&query).await {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => error_response(&e),
    }
}

async fn list_baselines(
    state: web::Data<ApiState>,
    query: web::Query<DimensionQuery>,
) -> impl Responder {
    HttpResponse::Ok().json(state.engine.baselines(&query))
}

async fn list_logs(state: web::Data<ApiState>, query: web::Query<HistoryQuery>) -> impl Responder {
    match state.engine.logs(&query).await {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => error_response(&e),
    }
}

async fn get_stats(state: web::Data<ApiState>) -> impl Responder {
    match state.engine.stats(Utc::now()).await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => error_response(&e),
    }
}

/// Out-of-cycle baseline recalculation, optionally for one dimension
async fn recalculate(
    state: web::Data<ApiState>,
    query: web::Query<DimensionQuery>,
) -> impl Responder {
    let engine = Arc::clone(&state.engine);
    let dimension = query.dimension;
    let operation = async move { engine.recalculate_baselines(dimension, Utc::now()).await };
    match run_detached(operation).await {
        Ok(baselines) => HttpResponse::Ok().json(RecalculateResponse {
            message: format!("Recalculated {} baseline(s)", baselines.len()),
            baselines,
        }),
        Err(response) => response,
    }
}

async fn reset(state: web::Data<ApiState>) -> impl Responder {
    let engine = Arc::clone(&state.engine);
    let result = run_detached(async move {
        engine.reset_learning(Utc::now()).await;
        Ok::<(), EngineError>(())
    })
    .await;
    match result {
        Ok(()) => HttpResponse::Ok().json(MessageResponse {
            message: "Learning reset".to_string(),
        }),
        Err(response) => response,
    }
}

/// Prometheus exposition, when the recorder is installed
async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().json(ErrorResponse {
            error: "metrics are disabled".to_string(),
            details: Vec::new(),
        }),
    }
}
