//! HTTP处理器

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use lis_core::models::ResultPayload;
use lis_core::LisError;
use lis_pipeline::{IngestOutcome, IngestPipeline};
use lis_transport::Supervisor;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 共享的API状态
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<IngestPipeline>,
    pub supervisor: Arc<Supervisor>,
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 代理结果上报处理器
pub async fn recibir_json(
    State(state): State<ApiState>,
    Json(payload): Json<ResultPayload>,
) -> impl IntoResponse {
    info!(
        "payload received: station={} equipment={} values={}",
        payload.station_name,
        payload.equipment_name,
        payload.valores.len()
    );

    match state.pipeline.ingest_payload(&payload).await {
        Ok(IngestOutcome::Written(outcome)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "codigoMuestra": outcome.sample_code,
                "message": if outcome.duplicate {
                    "Resultado ya registrado"
                } else {
                    "Resultado guardado"
                },
                // 兼容老代理: codigoMuestra 也嵌在 data 里
                "data": { "codigoMuestra": outcome.sample_code },
            })),
        ),
        Ok(IngestOutcome::Queued) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Resultado en cola de espera de identificación",
            })),
        ),
        Ok(IngestOutcome::Empty) => (
            StatusCode::OK,
            Json(json!({
                "success": false,
                "message": "El payload no contiene valores",
            })),
        ),
        Err(LisError::NotFound(message)) => {
            warn!("payload rejected: {}", message);
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "message": message })),
            )
        }
        Err(e) => {
            error!("payload processing failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
        }
    }
}

/// 手动触发重试队列重放
pub async fn procesar_cola(State(state): State<ApiState>) -> impl IntoResponse {
    match state.pipeline.reprocess_pending().await {
        Ok((processed, remaining)) => {
            info!("manual queue reprocess: processed={} remaining={}", processed, remaining);
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "processed": processed,
                    "remaining": remaining,
                })),
            )
        }
        Err(e) => {
            error!("queue reprocess failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
        }
    }
}

/// 设备与队列状态查询
pub async fn estados(State(state): State<ApiState>) -> impl IntoResponse {
    let equipment = match state.pipeline.equipment_status().await {
        Ok(equipment) => equipment,
        Err(e) => {
            error!("status query failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            );
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "equipos": equipment,
            "listeners": state.supervisor.status().await,
            "cola": {
                "depth": state.pipeline.queue_depth().await,
                "oldest_age_secs": state.pipeline.queue_oldest_age_secs().await,
            },
        })),
    )
}
