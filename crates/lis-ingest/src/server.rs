//! 接收端Web服务器

use crate::handlers::{estados, health, procesar_cola, recibir_json, ApiState};
use axum::{
    routing::{get, post},
    Router,
};
use lis_core::Result;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub struct IngestServer {
    addr: SocketAddr,
    app: Router,
}

impl IngestServer {
    pub fn new(addr: SocketAddr, state: ApiState) -> Self {
        Self {
            addr,
            app: create_app(state),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("接收端启动: {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(lis_core::LisError::Transport)?;
        Ok(())
    }
}

fn create_app(state: ApiState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health))
        // 设备API（路径与历史代理兼容）
        .nest("/api/equipos", equipos_routes())
        .with_state(state)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

fn equipos_routes() -> Router<ApiState> {
    Router::new()
        .route("/recibir-json", post(recibir_json))
        .route("/procesar-cola", post(procesar_cola))
        .route("/estados", get(estados))
}
