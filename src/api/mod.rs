//! HTTP API（axum）
//!
//! 只做 JSON 编解码，所有语义在 [`crate::app::Facade`] 中。
//! 错误统一渲染为 `{error, code}`，状态码由错误类别决定。

pub mod handlers;
pub mod models;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app::Facade;

/// 构建路由表
pub fn router(facade: Arc<Facade>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/snapshot", get(handlers::snapshot))
        .route(
            "/nodes",
            get(handlers::list_nodes).post(handlers::create_node),
        )
        .route(
            "/nodes/{id}",
            get(handlers::get_node)
                .put(handlers::update_node)
                .delete(handlers::delete_node),
        )
        .route(
            "/frouters",
            get(handlers::list_frouters).post(handlers::create_frouter),
        )
        .route(
            "/frouters/{id}",
            get(handlers::get_frouter)
                .put(handlers::update_frouter)
                .delete(handlers::delete_frouter),
        )
        .route("/components", get(handlers::list_components))
        .route("/components/{id}/install", post(handlers::install_component))
        .route(
            "/settings/frontend",
            get(handlers::get_frontend).put(handlers::put_frontend),
        )
        .route(
            "/settings/system-proxy",
            get(handlers::get_system_proxy).put(handlers::put_system_proxy),
        )
        .route(
            "/proxy/config",
            get(handlers::get_proxy_config).put(handlers::put_proxy_config),
        )
        .route("/proxy/start", post(handlers::start_proxy))
        .route("/proxy/stop", post(handlers::stop_proxy))
        .route("/proxy/status", get(handlers::proxy_status))
        .route("/proxy/logs", get(handlers::proxy_logs))
        .route("/engine/status", get(handlers::engine_status))
        .route("/engine/recommend", get(handlers::engine_recommend))
        .route("/tun/check", get(handlers::tun_check))
        .route("/tun/setup", post(handlers::tun_setup))
        .layer(CorsLayer::permissive())
        .with_state(facade)
}

/// `:19080` 形式的地址监听全部网卡
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address: {}", addr))
}

/// 监听并服务，`shutdown` 完成后优雅退出
pub async fn serve(
    addr: SocketAddr,
    facade: Arc<Facade>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(facade))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")
}
