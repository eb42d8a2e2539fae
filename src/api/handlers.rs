use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{Map, Value};
use tracing::debug;

use crate::app::Facade;
use crate::common::VeaError;
use crate::domain::{
    CoreComponent, FRouter, Node, ProxyConfig, ServiceState, SystemProxySettings,
};
use crate::engine::{EngineRecommendation, EngineStatus};
use crate::supervisor::{KernelLogSnapshot, ProxyStatus};
use crate::tun::TunCapabilityStatus;

use super::models::*;

pub type AppState = Arc<Facade>;

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /snapshot
pub async fn snapshot(State(facade): State<AppState>) -> Json<ServiceState> {
    Json(facade.snapshot().await)
}

// ─── 节点 ───

pub async fn list_nodes(State(facade): State<AppState>) -> Json<Vec<Node>> {
    Json(facade.list_nodes().await)
}

pub async fn get_node(State(facade): State<AppState>, Path(id): Path<String>) -> ApiResult<Node> {
    Ok(Json(facade.get_node(&id).await?))
}

pub async fn create_node(
    State(facade): State<AppState>,
    Json(node): Json<Node>,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    Ok((StatusCode::CREATED, Json(facade.create_node(node).await?)))
}

pub async fn update_node(
    State(facade): State<AppState>,
    Path(id): Path<String>,
    Json(node): Json<Node>,
) -> ApiResult<Node> {
    Ok(Json(facade.update_node(&id, node).await?))
}

pub async fn delete_node(
    State(facade): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    facade.delete_node(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── 路由 ───

pub async fn list_frouters(State(facade): State<AppState>) -> Json<Vec<FRouter>> {
    Json(facade.list_frouters().await)
}

pub async fn get_frouter(
    State(facade): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<FRouter> {
    Ok(Json(facade.get_frouter(&id).await?))
}

pub async fn create_frouter(
    State(facade): State<AppState>,
    Json(frouter): Json<FRouter>,
) -> Result<(StatusCode, Json<FRouter>), ApiError> {
    Ok((StatusCode::CREATED, Json(facade.create_frouter(frouter).await?)))
}

pub async fn update_frouter(
    State(facade): State<AppState>,
    Path(id): Path<String>,
    Json(frouter): Json<FRouter>,
) -> ApiResult<FRouter> {
    Ok(Json(facade.update_frouter(&id, frouter).await?))
}

pub async fn delete_frouter(
    State(facade): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    facade.delete_frouter(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── 组件 ───

pub async fn list_components(State(facade): State<AppState>) -> Json<Vec<CoreComponent>> {
    Json(facade.list_components().await)
}

/// POST /components/:id/install（后台执行）
pub async fn install_component(
    State(facade): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CoreComponent>), ApiError> {
    Ok((StatusCode::ACCEPTED, Json(facade.install_component(&id).await?)))
}

// ─── 设置 ───

pub async fn get_frontend(State(facade): State<AppState>) -> Json<Map<String, Value>> {
    Json(facade.frontend_settings().await)
}

pub async fn put_frontend(
    State(facade): State<AppState>,
    Json(settings): Json<Map<String, Value>>,
) -> ApiResult<Map<String, Value>> {
    Ok(Json(facade.update_frontend_settings(settings).await?))
}

pub async fn get_system_proxy(State(facade): State<AppState>) -> Json<SystemProxySettings> {
    Json(facade.system_proxy_settings().await)
}

pub async fn put_system_proxy(
    State(facade): State<AppState>,
    Json(settings): Json<SystemProxySettings>,
) -> ApiResult<SystemProxyResponse> {
    let (settings, message) = facade.update_system_proxy_settings(settings).await?;
    Ok(Json(SystemProxyResponse { settings, message }))
}

// ─── 代理 ───

pub async fn get_proxy_config(State(facade): State<AppState>) -> Json<ProxyConfig> {
    Json(facade.proxy_config().await)
}

pub async fn put_proxy_config(
    State(facade): State<AppState>,
    Json(cfg): Json<ProxyConfig>,
) -> ApiResult<ProxyConfig> {
    Ok(Json(facade.update_proxy_config(cfg).await?))
}

/// POST /proxy/start；请求体为空时使用已保存的配置
pub async fn start_proxy(State(facade): State<AppState>, body: Bytes) -> ApiResult<ProxyStatus> {
    let cfg = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let cfg: ProxyConfig = serde_json::from_slice(&body)
            .map_err(|e| VeaError::invalid(format!("decode proxy config: {}", e)))?;
        Some(cfg)
    };
    debug!(explicit = cfg.is_some(), "proxy start requested");
    facade.start_proxy(cfg).await?;
    Ok(Json(facade.proxy_status()))
}

pub async fn stop_proxy(State(facade): State<AppState>) -> ApiResult<ProxyStatus> {
    facade.stop_proxy().await?;
    Ok(Json(facade.proxy_status()))
}

pub async fn proxy_status(State(facade): State<AppState>) -> Json<ProxyStatus> {
    Json(facade.proxy_status())
}

/// GET /proxy/logs?since=N
pub async fn proxy_logs(
    State(facade): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Json<KernelLogSnapshot> {
    Json(facade.kernel_logs(q.since))
}

// ─── 引擎 / TUN ───

pub async fn engine_status(State(facade): State<AppState>) -> Json<EngineStatus> {
    Json(facade.engine_status().await)
}

pub async fn engine_recommend(State(facade): State<AppState>) -> Json<EngineRecommendation> {
    Json(facade.recommend_engine().await)
}

pub async fn tun_check(State(facade): State<AppState>) -> Json<TunCapabilityStatus> {
    Json(facade.check_tun_capabilities().await)
}

pub async fn tun_setup(State(facade): State<AppState>) -> ApiResult<TunCapabilityStatus> {
    Ok(Json(facade.setup_tun().await?))
}
