use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::common::VeaError;
use crate::domain::SystemProxySettings;

/// 错误响应体
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// handler 错误：按错误类别映射状态码
#[derive(Debug)]
pub struct ApiError(pub VeaError);

impl From<VeaError> for ApiError {
    fn from(e: VeaError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.to_string(),
            code: kind.as_str().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// GET /health
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /proxy/logs 查询参数
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub since: u64,
}

/// PUT /settings/system-proxy 响应
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProxyResponse {
    pub settings: SystemProxySettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
