use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;
pub type AppResult<T> = Result<T, AppError>;

pub use ApiError as AppError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// 登录或续期失败
    #[error("Authentication failed at {location} ({status_code}): {details}")]
    AuthFailure {
        location: String,
        status_code: u16,
        details: String,
    },

    /// 无法获取 chat requirements，或后端要求重新登录
    #[error("Challenge unavailable: {0}")]
    ChallengeUnavailable(String),

    /// 后端返回非200且响应体是JSON
    #[error("Upstream error {status}")]
    Upstream { status: u16, body: Value },

    /// 后端返回非200且响应体不是JSON
    #[error("Upstream error {status}: {body}")]
    UpstreamRaw { status: u16, body: String },

    /// 单个无法解析的流帧，调用方跳过
    #[error("Malformed stream frame: {0}")]
    StreamDecode(String),

    /// 200 流内的错误信封
    #[error("Backend stream error: {0}")]
    BackendStream(Value),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ApiError::WebSocket(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            // 原样转发上游状态码和 detail
            ApiError::Upstream { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = body.get("detail").cloned().unwrap_or(body);
                (
                    status,
                    json!({
                        "error": {
                            "message": message,
                            "type": status.to_string(),
                            "param": null,
                            "code": "error"
                        }
                    }),
                )
            }
            ApiError::UpstreamRaw { body, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": {
                        "message": "Unknown error",
                        "type": "internal_server_error",
                        "param": null,
                        "code": "500",
                        "details": body
                    }
                }),
            ),
            ApiError::BackendStream(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": error }),
            ),
            other => {
                let status = match &other {
                    ApiError::HttpRequest(_) => StatusCode::BAD_GATEWAY,
                    ApiError::JsonError(_) => StatusCode::BAD_REQUEST,
                    ApiError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::AuthFailure { .. } => StatusCode::UNAUTHORIZED,
                    ApiError::ChallengeUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::StreamDecode(_) => StatusCode::BAD_GATEWAY,
                    ApiError::WebSocket(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    json!({
                        "error": {
                            "message": other.to_string(),
                            "type": "api_error",
                            "code": status.as_u16()
                        }
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
