use crate::error::ApiError;
use crate::handlers::chat::acquire_session;
use crate::handlers::AppState;
use crate::models::SpeechRequest;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
};

/// 文字转语音，只支持带 PUID 的账号
pub async fn speech(
    State(state): State<AppState>,
    Json(request): Json<SpeechRequest>,
) -> Result<Response, ApiError> {
    if request.input.trim().is_empty() {
        return Err(ApiError::InvalidRequest("Input cannot be empty".to_string()));
    }

    let session = acquire_session(&state);
    if session.account.is_empty() || session.secret.puid.is_empty() {
        return Err(ApiError::ServiceUnavailable("Plus user only".to_string()));
    }

    tracing::info!("语音合成: voice={} format={}", request.voice, request.response_format);
    let (audio, content_type) = state.client.synthesize(&request, &session).await?;

    Ok(([(header::CONTENT_TYPE, content_type)], audio).into_response())
}
