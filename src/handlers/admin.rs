use crate::error::ApiError;
use crate::handlers::AppState;
use crate::models::{PasswordUpdate, Secret};
use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;

/// 用提交的映射整体替换凭据存储和轮换队列
pub async fn update_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(tokens): Json<HashMap<String, Secret>>,
) -> Result<Json<Value>, ApiError> {
    authorize_admin(&headers, state.admin_password.read().as_deref())?;

    let count = tokens.len();
    state.scheduler.replace_secrets(tokens)?;
    tracing::info!("管理接口更新了 {} 个账号凭据", count);

    Ok(Json(json!({
        "message": "tokens updated",
        "accounts": state.scheduler.active_accounts().len()
    })))
}

/// 修改管理员密码，需要提供当前密码
pub async fn update_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<PasswordUpdate>,
) -> Result<Json<Value>, ApiError> {
    rotate_password(&state.admin_password, &headers, update)?;
    tracing::info!("管理员密码已更新");

    Ok(Json(json!({ "message": "password updated" })))
}

fn rotate_password(
    current: &RwLock<Option<String>>,
    headers: &HeaderMap,
    update: PasswordUpdate,
) -> Result<(), ApiError> {
    let mut password = current.write();
    authorize_admin(headers, password.as_deref())?;

    if update.password.trim().is_empty() {
        return Err(ApiError::InvalidRequest("password not provided".to_string()));
    }
    *password = Some(update.password);
    Ok(())
}

/// Authorization 头需要与管理员密码一致，未配置密码时接口关闭
fn authorize_admin(headers: &HeaderMap, password: Option<&str>) -> Result<(), ApiError> {
    let Some(password) = password else {
        return Err(ApiError::Unauthorized("admin password not configured".to_string()));
    };

    let provided = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.strip_prefix("Bearer ").unwrap_or(h))
        .unwrap_or_default();

    if provided == password {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid admin password".to_string()))
    }
}
