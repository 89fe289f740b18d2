pub mod admin;
pub mod chat;
pub mod health;
pub mod speech;

use crate::config::Config;
use crate::error::ApiResult;
use crate::services::accounts::load_accounts;
use crate::services::{ChatGptClient, CredentialScheduler, SecretStore, WebAuthenticator};
use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<ChatGptClient>,
    pub scheduler: Arc<CredentialScheduler>,
    /// 可通过 /password 在运行时修改
    pub admin_password: Arc<RwLock<Option<String>>>,
    pub config: Config,
}

pub async fn create_router(config: Config) -> ApiResult<Router> {
    let accounts = load_accounts(&config.accounts.accounts_file)?;
    let store = SecretStore::open(&config.accounts.access_tokens_file);
    let authenticator = Arc::new(WebAuthenticator::new(
        config.chatgpt.base_url.clone(),
        config.chatgpt.proxy.clone(),
    ));
    let scheduler = CredentialScheduler::new(
        accounts,
        store,
        authenticator,
        Duration::from_secs(config.accounts.login_timeout_secs),
    );

    // 启动前完成首次续期安排
    scheduler.start().await;

    let client = Arc::new(ChatGptClient::new(config.clone())?);

    let state = AppState {
        client,
        scheduler,
        admin_password: Arc::new(RwLock::new(config.server.admin_password.clone())),
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        // 健康检查
        .route("/", get(health::root))
        .route("/ping", get(health::ping))

        // 聊天API - OpenAI兼容
        .route("/v1/chat/completions", post(chat::completions))
        .route("/v1/audio/speech", post(speech::speech))

        // 模型列表 - OpenAI兼容
        .route("/v1/models", get(chat::models))

        // 管理接口
        .route("/tokens", post(admin::update_tokens))
        .route("/password", post(admin::update_password))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
        )
        .with_state(state);

    Ok(app)
}
