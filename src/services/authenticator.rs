use crate::error::{ApiError, ApiResult};
use crate::models::Secret;
use crate::services::accounts::Account;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{cookie::Jar, Client, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// 登录协作者
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// 用已有 cookie 刷新会话
    async fn renew_with_cookies(&self, account: &Account) -> ApiResult<Secret>;

    /// 完整登录
    async fn login(&self, account: &Account) -> ApiResult<Secret>;
}

pub fn auth_failure(location: &str, status_code: u16, details: impl Into<String>) -> ApiError {
    ApiError::AuthFailure {
        location: location.to_string(),
        status_code,
        details: details.into(),
    }
}

/// 基于网页登录流程的实现，每个账号一个 cookie jar
pub struct WebAuthenticator {
    base_url: String,
    auth_url: String,
    proxy: Option<String>,
    clients: Mutex<HashMap<String, Client>>,
}

impl WebAuthenticator {
    pub fn new(base_url: String, proxy: Option<String>) -> Self {
        Self {
            base_url,
            auth_url: "https://auth0.openai.com".to_string(),
            proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn build_client(&self) -> ApiResult<Client> {
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .cookie_provider(jar)
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }

    fn existing_client(&self, account: &str) -> Option<Client> {
        self.clients.lock().get(account).cloned()
    }

    /// 丢弃旧 cookie，换一个新 jar
    fn reset_client(&self, account: &str) -> ApiResult<Client> {
        let client = self.build_client()?;
        self.clients
            .lock()
            .insert(account.to_string(), client.clone());
        Ok(client)
    }

    async fn fetch_session_token(&self, client: &Client, location: &str) -> ApiResult<String> {
        let response = client
            .get(format!("{}/api/auth/session", self.base_url))
            .send()
            .await
            .map_err(|e| auth_failure(location, 0, e.to_string()))?;
        let body = expect_json(response, location).await?;

        body.get("accessToken")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| auth_failure(location, 200, "missing access token"))
    }

    /// 补全 _puid 与团队账号ID
    async fn complete_secret(&self, client: &Client, access_token: String) -> ApiResult<Secret> {
        let puid = self.fetch_puid(client, &access_token).await.unwrap_or_default();
        let team_user_id = self
            .fetch_team_user_id(client, &access_token)
            .await
            .unwrap_or_default();

        Ok(Secret {
            token: access_token,
            puid,
            team_user_id,
        })
    }

    async fn fetch_puid(&self, client: &Client, access_token: &str) -> Option<String> {
        let response = client
            .get(format!(
                "{}/backend-api/models?history_and_training_disabled=false",
                self.base_url
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;

        let puid = response
            .cookies()
            .find(|cookie| cookie.name() == "_puid")
            .map(|cookie| cookie.value().to_string());
        debug!("PUID present: {}", puid.is_some());
        puid
    }

    async fn fetch_team_user_id(&self, client: &Client, access_token: &str) -> Option<String> {
        let response = client
            .get(format!(
                "{}/backend-api/accounts/check/v4-2023-04-27",
                self.base_url
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;

        body.get("accounts")?
            .as_object()?
            .values()
            .filter_map(|entry| entry.get("account"))
            .find(|account| account.get("plan_type").and_then(Value::as_str) == Some("team"))
            .and_then(|account| account.get("account_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl Authenticator for WebAuthenticator {
    async fn renew_with_cookies(&self, account: &Account) -> ApiResult<Secret> {
        let client = self
            .existing_client(&account.id)
            .ok_or_else(|| auth_failure("renew_with_cookies", 0, "no saved cookies"))?;

        let access_token = self.fetch_session_token(&client, "renew_with_cookies").await?;
        self.complete_secret(&client, access_token).await
    }

    async fn login(&self, account: &Account) -> ApiResult<Secret> {
        info!("开始登录流程: {}", account.id);
        let client = self.reset_client(&account.id)?;

        // 1. csrf
        let response = client
            .get(format!("{}/api/auth/csrf", self.base_url))
            .send()
            .await
            .map_err(|e| auth_failure("csrf", 0, e.to_string()))?;
        let csrf = expect_json(response, "csrf").await?;
        let csrf_token = csrf
            .get("csrfToken")
            .and_then(Value::as_str)
            .ok_or_else(|| auth_failure("csrf", 200, "missing csrfToken"))?
            .to_string();

        // 2. 获取授权跳转地址
        let response = client
            .post(format!(
                "{}/api/auth/signin/login-web?prompt=login&screen_hint=login",
                self.base_url
            ))
            .form(&[
                ("callbackUrl", "/"),
                ("csrfToken", csrf_token.as_str()),
                ("json", "true"),
            ])
            .send()
            .await
            .map_err(|e| auth_failure("signin", 0, e.to_string()))?;
        let signin = expect_json(response, "signin").await?;
        let authorize_url = signin
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| auth_failure("signin", 200, "missing authorize url"))?
            .to_string();

        // 3. 跟随跳转，拿到 state
        let response = client
            .get(&authorize_url)
            .send()
            .await
            .map_err(|e| auth_failure("authorize", 0, e.to_string()))?;
        let state = response
            .url()
            .query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| auth_failure("authorize", response.status().as_u16(), "missing state"))?;
        debug!("获取到登录 state");

        // 4. 提交用户名
        let response = client
            .post(format!("{}/u/login/identifier?state={}", self.auth_url, state))
            .form(&[
                ("state", state.as_str()),
                ("username", account.id.as_str()),
                ("action", "default"),
            ])
            .send()
            .await
            .map_err(|e| auth_failure("identifier", 0, e.to_string()))?;
        expect_success(response, "identifier").await?;

        // 5. 提交密码，跳转回调后写入会话 cookie
        let response = client
            .post(format!("{}/u/login/password?state={}", self.auth_url, state))
            .form(&[
                ("state", state.as_str()),
                ("username", account.id.as_str()),
                ("password", account.password.as_str()),
                ("action", "default"),
            ])
            .send()
            .await
            .map_err(|e| auth_failure("password", 0, e.to_string()))?;
        expect_success(response, "password").await?;

        // 6. 会话
        let access_token = self.fetch_session_token(&client, "session").await?;
        info!("登录成功: {}", account.id);
        self.complete_secret(&client, access_token).await
    }
}

async fn expect_success(response: Response, location: &str) -> ApiResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let details = response.text().await.unwrap_or_default();
    Err(auth_failure(location, status.as_u16(), details))
}

async fn expect_json(response: Response, location: &str) -> ApiResult<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| auth_failure(location, status.as_u16(), e.to_string()))?;
    if !status.is_success() {
        return Err(auth_failure(location, status.as_u16(), text));
    }
    serde_json::from_str(&text).map_err(|_| auth_failure(location, status.as_u16(), text))
}
