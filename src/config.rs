use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub server: ServerConfig,
    pub chatgpt: ChatGptConfig,
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatGptConfig {
    pub base_url: String,
    /// 覆盖 conversation 端点
    pub api_reverse_proxy: Option<String>,
    /// 覆盖文件下载端点
    pub files_reverse_proxy: Option<String>,
    pub enable_history: bool,
    /// 没有账号时使用的 _puid
    pub puid: Option<String>,
    pub proxy: Option<String>,
    pub enable_turnstile: bool,
    /// 每个客户端请求的最大轮次（含首轮）
    pub max_turns: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    pub accounts_file: String,
    pub access_tokens_file: String,
    pub login_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                admin_password: None,
            },
            chatgpt: ChatGptConfig {
                base_url: "https://chatgpt.com".to_string(),
                api_reverse_proxy: None,
                files_reverse_proxy: None,
                enable_history: false,
                puid: None,
                proxy: None,
                enable_turnstile: false,
                max_turns: 3,
                request_timeout_secs: 600,
            },
            accounts: AccountsConfig {
                accounts_file: "accounts.txt".to_string(),
                access_tokens_file: "access_tokens.json".to_string(),
                login_timeout_secs: 60,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(port) = env::var("PORT") {
            config.server.port = port.parse()?;
        }

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }

        if let Ok(env_type) = env::var("ENVIRONMENT") {
            config.environment = env_type;
        }

        if let Ok(password) = env::var("ADMIN_PASSWORD") {
            config.server.admin_password = non_empty(password);
        }

        // ChatGPT 后端相关配置
        if let Ok(base_url) = env::var("BASE_URL") {
            config.chatgpt.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Ok(url) = env::var("API_REVERSE_PROXY") {
            config.chatgpt.api_reverse_proxy = non_empty(url);
        }

        if let Ok(url) = env::var("FILES_REVERSE_PROXY") {
            config.chatgpt.files_reverse_proxy = non_empty(url);
        }

        if let Ok(flag) = env::var("ENABLE_HISTORY") {
            config.chatgpt.enable_history = flag == "true";
        }

        if let Ok(puid) = env::var("PUID") {
            config.chatgpt.puid = non_empty(puid);
        }

        if let Ok(proxy) = env::var("PROXY") {
            config.chatgpt.proxy = non_empty(proxy);
        }

        if let Ok(flag) = env::var("ENABLE_TURNSTILE") {
            config.chatgpt.enable_turnstile = flag == "true";
        }

        if let Ok(turns) = env::var("MAX_CONTINUATIONS") {
            config.chatgpt.max_turns = turns.parse::<u32>()?.max(1);
        }

        // 账号相关配置
        if let Ok(path) = env::var("ACCOUNTS_FILE") {
            config.accounts.accounts_file = path;
        }

        if let Ok(path) = env::var("ACCESS_TOKENS_FILE") {
            config.accounts.access_tokens_file = path;
        }

        if let Ok(secs) = env::var("LOGIN_TIMEOUT_SECS") {
            config.accounts.login_timeout_secs = secs.parse()?;
        }

        Ok(config)
    }

    /// conversation 端点，认证与匿名走不同路径
    pub fn conversation_url(&self, authenticated: bool) -> String {
        if let Some(url) = &self.chatgpt.api_reverse_proxy {
            return url.clone();
        }
        format!("{}/{}/conversation", self.chatgpt.base_url, backend_path(authenticated))
    }

    pub fn requirements_url(&self, authenticated: bool) -> String {
        format!(
            "{}/{}/sentinel/chat-requirements",
            self.chatgpt.base_url,
            backend_path(authenticated)
        )
    }

    pub fn files_url(&self) -> String {
        match &self.chatgpt.files_reverse_proxy {
            Some(url) => url.clone(),
            None => format!("{}/backend-api/files/", self.chatgpt.base_url),
        }
    }
}

fn backend_path(authenticated: bool) -> &'static str {
    if authenticated {
        "backend-api"
    } else {
        "backend-anon"
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
