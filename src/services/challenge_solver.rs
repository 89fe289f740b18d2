use crate::services::turnstile::TurnstileSolver;
use crate::utils::generate_uuid;
use base64::{engine::general_purpose, Engine as _};
use chrono::{FixedOffset, Utc};
use rand::{seq::SliceRandom, thread_rng, Rng};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use sha3::{Digest, Sha3_512};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// 成功答案前缀
const PROOF_PREFIX: &str = "gAAAAAB";
/// chat-requirements 预热 token 前缀
const REQUIREMENTS_PREFIX: &str = "gAAAAAC";
/// 搜索失败时的伪装前缀
const FAILED_PROOF_PREFIX: &str = "wQ8Lk5FbGpA2NcR9dShT6gYjU7VxZ4D";

const MAX_ITERATIONS: usize = 500_000;

const CORES: [u32; 4] = [8, 16, 24, 32];
const SCREENS: [u32; 3] = [3000, 4000, 6000];

const NAVIGATOR_KEYS: [&str; 6] = [
    "registerProtocolHandler−function registerProtocolHandler() { [native code] }",
    "storage−[object StorageManager]",
    "locks−[object LockManager]",
    "appCodeName−Mozilla",
    "permissions−[object Permissions]",
    "webdriver−false",
];

const WINDOW_KEYS: [&str; 5] = [
    "_reactListeningo743lnnpvdg",
    "__NEXT_DATA__",
    "__oai_SSR_HTML",
    "__oai_logHTML",
    "webpackChunk_N_E",
];

const FALLBACK_SCRIPT: &str =
    "https://cdn.oaistatic.com/_next/static/chunks/webpack-c5e3c4a3a7d5f1b6.js";
const FALLBACK_DPL: &str = "prod-f501fe933b3edf57aea882da888e1a544df99840";

/// 落地页中解析出的指纹环境
#[derive(Debug, Clone, PartialEq)]
pub struct ProofEnvironment {
    pub scripts: Vec<String>,
    pub dpl: String,
}

impl Default for ProofEnvironment {
    fn default() -> Self {
        Self {
            scripts: vec![FALLBACK_SCRIPT.to_string()],
            dpl: FALLBACK_DPL.to_string(),
        }
    }
}

impl ProofEnvironment {
    /// 从落地页 HTML 中提取脚本地址与 data-build
    pub fn parse(html: &str) -> Self {
        let mut environment = Self::default();

        if let Ok(re) = Regex::new(r#"<script[^>]*\ssrc="([^"]+)""#) {
            let scripts: Vec<String> = re
                .captures_iter(html)
                .map(|c| c[1].to_string())
                .collect();
            if !scripts.is_empty() {
                environment.scripts = scripts;
            }
        }

        if let Ok(re) = Regex::new(r#"data-build="([^"]+)""#) {
            if let Some(build) = re.captures(html) {
                environment.dpl = build[1].to_string();
            }
        }

        environment
    }

    pub async fn fetch(client: &Client, base_url: &str) -> Self {
        let result = async {
            client
                .get(format!("{}/", base_url))
                .header("User-Agent", USER_AGENT)
                .send()
                .await?
                .text()
                .await
        }
        .await;

        match result {
            Ok(html) => {
                let environment = Self::parse(&html);
                debug!(
                    "指纹环境: {} 个脚本, dpl={}",
                    environment.scripts.len(),
                    environment.dpl
                );
                environment
            }
            Err(e) => {
                warn!("获取落地页失败，使用默认指纹环境: {}", e);
                Self::default()
            }
        }
    }
}

/// 挑战求解器
pub struct ChallengeSolver {
    session_id: String,
    started: Instant,
    environment: OnceCell<ProofEnvironment>,
    requirements_token: OnceCell<String>,
    turnstile: Arc<dyn TurnstileSolver>,
}

impl ChallengeSolver {
    pub fn new(turnstile: Arc<dyn TurnstileSolver>) -> Self {
        Self {
            session_id: generate_uuid(),
            started: Instant::now(),
            environment: OnceCell::new(),
            requirements_token: OnceCell::new(),
            turnstile,
        }
    }

    /// 指纹环境只获取一次
    pub async fn environment(&self, client: &Client, base_url: &str) -> &ProofEnvironment {
        self.environment
            .get_or_init(|| ProofEnvironment::fetch(client, base_url))
            .await
    }

    /// 构造 15 项指纹向量，计数字段在搜索时改写
    fn fingerprint(&self, environment: &ProofEnvironment) -> Vec<Value> {
        let mut rng = thread_rng();
        let hardware = CORES.choose(&mut rng).copied().unwrap_or(8)
            + SCREENS.choose(&mut rng).copied().unwrap_or(3000);
        let script = environment
            .scripts
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_SCRIPT.to_string());
        let navigator_key = NAVIGATOR_KEYS.choose(&mut rng).copied().unwrap_or("webdriver−false");
        let window_key = WINDOW_KEYS.choose(&mut rng).copied().unwrap_or("__NEXT_DATA__");
        let elapsed = self.started.elapsed().as_secs_f64() * 1000.0 + rng.gen_range(0.0..1.0);

        vec![
            json!(hardware),
            json!(browser_time()),
            json!(4294705152u64),
            json!(0),
            json!(USER_AGENT),
            json!(script),
            json!(environment.dpl),
            json!("en-US"),
            json!("en-US,en"),
            json!(0),
            json!(navigator_key),
            json!("location"),
            json!(window_key),
            json!(elapsed),
            json!(self.session_id),
        ]
    }

    /// 计算工作量证明，搜索失败时返回伪装 token
    pub fn solve_proof_of_work(
        &self,
        environment: &ProofEnvironment,
        seed: &str,
        difficulty: &str,
    ) -> String {
        format!("{}{}", PROOF_PREFIX, self.answer(environment, seed, difficulty))
    }

    fn answer(&self, environment: &ProofEnvironment, seed: &str, difficulty: &str) -> String {
        let mut vector = self.fingerprint(environment);
        match search(&mut vector, seed, difficulty, MAX_ITERATIONS) {
            Some(answer) => answer,
            None => {
                warn!("工作量证明未找到解, difficulty={}", difficulty);
                failed_answer(seed)
            }
        }
    }

    /// chat-requirements 请求体中的 p，进程内只计算一次
    pub async fn requirements_token(self: &Arc<Self>, environment: &ProofEnvironment) -> String {
        let solver = Arc::clone(self);
        let environment = environment.clone();
        self.requirements_token
            .get_or_init(|| async move {
                let seed = thread_rng().gen::<f64>().to_string();
                let answer = tokio::task::spawn_blocking(move || {
                    solver.answer(&environment, &seed, "0")
                })
                .await
                .unwrap_or_else(|_| failed_answer("0"));
                format!("{}{}", REQUIREMENTS_PREFIX, answer)
            })
            .await
            .clone()
    }

    pub fn solve_turnstile(&self, dx: &str, p: &str) -> String {
        self.turnstile.solve(dx, p)
    }
}

/// 在预算内搜索满足难度的向量编码
fn search(vector: &mut [Value], seed: &str, difficulty: &str, budget: usize) -> Option<String> {
    // 难度串每两个十六进制字符对应一个摘要字节
    let prefix_len = (difficulty.len() / 2).min(64);

    for i in 0..budget {
        vector[3] = json!(i);
        vector[9] = json!((i + 2) / 2);

        let encoded = match serde_json::to_string(&vector) {
            Ok(encoded) => general_purpose::STANDARD.encode(encoded),
            Err(_) => return None,
        };

        let mut hasher = Sha3_512::new();
        hasher.update(seed.as_bytes());
        hasher.update(encoded.as_bytes());
        let digest = hasher.finalize();

        if hex::encode(&digest[..prefix_len]).as_str() <= difficulty {
            return Some(encoded);
        }
    }
    None
}

fn failed_answer(seed: &str) -> String {
    format!(
        "{}{}",
        FAILED_PROOF_PREFIX,
        general_purpose::STANDARD.encode(format!("\"{}\"", seed))
    )
}

/// 浏览器 Date.toString() 格式的当前时间
fn browser_time() -> String {
    const FORMAT: &str = "%a %b %d %Y %H:%M:%S GMT-0500 (Eastern Standard Time)";
    let now = Utc::now();
    match FixedOffset::west_opt(5 * 3600) {
        Some(offset) => now.with_timezone(&offset).format(FORMAT).to_string(),
        None => now.format(FORMAT).to_string(),
    }
}
