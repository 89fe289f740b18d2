use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    BackendFrame, ChallengeRequirement, ChatCompletionRequest, ContinuationToken,
    ConversationRequest, FileDownload, Secret, SentinelTokens, SpeechRequest, StreamEvent,
    WsEnvelope, WssResponse,
};
use crate::services::attachments::BackendUploader;
use crate::services::challenge_solver::{ChallengeSolver, USER_AGENT};
use crate::services::request_converter::RequestConverter;
use crate::services::stream_normalizer::{AssetResolver, NormalizedEvent, StreamNormalizer};
use crate::services::turnstile::{DisabledTurnstile, TurnstileSolver, TurnstileVm};
use crate::services::ws_pool::{ConnectionLease, WsPool};
use crate::utils::{device_id_for, generate_uuid, mask_token};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// 后端原始 data 行
pub type LineStream = Pin<Box<dyn Stream<Item = ApiResult<String>> + Send>>;
/// 规范化后的整段对话输出
pub type ConversationStream = Pin<Box<dyn Stream<Item = ApiResult<NormalizedEvent>> + Send>>;

/// 每收到多少条 relay 消息回一次 ack
const ACK_EVERY: u64 = 50;
const WS_RECONNECT_ATTEMPTS: u32 = 3;
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// 第三方 Arkose token 提供方
#[async_trait]
pub trait ArkoseProvider: Send + Sync {
    async fn token(&self, dx: &str, puid: &str) -> Option<String>;
}

/// 未接入 Arkose 服务
pub struct NoArkose;

#[async_trait]
impl ArkoseProvider for NoArkose {
    async fn token(&self, _dx: &str, _puid: &str) -> Option<String> {
        None
    }
}

/// 单个请求使用的账号会话
#[derive(Debug, Clone)]
pub struct Session {
    pub account: String,
    pub secret: Secret,
    pub device_id: String,
}

impl Session {
    pub fn new(account: String, secret: Secret) -> Self {
        let device_id = device_id_for(&account);
        Self {
            account,
            secret,
            device_id,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(String::new(), Secret::default())
    }
}

/// 一轮后端回复
pub struct Turn {
    pub lines: LineStream,
    /// relay 响应中给出的会话ID，SSE 时为空
    pub conversation_id: String,
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!("忽略非法请求头 {}", name),
    }
}

/// 后端通用请求头
pub fn backend_headers(secret: &Secret, device_id: &str, fallback_puid: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "user-agent", USER_AGENT);
    insert_header(&mut headers, "accept", "*/*");
    insert_header(&mut headers, "oai-language", "en-US");
    insert_header(&mut headers, "oai-device-id", device_id);

    if !secret.token.is_empty() {
        insert_header(&mut headers, "authorization", &format!("Bearer {}", secret.token));
    }

    let puid = if secret.puid.is_empty() {
        fallback_puid.unwrap_or_default()
    } else {
        secret.puid.as_str()
    };
    if !puid.is_empty() {
        insert_header(&mut headers, "cookie", &format!("_puid={};", puid));
    }

    if !secret.team_user_id.is_empty() {
        insert_header(&mut headers, "chatgpt-account-id", &secret.team_user_id);
    }
    headers
}

/// 只附加后端要求的 sentinel 头
pub fn apply_sentinel_headers(headers: &mut HeaderMap, tokens: &SentinelTokens) {
    if !tokens.chat_requirements.is_empty() {
        insert_header(
            headers,
            "openai-sentinel-chat-requirements-token",
            &tokens.chat_requirements,
        );
    }
    if let Some(proof) = &tokens.proof {
        insert_header(headers, "openai-sentinel-proof-token", proof);
    }
    if let Some(arkose) = &tokens.arkose {
        insert_header(headers, "openai-sentinel-arkose-token", arkose);
    }
    if let Some(turnstile) = &tokens.turnstile {
        insert_header(headers, "openai-sentinel-turnstile-token", turnstile);
    }
}

/// 非200响应：JSON 原样转发，否则带上原始响应体
pub fn upstream_error(status: u16, body: &str) -> ApiError {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() => ApiError::Upstream { status, body: value },
        _ => ApiError::UpstreamRaw {
            status,
            body: body.to_string(),
        },
    }
}

async fn upstream_error_from(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    warn!("后端返回错误状态 {}: {}", status, body);
    upstream_error(status, &body)
}

/// TTS 参数映射 -> (voice, format, content type)
pub fn speech_params(voice: &str, format: &str) -> (&'static str, &'static str, &'static str) {
    let voice = match voice {
        "echo" => "ember",
        "fable" => "breeze",
        "nova" | "shimmer" => "juniper",
        _ => "cove",
    };
    match format {
        "mp3" => (voice, "mp3", "audio/mpeg"),
        "opus" => (voice, "opus", "audio/ogg"),
        _ => (voice, "aac", "audio/aac"),
    }
}

/// 通过 files 接口换取图片下载地址
pub struct FileDownloader {
    client: Client,
    files_url: String,
    headers: HeaderMap,
}

impl FileDownloader {
    pub fn new(client: Client, files_url: String, headers: HeaderMap) -> Self {
        Self {
            client,
            files_url,
            headers,
        }
    }
}

#[async_trait]
impl AssetResolver for FileDownloader {
    async fn download_url(&self, asset_pointer: &str) -> Option<String> {
        let file_id = asset_pointer.split("//").nth(1)?;
        let url = format!("{}{}/download", self.files_url, file_id);

        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .ok()?;
        let download: FileDownload = response.json().await.ok()?;
        if download.status == "success" {
            Some(download.download_url)
        } else {
            debug!("文件 {} 状态为 {}", file_id, download.status);
            None
        }
    }
}

/// 驱动一次客户端请求的所有轮次，max_tokens 截断时通过 next_turn 续写
pub async fn drive_conversation<F, Fut>(
    first: Turn,
    max_turns: u32,
    resolver: Arc<dyn AssetResolver>,
    mut next_turn: F,
    tx: mpsc::Sender<ApiResult<NormalizedEvent>>,
) where
    F: FnMut(ContinuationToken) -> Fut,
    Fut: Future<Output = ApiResult<Turn>>,
{
    let mut turn = first;
    let mut turns = 1;
    let mut emitted = String::new();

    loop {
        let normalizer = StreamNormalizer::new(resolver.clone())
            .with_conversation(&turn.conversation_id)
            .resume(emitted);

        let (continuation, text) = match stream_turn(turn, normalizer, &tx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let Some(token) = continuation else {
            return;
        };

        if turns >= max_turns {
            info!("续写已达 {} 轮上限，返回已有内容", max_turns);
            let _ = tx.send(Ok(NormalizedEvent::Finish("length".to_string()))).await;
            return;
        }

        turns += 1;
        info!("回复被截断，开始第 {} 轮续写", turns);
        emitted = text;
        turn = match next_turn(token).await {
            Ok(turn) => turn,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
    }
}

/// 消费一轮回复，返回续写位置与本轮累计文本
async fn stream_turn(
    turn: Turn,
    mut normalizer: StreamNormalizer,
    tx: &mpsc::Sender<ApiResult<NormalizedEvent>>,
) -> ApiResult<(Option<ContinuationToken>, String)> {
    let mut lines = turn.lines;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(ApiError::StreamDecode(e)) => {
                debug!("跳过无法解码的数据: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        for event in normalizer.push(&line).await? {
            match event {
                NormalizedEvent::Continue(token) => {
                    return Ok((Some(token), normalizer.emitted_text().to_string()));
                }
                event => {
                    if tx.send(Ok(event)).await.is_err() {
                        debug!("客户端已断开");
                        return Ok((None, String::new()));
                    }
                }
            }
        }
        if normalizer.is_completed() {
            return Ok((None, String::new()));
        }
    }

    match normalizer.finish() {
        Some(NormalizedEvent::Continue(token)) => {
            Ok((Some(token), normalizer.emitted_text().to_string()))
        }
        Some(event) => {
            let _ = tx.send(Ok(event)).await;
            Ok((None, String::new()))
        }
        None => Ok((None, String::new())),
    }
}

/// 读取 relay 消息并还原为 data 行
async fn relay_websocket(lease: ConnectionLease, wss: WssResponse, tx: mpsc::Sender<ApiResult<String>>) {
    let mut sequence: u64 = 0;
    let mut failures = 0;
    let mut reconnected = false;

    loop {
        let connection = match lease.connect(&wss.wss_url).await {
            Ok(connection) => connection,
            Err(e) => {
                failures += 1;
                if failures > WS_RECONNECT_ATTEMPTS {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                warn!("连接 relay 失败，{}s 后重试: {}", WS_RECONNECT_DELAY.as_secs(), e);
                tokio::time::sleep(WS_RECONNECT_DELAY).await;
                continue;
            }
        };

        // 重连后告知已收到的位置
        if reconnected {
            reconnected = false;
            if let Err(e) = connection.send_text(sequence_ack(sequence)) {
                warn!("重连后发送 sequenceAck 失败: {}", e);
            }
        }

        let Some(text) = connection.recv().await else {
            warn!("relay 连接中断，重新建立 (slot {})", lease.slot_id());
            lease.discard();
            reconnected = true;
            failures += 1;
            if failures > WS_RECONNECT_ATTEMPTS {
                let _ = tx
                    .send(Err(ApiError::WebSocket("relay connection lost".to_string())))
                    .await;
                return;
            }
            continue;
        };

        let envelope: WsEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) => continue,
        };
        if envelope.data.response_id != wss.response_id {
            continue;
        }
        failures = 0;

        sequence = envelope.sequence_id;
        if sequence % ACK_EVERY == 0 {
            if let Err(e) = connection.send_text(sequence_ack(sequence)) {
                warn!("发送 sequenceAck 失败: {}", e);
            }
        }

        let body = match general_purpose::STANDARD
            .decode(&envelope.data.body)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(body) => body,
            None => continue,
        };

        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let done = line.contains("[DONE]");
            if tx.send(Ok(line.to_string())).await.is_err() || done {
                return;
            }
        }
    }
}

fn sequence_ack(sequence: u64) -> String {
    json!({ "type": "sequenceAck", "sequenceId": sequence }).to_string()
}

/// 后端协议客户端
pub struct ChatGptClient {
    client: Client,
    config: Config,
    solver: Arc<ChallengeSolver>,
    arkose: Arc<dyn ArkoseProvider>,
    converter: RequestConverter,
    ws_pool: Arc<WsPool>,
}

impl ChatGptClient {
    pub fn new(config: Config) -> ApiResult<Self> {
        let mut builder =
            Client::builder().timeout(Duration::from_secs(config.chatgpt.request_timeout_secs));
        // 只使用 PROXY 配置，不读取系统代理环境变量
        builder = match &config.chatgpt.proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };
        let client = builder.build()?;

        let turnstile: Arc<dyn TurnstileSolver> = if config.chatgpt.enable_turnstile {
            Arc::new(TurnstileVm::new())
        } else {
            Arc::new(DisabledTurnstile)
        };
        let uploader = Arc::new(BackendUploader::new(
            client.clone(),
            config.chatgpt.base_url.clone(),
            config.chatgpt.puid.clone(),
        ));
        let converter = RequestConverter::new(uploader, config.chatgpt.enable_history);

        Ok(Self {
            client,
            solver: Arc::new(ChallengeSolver::new(turnstile)),
            arkose: Arc::new(NoArkose),
            converter,
            ws_pool: WsPool::new(),
            config,
        })
    }

    fn headers(&self, session: &Session) -> HeaderMap {
        backend_headers(
            &session.secret,
            &session.device_id,
            self.config.chatgpt.puid.as_deref(),
        )
    }

    /// 获取本轮的 chat requirements，返回要求与请求中使用的 p
    pub async fn check_require(&self, session: &Session) -> ApiResult<(ChallengeRequirement, String)> {
        let environment = self
            .solver
            .environment(&self.client, &self.config.chatgpt.base_url)
            .await;
        let p = self.solver.requirements_token(environment).await;

        let url = self
            .config
            .requirements_url(session.secret.is_authenticated());
        let response = self
            .client
            .post(&url)
            .headers(self.headers(session))
            .json(&json!({ "p": p }))
            .send()
            .await
            .map_err(|e| ApiError::ChallengeUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("chat-requirements 失败 {}: {}", status, body);
            return Err(ApiError::ChallengeUnavailable(format!(
                "unable to check chat requirement ({})",
                status.as_u16()
            )));
        }

        let requirement: ChallengeRequirement = response
            .json()
            .await
            .map_err(|e| ApiError::ChallengeUnavailable(e.to_string()))?;
        if requirement.force_login {
            return Err(ApiError::ChallengeUnavailable(
                "backend requires a fresh login".to_string(),
            ));
        }

        debug!(
            "chat requirements: proof={} arkose={} turnstile={}",
            requirement.proof.required, requirement.arkose.required, requirement.turnstile.required
        );
        Ok((requirement, p))
    }

    /// 按要求计算各个 sentinel token
    pub async fn solve_challenges(
        &self,
        requirement: &ChallengeRequirement,
        p: &str,
        session: &Session,
    ) -> SentinelTokens {
        let mut tokens = SentinelTokens {
            chat_requirements: requirement.token.clone(),
            ..Default::default()
        };

        if requirement.proof.required {
            let solver = self.solver.clone();
            let environment = self
                .solver
                .environment(&self.client, &self.config.chatgpt.base_url)
                .await
                .clone();
            let seed = requirement.proof.seed.clone();
            let difficulty = requirement.proof.difficulty.clone();
            let proof = tokio::task::spawn_blocking(move || {
                solver.solve_proof_of_work(&environment, &seed, &difficulty)
            })
            .await;
            match proof {
                Ok(proof) => tokens.proof = Some(proof),
                Err(e) => warn!("工作量证明任务失败: {}", e),
            }
        }

        if requirement.arkose.required {
            tokens.arkose = self
                .arkose
                .token(&requirement.arkose.dx, &session.secret.puid)
                .await;
            if tokens.arkose.is_none() {
                warn!("未能获取 Arkose token");
            }
        }

        if requirement.turnstile.required {
            let token = self.solver.solve_turnstile(&requirement.turnstile.dx, p);
            if !token.is_empty() {
                tokens.turnstile = Some(token);
            }
        }

        tokens
    }

    /// 提交一轮对话，按响应类型选择 SSE 或 WebSocket relay
    pub async fn send_turn(
        &self,
        conversation: &ConversationRequest,
        tokens: &SentinelTokens,
        session: &Session,
        owner: &str,
    ) -> ApiResult<Turn> {
        let authenticated = session.secret.is_authenticated();
        let url = self.config.conversation_url(authenticated);

        let mut headers = self.headers(session);
        insert_header(&mut headers, "accept", "text/event-stream");
        apply_sentinel_headers(&mut headers, tokens);

        info!(
            "发送对话请求: action={} model={} account={}",
            conversation.action,
            conversation.model,
            mask_token(&session.account)
        );
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(conversation)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error_from(response).await);
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .map(|h| h.contains("text/event-stream"))
            .unwrap_or(false);

        if is_event_stream {
            let lines = response.bytes_stream().eventsource().map(|event| match event {
                Ok(event) => Ok(event.data),
                Err(EventStreamError::Transport(e)) => Err(ApiError::HttpRequest(e)),
                Err(e) => Err(ApiError::StreamDecode(e.to_string())),
            });
            return Ok(Turn {
                lines: Box::pin(lines),
                conversation_id: String::new(),
            });
        }

        let wss: WssResponse = response.json().await?;
        if !authenticated || wss.wss_url.is_empty() {
            return Err(ApiError::WebSocket(
                "backend returned a relay without a usable connection".to_string(),
            ));
        }
        debug!("使用 WebSocket relay, response_id={}", wss.response_id);

        let lease = self.ws_pool.lease(&session.secret.token, owner);
        let conversation_id = wss.conversation_id.clone();
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(relay_websocket(lease, wss, tx));

        Ok(Turn {
            lines: Box::pin(ReceiverStream::new(rx)),
            conversation_id,
        })
    }

    /// 取 requirements、解挑战、发送，组成完整的一轮
    pub async fn start_turn(
        &self,
        conversation: &ConversationRequest,
        session: &Session,
        owner: &str,
    ) -> ApiResult<Turn> {
        let (requirement, p) = self.check_require(session).await?;
        let tokens = self.solve_challenges(&requirement, &p, session).await;
        self.send_turn(conversation, &tokens, session, owner).await
    }

    fn resolver(&self, session: &Session) -> Arc<dyn AssetResolver> {
        Arc::new(FileDownloader::new(
            self.client.clone(),
            self.config.files_url(),
            self.headers(session),
        ))
    }

    /// 处理一次聊天补全。首轮的错误直接返回，之后的输出通过流传递
    pub async fn converse(
        self: &Arc<Self>,
        request: &ChatCompletionRequest,
        session: Session,
    ) -> ApiResult<ConversationStream> {
        let mut conversation = self
            .converter
            .build_request(request, &session.secret, &session.device_id)
            .await;
        let owner = generate_uuid();
        let first = self.start_turn(&conversation, &session, &owner).await?;

        let (tx, rx) = mpsc::channel(100);
        let client = Arc::clone(self);
        let resolver = self.resolver(&session);
        let max_turns = self.config.chatgpt.max_turns.max(1);

        tokio::spawn(async move {
            let next_turn = |token: ContinuationToken| {
                conversation.continue_from(&token);
                let conversation = conversation.clone();
                let client = client.clone();
                let session = session.clone();
                let owner = owner.clone();
                async move { client.start_turn(&conversation, &session, &owner).await }
            };
            drive_conversation(first, max_turns, resolver, next_turn, tx).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// 语音合成：提交原文，取得助手消息后调用 synthesize，最后隐藏该会话
    pub async fn synthesize(
        &self,
        speech: &SpeechRequest,
        session: &Session,
    ) -> ApiResult<(Vec<u8>, &'static str)> {
        let conversation = self.converter.speech_request(&speech.input);
        let turn = self.start_turn(&conversation, session, &generate_uuid()).await?;
        let (message_id, conversation_id) = assistant_message(turn, &speech.input).await?;

        let (voice, format, content_type) = speech_params(&speech.voice, &speech.response_format);
        let response = self
            .client
            .get(format!("{}/backend-api/synthesize", self.config.chatgpt.base_url))
            .headers(self.headers(session))
            .query(&[
                ("message_id", message_id.as_str()),
                ("conversation_id", conversation_id.as_str()),
                ("voice", voice),
                ("format", format),
            ])
            .send()
            .await;

        let result = match response {
            Ok(response) if response.status().is_success() => response
                .bytes()
                .await
                .map(|bytes| (bytes.to_vec(), content_type))
                .map_err(ApiError::from),
            Ok(response) => Err(upstream_error_from(response).await),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.hide_conversation(session, &conversation_id).await {
            warn!("隐藏会话失败 {}: {}", conversation_id, e);
        }
        result
    }

    async fn hide_conversation(&self, session: &Session, conversation_id: &str) -> ApiResult<()> {
        if conversation_id.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .patch(format!(
                "{}/backend-api/conversation/{}",
                self.config.chatgpt.base_url, conversation_id
            ))
            .headers(self.headers(session))
            .json(&json!({ "is_visible": false }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(upstream_error_from(response).await);
        }
        Ok(())
    }
}

/// 从一轮回复中找出助手消息，优先内容与原文一致的那条
async fn assistant_message(turn: Turn, input: &str) -> ApiResult<(String, String)> {
    let mut lines = turn.lines;
    let mut conversation_id = turn.conversation_id;
    let mut message_id = String::new();

    while let Some(line) = lines.next().await {
        let Ok(line) = line else { continue };
        let data = line.trim().trim_start_matches("data:").trim();
        if data.starts_with("[DONE]") {
            break;
        }
        let Ok(frame) = serde_json::from_str::<BackendFrame>(data) else {
            continue;
        };
        if let Some(error) = frame.error.clone() {
            return Err(ApiError::BackendStream(error));
        }
        let Some(event) = StreamEvent::from_frame(frame) else {
            continue;
        };
        if event.author_role != "assistant" {
            continue;
        }
        if conversation_id.is_empty() {
            conversation_id = event.conversation_id.clone();
        }
        if event.first_text() == Some(input) || message_id.is_empty() {
            message_id = event.message_id;
        }
    }

    if message_id.is_empty() || conversation_id.is_empty() {
        return Err(ApiError::Internal("no assistant message to synthesize".to_string()));
    }
    Ok((message_id, conversation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::request_converter::{new_conversation, resolve_model};
    use crate::services::ws_pool::SUBPROTOCOL;
    use axum::http::header;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures_util::{stream, SinkExt};
    use parking_lot::Mutex;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    struct NoAssets;

    #[async_trait]
    impl AssetResolver for NoAssets {
        async fn download_url(&self, _asset_pointer: &str) -> Option<String> {
            None
        }
    }

    fn data_line(text: &str, message_id: &str, finish: Option<&str>) -> String {
        let mut message = json!({
            "id": message_id,
            "author": { "role": "assistant" },
            "content": { "content_type": "text", "parts": [text] },
            "recipient": "all",
            "metadata": { "message_type": "next" }
        });
        if let Some(finish) = finish {
            message["end_turn"] = json!(finish != "max_tokens");
            message["metadata"]["finish_details"] = json!({ "type": finish });
        }
        format!("data: {}", json!({ "message": message, "conversation_id": "conv-1" }))
    }

    fn scripted_turn(lines: Vec<String>) -> Turn {
        Turn {
            lines: Box::pin(stream::iter(lines.into_iter().map(Ok))),
            conversation_id: String::new(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ApiResult<NormalizedEvent>>) -> Vec<ApiResult<NormalizedEvent>> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn text_of(events: &[ApiResult<NormalizedEvent>]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(NormalizedEvent::Delta { content, .. }) => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_continuation_resumes_conversation() {
        let (tx, rx) = mpsc::channel(100);
        let requested = Arc::new(Mutex::new(Vec::new()));

        let first = scripted_turn(vec![
            data_line("Hello", "m1", None),
            data_line("Hello wor", "m1", Some("max_tokens")),
        ]);
        let log = requested.clone();
        let next_turn = move |token: ContinuationToken| {
            log.lock().push(token);
            async {
                // 续写轮次重复发送已有前缀
                Ok(scripted_turn(vec![
                    data_line("Hello world", "m1", None),
                    data_line("Hello world!", "m1", Some("stop")),
                ]))
            }
        };

        drive_conversation(first, 3, Arc::new(NoAssets), next_turn, tx).await;
        let events = collect(rx).await;

        assert_eq!(text_of(&events), "Hello world!");
        assert!(matches!(events.last(), Some(Ok(NormalizedEvent::Finish(r))) if r == "stop"));
        assert_eq!(
            requested.lock().as_slice(),
            &[ContinuationToken {
                conversation_id: "conv-1".to_string(),
                parent_message_id: "m1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_continuation_ceiling_returns_partial_text() {
        let (tx, rx) = mpsc::channel(100);
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        let next_turn = move |_token: ContinuationToken| {
            *counter.lock() += 1;
            let n = *counter.lock();
            async move {
                Ok(scripted_turn(vec![data_line(
                    &format!("part{}", n),
                    &format!("m{}", n),
                    Some("max_tokens"),
                )]))
            }
        };
        let first = scripted_turn(vec![data_line("part0", "m0", Some("max_tokens"))]);

        drive_conversation(first, 3, Arc::new(NoAssets), next_turn, tx).await;
        let events = collect(rx).await;

        assert_eq!(*calls.lock(), 2);
        assert_eq!(text_of(&events), "part0part1part2");
        assert!(matches!(events.last(), Some(Ok(NormalizedEvent::Finish(r))) if r == "length"));
        assert!(events.iter().all(|e| e.is_ok()));
    }

    #[tokio::test]
    async fn test_backend_error_envelope_aborts() {
        let (tx, rx) = mpsc::channel(100);
        let first = scripted_turn(vec![
            data_line("Hi", "m1", None),
            format!("data: {}", json!({ "error": "conversation not found" })),
            data_line("Hi there", "m1", Some("stop")),
        ]);
        let next_turn = |_token: ContinuationToken| async {
            Err::<Turn, _>(ApiError::Internal("unexpected".to_string()))
        };

        drive_conversation(first, 3, Arc::new(NoAssets), next_turn, tx).await;
        let events = collect(rx).await;

        assert_eq!(text_of(&events), "Hi");
        assert!(matches!(events.last(), Some(Err(ApiError::BackendStream(_)))));
    }

    #[test]
    fn test_backend_headers() {
        let secret = Secret {
            token: "tok".to_string(),
            puid: String::new(),
            team_user_id: "team-1".to_string(),
        };
        let headers = backend_headers(&secret, "device-1", Some("fallback"));
        assert_eq!(headers["authorization"], "Bearer tok");
        assert_eq!(headers["oai-device-id"], "device-1");
        assert_eq!(headers["cookie"], "_puid=fallback;");
        assert_eq!(headers["chatgpt-account-id"], "team-1");

        let anonymous = backend_headers(&Secret::default(), "device-2", None);
        assert!(anonymous.get("authorization").is_none());
        assert!(anonymous.get("cookie").is_none());
        assert!(anonymous.get("chatgpt-account-id").is_none());
    }

    #[test]
    fn test_sentinel_headers_only_when_required() {
        let mut headers = HeaderMap::new();
        apply_sentinel_headers(
            &mut headers,
            &SentinelTokens {
                chat_requirements: "req".to_string(),
                proof: Some("gAAAAABproof".to_string()),
                arkose: None,
                turnstile: None,
            },
        );
        assert_eq!(headers["openai-sentinel-chat-requirements-token"], "req");
        assert_eq!(headers["openai-sentinel-proof-token"], "gAAAAABproof");
        assert!(headers.get("openai-sentinel-arkose-token").is_none());
        assert!(headers.get("openai-sentinel-turnstile-token").is_none());
    }

    #[test]
    fn test_upstream_error_classification() {
        match upstream_error(429, r#"{"detail":"rate limited"}"#) {
            ApiError::Upstream { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body["detail"], "rate limited");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            upstream_error(403, "<html>blocked</html>"),
            ApiError::UpstreamRaw { status: 403, .. }
        ));
    }

    #[test]
    fn test_speech_params() {
        assert_eq!(speech_params("alloy", "mp3"), ("cove", "mp3", "audio/mpeg"));
        assert_eq!(speech_params("echo", "opus"), ("ember", "opus", "audio/ogg"));
        assert_eq!(speech_params("fable", "flac"), ("breeze", "aac", "audio/aac"));
        assert_eq!(speech_params("shimmer", ""), ("juniper", "aac", "audio/aac"));
        assert_eq!(speech_params("unknown", "wav"), ("cove", "aac", "audio/aac"));
    }

    #[test]
    fn test_sequence_ack_format() {
        let ack: Value = serde_json::from_str(&sequence_ack(50)).unwrap();
        assert_eq!(ack, json!({ "type": "sequenceAck", "sequenceId": 50 }));
    }

    #[tokio::test]
    async fn test_assistant_message_prefers_echoed_text() {
        let turn = scripted_turn(vec![
            data_line("something else", "m-other", None),
            data_line("read me", "m-echo", None),
            "data: [DONE]".to_string(),
        ]);
        let (message_id, conversation_id) = assistant_message(turn, "read me").await.unwrap();
        assert_eq!(message_id, "m-echo");
        assert_eq!(conversation_id, "conv-1");
    }

    async fn accept_relay(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_hdr_async(stream, |_: &Request, mut response: WsResponse| {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                http::HeaderValue::from_static(SUBPROTOCOL),
            );
            Ok::<_, ErrorResponse>(response)
        })
        .await
        .unwrap()
    }

    fn relay_frame(sequence: u64, response_id: &str, body: &str) -> Message {
        Message::Text(
            json!({
                "sequenceId": sequence,
                "data": {
                    "response_id": response_id,
                    "body": general_purpose::STANDARD.encode(body),
                }
            })
            .to_string(),
        )
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn wss(url: String) -> WssResponse {
        WssResponse {
            wss_url: url,
            conversation_id: "conv-1".to_string(),
            response_id: "resp-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_acks_and_resumes_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (acks_tx, mut acks_rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            let mut ws = accept_relay(&listener).await;
            ws.send(relay_frame(1, "other", "data: ignored\n\n")).await.unwrap();
            ws.send(relay_frame(49, "resp-1", "data: first\n\n")).await.unwrap();
            ws.send(relay_frame(50, "resp-1", "data: second\n\ndata: third\n\n"))
                .await
                .unwrap();
            if let Some(ack) = next_text(&mut ws).await {
                acks_tx.send(ack).unwrap();
            }
            // 不经关闭握手直接断开
            drop(ws);

            let mut ws = accept_relay(&listener).await;
            if let Some(ack) = next_text(&mut ws).await {
                acks_tx.send(ack).unwrap();
            }
            ws.send(relay_frame(51, "resp-1", "data: fourth\n\ndata: [DONE]\n\n"))
                .await
                .unwrap();
            let _ = next_text(&mut ws).await;
        });

        let pool = WsPool::new();
        let lease = pool.lease("token", "req-1");
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(relay_websocket(lease, wss(url), tx));

        let lines = tokio::time::timeout(Duration::from_secs(10), async {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line.unwrap());
            }
            lines
        })
        .await
        .unwrap();

        assert_eq!(
            lines,
            vec![
                "data: first",
                "data: second",
                "data: third",
                "data: fourth",
                "data: [DONE]"
            ]
        );
        assert_eq!(acks_rx.recv().await.unwrap(), sequence_ack(50));
        // 重连后重发最后确认的位置
        assert_eq!(acks_rx.recv().await.unwrap(), sequence_ack(50));
        assert_eq!(pool.locked_count("token"), 0);
        server.abort();
    }

    #[tokio::test]
    async fn test_relay_gives_up_after_reconnect_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let pool = WsPool::new();
        let (tx, mut rx) = mpsc::channel(16);
        relay_websocket(pool.lease("token", "req-1"), wss(url), tx).await;

        assert!(matches!(rx.recv().await, Some(Err(ApiError::WebSocket(_)))));
        assert!(rx.recv().await.is_none());
    }

    /// 匿名端点返回 SSE，认证端点返回 relay 描述
    async fn fake_backend(relay_url: String) -> String {
        let relay = json!({
            "wss_url": relay_url,
            "response_id": "resp-1",
            "conversation_id": "conv-9",
        });
        let app = Router::new()
            .route(
                "/backend-anon/conversation",
                post(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        "data: hello\n\ndata: [DONE]\n\n",
                    )
                }),
            )
            .route(
                "/backend-api/conversation",
                post(move || {
                    let relay = relay.clone();
                    async move { Json(relay) }
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String, proxy: Option<String>) -> ChatGptClient {
        let mut config = Config::default();
        config.chatgpt.base_url = base_url;
        config.chatgpt.api_reverse_proxy = proxy;
        ChatGptClient::new(config).unwrap()
    }

    fn conversation() -> ConversationRequest {
        let (model, mode) = resolve_model("gpt-4o");
        new_conversation(model, mode, false)
    }

    async fn lines_of(turn: Turn) -> Vec<String> {
        turn.lines.map(|line| line.unwrap()).collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn test_event_stream_response_is_read_as_sse() {
        let base = fake_backend("ws://127.0.0.1:9".to_string()).await;
        let client = client_for(base, None);

        let turn = client
            .send_turn(&conversation(), &SentinelTokens::default(), &Session::anonymous(), "req")
            .await
            .unwrap();
        assert!(turn.conversation_id.is_empty());
        assert_eq!(lines_of(turn).await, vec!["hello", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_relay_response_switches_to_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut ws = accept_relay(&listener).await;
            ws.send(relay_frame(1, "resp-1", "data: relayed\n\ndata: [DONE]\n\n"))
                .await
                .unwrap();
            let _ = next_text(&mut ws).await;
        });

        let client = client_for(fake_backend(relay_url).await, None);
        let session = Session::new(
            "a@example.com".to_string(),
            Secret {
                token: "token".to_string(),
                ..Default::default()
            },
        );

        let turn = client
            .send_turn(&conversation(), &SentinelTokens::default(), &session, "req")
            .await
            .unwrap();
        assert_eq!(turn.conversation_id, "conv-9");
        let lines = tokio::time::timeout(Duration::from_secs(10), lines_of(turn))
            .await
            .unwrap();
        assert_eq!(lines, vec!["data: relayed", "data: [DONE]"]);
        server.abort();
    }

    #[tokio::test]
    async fn test_anonymous_session_cannot_use_relay() {
        let base = fake_backend("ws://127.0.0.1:9".to_string()).await;
        let proxy = format!("{}/backend-api/conversation", base);
        let client = client_for(base, Some(proxy));

        let result = client
            .send_turn(&conversation(), &SentinelTokens::default(), &Session::anonymous(), "req")
            .await;
        assert!(matches!(result, Err(ApiError::WebSocket(_))));
    }
}
