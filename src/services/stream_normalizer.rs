use crate::error::{ApiError, ApiResult};
use crate::models::{BackendFrame, Citation, ContinuationToken, StreamEvent};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// 同时解析的图片数上限
const ASSET_FAN_OUT: usize = 4;

const SOURCE_OPEN: &str = "【";
const SOURCE_CLOSE: &str = "】";

/// 把 asset pointer 解析成可下载的地址
#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn download_url(&self, asset_pointer: &str) -> Option<String>;
}

/// 规范化后的输出
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Delta {
        role: Option<String>,
        content: String,
    },
    Finish(String),
    /// 被 max_tokens 截断，需要续写
    Continue(ContinuationToken),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerState {
    AwaitingRole,
    Streaming,
    /// 等待引用标记闭合
    AwaitingSource,
    Completed,
}

/// 按插入顺序为引用编号并拼接到文本中
pub fn splice_citations(text: &str, citations: &[Citation]) -> String {
    let mut sorted: Vec<&Citation> = citations.iter().collect();
    sorted.sort_by_key(|c| c.start_ix);

    let mut chars: Vec<char> = text.chars().collect();
    let mut offset: isize = 0;

    for (i, citation) in sorted.iter().enumerate() {
        let len = chars.len() as isize;
        let start = (citation.start_ix as isize + offset).clamp(0, len) as usize;
        let end = (citation.end_ix as isize + offset).clamp(start as isize, len) as usize;

        let reference = format!(
            "[^{}^]({} \"{}\")",
            i + 1,
            citation.metadata.url,
            citation.metadata.title
        );

        let before = chars.len();
        chars.splice(start..end, reference.chars());
        offset += chars.len() as isize - before as isize;
    }

    chars.into_iter().collect()
}

/// 后端事件流到 OpenAI 增量的状态机，每轮一个实例
pub struct StreamNormalizer {
    resolver: Arc<dyn AssetResolver>,
    state: NormalizerState,
    role_sent: bool,
    previous_text: String,
    conversation_id: Option<String>,
    last_message_id: String,
    finish_reason: Option<String>,
    resolved_assets: HashSet<String>,
}

impl StreamNormalizer {
    pub fn new(resolver: Arc<dyn AssetResolver>) -> Self {
        Self {
            resolver,
            state: NormalizerState::AwaitingRole,
            role_sent: false,
            previous_text: String::new(),
            conversation_id: None,
            last_message_id: String::new(),
            finish_reason: None,
            resolved_assets: HashSet::new(),
        }
    }

    /// WebSocket relay 会预先给出会话ID
    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        if !conversation_id.is_empty() {
            self.conversation_id = Some(conversation_id.to_string());
        }
        self
    }

    /// 续写轮次沿用上一轮已输出的文本，后端重复发送的前缀不再输出
    pub fn resume(mut self, previous_text: String) -> Self {
        self.role_sent = !previous_text.is_empty();
        self.previous_text = previous_text;
        self
    }

    pub fn emitted_text(&self) -> &str {
        &self.previous_text
    }

    pub fn state(&self) -> NormalizerState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == NormalizerState::Completed
    }

    /// 处理一行 data，返回需要输出的事件。错误信封直接返回错误
    pub async fn push(&mut self, data: &str) -> ApiResult<Vec<NormalizedEvent>> {
        if self.is_completed() {
            return Ok(Vec::new());
        }

        let data = data.trim();
        let data = data.strip_prefix("data:").map(str::trim_start).unwrap_or(data);
        if data.is_empty() {
            return Ok(Vec::new());
        }

        if data.starts_with("[DONE]") {
            return Ok(self.finish().into_iter().collect());
        }

        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("跳过无法解析的帧: {}", e);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = frame.error.clone() {
            warn!("后端流返回错误: {}", error);
            self.state = NormalizerState::Completed;
            return Err(ApiError::BackendStream(error));
        }

        match StreamEvent::from_frame(frame) {
            Some(event) => self.handle_event(event).await,
            None => Ok(Vec::new()),
        }
    }

    /// 流结束时的收尾事件
    pub fn finish(&mut self) -> Option<NormalizedEvent> {
        if self.is_completed() {
            return None;
        }
        self.state = NormalizerState::Completed;

        match self.finish_reason.as_deref() {
            Some("max_tokens") => Some(NormalizedEvent::Continue(self.continuation_token())),
            Some(reason) if !reason.is_empty() => Some(NormalizedEvent::Finish(reason.to_string())),
            _ => Some(NormalizedEvent::Finish("stop".to_string())),
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> ApiResult<Vec<NormalizedEvent>> {
        match &self.conversation_id {
            Some(id) if !event.conversation_id.is_empty() && *id != event.conversation_id => {
                return Ok(Vec::new());
            }
            None if !event.conversation_id.is_empty() => {
                self.conversation_id = Some(event.conversation_id.clone());
            }
            _ => {}
        }

        if !accepts(&event) {
            return Ok(Vec::new());
        }

        self.last_message_id = event.message_id.clone();
        if let Some(reason) = &event.finish_details {
            self.finish_reason = Some(reason.clone());
        }
        let mut output = Vec::new();
        let content = if event.content_type == "multimodal_text" {
            self.resolve_assets(&event).await
        } else {
            self.text_delta(&event)
        };

        if let Some(content) = content {
            let role = if self.role_sent {
                None
            } else {
                self.role_sent = true;
                Some("assistant".to_string())
            };
            if self.state == NormalizerState::AwaitingRole {
                self.state = NormalizerState::Streaming;
            }
            output.push(NormalizedEvent::Delta { role, content });
        }

        if event.end_turn {
            output.extend(self.finish());
        }
        Ok(output)
    }

    fn text_delta(&mut self, event: &StreamEvent) -> Option<String> {
        let text = event.first_text()?;

        let text = if event.citations.is_empty() {
            text.to_string()
        } else {
            splice_citations(text, &event.citations)
        };

        let delta = text
            .strip_prefix(self.previous_text.as_str())
            .unwrap_or(text.as_str())
            .to_string();

        // 未闭合的引用标记之前的部分照常输出，其余等待后续帧
        if let Some(open) = dangling_source(&delta).filter(|_| !event.end_turn) {
            let held = delta.len() - open;
            self.previous_text = text[..text.len() - held].to_string();
            self.state = NormalizerState::AwaitingSource;
            let emitted = &delta[..open];
            return if emitted.is_empty() {
                None
            } else {
                Some(emitted.to_string())
            };
        }

        if self.state == NormalizerState::AwaitingSource {
            self.state = NormalizerState::Streaming;
        }
        if delta.is_empty() {
            return None;
        }
        self.previous_text = text;
        Some(delta)
    }

    async fn resolve_assets(&mut self, event: &StreamEvent) -> Option<String> {
        let assets: Vec<(String, String)> = event
            .parts
            .iter()
            .filter_map(asset_part)
            .filter(|(pointer, _)| !self.resolved_assets.contains(pointer))
            .collect();
        if assets.is_empty() {
            return None;
        }

        let resolver = self.resolver.clone();
        let images: Vec<String> = stream::iter(assets.iter().cloned())
            .map(|(pointer, prompt)| {
                let resolver = resolver.clone();
                async move {
                    match resolver.download_url(&pointer).await {
                        Some(url) => format!("[![image]({} \"{}\")]({})", url, prompt, url),
                        None => {
                            warn!("图片地址解析失败: {}", pointer);
                            String::new()
                        }
                    }
                }
            })
            .buffered(ASSET_FAN_OUT)
            .collect()
            .await;

        self.resolved_assets
            .extend(assets.into_iter().map(|(pointer, _)| pointer));

        let content = images.concat();
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }

    fn continuation_token(&self) -> ContinuationToken {
        ContinuationToken {
            conversation_id: self.conversation_id.clone().unwrap_or_default(),
            parent_message_id: self.last_message_id.clone(),
        }
    }
}

fn dangling_source(delta: &str) -> Option<usize> {
    let open = delta.rfind(SOURCE_OPEN)?;
    if delta[open..].contains(SOURCE_CLOSE) {
        None
    } else {
        Some(open)
    }
}

fn decode_frame(data: &str) -> ApiResult<BackendFrame> {
    serde_json::from_str(data).map_err(|e| ApiError::StreamDecode(e.to_string()))
}

/// 只保留发给用户的助手输出
fn accepts(event: &StreamEvent) -> bool {
    let role_ok = event.author_role == "assistant"
        || (event.author_role == "tool" && event.content_type != "text");
    let type_ok = matches!(event.message_type.as_deref(), None | Some("next") | Some("continue"));

    role_ok
        && type_ok
        && !event.parts.is_empty()
        && event.content_type.ends_with("text")
        && event.recipient == "all"
}

/// (asset_pointer, prompt)
fn asset_part(part: &Value) -> Option<(String, String)> {
    let pointer = part.get("asset_pointer")?.as_str()?;
    let prompt = part
        .pointer("/metadata/dalle/prompt")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some((pointer.to_string(), prompt.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CitationMetadata;
    use parking_lot::Mutex;
    use serde_json::json;

    struct FakeResolver {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetResolver for FakeResolver {
        async fn download_url(&self, asset_pointer: &str) -> Option<String> {
            self.calls.lock().push(asset_pointer.to_string());
            if asset_pointer.ends_with("broken") {
                None
            } else {
                Some(format!("https://files.local/{}", asset_pointer.trim_start_matches("file-service://")))
            }
        }
    }

    fn normalizer() -> (StreamNormalizer, Arc<FakeResolver>) {
        let resolver = Arc::new(FakeResolver {
            calls: Mutex::new(Vec::new()),
        });
        (StreamNormalizer::new(resolver.clone()), resolver)
    }

    fn citation(start_ix: usize, end_ix: usize, url: &str, title: &str) -> Citation {
        Citation {
            start_ix,
            end_ix,
            metadata: CitationMetadata {
                url: url.to_string(),
                title: title.to_string(),
            },
        }
    }

    fn frame(text: &str, message_id: &str) -> Value {
        json!({
            "message": {
                "id": message_id,
                "author": { "role": "assistant" },
                "content": { "content_type": "text", "parts": [text] },
                "recipient": "all",
                "metadata": { "message_type": "next" }
            },
            "conversation_id": "conv-1",
            "error": null
        })
    }

    fn line(value: &Value) -> String {
        format!("data: {}", value)
    }

    async fn run(normalizer: &mut StreamNormalizer, frames: &[Value]) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();
        for frame in frames {
            events.extend(normalizer.push(&line(frame)).await.unwrap());
        }
        events.extend(normalizer.push("data: [DONE]").await.unwrap());
        events
    }

    fn text_of(events: &[NormalizedEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                NormalizedEvent::Delta { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_splice_single_citation() {
        let text = "AB【C】D";
        let spliced = splice_citations(text, &[citation(2, 5, "https://a.com", "A")]);
        assert_eq!(spliced, "AB[^1^](https://a.com \"A\")D");
    }

    #[test]
    fn test_splice_two_citations_in_start_order() {
        let text = "x【1】y【2】z";
        // 故意倒序传入
        let citations = vec![
            citation(5, 8, "https://b.com", "B"),
            citation(1, 4, "https://a.com", "A"),
        ];
        let spliced = splice_citations(text, &citations);
        assert_eq!(
            spliced,
            "x[^1^](https://a.com \"A\")y[^2^](https://b.com \"B\")z"
        );
    }

    #[test]
    fn test_splice_out_of_range_is_clamped() {
        let spliced = splice_citations("abc", &[citation(2, 99, "u", "t")]);
        assert_eq!(spliced, "ab[^1^](u \"t\")");
    }

    #[tokio::test]
    async fn test_deltas_and_role() {
        let (mut normalizer, _) = normalizer();
        let events = run(
            &mut normalizer,
            &[frame("Hel", "m1"), frame("Hello", "m1"), frame("Hello!", "m1")],
        )
        .await;

        assert_eq!(
            events[0],
            NormalizedEvent::Delta {
                role: Some("assistant".to_string()),
                content: "Hel".to_string()
            }
        );
        assert_eq!(
            events[1],
            NormalizedEvent::Delta {
                role: None,
                content: "lo".to_string()
            }
        );
        assert_eq!(text_of(&events), "Hello!");
        assert_eq!(events.last(), Some(&NormalizedEvent::Finish("stop".to_string())));
        assert!(normalizer.is_completed());
    }

    #[tokio::test]
    async fn test_length_finish_has_no_continuation() {
        let (mut normalizer, _) = normalizer();
        let mut last = frame("done", "m1");
        last["message"]["end_turn"] = json!(true);
        last["message"]["metadata"]["finish_details"] = json!({ "type": "length" });

        let events = run(&mut normalizer, &[frame("do", "m1"), last]).await;
        assert_eq!(events.last(), Some(&NormalizedEvent::Finish("length".to_string())));
        assert!(!events.iter().any(|e| matches!(e, NormalizedEvent::Continue(_))));
    }

    #[tokio::test]
    async fn test_max_tokens_yields_continuation() {
        let (mut normalizer, _) = normalizer();
        let mut last = frame("partial", "m2");
        last["message"]["end_turn"] = json!(false);
        last["message"]["metadata"]["finish_details"] = json!({ "type": "max_tokens" });

        let events = run(&mut normalizer, &[frame("part", "m1"), last]).await;
        assert_eq!(
            events.last(),
            Some(&NormalizedEvent::Continue(ContinuationToken {
                conversation_id: "conv-1".to_string(),
                parent_message_id: "m2".to_string(),
            }))
        );
        assert_eq!(text_of(&events), "partial");
    }

    #[tokio::test]
    async fn test_filtering_rules() {
        let (mut normalizer, _) = normalizer();

        let mut user = frame("echo", "u1");
        user["message"]["author"]["role"] = json!("user");
        let mut browser = frame("search(\"x\")", "a1");
        browser["message"]["recipient"] = json!("browser");
        let mut tool_text = frame("tool output", "t1");
        tool_text["message"]["author"]["role"] = json!("tool");
        let mut other_conversation = frame("other", "m9");
        other_conversation["conversation_id"] = json!("conv-2");

        let events = run(
            &mut normalizer,
            &[frame("hi", "m1"), user, browser, tool_text, other_conversation],
        )
        .await;
        assert_eq!(text_of(&events), "hi");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (mut normalizer, _) = normalizer();
        assert!(normalizer.push("data: {not json").await.unwrap().is_empty());
        assert!(normalizer.push("").await.unwrap().is_empty());
        assert_eq!(normalizer.state(), NormalizerState::AwaitingRole);

        let events = normalizer.push(&line(&frame("ok", "m1"))).await.unwrap();
        assert_eq!(text_of(&events), "ok");
    }

    #[tokio::test]
    async fn test_error_envelope_is_fatal() {
        let (mut normalizer, _) = normalizer();
        let error = json!({ "message": null, "error": "Something went wrong" });
        let result = normalizer.push(&line(&error)).await;
        assert!(matches!(result, Err(ApiError::BackendStream(_))));
        assert!(normalizer.is_completed());
    }

    #[tokio::test]
    async fn test_dangling_source_marker_waits_for_citation() {
        let (mut normalizer, _) = normalizer();

        let mut cited = frame("AB【C】D", "m1");
        cited["message"]["metadata"]["citations"] = json!([
            { "start_ix": 2, "end_ix": 5, "metadata": { "url": "https://a.com", "title": "A" } }
        ]);

        let mut events = Vec::new();
        events.extend(normalizer.push(&line(&frame("AB", "m1"))).await.unwrap());
        events.extend(normalizer.push(&line(&frame("AB【", "m1"))).await.unwrap());
        assert_eq!(normalizer.state(), NormalizerState::AwaitingSource);
        events.extend(normalizer.push(&line(&frame("AB【C", "m1"))).await.unwrap());
        assert_eq!(text_of(&events), "AB");

        events.extend(normalizer.push(&line(&cited)).await.unwrap());
        assert_eq!(normalizer.state(), NormalizerState::Streaming);
        assert_eq!(text_of(&events), "AB[^1^](https://a.com \"A\")D");
    }

    #[tokio::test]
    async fn test_multimodal_parts_resolve_once() {
        let (mut normalizer, resolver) = normalizer();
        let image = json!({
            "message": {
                "id": "t1",
                "author": { "role": "tool" },
                "content": {
                    "content_type": "multimodal_text",
                    "parts": [
                        { "asset_pointer": "file-service://file-a", "metadata": { "dalle": { "prompt": "a cat" } } },
                        { "asset_pointer": "file-service://file-broken" }
                    ]
                },
                "recipient": "all",
                "metadata": {}
            },
            "conversation_id": "conv-1"
        });

        let events = run(&mut normalizer, &[image.clone(), image]).await;
        assert_eq!(
            text_of(&events),
            "[![image](https://files.local/file-a \"a cat\")](https://files.local/file-a)"
        );
        assert_eq!(resolver.calls.lock().len(), 2);
    }
}
