use serde::{Deserialize, Serialize};
use serde_json::Value;

// OpenAI兼容的聊天请求结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatMessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatMessageContent {
    Text(String),
    Array(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: Option<String>,
}

// OpenAI兼容的响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: Option<ChatMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// 流式响应数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
}

// 管理接口
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordUpdate {
    #[serde(default)]
    pub password: String,
}

// TTS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub input: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub response_format: String,
}

// 账号会话凭据，持久化到 access_tokens.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub puid: String,
    #[serde(default, rename = "teamUserID")]
    pub team_user_id: String,
}

impl Secret {
    pub fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }
}

// chat-requirements 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeRequirement {
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "proofofwork")]
    pub proof: ProofRequirement,
    #[serde(default)]
    pub arkose: DxRequirement,
    #[serde(default)]
    pub turnstile: DxRequirement,
    #[serde(default)]
    pub force_login: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProofRequirement {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub seed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DxRequirement {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub dx: String,
}

/// 一次请求所需的 sentinel 头
#[derive(Debug, Clone, Default)]
pub struct SentinelTokens {
    pub chat_requirements: String,
    pub proof: Option<String>,
    pub arkose: Option<String>,
    pub turnstile: Option<String>,
}

// 发往后端的 conversation 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub action: String,
    pub conversation_mode: ConversationMode,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub messages: Vec<BackendMessage>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub parent_message_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub conversation_id: String,
    pub model: String,
    pub history_and_training_disabled: bool,
    pub websocket_request_id: String,
    pub force_use_sse: bool,
}

impl ConversationRequest {
    /// 将请求改写为续写轮次
    pub fn continue_from(&mut self, token: &ContinuationToken) {
        self.messages.clear();
        self.action = "continue".to_string();
        self.conversation_id = token.conversation_id.clone();
        self.parent_message_id = token.parent_message_id.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMode {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gizmo_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMessage {
    pub id: String,
    pub author: Author,
    pub content: BackendContent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<BackendMessageMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendContent {
    pub content_type: String,
    pub parts: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMessageMetadata {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    pub asset_pointer: String,
    pub content_type: String,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub width: u32,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub name: String,
    pub size: usize,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub width: u32,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub height: u32,
    #[serde(rename = "file_token_size", skip_serializing_if = "is_zero", default)]
    pub token_size: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// 上传协作者返回的文件引用
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    pub file_id: String,
    pub mime_type: String,
    pub file_name: String,
    pub size: usize,
    pub is_image: bool,
    pub width: u32,
    pub height: u32,
    pub token_size: u32,
}

// 后端流帧
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendFrame {
    #[serde(default)]
    pub message: Option<FrameMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub content: FrameContent,
    #[serde(default)]
    pub end_turn: Option<bool>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub metadata: FrameMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameContent {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub parts: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
    #[serde(default)]
    pub finish_details: Option<FinishDetails>,
    #[serde(default)]
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub start_ix: usize,
    #[serde(default)]
    pub end_ix: usize,
    #[serde(default)]
    pub metadata: CitationMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CitationMetadata {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishDetails {
    #[serde(rename = "type", default)]
    pub finish_type: String,
}

/// 解码后的单个后端事件
#[derive(Debug, Clone, Default)]
pub struct StreamEvent {
    pub author_role: String,
    pub content_type: String,
    pub parts: Vec<Value>,
    pub recipient: String,
    pub citations: Vec<Citation>,
    pub finish_details: Option<String>,
    pub message_type: Option<String>,
    pub end_turn: bool,
    pub message_id: String,
    pub conversation_id: String,
}

impl StreamEvent {
    /// 没有 message 或 parts 的帧返回 None
    pub fn from_frame(frame: BackendFrame) -> Option<Self> {
        let message = frame.message?;
        let parts = message.content.parts?;
        Some(Self {
            author_role: message.author.role,
            content_type: message.content.content_type,
            parts,
            recipient: message.recipient.unwrap_or_default(),
            citations: message.metadata.citations.unwrap_or_default(),
            finish_details: message.metadata.finish_details.map(|f| f.finish_type),
            message_type: message.metadata.message_type,
            end_turn: message.end_turn.is_some(),
            message_id: message.id,
            conversation_id: frame.conversation_id.unwrap_or_default(),
        })
    }

    pub fn first_text(&self) -> Option<&str> {
        self.parts.first().and_then(Value::as_str)
    }
}

/// max_tokens 截断后续写所需的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    pub conversation_id: String,
    pub parent_message_id: String,
}

// WebSocket relay
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WssResponse {
    #[serde(default)]
    pub wss_url: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub response_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "sequenceId", default)]
    pub sequence_id: u64,
    #[serde(default)]
    pub data: WsEnvelopeData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsEnvelopeData {
    #[serde(default)]
    pub response_id: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDownload {
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_to_event() {
        let frame: BackendFrame = serde_json::from_value(json!({
            "message": {
                "id": "msg-1",
                "author": { "role": "assistant" },
                "content": { "content_type": "text", "parts": ["Hello"] },
                "end_turn": null,
                "recipient": "all",
                "metadata": {
                    "message_type": "next",
                    "finish_details": { "type": "stop" }
                }
            },
            "conversation_id": "conv-1",
            "error": null
        }))
        .unwrap();

        let event = StreamEvent::from_frame(frame).unwrap();
        assert_eq!(event.author_role, "assistant");
        assert_eq!(event.first_text(), Some("Hello"));
        assert_eq!(event.finish_details.as_deref(), Some("stop"));
        assert!(!event.end_turn);
        assert_eq!(event.conversation_id, "conv-1");
    }

    #[test]
    fn test_frame_without_parts_is_dropped() {
        let frame: BackendFrame = serde_json::from_value(json!({
            "message": { "id": "m", "author": { "role": "assistant" }, "content": { "content_type": "text" } },
            "conversation_id": "c"
        }))
        .unwrap();
        assert!(StreamEvent::from_frame(frame).is_none());
    }

    #[test]
    fn test_continuation_rewrites_request() {
        let mut request = ConversationRequest {
            action: "next".to_string(),
            conversation_mode: ConversationMode {
                kind: "primary_assistant".to_string(),
                gizmo_id: None,
            },
            messages: vec![],
            parent_message_id: "p0".to_string(),
            conversation_id: String::new(),
            model: "gpt-4o".to_string(),
            history_and_training_disabled: true,
            websocket_request_id: "ws".to_string(),
            force_use_sse: true,
        };
        request.continue_from(&ContinuationToken {
            conversation_id: "c1".to_string(),
            parent_message_id: "m1".to_string(),
        });

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["action"], "continue");
        assert_eq!(body["conversation_id"], "c1");
        assert_eq!(body["parent_message_id"], "m1");
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn test_secret_persisted_field_names() {
        let secret = Secret {
            token: "t".to_string(),
            puid: "p".to_string(),
            team_user_id: "team".to_string(),
        };
        let value = serde_json::to_value(&secret).unwrap();
        assert_eq!(value, json!({ "token": "t", "puid": "p", "teamUserID": "team" }));
    }
}
