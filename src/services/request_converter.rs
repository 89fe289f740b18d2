use crate::models::{
    Author, AttachmentMeta, BackendContent, BackendMessage, BackendMessageMetadata,
    ChatCompletionRequest, ChatMessageContent, ConversationMode, ConversationRequest, ImagePart,
    Secret,
};
use crate::services::attachments::{resolve_attachment, AttachmentUploader};
use crate::utils::{generate_uuid, is_gpt4_model, is_legacy_model};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// 旧版模型在后端的ID
pub const LEGACY_MODEL: &str = "text-davinci-002-render-sha";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const GIZMO_MARKER: &str = "-gizmo-";

/// 把客户端模型名映射为后端模型与会话模式
pub fn resolve_model(model: &str) -> (String, ConversationMode) {
    let mut mode = ConversationMode {
        kind: "primary_assistant".to_string(),
        gizmo_id: None,
    };

    if is_legacy_model(model) {
        return (LEGACY_MODEL.to_string(), mode);
    }

    if is_gpt4_model(model) {
        if let Some((base, gizmo)) = model.split_once(GIZMO_MARKER) {
            if gizmo.starts_with("g-") {
                mode.kind = "gizmo_interaction".to_string();
                mode.gizmo_id = Some(gizmo.to_string());
                return (base.to_string(), mode);
            }
        }
        return (model.to_string(), mode);
    }

    (LEGACY_MODEL.to_string(), mode)
}

/// 新会话的请求骨架
pub fn new_conversation(model: String, mode: ConversationMode, enable_history: bool) -> ConversationRequest {
    ConversationRequest {
        action: "next".to_string(),
        conversation_mode: mode,
        messages: Vec::new(),
        parent_message_id: generate_uuid(),
        conversation_id: String::new(),
        model,
        history_and_training_disabled: !enable_history,
        websocket_request_id: generate_uuid(),
        force_use_sse: true,
    }
}

/// OpenAI 请求到后端 conversation 请求的转换
pub struct RequestConverter {
    uploader: Arc<dyn AttachmentUploader>,
    enable_history: bool,
}

impl RequestConverter {
    pub fn new(uploader: Arc<dyn AttachmentUploader>, enable_history: bool) -> Self {
        Self {
            uploader,
            enable_history,
        }
    }

    pub async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        secret: &Secret,
        device_id: &str,
    ) -> ConversationRequest {
        let requested = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        // 没有 PUID 的会话只能使用旧版模型
        let requested = if secret.puid.is_empty() {
            DEFAULT_MODEL
        } else {
            requested
        };

        let (model, mode) = resolve_model(requested);
        let multimodal = is_gpt4_model(requested);
        debug!("模型映射: {} -> {} (multimodal={})", requested, model, multimodal);

        let mut conversation = new_conversation(model, mode, self.enable_history);
        for message in &request.messages {
            let role = if message.role == "system" {
                "critic"
            } else {
                message.role.as_str()
            };
            let backend_message = self
                .convert_message(role, &message.content, multimodal, secret, device_id)
                .await;
            conversation.messages.push(backend_message);
        }
        conversation
    }

    async fn convert_message(
        &self,
        role: &str,
        content: &ChatMessageContent,
        multimodal: bool,
        secret: &Secret,
        device_id: &str,
    ) -> BackendMessage {
        let mut parts: Vec<Value> = Vec::new();
        let mut attachments: Vec<AttachmentMeta> = Vec::new();
        let mut content_type = "text";

        match content {
            ChatMessageContent::Text(text) => parts.push(Value::String(text.clone())),
            ChatMessageContent::Array(items) => {
                for item in items {
                    if item.content_type != "image_url" {
                        parts.push(Value::String(item.text.clone().unwrap_or_default()));
                        continue;
                    }
                    if !multimodal {
                        continue;
                    }
                    let Some(image_url) = &item.image_url else {
                        continue;
                    };
                    let Some(file) =
                        resolve_attachment(self.uploader.as_ref(), &image_url.url, secret, device_id)
                            .await
                    else {
                        continue;
                    };

                    if file.is_image {
                        content_type = "multimodal_text";
                        let part = ImagePart {
                            asset_pointer: format!("file-service://{}", file.file_id),
                            content_type: "image_asset_pointer".to_string(),
                            size_bytes: file.size,
                            width: file.width,
                            height: file.height,
                        };
                        parts.push(serde_json::to_value(part).unwrap_or(Value::Null));
                    }
                    attachments.push(AttachmentMeta {
                        id: file.file_id,
                        mime_type: file.mime_type,
                        name: file.file_name,
                        size: file.size,
                        width: file.width,
                        height: file.height,
                        token_size: file.token_size,
                    });
                }
            }
        }

        BackendMessage {
            id: generate_uuid(),
            author: Author {
                role: role.to_string(),
            },
            content: BackendContent {
                content_type: content_type.to_string(),
                parts,
            },
            metadata: if attachments.is_empty() {
                None
            } else {
                Some(BackendMessageMetadata { attachments })
            },
        }
    }

    /// 语音合成：以助手消息形式提交原文，需要保留历史
    pub fn speech_request(&self, input: &str) -> ConversationRequest {
        let (model, mode) = resolve_model(DEFAULT_MODEL);
        let mut conversation = new_conversation(model, mode, true);
        conversation.messages.push(BackendMessage {
            id: generate_uuid(),
            author: Author {
                role: "assistant".to_string(),
            },
            content: BackendContent {
                content_type: "text".to_string(),
                parts: vec![Value::String(input.to_string())],
            },
            metadata: None,
        });
        conversation
    }
}
