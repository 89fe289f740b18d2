use crate::error::ApiError;
use crate::handlers::AppState;
use crate::models::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatMessageContent,
    ChatMessageDelta, ChatUsage, StreamChoice, StreamChunk,
};
use crate::services::chatgpt_client::ConversationStream;
use crate::services::request_converter::DEFAULT_MODEL;
use crate::services::stream_normalizer::NormalizedEvent;
use crate::services::Session;
use crate::utils::{generate_random_string, mask_token, unix_timestamp};
use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Json, Response, Sse},
};
use futures_util::{stream, stream::StreamExt, Stream};
use serde_json::{json, Value};
use std::convert::Infallible;

/// 聊天补全处理器
pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    // 验证请求
    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest("Messages cannot be empty".to_string()));
    }

    let session = acquire_session(&state);
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let stream = request.stream.unwrap_or(false);

    let events = state.client.converse(&request, session).await?;
    let completion_id = format!("chatcmpl-{}", generate_random_string(29));

    if stream {
        // 流式响应
        let sse_stream = create_sse_stream(events, completion_id, model);
        Ok(Sse::new(sse_stream).into_response())
    } else {
        // 非流式响应
        let response = collect_completion(events, completion_id, model).await?;
        Ok(Json(response).into_response())
    }
}

/// 从调度器取一个账号会话，没有账号时匿名访问
pub fn acquire_session(state: &AppState) -> Session {
    match state.scheduler.acquire_secret() {
        Some((account, secret)) => {
            tracing::debug!("使用账号 {} ({})", account, mask_token(&secret.token));
            Session::new(account, secret)
        }
        None => Session::anonymous(),
    }
}

/// 获取模型列表
pub async fn models() -> Json<Value> {
    let data: Vec<Value> = ["gpt-3.5-turbo", "gpt-4", "gpt-4o", "gpt-4o-mini"]
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1688888888,
                "owned_by": "chatgpt-to-api"
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": data
    }))
}

fn stream_chunk(
    id: &str,
    model: &str,
    delta: ChatMessageDelta,
    finish_reason: Option<String>,
) -> StreamChunk {
    StreamChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

/// 规范化事件转为 OpenAI chunk，Continue 不会到达这里
fn event_to_chunk(event: NormalizedEvent, id: &str, model: &str) -> Option<StreamChunk> {
    match event {
        NormalizedEvent::Delta { role, content } => Some(stream_chunk(
            id,
            model,
            ChatMessageDelta {
                role,
                content: Some(content),
            },
            None,
        )),
        NormalizedEvent::Finish(reason) => Some(stream_chunk(
            id,
            model,
            ChatMessageDelta {
                role: None,
                content: None,
            },
            Some(reason),
        )),
        NormalizedEvent::Continue(_) => None,
    }
}

/// 创建SSE流
fn create_sse_stream(
    events: ConversationStream,
    id: String,
    model: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    events
        .filter_map(move |result| {
            let event = match result {
                Ok(event) => event_to_chunk(event, &id, &model)
                    .and_then(|chunk| serde_json::to_string(&chunk).ok())
                    .map(|data| Event::default().data(data)),
                Err(e) => {
                    tracing::error!("Stream error: {}", e);
                    // 发送错误事件
                    let error_data = json!({
                        "error": {
                            "message": e.to_string(),
                            "type": "stream_error"
                        }
                    });
                    Some(Event::default().data(error_data.to_string()))
                }
            };
            std::future::ready(event.map(Ok))
        })
        .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
}

/// 非流式请求收集完整回复
async fn collect_completion(
    mut events: ConversationStream,
    id: String,
    model: String,
) -> Result<ChatCompletionResponse, ApiError> {
    let mut content = String::new();
    let mut finish_reason = "stop".to_string();

    while let Some(event) = events.next().await {
        match event? {
            NormalizedEvent::Delta { content: delta, .. } => content.push_str(&delta),
            NormalizedEvent::Finish(reason) => finish_reason = reason,
            NormalizedEvent::Continue(_) => {}
        }
    }

    Ok(ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: ChatMessageContent::Text(content),
            }),
            finish_reason: Some(finish_reason),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }),
    })
}
