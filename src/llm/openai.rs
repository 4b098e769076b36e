//! OpenAI 兼容 API 客户端
//!
//! 直接用 reqwest 调用 `{base_url}/chat/completions`（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 流式响应按 SSE 行解析：`data: {...}` 中的 delta.content 逐段产出，delta.tool_calls 按 index 累积，
//! 在 `[DONE]` 或流结束时一次性产出拼装好的工具调用。

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::traits::{ChatRequest, Completion, DeltaStream, LlmClient, LlmDelta, LlmError};
use crate::config::LlmSection;
use crate::memory::{Role, ToolCall};

pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn from_config(cfg: &LlmSection) -> Result<Self, LlmError> {
        let api_key = cfg
            .resolved_api_key()
            .ok_or_else(|| LlmError::NotConfigured("missing api key (llm.api_key or OPENAI_API_KEY)".to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.timeouts.connect))
            .read_timeout(Duration::from_secs(cfg.timeouts.request))
            .build()
            .map_err(|e| LlmError::NotConfigured(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
            temperature: cfg.temperature,
        })
    }

    fn to_openai_messages(request: &ChatRequest) -> Vec<Value> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            out.push(json!({"role": "system", "content": request.system}));
        }
        for m in &request.messages {
            let value = match m.role {
                Role::User => json!({"role": "user", "content": m.content}),
                Role::Assistant if m.tool_calls.is_empty() => json!({"role": "assistant", "content": m.content}),
                Role::Assistant => json!({
                    "role": "assistant",
                    "content": m.content,
                    "tool_calls": m.tool_calls.iter().map(|c| json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })).collect::<Vec<_>>(),
                }),
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                }),
            };
            out.push(value);
        }
        out
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": Self::to_openai_messages(request),
            "temperature": self.temperature,
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {"name": t.name, "description": t.description, "parameters": t.parameters},
                    })
                })
                .collect();
        }
        body
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(request, stream))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// SSE 解析状态：字节行缓冲（多字节字符可能跨网络分块，只解码完整的行）、按 index 累积的工具调用片段、待产出的增量
struct SseState<S> {
    body: S,
    buffer: Vec<u8>,
    calls: BTreeMap<usize, ToolCall>,
    ready: VecDeque<Result<LlmDelta, LlmError>>,
    finished: bool,
}

impl<S> SseState<S> {
    fn new(body: S) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            calls: BTreeMap::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// 处理缓冲区中的完整行
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.finish();
                return;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => self.apply(chunk),
                Err(e) => tracing::debug!("skipping undecodable SSE line: {}", e),
            }
        }
    }

    fn apply(&mut self, chunk: StreamChunk) {
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.ready.push_back(Ok(LlmDelta::Text(text)));
            }
            for part in choice.delta.tool_calls.into_iter().flatten() {
                let call = self.calls.entry(part.index).or_insert_with(|| ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = part.id {
                    call.id = id;
                }
                if let Some(f) = part.function {
                    if let Some(name) = f.name {
                        call.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        call.arguments.push_str(&args);
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let calls: Vec<ToolCall> = std::mem::take(&mut self.calls).into_values().collect();
        if calls.iter().any(|c| c.id.is_empty() || c.name.is_empty()) {
            self.ready
                .push_back(Err(LlmError::Protocol("incomplete tool call in stream".to_string())));
        } else if !calls.is_empty() {
            self.ready.push_back(Ok(LlmDelta::ToolCalls(calls)));
        }
    }
}

fn sse_deltas<S>(body: S) -> impl Stream<Item = Result<LlmDelta, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    stream::unfold(SseState::new(body), |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(LlmError::from(e)), state));
                }
                None => {
                    state.buffer.push(b'\n');
                    state.drain_lines();
                    state.finish();
                }
            }
        }
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;
        let parsed: ChatResponse = response.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::Protocol("response has no choices".to_string()))?;
        Ok(Completion {
            text: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .into_iter()
                .flatten()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        let response = self.send(request, true).await?;
        Ok(Box::pin(sse_deltas(Box::pin(response.bytes_stream()))))
    }

    fn name(&self) -> &str {
        &self.model
    }
}
