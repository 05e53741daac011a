//! 流式图片生成服务适配（OpenAI 兼容 `images/generations`，`stream = true`）
//!
//! 服务端以 text/event-stream 返回：
//! - `image_generation.partial_image`：中间结果
//! - `image_generation.completed`：最终结果
//! - `error`：失败

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{GenerationProvider, ProviderItem, ProviderStream};
use crate::error::{Error, Result};
use crate::protocol::GenerationRequest;

/// 生成服务配置
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// 接口地址
    pub endpoint: String,
    /// API Key（未配置时请求会直接以 error 事件结束）
    pub api_key: Option<String>,
    /// 模型
    pub model: String,
    /// 中间结果数量
    pub partial_images: u8,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/images/generations".to_string(),
            api_key: None,
            model: "gpt-image-1".to_string(),
            partial_images: 2,
        }
    }
}

impl ProviderConfig {
    /// 从环境变量创建配置
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("GALLERY_LIVE_PROVIDER_URL") {
            config.endpoint = endpoint;
        }
        config.api_key = std::env::var("GALLERY_LIVE_PROVIDER_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if let Ok(model) = std::env::var("GALLERY_LIVE_PROVIDER_MODEL") {
            config.model = model;
        }
        if let Some(n) = std::env::var("GALLERY_LIVE_PARTIAL_IMAGES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.partial_images = n;
        }

        config
    }
}

/// 流式图片生成服务
pub struct ImageProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl ImageProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl GenerationProvider for ImageProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("GALLERY_LIVE_PROVIDER_KEY is not set".into()))?;

        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": request.prompt,
            "stream": true,
            "partial_images": self.config.partial_images,
        });

        let send = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Provider("generation cancelled".into()));
            }
            response = send => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("provider error {}: {}", status, text)));
        }

        Ok(event_stream(response.bytes_stream(), cancel).boxed())
    }
}

/// 解析状态
struct EventStreamState<S> {
    bytes: Pin<Box<S>>,
    buffer: String,
    pending: VecDeque<Result<ProviderItem>>,
    cancel: CancellationToken,
    done: bool,
}

impl<S> EventStreamState<S> {
    /// 取出缓冲区里的完整行
    fn drain_lines(&mut self) {
        while let Some(newline_idx) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline_idx].to_string();
            if line.ends_with('\r') {
                line.pop();
            }
            self.buffer.drain(..=newline_idx);
            self.push_line(&line);
        }
    }

    /// 字节流结束时处理最后一行（可能没有换行）
    fn drain_remaining(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches('\r');
        if !rest.trim().is_empty() {
            self.push_line(rest);
        }
    }

    fn push_line(&mut self, line: &str) {
        if let Some(item) = parse_line(line) {
            self.pending.push_back(item);
        }
    }
}

/// 把服务端 text/event-stream 字节流解析成 ProviderItem 流
///
/// 取消信号触发后立即结束，丢弃尚未读到的内容。
fn event_stream<S, B, E>(
    bytes: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ProviderItem>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = EventStreamState {
        bytes: Box::pin(bytes),
        buffer: String::new(),
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            let chunk = tokio::select! {
                _ = st.cancel.cancelled() => return None,
                chunk = st.bytes.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.pending
                        .push_back(Err(Error::Provider(format!("stream interrupted: {}", e))));
                }
                None => {
                    st.done = true;
                    st.drain_remaining();
                }
            }
        }
    })
}

/// 解析一行；只关心 `data:` 行
fn parse_line(line: &str) -> Option<Result<ProviderItem>> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => parse_event(&value),
        Err(e) => {
            tracing::debug!("Skipping malformed provider line: {}", e);
            None
        }
    }
}

/// 服务端事件 → ProviderItem；未知类型忽略
fn parse_event(value: &Value) -> Option<Result<ProviderItem>> {
    let event_type = value.get("type").and_then(Value::as_str)?;
    let image_b64 = || {
        value
            .get("b64_json")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match event_type {
        "image_generation.partial_image" => Some(Ok(ProviderItem::Partial {
            index: value
                .get("partial_image_index")
                .and_then(Value::as_u64)
                .map(|i| i as u32),
            image_b64: image_b64(),
        })),
        "image_generation.completed" => Some(Ok(ProviderItem::Completed {
            image_b64: image_b64(),
            usage: value.get("usage").cloned(),
        })),
        "error" => {
            let message = value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            Some(Err(Error::Provider(message.to_string())))
        }
        _ => None,
    }
}
