//! 推送协议定义
//!
//! 通信方式：text/event-stream
//! - 实时更新流：每帧 `data: <JSON>\n\n`，JSON 形如 `{type, data, timestamp}`
//! - 生成流：具名帧 `event: <name>\ndata: <JSON>\n\n`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// keep-alive 注释帧（EventSource 会忽略注释行）
pub const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// prompt 最大长度（字符）
pub const MAX_PROMPT_CHARS: usize = 4000;

/// 当前时间（毫秒时间戳）
pub fn current_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 连接建立（每个实时连接的第一帧）
    Connected,
    /// 记录变化
    DataChange,
    /// 生成中间结果
    PartialImage,
    /// 生成完成
    Completed,
    /// 生成失败
    Error,
}

impl EventType {
    /// 帧名称（与序列化值一致）
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::DataChange => "data_change",
            EventType::PartialImage => "partial_image",
            EventType::Completed => "completed",
            EventType::Error => "error",
        }
    }
}

/// 推送事件（只投递，不持久化）
///
/// 构造后不可变，字段只能通过访问器读取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    data: Value,
    timestamp: i64,
}

impl Event {
    /// 创建事件（时间戳取当前时间）
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: current_time_ms(),
        }
    }

    /// 连接建立事件
    pub fn connected(client_id: Uuid) -> Self {
        Self::new(
            EventType::Connected,
            serde_json::json!({ "clientId": client_id }),
        )
    }

    /// 记录变化事件
    pub fn data_change(record: &ChangeRecord) -> Result<Self> {
        Ok(Self::new(EventType::DataChange, serde_json::to_value(record)?))
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// 序列化为实时流帧 `data: <JSON>\n\n`
    pub fn to_frame(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// 变化记录类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Image,
    Table,
}

/// 增量读取返回的一条变化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub kind: ChangeKind,
    pub table_id: String,
    /// 最后修改时间（毫秒）
    pub updated_at: i64,
    pub data: Value,
}

/// 增量读取参数：返回 `updated_at > since` 的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeQuery {
    pub since: i64,
    /// 限定某张桌子（None = 全部）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub limit: usize,
}

impl ChangeQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 500;

    pub fn new(since: i64) -> Self {
        Self {
            since,
            scope: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// 限制在 1..=MAX_LIMIT
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }
}

/// 桌子的当前展示图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryRef {
    pub current_url: String,
}

/// 工作区（桌子）快照，只用于完成判定和退避分级
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gallery: Option<GalleryRef>,
}

impl WorkspaceSnapshot {
    pub fn has_gallery_image(&self) -> bool {
        self.gallery.is_some()
    }
}

/// 生成请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub persona_id: String,
    /// 分组（桌子）ID，用于结果关联
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
}

impl GenerationRequest {
    /// 校验请求；失败时不应打开任何流
    pub fn validate(&self) -> Result<()> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(Error::Validation("prompt is required".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(Error::Validation(format!(
                "prompt exceeds {} characters",
                MAX_PROMPT_CHARS
            )));
        }
        if self.persona_id.trim().is_empty() {
            return Err(Error::Validation("personaId is required".into()));
        }
        if matches!(&self.table_id, Some(t) if t.trim().is_empty()) {
            return Err(Error::Validation("tableId must not be empty".into()));
        }
        Ok(())
    }
}

/// 生成流事件（一对一推送给发起请求的客户端）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// 中间结果
    PartialImage {
        index: u32,
        #[serde(rename = "imageB64")]
        image_b64: String,
    },
    /// 最终结果（终止事件）
    Completed {
        #[serde(rename = "imageB64")]
        image_b64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        #[serde(rename = "personaId")]
        persona_id: String,
        #[serde(rename = "tableId", default, skip_serializing_if = "Option::is_none")]
        table_id: Option<String>,
    },
    /// 失败（终止事件）
    Error { message: String },
}

impl GenerationEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            GenerationEvent::PartialImage { .. } => EventType::PartialImage,
            GenerationEvent::Completed { .. } => EventType::Completed,
            GenerationEvent::Error { .. } => EventType::Error,
        }
    }

    /// 是否为终止事件（之后流关闭）
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationEvent::PartialImage { .. })
    }

    /// 序列化为具名帧 `event: <name>\ndata: <JSON>\n\n`
    pub fn to_frame(&self) -> Result<String> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.event_type().as_str(),
            serde_json::to_string(self)?
        ))
    }
}
