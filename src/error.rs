//! 错误类型定义

use thiserror::Error;
use uuid::Uuid;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 订阅者 ID 冲突（只影响当次 register）
    #[error("订阅者已存在: {0}")]
    DuplicateSubscriber(Uuid),

    /// 投递失败（sink 已关闭或写入失败）
    #[error("投递失败: {0}")]
    Delivery(String),

    /// 增量拉取失败
    #[error("拉取失败: {0}")]
    Fetch(String),

    /// 生成服务报错
    #[error("生成服务错误: {0}")]
    Provider(String),

    /// 请求校验失败（在打开流之前拒绝）
    #[error("请求校验失败: {0}")]
    Validation(String),

    /// 记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP 错误
    #[cfg(any(feature = "server", feature = "client"))]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
