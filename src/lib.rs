//! gallery-live - 工作区设计图库的实时更新层
//!
//! 三个核心组件：
//!
//! - **Event Registry**: 维护实时连接，把一个事件扇出给所有订阅者
//! - **Adaptive Feed**: 增量拉取变化记录，按完成度调整出错退避，完成后自动停止
//! - **Generation Relay**: 把生成服务的中间结果逐条转成事件帧推给单个客户端
//!
//! 以及围绕它们的 SQLite 存储、HTTP 服务和 HTTP 数据源。
//!
//! # Feature Flags
//!
//! - `server`: HTTP 服务 + 流式生成服务适配（`gallery-live` 二进制）
//! - `client`: HTTP 数据源（`gallery-watch` 二进制）

pub mod config;
pub mod error;
pub mod feed;
pub mod live;
pub mod protocol;
pub mod relay;
pub mod schema;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use feed::{AdaptiveFeed, FeedConfig, FeedObserver, FeedStatus, FeedUpdate};
pub use live::{ConnId, EventRegistry, FrameSink, SubscriberState};
pub use protocol::{
    ChangeKind, ChangeQuery, ChangeRecord, Event, EventType, GenerationEvent, GenerationRequest,
    WorkspaceSnapshot,
};
pub use relay::{GenerationProvider, GenerationRelay, ProviderItem};
pub use store::GalleryStore;

#[cfg(feature = "server")]
pub use server::{AppState, Server, ServerConfig};

#[cfg(feature = "client")]
pub use client::{HttpFeedClient, WatchConfig};

/// 编译时间戳（Unix 秒）
pub const BUILD_TIMESTAMP: u64 = {
    // const 中不能直接用 parse()，需要手动解析
    const BYTES: &[u8] = env!("BUILD_TIMESTAMP").as_bytes();
    const fn parse_u64(bytes: &[u8]) -> u64 {
        let mut result = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            result = result * 10 + (bytes[i] - b'0') as u64;
            i += 1;
        }
        result
    }
    parse_u64(BYTES)
};

/// 完整版本号（语义版本 + 编译时间戳），例如 `0.1.0-1706400000`
pub const VERSION_FULL: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"));
