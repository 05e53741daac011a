//! HTTP 客户端
//!
//! 通过服务端的 HTTP 接口为 Adaptive Feed 提供数据源

mod sources;

pub use sources::HttpFeedClient;

use std::time::Duration;

use crate::feed::FeedConfig;

/// 观察端配置
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// 服务地址
    pub server_url: String,
    /// Feed 配置
    pub feed: FeedConfig,
    /// 单次请求超时
    pub request_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8787".to_string(),
            feed: FeedConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl WatchConfig {
    /// 从环境变量创建配置
    pub fn from_env() -> Self {
        let mut config = Self {
            feed: FeedConfig::from_env(),
            ..Default::default()
        };

        if let Ok(url) = std::env::var("GALLERY_LIVE_URL") {
            config.server_url = url;
        }

        config
    }

    /// 设置服务地址
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }
}
