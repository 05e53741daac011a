//! HTTP 服务
//!
//! 对外提供实时更新流、生成中继流、增量读取和两个会触发广播的写操作；
//! 后台定时通过 Event Registry 发送 keep-alive 帧。

mod routes;

pub use routes::{router, ApiError};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{default_data_dir, StoreConfig};
use crate::live::EventRegistry;
use crate::relay::{GenerationProvider, GenerationRelay, ImageProvider, ProviderConfig};
use crate::store::GalleryStore;

/// 服务配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 数据目录（默认 ~/.gallery-live）
    pub data_dir: PathBuf,
    /// keep-alive 间隔（秒）
    pub keep_alive_secs: u64,
    /// 每个连接的发送队列容量
    pub channel_capacity: usize,
    /// 生成服务配置
    pub provider: ProviderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            data_dir: default_data_dir(),
            keep_alive_secs: 15,
            channel_capacity: 100,
            provider: ProviderConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 从环境变量覆盖默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GALLERY_LIVE_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("GALLERY_LIVE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = std::env::var("GALLERY_LIVE_KEEP_ALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.keep_alive_secs = secs;
        }
        config.provider = ProviderConfig::from_env();

        config
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("gallery.db")
    }
}

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: GalleryStore,
    pub registry: Arc<EventRegistry>,
    pub relay: Arc<GenerationRelay>,
    /// 每个实时连接的发送队列容量
    pub channel_capacity: usize,
    /// 服务关闭信号，用于结束仍在进行的实时流
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: GalleryStore,
        provider: Arc<dyn GenerationProvider>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            store,
            registry: EventRegistry::new(),
            relay: Arc::new(GenerationRelay::new(provider, channel_capacity)),
            channel_capacity,
            shutdown: CancellationToken::new(),
        }
    }
}

/// HTTP 服务
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// 按配置创建：打开本地数据库，接入流式生成服务
    pub fn new(config: ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(config.data_dir.join("db")).context("创建数据目录失败")?;

        let store = GalleryStore::connect(StoreConfig::local(config.db_path()))
            .context("打开数据库失败")?;
        let provider: Arc<dyn GenerationProvider> =
            Arc::new(ImageProvider::new(config.provider.clone()));
        if config.provider.api_key.is_none() {
            tracing::warn!("GALLERY_LIVE_PROVIDER_KEY is not set, generation requests will fail");
        }

        let state = AppState::new(store, provider, config.channel_capacity);
        Ok(Self { config, state })
    }

    /// 使用现成的状态创建（测试 / 嵌入）
    pub fn with_state(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// 运行服务直到 Ctrl-C
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.bind_addr))?;

        self.serve(listener, shutdown_signal()).await
    }

    /// 在给定的 listener 上运行，`shutdown` 完成后优雅退出
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!("🚀 gallery-live 启动: http://{}", addr);

        // keep-alive 任务
        let keep_alive = {
            let registry = self.state.registry.clone();
            let token = self.state.shutdown.clone();
            let period = Duration::from_secs(self.config.keep_alive_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if registry.has_connections() {
                                let delivered = registry.keep_alive();
                                tracing::trace!("💓 keep-alive: {} connections", delivered);
                            }
                        }
                    }
                }
            })
        };

        let token = self.state.shutdown.clone();
        let app = router(self.state.clone());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                // 结束实时流，否则优雅退出会一直等待
                token.cancel();
            })
            .await
            .context("服务异常退出")?;

        self.state.shutdown.cancel();
        let _ = keep_alive.await;
        tracing::info!("🧹 gallery-live 已退出");
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到中断信号，准备退出...");
}
