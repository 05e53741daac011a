//! gallery-live - 图库实时更新服务
//!
//! 负责：
//! - 实时更新流（广播 data_change）
//! - 生成中继流
//! - 增量读取接口（供 gallery-watch / 前端轮询）

use anyhow::Result;
use gallery_live::{Server, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gallery_live=debug".parse()?))
        .init();

    tracing::info!("🚀 gallery-live v{}", gallery_live::VERSION_FULL);

    let config = ServerConfig::from_env();
    tracing::debug!("📁 数据目录: {}", config.data_dir.display());

    Server::new(config)?.run().await?;

    tracing::info!("👋 gallery-live exiting");
    Ok(())
}
