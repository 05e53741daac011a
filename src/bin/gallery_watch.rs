//! gallery-watch - 管理端观察进程
//!
//! 用 Adaptive Feed 轮询服务端，打印每轮变化；锁定的桌子数达到阈值后退出。

use std::sync::Arc;

use anyhow::Result;
use gallery_live::feed::{AdaptiveFeed, FeedObserver, FeedUpdate};
use gallery_live::{ChangeKind, HttpFeedClient, WatchConfig};
use tokio::sync::Notify;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 把 Feed 结果写到日志
struct LoggingObserver {
    done: Arc<Notify>,
}

impl FeedObserver for LoggingObserver {
    fn on_update(&self, update: &FeedUpdate) {
        if update.changes.is_empty() {
            tracing::trace!("no changes, cursor={}", update.cursor);
            return;
        }

        let images = update
            .changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Image)
            .count();
        tracing::info!(
            "📊 {} changes ({} images, {} tables), cursor={}",
            update.change_count(),
            images,
            update.change_count() - images,
            update.cursor
        );
    }

    fn on_complete(&self) {
        tracing::info!("✅ all tables locked");
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("gallery_live=info".parse()?)
                .add_directive("gallery_watch=info".parse()?),
        )
        .init();

    let config = WatchConfig::from_env();
    tracing::info!(
        "👀 gallery-watch v{} → {}",
        gallery_live::VERSION_FULL,
        config.server_url
    );

    let client = Arc::new(HttpFeedClient::new(&config)?);
    let feed = AdaptiveFeed::new(config.feed.clone(), client.clone(), client);

    let done = Arc::new(Notify::new());
    feed.observe(Arc::new(LoggingObserver { done: done.clone() }));

    tokio::select! {
        _ = done.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到中断信号，准备退出...");
        }
    }

    feed.stop();
    tracing::info!("👋 gallery-watch exiting, cursor={}", feed.cursor());
    Ok(())
}
