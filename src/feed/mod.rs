//! Adaptive Feed - 增量拉取 + 完成度感知退避
//!
//! - 惰性激活：第一个观察者出现时以 `since = 0` 全量拉取
//! - 之后每轮只拉游标之后的变化，下一轮在本轮结算后才排期
//! - 游标只取返回记录里最大的 `updated_at`，不看本地时钟
//! - 拉取出错按已出图桌子数分档退避，成功即回到基础间隔
//! - 锁定的桌子达到阈值后自动停止，并通知观察者一次
//!
//! 状态机字段 `{cursor, backoff, active}`；每个活跃期只有一个定时唤醒任务，
//! 由该活跃期的 `CancellationToken` 控制，`stop()` 之后不会再有迟到的状态修改。

mod backoff;
mod source;

pub use backoff::{tier_for, Backoff, BackoffTier, BACKOFF_TIERS};
pub use source::{ChangeSource, WorkspaceSource};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{ChangeQuery, ChangeRecord, WorkspaceSnapshot};

/// Feed 配置
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// 基础拉取间隔
    pub base_interval: Duration,
    /// 锁定桌子数达到该值即视为完成
    pub completion_threshold: usize,
    /// 限定某张桌子（None = 全部）
    pub scope: Option<String>,
    /// 每次拉取的最大记录数
    pub limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(5000),
            completion_threshold: 10,
            scope: None,
            limit: ChangeQuery::DEFAULT_LIMIT,
        }
    }
}

impl FeedConfig {
    /// 从环境变量覆盖默认值
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("GALLERY_LIVE_FEED_INTERVAL_MS") {
            config.base_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse::<usize>("GALLERY_LIVE_FEED_THRESHOLD") {
            config.completion_threshold = threshold;
        }
        if let Ok(scope) = std::env::var("GALLERY_LIVE_FEED_SCOPE") {
            if !scope.is_empty() {
                config.scope = Some(scope);
            }
        }

        config
    }

    /// 设置基础拉取间隔
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// 一次成功拉取的结果
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub changes: Vec<ChangeRecord>,
    /// 本次拉取后的游标
    pub cursor: i64,
}

impl FeedUpdate {
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

/// Feed 观察者
pub trait FeedObserver: Send + Sync {
    /// 每次成功拉取后调用（包括没有变化的情况）
    fn on_update(&self, update: &FeedUpdate);

    /// 完成条件由假变真时调用，每个活跃期最多一次
    fn on_complete(&self) {}
}

/// 诊断用状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedStatus {
    pub active: bool,
    pub cursor: i64,
    pub multiplier: f64,
    pub next_interval: Duration,
}

struct FeedState {
    cursor: i64,
    backoff: Backoff,
    active: bool,
    /// 还没有观察者出现过
    dormant: bool,
    /// 当前活跃期内是否已通知完成
    completion_notified: bool,
    base_interval: Duration,
    /// 最近一次成功读取的工作区快照
    workspaces: Vec<WorkspaceSnapshot>,
    /// 当前活跃期的取消信号
    period: Option<CancellationToken>,
}

/// 单次拉取的结算结果
struct Outcome {
    succeeded: bool,
    /// None = 本活跃期结束（完成或已停止）
    next: Option<Duration>,
}

/// 结算后需要在锁外发出的通知
struct Settled {
    update: Option<FeedUpdate>,
    completed: bool,
    next: Option<Duration>,
}

/// 自适应增量拉取
pub struct AdaptiveFeed {
    changes: Arc<dyn ChangeSource>,
    workspaces: Arc<dyn WorkspaceSource>,
    scope: Option<String>,
    limit: usize,
    completion_threshold: usize,
    state: Mutex<FeedState>,
    observers: RwLock<Vec<Arc<dyn FeedObserver>>>,
    /// 同一时刻最多一个拉取在进行
    fetch_gate: tokio::sync::Mutex<()>,
}

impl AdaptiveFeed {
    /// 创建 Feed（处于休眠状态，直到第一个观察者出现）
    pub fn new(
        config: FeedConfig,
        changes: Arc<dyn ChangeSource>,
        workspaces: Arc<dyn WorkspaceSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            changes,
            workspaces,
            scope: config.scope,
            limit: config.limit.clamp(1, ChangeQuery::MAX_LIMIT),
            completion_threshold: config.completion_threshold,
            state: Mutex::new(FeedState {
                cursor: 0,
                backoff: Backoff::new(),
                active: false,
                dormant: true,
                completion_notified: false,
                base_interval: config.base_interval,
                workspaces: Vec::new(),
                period: None,
            }),
            observers: RwLock::new(Vec::new()),
            fetch_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// 注册观察者；第一个观察者会激活 Feed 并立即全量拉取
    ///
    /// 需要在 tokio runtime 内调用。
    pub fn observe(self: &Arc<Self>, observer: Arc<dyn FeedObserver>) {
        self.observers.write().push(observer);

        let mut state = self.state.lock();
        if state.dormant {
            state.dormant = false;
            tracing::info!("🛰️ Feed activated by first observer");
            self.start_period(&mut state, Some(0));
        }
    }

    /// 立即做一次 `since = 0` 的全量拉取，不影响排期和活跃状态
    ///
    /// 返回拉取是否成功；成功时倍率重置为 1。
    pub async fn refresh(&self) -> bool {
        tracing::debug!("🔄 Manual refresh");
        self.fetch_once(Some(0), None)
            .await
            .map(|outcome| outcome.succeeded)
            .unwrap_or(false)
    }

    /// 停止排期；正在进行的拉取结果会被丢弃
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }

        state.active = false;
        if let Some(period) = state.period.take() {
            period.cancel();
        }
        tracing::info!("⏸️ Feed stopped: cursor={}", state.cursor);
    }

    /// 恢复排期并立即拉取；已满足完成条件时不做任何事
    ///
    /// 完成条件按最近一次工作区快照判断；休眠期间的外部变化可先用 `refresh()` 同步。
    pub fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.active {
            return;
        }
        if self.is_complete(&state.workspaces) {
            tracing::debug!("Feed already complete, resume ignored");
            return;
        }

        state.dormant = false;
        tracing::info!("▶️ Feed resumed: cursor={}", state.cursor);
        self.start_period(&mut state, None);
    }

    /// 修改基础间隔；已经排好的下一次拉取不受影响
    pub fn set_interval(&self, ms: u64) {
        let mut state = self.state.lock();
        state.base_interval = Duration::from_millis(ms);
        tracing::debug!("Feed base interval set to {}ms", ms);
    }

    /// 是否处于活跃期
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// 当前游标（毫秒）
    pub fn cursor(&self) -> i64 {
        self.state.lock().cursor
    }

    /// 诊断快照
    pub fn status(&self) -> FeedStatus {
        let state = self.state.lock();
        FeedStatus {
            active: state.active,
            cursor: state.cursor,
            multiplier: state.backoff.multiplier(),
            next_interval: state.backoff.interval(state.base_interval),
        }
    }

    /// 开启新的活跃期；调用方持有状态锁
    fn start_period(self: &Arc<Self>, state: &mut FeedState, since: Option<i64>) {
        let token = CancellationToken::new();
        state.active = true;
        state.completion_notified = false;
        if let Some(previous) = state.period.replace(token.clone()) {
            previous.cancel();
        }

        let feed = self.clone();
        tokio::spawn(async move {
            feed.run_period(token, since).await;
        });
    }

    /// 活跃期主循环：拉取 → 结算 → 按结算结果休眠 → 下一轮
    async fn run_period(self: Arc<Self>, token: CancellationToken, mut since: Option<i64>) {
        loop {
            let delay = match self.fetch_once(since.take(), Some(&token)).await {
                Some(Outcome { next: Some(delay), .. }) => delay,
                _ => break,
            };

            tracing::trace!("Feed next fetch in {}ms", delay.as_millis());

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("🛰️ Feed period ended");
    }

    /// 做一次拉取并结算；活跃期已取消时返回 None
    async fn fetch_once(
        &self,
        since: Option<i64>,
        period: Option<&CancellationToken>,
    ) -> Option<Outcome> {
        let _gate = match period {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return None,
                gate = self.fetch_gate.lock() => gate,
            },
            None => self.fetch_gate.lock().await,
        };

        let since = since.unwrap_or_else(|| self.state.lock().cursor);
        let query = ChangeQuery {
            since,
            scope: self.scope.clone(),
            limit: self.limit,
        };

        let fetch = async {
            tokio::join!(
                self.changes.changes_since(query),
                self.workspaces.list_workspaces()
            )
        };
        let (changes, workspaces) = match period {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return None,
                fetched = fetch => fetched,
            },
            None => fetch.await,
        };

        let succeeded = changes.is_ok();
        let settled = self.settle(since, changes, workspaces, period)?;
        self.notify(&settled);

        Some(Outcome {
            succeeded,
            next: settled.next,
        })
    }

    /// 在状态锁内应用拉取结果
    fn settle(
        &self,
        since: i64,
        changes: Result<Vec<ChangeRecord>>,
        workspaces: Result<Vec<WorkspaceSnapshot>>,
        period: Option<&CancellationToken>,
    ) -> Option<Settled> {
        let mut state = self.state.lock();

        // stop() 在同一把锁内取消，这里看到取消就说明结果已过期
        if period.map(|t| t.is_cancelled()).unwrap_or(false) {
            tracing::debug!("Feed fetch settled after cancellation, discarded");
            return None;
        }

        match workspaces {
            Ok(list) => state.workspaces = list,
            Err(e) => tracing::warn!("⚠️ Workspace snapshot failed, keeping last known: {}", e),
        }

        let update = match changes {
            Ok(changes) => {
                state.cursor = next_cursor(state.cursor, &changes);
                state.backoff.reset();
                tracing::debug!(
                    "📥 Feed fetched {} change(s): since={}, cursor={}",
                    changes.len(),
                    since,
                    state.cursor
                );
                Some(FeedUpdate {
                    changes,
                    cursor: state.cursor,
                })
            }
            Err(e) => {
                let filled = filled_count(&state.workspaces);
                let multiplier = state.backoff.on_error(filled);
                tracing::warn!(
                    "⚠️ Feed fetch failed (since={}), backing off: multiplier={:.2}, filled={}: {}",
                    since,
                    multiplier,
                    filled,
                    e
                );
                None
            }
        };

        let mut completed = false;
        if self.is_complete(&state.workspaces) {
            completed = !state.completion_notified;
            state.completion_notified = true;
            state.active = false;
            if let Some(period) = state.period.take() {
                period.cancel();
            }
        }

        let next = if state.active {
            Some(state.backoff.interval(state.base_interval))
        } else {
            None
        };

        Some(Settled {
            update,
            completed,
            next,
        })
    }

    /// 在锁外通知观察者
    fn notify(&self, settled: &Settled) {
        let observers = self.observers.read().clone();

        if let Some(update) = &settled.update {
            for observer in &observers {
                observer.on_update(update);
            }
        }

        if settled.completed {
            tracing::info!(
                "✅ Feed complete: {} locked workspace(s) reached",
                self.completion_threshold
            );
            for observer in &observers {
                observer.on_complete();
            }
        }
    }

    fn is_complete(&self, workspaces: &[WorkspaceSnapshot]) -> bool {
        locked_count(workspaces) >= self.completion_threshold
    }
}

/// 成功拉取后的游标：本页记录里最大的 updated_at，空页保持不变
///
/// 只使用数据源给出的时间戳，不掺入本地时钟；数据源保证写入时间戳严格递增。
fn next_cursor(current: i64, changes: &[ChangeRecord]) -> i64 {
    changes
        .iter()
        .map(|c| c.updated_at)
        .fold(current, i64::max)
}

fn locked_count(workspaces: &[WorkspaceSnapshot]) -> usize {
    workspaces.iter().filter(|w| w.is_locked).count()
}

fn filled_count(workspaces: &[WorkspaceSnapshot]) -> usize {
    workspaces.iter().filter(|w| w.has_gallery_image()).count()
}
