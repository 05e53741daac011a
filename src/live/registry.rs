//! 事件注册表 + 广播
//!
//! 维护在线订阅者，将事件推送给所有订阅者；投递失败的订阅者立即移除。
//! 不做主动超时扫描：连接关闭在写入时即可同步观察到。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Event, KEEP_ALIVE_FRAME};

/// 连接 ID
pub type ConnId = Uuid;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 帧输出端
pub trait FrameSink: Send + Sync {
    /// 写入一帧；返回错误表示该连接已不可用
    fn write_frame(&self, frame: &str) -> Result<()>;
}

impl FrameSink for MessageSender {
    fn write_frame(&self, frame: &str) -> Result<()> {
        self.try_send(frame.to_string()).map_err(|e| match e {
            // 慢消费者按投递失败处理，由 Adaptive Feed 兜底
            TrySendError::Full(_) => Error::Delivery("channel full".into()),
            TrySendError::Closed(_) => Error::Delivery("channel closed".into()),
        })
    }
}

/// 订阅者生命周期：connecting → established → active → closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// 已注册，尚未写出任何帧
    Connecting,
    /// 已写出 connected 帧
    Established,
    /// 至少收到过一次广播
    Active,
    /// 已移除（终态）
    Closed,
}

struct Subscriber {
    sink: Arc<dyn FrameSink>,
    state: SubscriberState,
    last_activity: DateTime<Utc>,
}

/// 事件注册表
pub struct EventRegistry {
    /// ConnId → 订阅者
    subscribers: RwLock<HashMap<ConnId, Subscriber>>,
    /// 扇出串行化：所有订阅者看到相同的广播顺序
    delivery: Mutex<()>,
}

impl EventRegistry {
    /// 创建新的注册表
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册订阅者（底层入口，不写 connected 帧）
    ///
    /// 订阅者从 connecting 开始；第一帧写出后进入 established，之后的广播才让它进入 active。
    /// 对外的实时连接应使用 [`EventRegistry::connect`]。
    pub fn register<S: FrameSink + 'static>(&self, conn_id: ConnId, sink: S) -> Result<()> {
        let mut subscribers = self.subscribers.write();
        if subscribers.contains_key(&conn_id) {
            tracing::warn!("📡 Duplicate subscriber: conn_id={}", conn_id);
            return Err(Error::DuplicateSubscriber(conn_id));
        }

        subscribers.insert(
            conn_id,
            Subscriber {
                sink: Arc::new(sink),
                state: SubscriberState::Connecting,
                last_activity: Utc::now(),
            },
        );

        tracing::debug!("📡 Subscriber registered: conn_id={}", conn_id);
        Ok(())
    }

    /// 建立新连接：生成 ID、注册并写出 connected 帧
    ///
    /// 整个过程持有扇出锁，connected 一定是该连接收到的第一帧。
    pub fn connect<S: FrameSink + 'static>(&self, sink: S) -> Result<ConnId> {
        let _order = self.delivery.lock();

        let conn_id = Uuid::new_v4();
        self.register(conn_id, sink)?;

        let frame = Event::connected(conn_id).to_frame()?;
        if let Some(sink) = self.sink_of(conn_id) {
            if let Err(e) = sink.write_frame(&frame) {
                self.unregister(conn_id);
                return Err(e);
            }
        }
        self.mark_written(&[conn_id], SubscriberState::Established);

        tracing::debug!("📥 Connection established: conn_id={}", conn_id);
        Ok(conn_id)
    }

    /// 注销订阅者（幂等）
    pub fn unregister(&self, conn_id: ConnId) {
        if self.subscribers.write().remove(&conn_id).is_some() {
            tracing::debug!(
                "📡 Subscriber unregistered: conn_id={}, state={:?}",
                conn_id,
                SubscriberState::Closed
            );
        }
    }

    /// 广播事件给所有订阅者
    ///
    /// 只序列化一次；单个订阅者失败只移除该订阅者，不影响其余投递，也不向调用方报错。
    /// 返回成功投递的订阅者数量。
    pub fn broadcast(&self, event: &Event) -> usize {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return 0;
            }
        };

        let _order = self.delivery.lock();
        let targets = self.snapshot();

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_type={:?}", event.event_type());
            return 0;
        }

        tracing::debug!(
            "📡 Broadcasting event: event_type={:?}, subscribers={}",
            event.event_type(),
            targets.len()
        );

        self.fan_out(&frame, targets, SubscriberState::Active)
    }

    /// 发送事件到指定连接
    pub fn send_to(&self, conn_id: ConnId, event: &Event) -> bool {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return false;
            }
        };

        let _order = self.delivery.lock();
        let target = match self.sink_of(conn_id) {
            Some(sink) => vec![(conn_id, sink)],
            None => return false,
        };

        self.fan_out(&frame, target, SubscriberState::Active) == 1
    }

    /// 向所有订阅者写 keep-alive 注释帧，顺带清理已断开的连接
    pub fn keep_alive(&self) -> usize {
        let _order = self.delivery.lock();
        let targets = self.snapshot();
        if targets.is_empty() {
            return 0;
        }

        let total = targets.len();
        let delivered = self.fan_out(KEEP_ALIVE_FRAME, targets, SubscriberState::Established);
        if delivered < total {
            tracing::debug!("💓 Keep-alive pruned {} subscriber(s)", total - delivered);
        }
        delivered
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 检查是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    /// 订阅者状态；未注册或已移除返回 Closed
    pub fn state(&self, conn_id: ConnId) -> SubscriberState {
        self.subscribers
            .read()
            .get(&conn_id)
            .map(|s| s.state)
            .unwrap_or(SubscriberState::Closed)
    }

    /// 最后一次成功写入的时间
    pub fn last_activity(&self, conn_id: ConnId) -> Option<DateTime<Utc>> {
        self.subscribers.read().get(&conn_id).map(|s| s.last_activity)
    }

    /// 取当前订阅表的一致快照（拷贝出 sink，释放锁后再投递）
    fn snapshot(&self) -> Vec<(ConnId, Arc<dyn FrameSink>)> {
        self.subscribers
            .read()
            .iter()
            .map(|(conn_id, sub)| (*conn_id, sub.sink.clone()))
            .collect()
    }

    fn sink_of(&self, conn_id: ConnId) -> Option<Arc<dyn FrameSink>> {
        self.subscribers.read().get(&conn_id).map(|s| s.sink.clone())
    }

    /// 逐个投递；调用方需持有扇出锁
    fn fan_out(
        &self,
        frame: &str,
        targets: Vec<(ConnId, Arc<dyn FrameSink>)>,
        reached: SubscriberState,
    ) -> usize {
        let mut delivered = Vec::with_capacity(targets.len());
        let mut failed = Vec::new();

        for (conn_id, sink) in targets {
            match sink.write_frame(frame) {
                Ok(()) => delivered.push(conn_id),
                Err(e) => {
                    tracing::debug!("📡 Delivery failed: conn_id={}, error={}", conn_id, e);
                    failed.push((conn_id, sink));
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for (conn_id, sink) in failed {
                // 只移除快照里的那个 sink，避免误删同 ID 的新注册
                let same = subscribers
                    .get(&conn_id)
                    .map(|s| Arc::ptr_eq(&s.sink, &sink))
                    .unwrap_or(false);
                if same {
                    subscribers.remove(&conn_id);
                    tracing::debug!("📡 Subscriber pruned: conn_id={}", conn_id);
                }
            }
        }

        self.mark_written(&delivered, reached);
        delivered.len()
    }

    /// 记录成功写入：刷新 last_activity，状态只前进不后退
    fn mark_written(&self, conn_ids: &[ConnId], reached: SubscriberState) {
        if conn_ids.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut subscribers = self.subscribers.write();
        for conn_id in conn_ids {
            if let Some(sub) = subscribers.get_mut(conn_id) {
                sub.last_activity = now;
                sub.state = advance(sub.state, reached);
            }
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            delivery: Mutex::new(()),
        }
    }
}

/// 每次成功写出最多前进一步，不会从 connecting 直接跳到 active
fn advance(current: SubscriberState, reached: SubscriberState) -> SubscriberState {
    use SubscriberState::*;
    match (current, reached) {
        (Closed, _) => Closed,
        (Active, _) | (Established, Active) => Active,
        (Established, _) => Established,
        (Connecting, Connecting) => Connecting,
        (Connecting, _) => Established,
    }
}
