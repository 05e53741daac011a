//! 实时更新分发层
//!
//! - 事件注册表：记录当前在线的订阅连接
//! - 广播：一次序列化，扇出给所有订阅者，投递失败即移除

mod registry;

pub use registry::{ConnId, EventRegistry, FrameSink, MessageSender, SubscriberState};
