//! Generation Relay - 把生成服务的增量输出转成一对一推送流
//!
//! 每个请求一个独立任务，不经过广播注册表：
//! - 中间结果 → `partial_image`
//! - 最终结果 → `completed`，随后关闭
//! - 服务报错 / 流提前结束 → `error`，随后关闭
//!
//! 客户端断开时取消 `CancellationToken`，停止拉取并释放服务端资源。

#[cfg(feature = "server")]
mod image_provider;

#[cfg(feature = "server")]
pub use image_provider::{ImageProvider, ProviderConfig};

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{GenerationEvent, GenerationRequest};

/// 生成服务产出的一项
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderItem {
    /// 中间结果；index 由服务提供时优先使用
    Partial {
        index: Option<u32>,
        image_b64: String,
    },
    /// 最终结果
    Completed {
        image_b64: String,
        usage: Option<Value>,
    },
}

/// 生成服务的增量输出；`Err` 表示服务在中途报错
pub type ProviderStream = BoxStream<'static, Result<ProviderItem>>;

/// 生成服务
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 发起生成；实现方需要配合 `cancel` 尽快停止并释放资源
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream>;
}

/// 生成流转发器
pub struct GenerationRelay {
    provider: Arc<dyn GenerationProvider>,
    /// 单个请求的输出缓冲
    capacity: usize,
}

/// 消费结束的原因
enum Outcome {
    Terminal(GenerationEvent),
    Disconnected,
}

impl GenerationRelay {
    pub fn new(provider: Arc<dyn GenerationProvider>, capacity: usize) -> Self {
        Self {
            provider,
            capacity: capacity.max(1),
        }
    }

    /// 校验请求并打开生成流
    ///
    /// 校验失败直接返回 `Error::Validation`，不建立任何流。
    /// 需要在 tokio runtime 内调用。
    pub fn open(&self, request: GenerationRequest) -> Result<mpsc::Receiver<GenerationEvent>> {
        request.validate()?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let provider = self.provider.clone();

        tracing::debug!(
            "🎨 Generation started: persona={}, table={:?}",
            request.persona_id,
            request.table_id
        );

        tokio::spawn(async move {
            relay(provider, request, tx).await;
        });

        Ok(rx)
    }
}

/// 单个请求的转发任务
async fn relay(
    provider: Arc<dyn GenerationProvider>,
    request: GenerationRequest,
    tx: mpsc::Sender<GenerationEvent>,
) {
    let cancel = CancellationToken::new();

    let outcome = tokio::select! {
        biased;
        _ = tx.closed() => Outcome::Disconnected,
        outcome = consume(provider.as_ref(), &request, cancel.clone(), &tx) => outcome,
    };

    // consume 的 future 已在这里被丢弃，服务端流随之释放
    cancel.cancel();

    match outcome {
        Outcome::Terminal(event) => {
            let kind = event.event_type();
            if tx.send(event).await.is_err() {
                tracing::debug!("🎨 Client gone before terminal event: {:?}", kind);
            } else {
                tracing::debug!("🎨 Generation finished: {:?}", kind);
            }
        }
        Outcome::Disconnected => {
            tracing::debug!(
                "🎨 Client disconnected, generation cancelled: persona={}",
                request.persona_id
            );
        }
    }
}

/// 拉取服务输出并逐项转发中间结果，返回终止事件
async fn consume(
    provider: &dyn GenerationProvider,
    request: &GenerationRequest,
    cancel: CancellationToken,
    tx: &mpsc::Sender<GenerationEvent>,
) -> Outcome {
    let mut stream = match provider.generate(request, cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Generation provider failed to start: {}", e);
            return Outcome::Terminal(GenerationEvent::Error {
                message: e.to_string(),
            });
        }
    };

    let mut counter = 0u32;
    while let Some(item) = stream.next().await {
        match item {
            Ok(ProviderItem::Partial { index, image_b64 }) => {
                counter += 1;
                let event = GenerationEvent::PartialImage {
                    index: index.unwrap_or(counter),
                    image_b64,
                };
                if tx.send(event).await.is_err() {
                    return Outcome::Disconnected;
                }
            }
            Ok(ProviderItem::Completed { image_b64, usage }) => {
                return Outcome::Terminal(GenerationEvent::Completed {
                    image_b64,
                    usage,
                    persona_id: request.persona_id.clone(),
                    table_id: request.table_id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!("Generation provider failed mid-stream: {}", e);
                return Outcome::Terminal(GenerationEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    Outcome::Terminal(GenerationEvent::Error {
        message: "generation ended without a result".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::EventType;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// 按脚本产出的服务
    struct ScriptedProvider {
        items: Mutex<Option<Vec<Result<ProviderItem>>>>,
        fail_to_start: bool,
    }

    impl ScriptedProvider {
        fn new(items: Vec<Result<ProviderItem>>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(Some(items)),
                fail_to_start: false,
            })
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _cancel: CancellationToken,
        ) -> Result<ProviderStream> {
            if self.fail_to_start {
                return Err(Error::Provider("quota exceeded".into()));
            }
            let items = self.items.lock().take().unwrap_or_default();
            Ok(stream::iter(items).boxed())
        }
    }

    /// 永不结束的服务，记录拿到的取消信号
    #[derive(Default)]
    struct EndlessProvider {
        token: Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl GenerationProvider for EndlessProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            cancel: CancellationToken,
        ) -> Result<ProviderStream> {
            *self.token.lock() = Some(cancel);
            let partials = stream::unfold(0u32, |n| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some((
                    Ok(ProviderItem::Partial {
                        index: None,
                        image_b64: format!("frame-{}", n),
                    }),
                    n + 1,
                ))
            });
            Ok(partials.boxed())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a sunlit studio with plants".to_string(),
            persona_id: "architect".to_string(),
            table_id: Some("t-4".to_string()),
        }
    }

    fn partial(index: Option<u32>, data: &str) -> Result<ProviderItem> {
        Ok(ProviderItem::Partial {
            index,
            image_b64: data.to_string(),
        })
    }

    async fn collect(mut rx: mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_partials_then_completed() {
        let provider = ScriptedProvider::new(vec![
            partial(None, "p1"),
            partial(None, "p2"),
            Ok(ProviderItem::Completed {
                image_b64: "final".to_string(),
                usage: Some(serde_json::json!({"output_tokens": 10})),
            }),
        ]);
        let relay = GenerationRelay::new(provider, 8);

        let events = collect(relay.open(request()).unwrap()).await;
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type()).collect();

        assert_eq!(
            kinds,
            vec![EventType::PartialImage, EventType::PartialImage, EventType::Completed]
        );
        assert!(matches!(&events[0], GenerationEvent::PartialImage { index: 1, .. }));
        assert!(matches!(&events[1], GenerationEvent::PartialImage { index: 2, .. }));
        match &events[2] {
            GenerationEvent::Completed {
                image_b64,
                persona_id,
                table_id,
                usage,
            } => {
                assert_eq!(image_b64, "final");
                assert_eq!(persona_id, "architect");
                assert_eq!(table_id.as_deref(), Some("t-4"));
                assert!(usage.is_some());
            }
            other => panic!("Expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_error_after_partial() {
        let provider = ScriptedProvider::new(vec![
            partial(Some(0), "p0"),
            Err(Error::Provider("content policy violation".into())),
            // 终止之后的项不会再被拉取
            Ok(ProviderItem::Completed {
                image_b64: "never".to_string(),
                usage: None,
            }),
        ]);
        let relay = GenerationRelay::new(provider, 8);

        let events = collect(relay.open(request()).unwrap()).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], GenerationEvent::PartialImage { index: 0, .. }));
        match &events[1] {
            GenerationEvent::Error { message } => assert!(message.contains("content policy")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_index_preferred_over_counter() {
        let provider = ScriptedProvider::new(vec![
            partial(Some(7), "a"),
            partial(None, "b"),
            Ok(ProviderItem::Completed {
                image_b64: "c".to_string(),
                usage: None,
            }),
        ]);
        let relay = GenerationRelay::new(provider, 8);

        let events = collect(relay.open(request()).unwrap()).await;

        assert!(matches!(&events[0], GenerationEvent::PartialImage { index: 7, .. }));
        assert!(matches!(&events[1], GenerationEvent::PartialImage { index: 2, .. }));
    }

    #[tokio::test]
    async fn test_setup_failure_emits_single_error() {
        let provider = Arc::new(ScriptedProvider {
            items: Mutex::new(None),
            fail_to_start: true,
        });
        let relay = GenerationRelay::new(provider, 8);

        let events = collect(relay.open(request()).unwrap()).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Error);
    }

    #[tokio::test]
    async fn test_stream_ending_without_result_is_error() {
        let provider = ScriptedProvider::new(vec![partial(None, "only")]);
        let relay = GenerationRelay::new(provider, 8);

        let events = collect(relay.open(request()).unwrap()).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type(), EventType::Error);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_without_stream() {
        let provider = ScriptedProvider::new(vec![]);
        let relay = GenerationRelay::new(provider, 8);

        let mut bad = request();
        bad.prompt = String::new();

        assert!(matches!(relay.open(bad), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_provider() {
        let provider = Arc::new(EndlessProvider::default());
        let relay = GenerationRelay::new(provider.clone(), 1);

        let mut rx = relay.open(request()).unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        let token = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(token) = provider.token.lock().clone() {
                    return token;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("provider should observe cancellation");
    }
}
