//! 事件处理器（EventHandler）与注册表
//!
//! 每个事件类型只绑定一个处理器，后注册者覆盖先注册者。
//! 处理器必须能容忍同一事件被重复调用（至少一次投递）。
//!
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// 事件处理器：处理某一类型事件的负载
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理事件；返回错误将交给重试策略
    async fn handle(&self, payload: &Value) -> anyhow::Result<()>;
}

/// 将异步闭包适配为 `EventHandler`
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: &Value) -> anyhow::Result<()> {
        (self.f)(payload.clone()).await
    }
}

/// 事件类型 -> 处理器 的注册表，可在消费循环运行期间注册
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        let replaced = self.handlers.insert(event_type.clone(), handler).is_some();
        debug!(event_type = %event_type, replaced, "registered event handler");
    }

    pub fn register_fn<F, Fut>(&self, event_type: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler::new(f)));
    }

    /// 查找处理器；未注册时返回 `None`
    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).map(|h| h.value().clone())
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
