//! 事件流引擎（EventStream）
//!
//! 显式构造的服务实例，统一编排：
//! - `Publisher`：向主流追加新事件；
//! - `ConsumerLoop`：轮询主流、分发处理、确认/重投/死信；
//! - `DlqMonitor`：只读地观察死信流并记录日志；
//! - 运行统计与 `EngineHandle`（关闭与等待）。
//!
use super::consumer::ConsumerLoop;
use super::dead_letter::DeadLetter;
use super::handler::{EventHandler, HandlerRegistry};
use super::monitor::DlqMonitor;
use super::policy::RetryPolicy;
use super::publisher::Publisher;
use crate::error::{DomainError, DomainResult};
use crate::stats::{OperationalStats, StreamStats};
use crate::store::LogStore;
use futures_core::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 事件流配置
#[derive(Clone, Debug)]
pub struct EventStreamConfig {
    /// 主流名称
    pub main_stream: String,
    /// 死信流名称
    pub dlq_stream: String,
    /// 处理器失败后的最大重试次数
    pub max_retries: u32,
    /// 事件存活时间，每次重投重新计时
    pub ttl: Duration,
    /// 单次读取的最大条目数
    pub read_count: usize,
    /// 主流阻塞读的超时
    pub block: Duration,
    /// 死信流阻塞读的超时
    pub dlq_block: Duration,
    /// 存储错误后的固定退避
    pub error_backoff: Duration,
    /// 发布后将主流裁剪到约该长度；`None` 表示不裁剪
    pub max_stream_len: Option<usize>,
    /// 统计中首/尾条目的采样数
    pub stats_sample: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            main_stream: "events_stream".to_string(),
            dlq_stream: "events_dlq".to_string(),
            max_retries: 3,
            ttl: Duration::from_secs(60 * 60),
            read_count: 10,
            block: Duration::from_secs(5),
            dlq_block: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            max_stream_len: Some(10_000),
            stats_sample: 5,
        }
    }
}

impl EventStreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.ttl)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.main_stream.is_empty() || self.dlq_stream.is_empty() {
            return Err(DomainError::invalid_config("stream names must not be empty"));
        }
        if self.main_stream == self.dlq_stream {
            return Err(DomainError::invalid_config(
                "main stream and dead-letter stream must differ",
            ));
        }
        if self.read_count == 0 {
            return Err(DomainError::invalid_config("read_count must be positive"));
        }
        // 许多日志存储把 0 视为无限阻塞
        if self.block.is_zero() || self.dlq_block.is_zero() {
            return Err(DomainError::invalid_config("block timeouts must be positive"));
        }
        if self.max_stream_len == Some(0) {
            return Err(DomainError::invalid_config("max_stream_len must be positive"));
        }
        Ok(())
    }
}

/// 后台循环状态：STOPPED → RUNNING → STOPPED
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
}

/// 循环运行标记；同一实例同时只允许一个运行中的任务
#[derive(Clone, Default)]
pub(crate) struct RunState(Arc<AtomicBool>);

impl RunState {
    pub(crate) fn begin(&self, name: &str) -> DomainResult<RunGuard> {
        if self
            .0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DomainError::InvalidState {
                reason: format!("{name} is already running"),
            });
        }
        Ok(RunGuard(self.0.clone()))
    }

    pub(crate) fn get(&self) -> LoopState {
        if self.0.load(Ordering::SeqCst) {
            LoopState::Running
        } else {
            LoopState::Stopped
        }
    }
}

/// 任务结束（含 panic）时把状态复位为 STOPPED
pub(crate) struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 事件流服务：发布、注册处理器、启动后台循环与查询统计
pub struct EventStream {
    config: EventStreamConfig,
    store: Arc<dyn LogStore>,
    registry: Arc<HandlerRegistry>,
    publisher: Publisher,
    consumer: Arc<ConsumerLoop>,
    monitor: Arc<DlqMonitor>,
}

impl EventStream {
    /// 校验配置并组装各组件；不会访问存储
    pub fn new(store: Arc<dyn LogStore>, config: EventStreamConfig) -> DomainResult<Self> {
        config.validate()?;

        let registry = Arc::new(HandlerRegistry::new());
        let publisher = Publisher::new(
            store.clone(),
            &config.main_stream,
            config.ttl,
            config.max_stream_len,
        );
        let consumer = Arc::new(ConsumerLoop::new(store.clone(), registry.clone(), &config));
        let monitor = Arc::new(DlqMonitor::new(store.clone(), &config));

        Ok(Self {
            config,
            store,
            registry,
            publisher,
            consumer,
            monitor,
        })
    }

    pub fn config(&self) -> &EventStreamConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn consumer(&self) -> &Arc<ConsumerLoop> {
        &self.consumer
    }

    pub fn monitor(&self) -> &Arc<DlqMonitor> {
        &self.monitor
    }

    pub async fn publish_event<T>(&self, event_type: &str, data: &T) -> DomainResult<Uuid>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.publish_event(event_type, data).await
    }

    pub fn register_handler(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.registry.register(event_type, handler);
    }

    pub fn register_fn<F, Fut>(&self, event_type: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register_fn(event_type, f);
    }

    /// 同时启动消费循环与死信监控，两者共享同一个取消令牌
    pub async fn start(&self) -> DomainResult<EngineHandle> {
        let token = CancellationToken::new();
        let mut handle = EngineHandle::new(token.clone(), Vec::with_capacity(2));

        // 任一启动失败时 handle 被丢弃，已启动的任务随之取消
        handle
            .tasks
            .push(self.consumer.clone().spawn(token.clone()).await?);
        handle.tasks.push(self.monitor.clone().spawn(token).await?);

        Ok(handle)
    }

    /// 死信到达通知流（只读观察，用于告警）
    pub fn dead_letters(&self) -> BoxStream<'static, DeadLetter> {
        self.monitor.subscribe()
    }

    pub async fn get_operational_stats(&self) -> DomainResult<OperationalStats> {
        let sample = self.config.stats_sample;
        let (main_stream, dlq_stream) = tokio::try_join!(
            StreamStats::collect(self.store.as_ref(), &self.config.main_stream, sample),
            StreamStats::collect(self.store.as_ref(), &self.config.dlq_stream, sample),
        )?;

        Ok(OperationalStats {
            main_stream,
            dlq_stream,
            consumer: self.consumer.counters(),
        })
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub(crate) fn new(token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { token, tasks }
    }

    /// 请求停止；循环在当前迭代结束或阻塞读被打断后退出
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }

    /// `shutdown` 后等待全部任务结束
    pub async fn stop(self) {
        self.shutdown();
        self.join().await;
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
