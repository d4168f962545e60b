//! 消费循环（ConsumerLoop）
//!
//! 单读者轮询主流：阻塞读一批新条目 → 逐条分发 → 按 `Outcome` 确认/重投/死信。
//! - 游标只在内存中推进，启动时定位到流尾；
//! - 处理器按到达顺序逐个 await，长耗时处理器会降低吞吐；
//! - 存储错误记录日志并固定退避，循环不会因此退出；结算失败的条目在恢复后重读；
//! - 取消令牌同时作用于阻塞读，关闭时无需等待读超时。
//!
use super::dead_letter::DlqMover;
use super::engine::{EngineHandle, EventStreamConfig, LoopState, RunState};
use super::handler::HandlerRegistry;
use super::policy::{DeadLetterReason, Outcome, RetryPolicy};
use crate::envelope::{EventEnvelope, StreamEntry};
use crate::error::{DomainError, DomainResult};
use crate::store::{EntryId, LogStore, RawEntry};
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 消费计数器快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerCounters {
    pub processed: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
}

#[derive(Default)]
struct ConsumerMetrics {
    processed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    store_errors: AtomicU64,
}

impl ConsumerMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerCounters {
        ConsumerCounters {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsumerLoop {
    store: Arc<dyn LogStore>,
    registry: Arc<HandlerRegistry>,
    mover: DlqMover,
    policy: RetryPolicy,
    main_stream: String,
    read_count: usize,
    block: Duration,
    error_backoff: Duration,
    state: RunState,
    metrics: ConsumerMetrics,
}

impl ConsumerLoop {
    pub fn new(
        store: Arc<dyn LogStore>,
        registry: Arc<HandlerRegistry>,
        config: &EventStreamConfig,
    ) -> Self {
        Self {
            mover: DlqMover::new(store.clone(), &config.main_stream, &config.dlq_stream),
            store,
            registry,
            policy: config.retry_policy(),
            main_stream: config.main_stream.clone(),
            read_count: config.read_count,
            block: config.block,
            error_backoff: config.error_backoff,
            state: RunState::default(),
            metrics: ConsumerMetrics::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn counters(&self) -> ConsumerCounters {
        self.metrics.snapshot()
    }

    /// 启动循环：游标定位到当前流尾，只会看到此后追加的条目
    pub async fn start(self: Arc<Self>) -> DomainResult<EngineHandle> {
        let token = CancellationToken::new();
        let task = self.spawn(token.clone()).await?;
        Ok(EngineHandle::new(token, vec![task]))
    }

    pub(crate) async fn spawn(self: Arc<Self>, token: CancellationToken) -> DomainResult<JoinHandle<()>> {
        let guard = self.state.begin("consumer loop")?;
        let cursor = self.store.tail(&self.main_stream).await?;
        info!(stream = %self.main_stream, cursor = %cursor, "consumer loop started");

        Ok(tokio::spawn(async move {
            self.run(token, cursor).await;
            drop(guard);
        }))
    }

    async fn run(&self, token: CancellationToken, mut cursor: EntryId) {
        'poll: loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.store.blocking_read(&self.main_stream, &cursor, self.read_count, self.block) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(err) => {
                    ConsumerMetrics::incr(&self.metrics.store_errors);
                    error!(stream = %self.main_stream, error = %err, "stream read failed, backing off");
                    if !self.backoff(&token).await {
                        break;
                    }
                    continue;
                }
            };

            for raw in entries {
                let id = raw.id;
                // 结算失败时游标停在上一条，退避后重读该条目；本批余下条目一并放弃以保持顺序
                if let Err(err) = self.process_single_event(raw).await {
                    self.store_failure(&id, &err);
                    if !self.backoff(&token).await {
                        break 'poll;
                    }
                    continue 'poll;
                }
                cursor = id;
            }
        }

        info!(stream = %self.main_stream, "consumer loop stopped");
    }

    /// 固定退避；期间收到取消时返回 `false`
    async fn backoff(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = time::sleep(self.error_backoff) => true,
        }
    }

    /// 处理单个条目直至结算完成；返回错误时条目仍留在主流中，由调用方重读
    pub(crate) async fn process_single_event(&self, raw: RawEntry) -> DomainResult<()> {
        ConsumerMetrics::incr(&self.metrics.processed);

        let entry = match StreamEntry::decode(&self.main_stream, &raw) {
            Ok(entry) => entry,
            Err(err) => {
                let reason = DeadLetterReason::Malformed {
                    reason: match err {
                        DomainError::MalformedEntry { reason, .. } => reason,
                        other => other.to_string(),
                    },
                };
                self.mover.move_raw(&raw, &reason, Utc::now()).await?;
                ConsumerMetrics::incr(&self.metrics.dead_lettered);
                return Ok(());
            }
        };

        let outcome = self.dispatch(&entry.envelope).await;
        self.apply(&entry, outcome).await
    }

    /// 决定单个信封的结果：过期 → 无处理器 → 调用处理器（失败交给重试策略）
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Outcome {
        if let Some(expired) = self.policy.check_expiry(envelope, Utc::now()) {
            return expired;
        }

        let Some(handler) = self.registry.get(envelope.event_type()) else {
            return Outcome::DeadLetter(DeadLetterReason::NoHandler {
                event_type: envelope.event_type().to_string(),
            });
        };

        let result = AssertUnwindSafe(handler.handle(envelope.payload()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))));

        match result {
            Ok(()) => Outcome::Ack,
            Err(err) => {
                warn!(
                    event_id = %envelope.event_id(),
                    event_type = %envelope.event_type(),
                    retries = envelope.retries(),
                    error = %format!("{err:#}"),
                    "event handler failed"
                );
                self.policy.decide(envelope, &err, Utc::now())
            }
        }
    }

    async fn apply(&self, entry: &StreamEntry, outcome: Outcome) -> DomainResult<()> {
        match outcome {
            Outcome::Ack => {
                self.store.delete(&self.main_stream, &entry.id).await?;
                ConsumerMetrics::incr(&self.metrics.acked);
                debug!(entry_id = %entry.id, event_id = %entry.envelope.event_id(), "event acknowledged");
            }
            Outcome::Retry(next) => {
                self.retry(entry, &next).await?;
                ConsumerMetrics::incr(&self.metrics.retried);
            }
            Outcome::DeadLetter(reason) => {
                self.mover.move_to_dlq(entry, &reason, Utc::now()).await?;
                ConsumerMetrics::incr(&self.metrics.dead_lettered);
            }
        }
        Ok(())
    }

    /// 追加新副本后再删除原条目；新副本在下一次轮询即可见
    async fn retry(&self, entry: &StreamEntry, next: &EventEnvelope) -> DomainResult<()> {
        let retry_id = self.store.append(&self.main_stream, &next.to_fields()?).await?;
        self.store.delete(&self.main_stream, &entry.id).await?;
        warn!(
            entry_id = %entry.id,
            retry_entry_id = %retry_id,
            event_id = %next.event_id(),
            retries = next.retries(),
            "event scheduled for retry"
        );
        Ok(())
    }

    fn store_failure(&self, entry_id: &EntryId, err: &DomainError) {
        ConsumerMetrics::incr(&self.metrics.store_errors);
        error!(entry_id = %entry_id, error = %err, "failed to settle event, will re-read it");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::fields;
    use crate::eventing::dead_letter::DeadLetter;
    use crate::store::InMemoryLogStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config(max_retries: u32, ttl: Duration) -> EventStreamConfig {
        EventStreamConfig {
            max_retries,
            ttl,
            block: Duration::from_millis(50),
            error_backoff: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn consumer(store: Arc<InMemoryLogStore>, cfg: &EventStreamConfig) -> (ConsumerLoop, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        (ConsumerLoop::new(store, registry.clone(), cfg), registry)
    }

    async fn publish(store: &InMemoryLogStore, cfg: &EventStreamConfig, ty: &str) -> (RawEntry, EventEnvelope) {
        let env = EventEnvelope::new(ty, json!({"order_id": 42}), cfg.ttl, Utc::now());
        let fields = env.to_fields().unwrap();
        let id = store.append(&cfg.main_stream, &fields).await.unwrap();
        (RawEntry::new(id, fields), env)
    }

    #[tokio::test]
    async fn expired_event_skips_the_handler() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::ZERO);
        let (consumer, registry) = consumer(store.clone(), &cfg);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        registry.register_fn("order_created", move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (raw, _) = publish(&store, &cfg, "order_created").await;
        consumer.process_single_event(raw).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.snapshot(&cfg.main_stream).is_empty());
        let dead = DeadLetter::from_raw(&store.snapshot(&cfg.dlq_stream)[0]).unwrap();
        assert_eq!(dead.error, "Event TTL expired");
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_without_retry() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::from_secs(60));
        let (consumer, _registry) = consumer(store.clone(), &cfg);

        let (raw, env) = publish(&store, &cfg, "unknown_type").await;
        assert_eq!(
            consumer.dispatch(&env).await,
            Outcome::DeadLetter(DeadLetterReason::NoHandler {
                event_type: "unknown_type".into()
            })
        );
        consumer.process_single_event(raw).await.unwrap();

        let dead = DeadLetter::from_raw(&store.snapshot(&cfg.dlq_stream)[0]).unwrap();
        assert_eq!(dead.final_retry_count, 0);
        assert!(dead.error.contains("no handler"));
        assert_eq!(consumer.counters().retried, 0);
    }

    #[tokio::test]
    async fn handler_failure_appends_retry_copy_and_deletes_original() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::from_secs(60));
        let (consumer, registry) = consumer(store.clone(), &cfg);
        registry.register_fn("order_created", |_| async { Err(anyhow::anyhow!("db unavailable")) });

        let (raw, env) = publish(&store, &cfg, "order_created").await;
        let original_id = raw.id;
        consumer.process_single_event(raw).await.unwrap();

        let main = store.snapshot(&cfg.main_stream);
        assert_eq!(main.len(), 1);
        assert!(main[0].id > original_id);
        let copy = EventEnvelope::from_fields(&main[0].fields).unwrap();
        assert_eq!(copy.event_id(), env.event_id());
        assert_eq!(copy.retries(), 1);
        assert!(store.snapshot(&cfg.dlq_stream).is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_failure() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(0, Duration::from_secs(60));
        let (consumer, registry) = consumer(store.clone(), &cfg);
        registry.register_fn("boom", |_| async { panic!("handler exploded") });

        let (_, env) = publish(&store, &cfg, "boom").await;
        let outcome = consumer.dispatch(&env).await;
        assert_eq!(
            outcome,
            Outcome::DeadLetter(DeadLetterReason::RetriesExhausted {
                error: "handler panicked: handler exploded".into()
            })
        );
    }

    #[tokio::test]
    async fn malformed_entry_is_dead_lettered_with_raw_fields() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::from_secs(60));
        let (consumer, _registry) = consumer(store.clone(), &cfg);

        let (mut raw, _) = publish(&store, &cfg, "order_created").await;
        raw.fields.insert(fields::DATA.to_string(), "not-json".to_string());
        consumer.process_single_event(raw).await.unwrap();

        let dlq = store.snapshot(&cfg.dlq_stream);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].field(fields::DATA), Some("not-json"));
        assert!(dlq[0].field(fields::ERROR).unwrap().starts_with("malformed entry"));
        assert!(store.snapshot(&cfg.main_stream).is_empty());
    }

    #[tokio::test]
    async fn settle_failure_is_returned_and_entry_stays() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::from_secs(60));
        let (consumer, registry) = consumer(store.clone(), &cfg);
        let outage = store.clone();
        registry.register_fn("order_created", move |_| {
            let outage = outage.clone();
            async move {
                outage.set_available(false);
                Ok(())
            }
        });

        let (raw, _) = publish(&store, &cfg, "order_created").await;
        let original_id = raw.id;
        let err = consumer.process_single_event(raw).await.unwrap_err();
        assert!(err.is_store());

        store.set_available(true);
        let main = store.snapshot(&cfg.main_stream);
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].id, original_id);
        assert_eq!(consumer.counters().acked, 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let store = Arc::new(InMemoryLogStore::new());
        let cfg = config(3, Duration::from_secs(60));
        let (consumer, _registry) = consumer(store, &cfg);
        let consumer = Arc::new(consumer);

        let handle = consumer.clone().start().await.unwrap();
        assert_eq!(consumer.state(), LoopState::Running);
        assert!(matches!(
            consumer.clone().start().await,
            Err(DomainError::InvalidState { .. })
        ));

        handle.stop().await;
        assert_eq!(consumer.state(), LoopState::Stopped);
        // 停止后可以再次启动
        consumer.clone().start().await.unwrap().stop().await;
    }
}
