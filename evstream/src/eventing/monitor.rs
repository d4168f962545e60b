//! 死信监控（DlqMonitor）
//!
//! 从启动时的流尾开始阻塞读死信流，对每条到达的死信记录 `error` 级日志，
//! 并通过广播通道通知订阅者。监控只读，不删除、不重放死信。
//!
use super::dead_letter::DeadLetter;
use super::engine::{EngineHandle, EventStreamConfig, LoopState, RunState};
use crate::error::DomainResult;
use crate::store::{EntryId, LogStore};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ALERT_CAPACITY: usize = 256;

pub struct DlqMonitor {
    store: Arc<dyn LogStore>,
    dlq_stream: String,
    read_count: usize,
    block: Duration,
    error_backoff: Duration,
    tx: broadcast::Sender<DeadLetter>,
    state: RunState,
}

impl DlqMonitor {
    pub fn new(store: Arc<dyn LogStore>, config: &EventStreamConfig) -> Self {
        let (tx, _) = broadcast::channel(ALERT_CAPACITY);
        Self {
            store,
            dlq_stream: config.dlq_stream.clone(),
            read_count: config.read_count,
            block: config.dlq_block,
            error_backoff: config.error_backoff,
            tx,
            state: RunState::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// 订阅死信到达通知；订阅者落后过多时丢弃最旧的通知
    pub fn subscribe(&self) -> BoxStream<'static, DeadLetter> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    pub async fn start(self: Arc<Self>) -> DomainResult<EngineHandle> {
        let token = CancellationToken::new();
        let task = self.spawn(token.clone()).await?;
        Ok(EngineHandle::new(token, vec![task]))
    }

    pub(crate) async fn spawn(self: Arc<Self>, token: CancellationToken) -> DomainResult<JoinHandle<()>> {
        let guard = self.state.begin("dead-letter monitor")?;
        let cursor = self.store.tail(&self.dlq_stream).await?;
        info!(stream = %self.dlq_stream, cursor = %cursor, "dead-letter monitor started");

        Ok(tokio::spawn(async move {
            self.run(token, cursor).await;
            drop(guard);
        }))
    }

    async fn run(&self, token: CancellationToken, mut cursor: EntryId) {
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.store.blocking_read(&self.dlq_stream, &cursor, self.read_count, self.block) => read,
            };

            match read {
                Ok(entries) => {
                    for raw in entries {
                        cursor = raw.id;
                        match DeadLetter::from_raw(&raw) {
                            Ok(dead) => self.alert(dead),
                            Err(err) => {
                                warn!(entry_id = %raw.id, error = %err, "unreadable dead-letter entry")
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(stream = %self.dlq_stream, error = %err, "dead-letter read failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(stream = %self.dlq_stream, "dead-letter monitor stopped");
    }

    fn alert(&self, dead: DeadLetter) {
        error!(
            dlq_entry_id = %dead.id,
            event_id = %dead.event_id,
            event_type = dead.event_type.as_deref().unwrap_or("-"),
            error = %dead.error,
            final_retry_count = dead.final_retry_count,
            failed_at = %dead.failed_at.to_rfc3339(),
            original_stream = %dead.original_stream,
            "event moved to dead-letter queue"
        );
        // 没有订阅者时发送失败，忽略即可
        let _ = self.tx.send(dead);
    }
}
