//! 内存版日志存储（InMemoryLogStore）
//!
//! 以 `BTreeMap<EntryId, FieldMap>` 保存每个流，`tokio::sync::Notify` 唤醒阻塞读：
//! - ID 按毫秒时间戳 + 序号分配，单流内严格递增；
//! - `set_available(false)` 可模拟存储不可用，所有操作返回 `DomainError::Store`；
//! - 典型用途：测试环境、示例与本地开发。
//!
use super::{EntryId, FieldMap, LogStore, RawEntry};
use crate::error::{DomainError, DomainResult as Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, FieldMap>,
    last_id: EntryId,
}

impl StreamLog {
    fn collect<'a>(
        iter: impl Iterator<Item = (&'a EntryId, &'a FieldMap)>,
        count: Option<usize>,
    ) -> Vec<RawEntry> {
        iter.take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| RawEntry::new(*id, fields.clone()))
            .collect()
    }
}

/// 简单的内存日志存储实现
pub struct InMemoryLogStore {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
    available: AtomicBool,
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换可用性；不可用期间所有操作都返回存储错误
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 读取某个流的全部条目（正序），便于测试断言
    pub fn snapshot(&self, stream: &str) -> Vec<RawEntry> {
        self.with_streams(|streams| {
            streams
                .get(stream)
                .map(|log| StreamLog::collect(log.entries.iter(), None))
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    fn with_streams<R>(&self, f: impl FnOnce(&mut HashMap<String, StreamLog>) -> R) -> Result<R> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DomainError::store("in-memory store unavailable"));
        }
        let mut guard = self
            .streams
            .lock()
            .map_err(|_| DomainError::store("in-memory store lock poisoned"))?;
        Ok(f(&mut guard))
    }

    fn read_after(&self, stream: &str, since: &EntryId, count: usize) -> Result<Vec<RawEntry>> {
        self.with_streams(|streams| match streams.get(stream) {
            Some(log) => StreamLog::collect(
                log.entries
                    .range((Bound::Excluded(*since), Bound::Unbounded)),
                Some(count),
            ),
            None => Vec::new(),
        })
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<EntryId> {
        let now_millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let id = self.with_streams(|streams| {
            let log = streams.entry(stream.to_string()).or_default();
            let id = log.last_id.successor(now_millis);
            log.last_id = id;
            log.entries.insert(id, fields.clone());
            id
        })?;
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn delete(&self, stream: &str, id: &EntryId) -> Result<()> {
        self.with_streams(|streams| {
            if let Some(log) = streams.get_mut(stream) {
                log.entries.remove(id);
            }
        })
    }

    async fn range_read(
        &self,
        stream: &str,
        min: Option<EntryId>,
        max: Option<EntryId>,
        count: Option<usize>,
    ) -> Result<Vec<RawEntry>> {
        let lower = min.map_or(Bound::Unbounded, Bound::Included);
        let upper = max.map_or(Bound::Unbounded, Bound::Included);
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Ok(Vec::new());
            }
        }

        self.with_streams(|streams| match streams.get(stream) {
            Some(log) => StreamLog::collect(log.entries.range((lower, upper)), count),
            None => Vec::new(),
        })
    }

    async fn blocking_read(
        &self,
        stream: &str,
        since: &EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        let deadline = Instant::now() + block;

        loop {
            // 先登记等待再检查，避免检查与等待之间的追加被漏掉
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_after(stream, since, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn length(&self, stream: &str) -> Result<u64> {
        self.with_streams(|streams| {
            streams
                .get(stream)
                .map_or(0, |log| log.entries.len() as u64)
        })
    }

    async fn last_entries(&self, stream: &str, n: usize) -> Result<Vec<RawEntry>> {
        self.with_streams(|streams| match streams.get(stream) {
            Some(log) => StreamLog::collect(log.entries.iter().rev(), Some(n)),
            None => Vec::new(),
        })
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64> {
        self.with_streams(|streams| {
            let Some(log) = streams.get_mut(stream) else {
                return 0;
            };
            let mut removed = 0;
            while log.entries.len() > max_len {
                log.entries.pop_first();
                removed += 1;
            }
            removed
        })
    }
}
