//! 日志存储（LogStore）协议
//!
//! 定义对“命名的、只追加的有序日志”的最小操作集：追加、删除、区间读、
//! 阻塞读、长度与尾部条目。引擎只依赖单条目级别的原子性，不做额外加锁。
//!
//! - `InMemoryLogStore`：基于内存的实现，用于测试、示例与本地开发；
//! - `RedisStreamStore`：基于 Redis Streams 的实现（需启用 `redis` 特性）。
//!
mod entry_id;
mod inmemory;
#[cfg(feature = "redis")]
mod redis_stream;

pub use entry_id::EntryId;
pub use inmemory::InMemoryLogStore;
#[cfg(feature = "redis")]
pub use redis_stream::RedisStreamStore;

use crate::error::DomainResult as Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// 条目的字段表（字段名 -> 字符串值）
pub type FieldMap = BTreeMap<String, String>;

/// 存储返回的原始条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawEntry {
    pub id: EntryId,
    pub fields: FieldMap,
}

impl RawEntry {
    pub fn new(id: EntryId, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// 消费组信息（仅在存储支持消费组时非空）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

/// 日志存储：对命名流的追加/删除/读取原语
#[async_trait]
pub trait LogStore: Send + Sync {
    /// 追加一条条目，返回日志分配的 ID
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<EntryId>;

    /// 删除指定条目；条目不存在时视为成功
    async fn delete(&self, stream: &str, id: &EntryId) -> Result<()>;

    /// 按 ID 闭区间正序读取；`None` 表示不设该侧边界
    async fn range_read(
        &self,
        stream: &str,
        min: Option<EntryId>,
        max: Option<EntryId>,
        count: Option<usize>,
    ) -> Result<Vec<RawEntry>>;

    /// 读取 `since` 之后的至多 `count` 条新条目，最多阻塞 `block`；超时返回空
    async fn blocking_read(
        &self,
        stream: &str,
        since: &EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>>;

    async fn length(&self, stream: &str) -> Result<u64>;

    /// 最新的 `n` 条条目，按从新到旧排列
    async fn last_entries(&self, stream: &str, n: usize) -> Result<Vec<RawEntry>>;

    /// 将流裁剪到约 `max_len` 条，返回被移除的条目数
    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64>;

    async fn group_info(&self, _stream: &str) -> Result<Vec<GroupInfo>> {
        Ok(Vec::new())
    }

    /// 当前流尾的条目 ID；空流返回 `EntryId::ZERO`
    async fn tail(&self, stream: &str) -> Result<EntryId> {
        let last = self.last_entries(stream, 1).await?;
        Ok(last.first().map(|e| e.id).unwrap_or(EntryId::ZERO))
    }
}
