//! 运行统计
//!
//! 对主流与死信流做只读的快照查询：长度、首/尾若干条目与消费组信息，
//! 另附消费循环的计数器。
//!
use crate::error::DomainResult;
use crate::eventing::ConsumerCounters;
use crate::store::{GroupInfo, LogStore, RawEntry};
use serde::Serialize;
use tracing::instrument;

/// 单个流的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub stream: String,
    pub length: u64,
    /// 最早的若干条，按从旧到新
    pub first_entries: Vec<RawEntry>,
    /// 最新的若干条，按从新到旧
    pub last_entries: Vec<RawEntry>,
    pub groups: Vec<GroupInfo>,
}

impl StreamStats {
    #[instrument(skip(store), err)]
    pub async fn collect(store: &dyn LogStore, stream: &str, sample: usize) -> DomainResult<Self> {
        let (length, first_entries, last_entries, groups) = tokio::try_join!(
            store.length(stream),
            store.range_read(stream, None, None, Some(sample)),
            store.last_entries(stream, sample),
            store.group_info(stream),
        )?;

        Ok(Self {
            stream: stream.to_string(),
            length,
            first_entries,
            last_entries,
            groups,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationalStats {
    pub main_stream: StreamStats,
    pub dlq_stream: StreamStats,
    pub consumer: ConsumerCounters,
}
