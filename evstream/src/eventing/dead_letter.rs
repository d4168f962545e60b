//! 死信（DeadLetter）与死信搬运器（DlqMover）
//!
//! 搬运 = 向死信流追加（原字段 + 失败元数据），再从主流删除原条目。
//! 两步之间不具备事务性：中途崩溃可能在主流留下重复条目，按至少一次语义重新处理。
//!
use super::policy::DeadLetterReason;
use crate::envelope::{EventEnvelope, StreamEntry, fields, parse_timestamp, require};
use crate::error::{DomainError, DomainResult};
use crate::store::{EntryId, FieldMap, LogStore, RawEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{instrument, warn};

/// 死信流中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// 死信流中的条目 ID
    pub id: EntryId,
    pub event_id: String,
    pub event_type: Option<String>,
    /// 原条目可解码时的信封；格式错误的条目为 `None`
    pub envelope: Option<EventEnvelope>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub original_stream: String,
    pub final_retry_count: u32,
}

impl DeadLetter {
    pub fn from_raw(raw: &RawEntry) -> DomainResult<Self> {
        let map = &raw.fields;
        let parsed = || -> DomainResult<Self> {
            Ok(Self {
                id: raw.id,
                event_id: require(map, fields::EVENT_ID)?.to_string(),
                event_type: raw.field(fields::TYPE).map(str::to_string),
                envelope: EventEnvelope::from_fields(map).ok(),
                error: require(map, fields::ERROR)?.to_string(),
                failed_at: parse_timestamp(require(map, fields::FAILED_AT)?)?,
                original_stream: require(map, fields::ORIGINAL_STREAM)?.to_string(),
                final_retry_count: require(map, fields::FINAL_RETRY_COUNT)?.parse()?,
            })
        };

        parsed().map_err(|e| DomainError::MalformedEntry {
            entry_id: raw.id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// 将失败/过期条目从主流搬到死信流
#[derive(Clone)]
pub struct DlqMover {
    store: Arc<dyn LogStore>,
    main_stream: String,
    dlq_stream: String,
}

impl DlqMover {
    pub fn new(
        store: Arc<dyn LogStore>,
        main_stream: impl Into<String>,
        dlq_stream: impl Into<String>,
    ) -> Self {
        Self {
            store,
            main_stream: main_stream.into(),
            dlq_stream: dlq_stream.into(),
        }
    }

    /// 搬运已解码的条目，返回死信流中的新 ID
    #[instrument(
        skip(self, entry, reason),
        fields(
            stream = %self.main_stream,
            entry_id = %entry.id,
            event_id = %entry.envelope.event_id()
        ),
        err
    )]
    pub async fn move_to_dlq(
        &self,
        entry: &StreamEntry,
        reason: &DeadLetterReason,
        failed_at: DateTime<Utc>,
    ) -> DomainResult<EntryId> {
        let fields = entry.envelope.to_fields()?;
        self.relocate(&entry.id, fields, reason, entry.envelope.retries(), failed_at)
            .await
    }

    /// 搬运无法解码的原始条目，保留其全部原字段
    #[instrument(skip(self, raw, reason), fields(stream = %self.main_stream, entry_id = %raw.id), err)]
    pub async fn move_raw(
        &self,
        raw: &RawEntry,
        reason: &DeadLetterReason,
        failed_at: DateTime<Utc>,
    ) -> DomainResult<EntryId> {
        let retries = raw
            .field(fields::RETRIES)
            .and_then(|r| r.parse().ok())
            .unwrap_or(0);
        self.relocate(&raw.id, raw.fields.clone(), reason, retries, failed_at)
            .await
    }

    async fn relocate(
        &self,
        id: &EntryId,
        mut dead: FieldMap,
        reason: &DeadLetterReason,
        retries: u32,
        failed_at: DateTime<Utc>,
    ) -> DomainResult<EntryId> {
        let error = reason.to_string();
        dead.insert(fields::ERROR.to_string(), error.clone());
        dead.insert(fields::FAILED_AT.to_string(), failed_at.to_rfc3339());
        dead.insert(fields::MOVED_AT.to_string(), Utc::now().to_rfc3339());
        dead.insert(fields::ORIGINAL_STREAM.to_string(), self.main_stream.clone());
        dead.insert(fields::FINAL_RETRY_COUNT.to_string(), retries.to_string());

        let dlq_id = self.store.append(&self.dlq_stream, &dead).await?;
        self.store.delete(&self.main_stream, id).await?;

        warn!(
            dlq_stream = %self.dlq_stream,
            dlq_entry_id = %dlq_id,
            final_retry_count = retries,
            error = %error,
            "moved event to dead-letter queue"
        );
        Ok(dlq_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLogStore;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn move_appends_failure_metadata_then_deletes_original() {
        let store = Arc::new(InMemoryLogStore::new());
        let mover = DlqMover::new(store.clone(), "main", "dlq");

        let envelope = EventEnvelope::new("send_mail", json!({"to": "x"}), Duration::from_secs(60), Utc::now())
            .next_attempt(Duration::from_secs(60), Utc::now());
        let id = store.append("main", &envelope.to_fields().unwrap()).await.unwrap();
        let entry = StreamEntry::decode("main", &RawEntry::new(id, envelope.to_fields().unwrap())).unwrap();

        let reason = DeadLetterReason::RetriesExhausted {
            error: "smtp down".into(),
        };
        let failed_at = Utc::now();
        mover.move_to_dlq(&entry, &reason, failed_at).await.unwrap();

        assert!(store.snapshot("main").is_empty());
        let dlq = store.snapshot("dlq");
        assert_eq!(dlq.len(), 1);
        assert!(dlq[0].field(fields::MOVED_AT).is_some());

        let dead = DeadLetter::from_raw(&dlq[0]).unwrap();
        assert_eq!(dead.event_id, envelope.event_id().to_string());
        assert_eq!(dead.error, "max retries exceeded: smtp down");
        assert_eq!(dead.original_stream, "main");
        assert_eq!(dead.final_retry_count, 1);
        assert_eq!(dead.failed_at, failed_at);
        assert_eq!(dead.envelope.as_ref(), Some(&envelope));
    }

    #[tokio::test]
    async fn raw_entries_keep_their_original_fields() {
        let store = Arc::new(InMemoryLogStore::new());
        let mover = DlqMover::new(store.clone(), "main", "dlq");
        let raw_fields = FieldMap::from([
            (fields::EVENT_ID.to_string(), "evt-1".to_string()),
            (fields::DATA.to_string(), "{broken".to_string()),
        ]);
        let id = store.append("main", &raw_fields).await.unwrap();

        let reason = DeadLetterReason::Malformed {
            reason: "bad json".into(),
        };
        mover
            .move_raw(&RawEntry::new(id, raw_fields), &reason, Utc::now())
            .await
            .unwrap();

        let dead = DeadLetter::from_raw(&store.snapshot("dlq")[0]).unwrap();
        assert_eq!(dead.event_id, "evt-1");
        assert_eq!(dead.final_retry_count, 0);
        assert!(dead.envelope.is_none());
        assert_eq!(store.snapshot("dlq")[0].field(fields::DATA), Some("{broken"));
    }

    #[tokio::test]
    async fn failed_append_leaves_original_in_place() {
        let store = Arc::new(InMemoryLogStore::new());
        let mover = DlqMover::new(store.clone(), "main", "dlq");
        let envelope = EventEnvelope::new("t", json!({}), Duration::from_secs(60), Utc::now());
        let id = store.append("main", &envelope.to_fields().unwrap()).await.unwrap();
        let entry = StreamEntry::decode("main", &RawEntry::new(id, envelope.to_fields().unwrap())).unwrap();

        store.set_available(false);
        let err = mover
            .move_to_dlq(&entry, &DeadLetterReason::Expired, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_store());

        store.set_available(true);
        assert_eq!(store.snapshot("main").len(), 1);
        assert!(store.snapshot("dlq").is_empty());
    }
}
