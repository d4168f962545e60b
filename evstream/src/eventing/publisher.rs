//! 事件发布器（Publisher）
//!
//! 生成信封并追加到主流。本层不做重试：存储失败直接返回给调用方。
//!
use crate::envelope::EventEnvelope;
use crate::error::DomainResult;
use crate::store::{EntryId, LogStore};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn LogStore>,
    main_stream: String,
    ttl: Duration,
    /// 追加后将主流裁剪到约该长度；`None` 表示不裁剪
    max_stream_len: Option<usize>,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn LogStore>,
        main_stream: impl Into<String>,
        ttl: Duration,
        max_stream_len: Option<usize>,
    ) -> Self {
        Self {
            store,
            main_stream: main_stream.into(),
            ttl,
            max_stream_len,
        }
    }

    /// 发布一个新事件，返回其 `event_id`
    #[instrument(skip(self, data), fields(stream = %self.main_stream), err)]
    pub async fn publish_event<T>(&self, event_type: &str, data: &T) -> DomainResult<Uuid>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(data)?;
        let envelope = EventEnvelope::new(event_type, payload, self.ttl, Utc::now());
        self.publish(&envelope).await?;
        Ok(envelope.event_id())
    }

    /// 追加一个已构造的信封
    pub async fn publish(&self, envelope: &EventEnvelope) -> DomainResult<EntryId> {
        let entry_id = self
            .store
            .append(&self.main_stream, &envelope.to_fields()?)
            .await?;
        debug!(
            entry_id = %entry_id,
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            "event published"
        );

        if let Some(max_len) = self.max_stream_len {
            // 裁剪失败不影响已成功的发布
            if let Err(err) = self.store.trim(&self.main_stream, max_len).await {
                warn!(stream = %self.main_stream, error = %err, "failed to trim stream");
            }
        }

        Ok(entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::fields;
    use crate::store::InMemoryLogStore;
    use serde_json::json;

    #[tokio::test]
    async fn publish_appends_a_fresh_envelope() {
        let store = Arc::new(InMemoryLogStore::new());
        let publisher = Publisher::new(store.clone(), "events", Duration::from_secs(3600), None);

        let event_id = publisher
            .publish_event("order_created", &json!({"order_id": 42}))
            .await
            .unwrap();

        let entries = store.snapshot("events");
        assert_eq!(entries.len(), 1);
        let raw = &entries[0];
        assert_eq!(raw.field(fields::EVENT_ID), Some(event_id.to_string().as_str()));
        assert_eq!(raw.field(fields::TYPE), Some("order_created"));
        assert_eq!(raw.field(fields::DATA), Some(r#"{"order_id":42}"#));
        assert_eq!(raw.field(fields::RETRIES), Some("0"));

        let envelope = EventEnvelope::from_fields(&raw.fields).unwrap();
        assert!(envelope.expires_at() > envelope.created_at());
    }

    #[tokio::test]
    async fn publish_surfaces_store_errors() {
        let store = Arc::new(InMemoryLogStore::new());
        let publisher = Publisher::new(store.clone(), "events", Duration::from_secs(60), None);
        store.set_available(false);

        let err = publisher.publish_event("t", &json!({})).await.unwrap_err();
        assert!(err.is_store());
    }

    #[tokio::test]
    async fn publish_caps_stream_length() {
        let store = Arc::new(InMemoryLogStore::new());
        let publisher = Publisher::new(store.clone(), "events", Duration::from_secs(60), Some(2));
        for n in 0..5 {
            publisher.publish_event("t", &json!({ "n": n })).await.unwrap();
        }

        let left: Vec<_> = store
            .snapshot("events")
            .iter()
            .map(|e| e.field(fields::DATA).unwrap().to_string())
            .collect();
        assert_eq!(left, [r#"{"n":3}"#, r#"{"n":4}"#]);
    }
}
