//! 事件信封（EventEnvelope）
//!
//! 定义事件在流中的标准形态，以及与存储字段表（`FieldMap`）之间的转换：
//! `event_id, type, data, created_at, expires_at, retries`。
//!
//! 信封不可变：重试会生成一个新的信封（相同 `event_id`、`retries + 1`、
//! 刷新 `expires_at`），旧条目随后被删除。
//!
use crate::error::{DomainError, DomainResult};
use crate::store::{EntryId, FieldMap, RawEntry};
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// 存储字段名
pub mod fields {
    pub const EVENT_ID: &str = "event_id";
    pub const TYPE: &str = "type";
    pub const DATA: &str = "data";
    pub const CREATED_AT: &str = "created_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const RETRIES: &str = "retries";

    // 死信附加字段
    pub const ERROR: &str = "error";
    pub const FAILED_AT: &str = "failed_at";
    pub const MOVED_AT: &str = "moved_at";
    pub const ORIGINAL_STREAM: &str = "original_stream";
    pub const FINAL_RETRY_COUNT: &str = "final_retry_count";
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// 事件唯一标识，跨重试保持不变
    event_id: Uuid,
    /// 事件类型，用于匹配处理器
    event_type: String,
    /// 事件负载
    payload: Value,
    created_at: DateTime<Utc>,
    /// 过期时间；到达后事件不再分发给处理器
    expires_at: DateTime<Utc>,
    #[builder(default)]
    retries: u32,
}

impl EventEnvelope {
    /// 以 `now` 为创建时间构造一个全新的信封
    pub fn new(event_type: impl Into<String>, payload: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            created_at: now,
            expires_at: deadline(now, ttl),
            retries: 0,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 到达过期时间即视为过期（TTL 为 0 的事件到达即过期）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 下一次投递的副本：相同 `event_id`，`retries + 1`，TTL 从 `now` 重新计算
    pub fn next_attempt(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            expires_at: deadline(now, ttl),
            ..self.clone()
        }
    }

    pub fn to_fields(&self) -> DomainResult<FieldMap> {
        Ok(FieldMap::from([
            (fields::EVENT_ID.to_string(), self.event_id.to_string()),
            (fields::TYPE.to_string(), self.event_type.clone()),
            (fields::DATA.to_string(), serde_json::to_string(&self.payload)?),
            (fields::CREATED_AT.to_string(), self.created_at.to_rfc3339()),
            (fields::EXPIRES_AT.to_string(), self.expires_at.to_rfc3339()),
            (fields::RETRIES.to_string(), self.retries.to_string()),
        ]))
    }

    pub fn from_fields(map: &FieldMap) -> DomainResult<Self> {
        Ok(Self {
            event_id: require(map, fields::EVENT_ID)?.parse()?,
            event_type: require(map, fields::TYPE)?.to_string(),
            payload: serde_json::from_str(require(map, fields::DATA)?)?,
            created_at: parse_timestamp(require(map, fields::CREATED_AT)?)?,
            expires_at: parse_timestamp(require(map, fields::EXPIRES_AT)?)?,
            retries: require(map, fields::RETRIES)?.parse()?,
        })
    }
}

/// 已解码的流条目：所在流、日志 ID 与信封
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: EntryId,
    pub envelope: EventEnvelope,
}

impl StreamEntry {
    /// 将原始条目解码为信封；失败时返回 `MalformedEntry`
    pub fn decode(stream: &str, raw: &RawEntry) -> DomainResult<Self> {
        let envelope = EventEnvelope::from_fields(&raw.fields).map_err(|e| {
            DomainError::MalformedEntry {
                entry_id: raw.id.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            stream: stream.to_string(),
            id: raw.id,
            envelope,
        })
    }
}

pub(crate) fn require<'a>(map: &'a FieldMap, name: &str) -> DomainResult<&'a str> {
    map.get(name).map(String::as_str).ok_or_else(|| DomainError::Parse {
        reason: format!("missing field `{name}`"),
    })
}

pub(crate) fn parse_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn new_envelope_stamps_expiry_after_creation() {
        let now = Utc::now();
        let env = EventEnvelope::new("order_created", json!({"order_id": 42}), HOUR, now);
        assert_eq!(env.retries(), 0);
        assert_eq!(env.created_at(), now);
        assert!(env.expires_at() > env.created_at());
        assert!(!env.is_expired_at(now));
        assert!(env.is_expired_at(now + TimeDelta::hours(1)));
    }

    #[test]
    fn zero_ttl_is_expired_on_arrival() {
        let now = Utc::now();
        let env = EventEnvelope::new("t", json!({}), Duration::ZERO, now);
        assert!(env.is_expired_at(now));
    }

    #[test]
    fn huge_ttl_saturates_instead_of_overflowing() {
        let now = Utc::now();
        let env = EventEnvelope::new("t", json!({}), Duration::MAX, now);
        assert_eq!(env.expires_at(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn next_attempt_keeps_identity_and_refreshes_ttl() {
        let created = Utc::now() - TimeDelta::minutes(30);
        let env = EventEnvelope::new("t", json!({"a": 1}), HOUR, created);
        let now = Utc::now();
        let next = env.next_attempt(HOUR, now);

        assert_eq!(next.event_id(), env.event_id());
        assert_eq!(next.created_at(), env.created_at());
        assert_eq!(next.payload(), env.payload());
        assert_eq!(next.retries(), 1);
        assert!(next.expires_at() > env.expires_at());
        assert_eq!(next.next_attempt(HOUR, now).retries(), 2);
    }

    #[test]
    fn field_map_uses_stored_layout() {
        let env = EventEnvelope::new("send_mail", json!({"to": "a@b.c"}), HOUR, Utc::now());
        let map = env.to_fields().unwrap();

        assert_eq!(map[fields::EVENT_ID], env.event_id().to_string());
        assert_eq!(map[fields::TYPE], "send_mail");
        assert_eq!(map[fields::DATA], r#"{"to":"a@b.c"}"#);
        assert_eq!(map[fields::RETRIES], "0");
        assert_eq!(EventEnvelope::from_fields(&map).unwrap(), env);
    }

    #[test]
    fn decoding_reports_malformed_entries() {
        let env = EventEnvelope::new("t", json!(1), HOUR, Utc::now());
        let mut map = env.to_fields().unwrap();
        map.insert(fields::DATA.into(), "{not json".into());
        let raw = RawEntry::new(EntryId::new(1, 0), map.clone());
        let err = StreamEntry::decode("s", &raw).unwrap_err();
        assert!(matches!(err, DomainError::MalformedEntry { ref entry_id, .. } if entry_id == "1-0"));

        map.remove(fields::DATA);
        let raw = RawEntry::new(EntryId::new(2, 0), map);
        let err = StreamEntry::decode("s", &raw).unwrap_err();
        assert!(err.to_string().contains("missing field `data`"));
    }
}
