//! 重试/过期策略
//!
//! 纯决策逻辑：给定信封与处理器错误，决定重投（`Outcome::Retry`）还是进入死信
//! （`Outcome::DeadLetter`）。TTL 过期是独立于重试预算的硬上限。
//!
use crate::envelope::EventEnvelope;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// 事件进入死信队列的原因；其 `Display` 即写入死信条目的 `error` 字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// TTL 已过，处理器不会被调用
    Expired,
    /// 该类型没有注册处理器（配置错误，不重试）
    NoHandler { event_type: String },
    /// 重试预算耗尽，携带最后一次处理器错误
    RetriesExhausted { error: String },
    /// 条目无法解码为信封
    Malformed { reason: String },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "Event TTL expired"),
            Self::NoHandler { event_type } => {
                write!(f, "no handler registered for event type: {event_type}")
            }
            Self::RetriesExhausted { error } => write!(f, "max retries exceeded: {error}"),
            Self::Malformed { reason } => write!(f, "malformed entry: {reason}"),
        }
    }
}

/// 单个事件的处理结果，由分发阶段产生、消费循环执行
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 处理成功，删除原条目
    Ack,
    /// 追加该副本并删除原条目
    Retry(EventEnvelope),
    DeadLetter(DeadLetterReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次投递）
    pub max_retries: u32,
    /// 每次（重）投递的存活时间
    pub ttl: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, ttl: Duration) -> Self {
        Self { max_retries, ttl }
    }

    /// 处理器失败后的决策：预算未耗尽则重投（TTL 重新计时），否则死信
    pub fn decide(&self, envelope: &EventEnvelope, error: &anyhow::Error, now: DateTime<Utc>) -> Outcome {
        if envelope.retries() < self.max_retries {
            Outcome::Retry(envelope.next_attempt(self.ttl, now))
        } else {
            Outcome::DeadLetter(DeadLetterReason::RetriesExhausted {
                error: format!("{error:#}"),
            })
        }
    }

    /// 分发前的过期检查；过期事件无论剩余预算一律进入死信
    pub fn check_expiry(&self, envelope: &EventEnvelope, now: DateTime<Utc>) -> Option<Outcome> {
        envelope
            .is_expired_at(now)
            .then_some(Outcome::DeadLetter(DeadLetterReason::Expired))
    }
}
