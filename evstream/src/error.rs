//! 统一错误定义
//!
//! 聚焦日志存储、编解码、配置与状态校验等最小必要集合。
//! 处理器（handler）自身的失败使用 `anyhow::Error`，不在此处建模，
//! 而是由重试策略归类为 `Outcome`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 存储 ---
    #[error("store error: {reason}")]
    Store { reason: String },

    // --- 序列化/解析 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("malformed entry: id={entry_id}, reason={reason}")]
    MalformedEntry { entry_id: String, reason: String },

    // --- 配置/状态 ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

impl DomainError {
    pub fn store(reason: impl Into<String>) -> Self {
        DomainError::Store {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        DomainError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// 是否为存储层的瞬时错误（消费循环据此退避重试）
    pub fn is_store(&self) -> bool {
        matches!(self, DomainError::Store { .. })
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// ---- Cross-crate conversions ----

#[cfg(feature = "redis")]
impl From<redis::RedisError> for DomainError {
    fn from(err: redis::RedisError) -> Self {
        DomainError::Store {
            reason: err.to_string(),
        }
    }
}

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for DomainError {
    fn from(err: std::num::ParseIntError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for DomainError {
    fn from(err: chrono::ParseError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}
