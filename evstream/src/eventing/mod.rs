//! 事件子系统（eventing）
//!
//! 基于日志存储的事件发布与消费运行时：
//! - `Publisher`：生成信封并追加到主流；
//! - `HandlerRegistry` / `EventHandler`：按事件类型绑定处理器；
//! - `RetryPolicy` / `Outcome`：失败重投与 TTL 过期决策；
//! - `ConsumerLoop`：单读者轮询、分发、确认/重投/死信；
//! - `DlqMover` / `DlqMonitor`：死信搬运与只读监控；
//! - `EventStream`：组装上述组件并提供 `EngineHandle`。
//!
//! 投递语义为至少一次：处理器可能对同一事件被调用多次。
//!
pub mod consumer;
pub mod dead_letter;
pub mod engine;
pub mod handler;
pub mod monitor;
pub mod policy;
pub mod publisher;

pub use consumer::{ConsumerCounters, ConsumerLoop};
pub use dead_letter::{DeadLetter, DlqMover};
pub use engine::{EngineHandle, EventStream, EventStreamConfig, LoopState};
pub use handler::{EventHandler, FnHandler, HandlerRegistry};
pub use monitor::DlqMonitor;
pub use policy::{DeadLetterReason, Outcome, RetryPolicy};
pub use publisher::Publisher;
