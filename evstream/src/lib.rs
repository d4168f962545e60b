//! 基于日志存储的事件流处理库（evstream）
//!
//! 以“只追加的有序日志”（如 Redis Streams）为传输与持久化介质：
//! - `envelope`：事件信封及其字段编解码；
//! - `store`：日志存储协议，附带内存实现与可选的 Redis 实现；
//! - `eventing`：发布、处理器注册、消费循环、重试/过期策略与死信队列；
//! - `stats`：主流/死信流的运行统计。
//!
//! 典型用法：
//! 1. 选择 `LogStore` 实现并构造 `EventStream`；
//! 2. 通过 `register_handler`/`register_fn` 为事件类型绑定处理器；
//! 3. `start` 启动消费循环与死信监控，`publish_event` 发布事件；
//! 4. 通过返回的 `EngineHandle` 优雅关闭。
//!
pub mod envelope;
pub mod error;
pub mod eventing;
pub mod stats;
pub mod store;
