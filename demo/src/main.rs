//! Redis Streams 演示：注册处理器、发布若干事件，Ctrl-C 后打印统计并退出。
//!
//! 环境变量：
//! - `REDIS_URL`（默认 `redis://127.0.0.1:6379/0`）
//! - `EVSTREAM_MAIN_STREAM` / `EVSTREAM_DLQ_STREAM`
//! - `EVSTREAM_MAX_RETRIES` / `EVSTREAM_TTL_SECS`
//! - `RUST_LOG`（默认 `info`）
//!
use anyhow::Context;
use evstream::eventing::{EventStream, EventStreamConfig};
use evstream::store::RedisStreamStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
    amount_cents: i64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init();
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}

fn config_from_env() -> anyhow::Result<EventStreamConfig> {
    let defaults = EventStreamConfig::default();
    Ok(EventStreamConfig {
        main_stream: env_or("EVSTREAM_MAIN_STREAM", defaults.main_stream.clone())?,
        dlq_stream: env_or("EVSTREAM_DLQ_STREAM", defaults.dlq_stream.clone())?,
        max_retries: env_or("EVSTREAM_MAX_RETRIES", defaults.max_retries)?,
        ttl: Duration::from_secs(env_or("EVSTREAM_TTL_SECS", defaults.ttl.as_secs())?),
        ..defaults
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let url = env_or("REDIS_URL", "redis://127.0.0.1:6379/0".to_string())?;
    let store = RedisStreamStore::connect(&url)
        .await
        .context("connect to redis")?;
    let stream = EventStream::new(Arc::new(store), config_from_env()?)?;

    stream.register_fn("order_created", |payload: Value| async move {
        let order: OrderCreated = serde_json::from_value(payload)?;
        info!(order_id = order.order_id, amount_cents = order.amount_cents, "order processed");
        Ok(())
    });
    stream.register_fn("send_mail", |_| async {
        Err(anyhow::anyhow!("smtp relay unreachable"))
    });

    let handle = stream.start().await?;

    stream
        .publish_event("order_created", &OrderCreated { order_id: 1, amount_cents: 4_200 })
        .await?;
    stream
        .publish_event("send_mail", &serde_json::json!({"to": "ops@example.com"}))
        .await?;
    stream
        .publish_event("unknown_type", &serde_json::json!({}))
        .await?;

    tokio::signal::ctrl_c().await?;
    handle.stop().await;

    let stats = stream.get_operational_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
