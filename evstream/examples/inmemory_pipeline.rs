//! 内存存储上的完整流程：成功、重试后进入死信、无处理器、TTL 过期。
//!
//! 运行：`RUST_LOG=debug cargo run -p evstream --example inmemory_pipeline`
//!
use evstream::eventing::{EventStream, EventStreamConfig};
use evstream::store::InMemoryLogStore;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(InMemoryLogStore::new());
    let config = EventStreamConfig {
        max_retries: 2,
        block: Duration::from_millis(200),
        dlq_block: Duration::from_millis(200),
        ..Default::default()
    };
    let stream = EventStream::new(store, config)?;
    let mut dead_letters = stream.dead_letters();

    stream.register_fn("order_created", |payload| async move {
        tracing::info!(%payload, "order created");
        Ok(())
    });
    stream.register_fn("charge_card", |_| async { Err(anyhow::anyhow!("gateway timeout")) });

    let handle = stream.start().await?;
    stream.publish_event("order_created", &json!({"order_id": 7})).await?;
    stream.publish_event("charge_card", &json!({"order_id": 7})).await?;
    stream.publish_event("refund_issued", &json!({"order_id": 7})).await?;

    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), dead_letters.next()).await {
            Ok(Some(dead)) => println!("dead letter: {} ({})", dead.event_id, dead.error),
            _ => break,
        }
    }

    handle.stop().await;
    let stats = stream.get_operational_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
