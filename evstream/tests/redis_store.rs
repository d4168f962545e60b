//! 需要可用的 Redis：`REDIS_URL=redis://127.0.0.1:6379/0 cargo test -p evstream --features redis`
#![cfg(feature = "redis")]

use anyhow::Result as AnyResult;
use evstream::store::{EntryId, FieldMap, LogStore, RedisStreamStore};
use std::time::Duration;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

async fn client_count(conn: &mut redis::aio::MultiplexedConnection) -> AnyResult<usize> {
    let list: String = redis::cmd("CLIENT").arg("LIST").query_async(conn).await?;
    Ok(list.lines().count())
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_reads_reuse_one_connection_per_stream() -> AnyResult<()> {
    let Some(url) = redis_url() else {
        return Ok(());
    };
    let store = RedisStreamStore::connect(&url).await?;
    let mut admin = redis::Client::open(url.as_str())?
        .get_multiplexed_async_connection()
        .await?;
    let stream = format!("evstream-test-{}", uuid::Uuid::new_v4());

    // 第一次读取建立专用连接
    store
        .blocking_read(&stream, &EntryId::ZERO, 10, Duration::from_millis(10))
        .await?;
    let before = client_count(&mut admin).await?;
    for _ in 0..5 {
        let batch = store
            .blocking_read(&stream, &EntryId::ZERO, 10, Duration::from_millis(10))
            .await?;
        assert!(batch.is_empty());
    }
    assert_eq!(client_count(&mut admin).await?, before);

    let fields = FieldMap::from([("k".to_string(), "v".to_string())]);
    let id = store.append(&stream, &fields).await?;
    let batch = store
        .blocking_read(&stream, &EntryId::ZERO, 10, Duration::from_millis(10))
        .await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].field("k"), Some("v"));

    store.delete(&stream, &id).await?;
    assert_eq!(store.length(&stream).await?, 0);
    assert!(store.group_info("evstream-missing-stream").await?.is_empty());
    Ok(())
}
