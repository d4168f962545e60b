//! Redis Streams 日志存储
//!
//! 命令映射：
//! - 追加 `XADD <stream> * f v ...`，删除 `XDEL`；
//! - 区间读 `XRANGE`/`XREVRANGE`，长度 `XLEN`，裁剪 `XTRIM MAXLEN ~`；
//! - 阻塞读 `XREAD COUNT n BLOCK ms STREAMS <stream> <since>`；
//! - 消费组信息 `XINFO GROUPS`。
//!
//! 普通命令走共享的 `ConnectionManager`（断线自动重连）；阻塞读会占住连接，
//! 因此每个被阻塞读取的流各自复用一条专用连接，出错时丢弃并在下次读取时重连。
//!
use super::{EntryId, FieldMap, GroupInfo, LogStore, RawEntry};
use crate::error::{DomainError, DomainResult as Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamInfoGroupsReply, StreamRangeReply, StreamReadReply};
use redis::{Client, Cmd, FromRedisValue};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub struct RedisStreamStore {
    client: Client,
    conn: ConnectionManager,
    /// 流名 -> 阻塞读专用连接
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamStore {
    /// 连接 Redis，例如 `redis://localhost:6379/0`
    #[instrument(skip(url), err)]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("connected to redis");
        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn readers(&self) -> Result<MutexGuard<'_, HashMap<String, MultiplexedConnection>>> {
        self.readers
            .lock()
            .map_err(|_| DomainError::store("redis reader pool lock poisoned"))
    }

    /// 取出该流的阻塞读连接；没有缓存时新建
    async fn reader(&self, stream: &str) -> Result<MultiplexedConnection> {
        let cached = self.readers()?.remove(stream);
        match cached {
            Some(conn) => Ok(conn),
            None => {
                debug!(stream, "opening blocking-read connection");
                Ok(self.client.get_multiplexed_async_connection().await?)
            }
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }
}

fn to_raw(entry: StreamId) -> Result<RawEntry> {
    let id: EntryId = entry.id.parse()?;
    let fields = entry
        .map
        .iter()
        .map(|(k, v)| -> Result<(String, String)> {
            Ok((k.clone(), redis::from_redis_value(v)?))
        })
        .collect::<Result<FieldMap>>()?;
    Ok(RawEntry::new(id, fields))
}

fn to_raw_all(ids: Vec<StreamId>) -> Result<Vec<RawEntry>> {
    ids.into_iter().map(to_raw).collect()
}

fn bound(id: Option<EntryId>, open: &str) -> String {
    id.map_or_else(|| open.to_string(), |id| id.to_string())
}

#[async_trait]
impl LogStore for RedisStreamStore {
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<EntryId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let id: String = self.query(&cmd).await?;
        id.parse()
    }

    async fn delete(&self, stream: &str, id: &EntryId) -> Result<()> {
        let _: u64 = self
            .query(redis::cmd("XDEL").arg(stream).arg(id.to_string()))
            .await?;
        Ok(())
    }

    async fn range_read(
        &self,
        stream: &str,
        min: Option<EntryId>,
        max: Option<EntryId>,
        count: Option<usize>,
    ) -> Result<Vec<RawEntry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg(bound(min, "-")).arg(bound(max, "+"));
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let reply: StreamRangeReply = self.query(&cmd).await?;
        to_raw_all(reply.ids)
    }

    async fn blocking_read(
        &self,
        stream: &str,
        since: &EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        // BLOCK 0 表示无限阻塞
        let block_ms = block.as_millis().max(1) as u64;
        let mut conn = self.reader(stream).await?;
        let reply: Option<StreamReadReply> = match redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(since.to_string())
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            // 连接随之丢弃，下次读取时重连
            Err(err) => {
                warn!(stream, error = %err, "blocking read failed, dropping connection");
                return Err(err.into());
            }
        };
        self.readers()?.insert(stream.to_string(), conn);

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .into_iter()
            .filter(|key| key.key == stream)
            .flat_map(|key| key.ids)
            .map(to_raw)
            .collect()
    }

    async fn length(&self, stream: &str) -> Result<u64> {
        self.query(redis::cmd("XLEN").arg(stream)).await
    }

    async fn last_entries(&self, stream: &str, n: usize) -> Result<Vec<RawEntry>> {
        let reply: StreamRangeReply = self
            .query(redis::cmd("XREVRANGE").arg(stream).arg("+").arg("-").arg("COUNT").arg(n))
            .await?;
        to_raw_all(reply.ids)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64> {
        self.query(redis::cmd("XTRIM").arg(stream).arg("MAXLEN").arg("~").arg(max_len))
            .await
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = match redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            // 流不存在
            Err(err) if err.to_string().contains("no such key") => return Ok(Vec::new()),
            Err(err) => return Err(DomainError::from(err)),
        };

        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers as u64,
                pending: g.pending as u64,
                last_delivered_id: g.last_delivered_id,
            })
            .collect())
    }
}
