//! Redis Streams backed event log.

use std::collections::HashMap;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use tracing::warn;

use super::{EventLog, LogEntry, Result};
use crate::types::EntryId;

/// An [`EventLog`] backed by Redis Streams.
///
/// Holds two multiplexed connections. `XREADGROUP ... BLOCK` parks the whole
/// connection server-side, so blocking reads get their own connection and never
/// stall appends, claims or acks issued concurrently by the other loop or by
/// ingress.
#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisEventLog {
    /// Connects to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        Ok(RedisEventLog { conn, blocking })
    }
}

fn duration_millis(d: Duration) -> usize {
    usize::try_from(d.as_millis()).unwrap_or(usize::MAX)
}

/// Converts a raw stream entry, keeping every value as raw bytes.
///
/// A value that is not a byte string is dropped from the entry rather than
/// failing the batch; the processor then dead-letters the entry as undecodable.
fn to_entry(raw: StreamId) -> LogEntry {
    let mut fields = HashMap::with_capacity(raw.map.len());
    for (name, value) in raw.map {
        match redis::from_redis_value::<Vec<u8>>(&value) {
            Ok(bytes) => {
                fields.insert(name, bytes);
            }
            Err(e) => {
                warn!(entry_id = %raw.id, field = %name, error = %e, "Dropping undecodable stream field");
            }
        }
    }
    LogEntry::new(EntryId::new(raw.id), fields)
}

impl EventLog for RedisEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(EntryId::new(id))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.blocking.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1))
            .block(duration_millis(block));

        // A timed-out block replies nil.
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(to_entry)
            .collect())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(count.max(1));
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                duration_millis(min_idle),
                "0-0",
                options,
            )
            .await?;

        Ok(reply.claimed.into_iter().map(to_entry).collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn.xack(stream, group, &[id.as_str()]).await?;
        Ok(())
    }
}
