//! Thin wrapper over the Redis stream commands the bus uses.
//!
//! Each `StreamStore` owns one auto-reconnecting connection. Readers hold
//! their own store because they issue indefinite blocking XREADGROUP calls;
//! sharing a connection with the control path would stall unrelated ops.

use redis::aio::ConnectionManager;
use redis::streams::{
    StreamInfoConsumersReply, StreamInfoGroupsReply, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};
use tracing::debug;

use crate::error::{BusError, Result};

/// The single field every bus record carries.
pub const MESSAGE_FIELD: &str = "message";

/// One record as read from a stream.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    /// Store-assigned record id.
    pub id: String,
    /// The `message` field, if present.
    pub payload: Option<Vec<u8>>,
}

/// A consumer as reported by XINFO CONSUMERS.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub name: String,
    pub idle_ms: u64,
    pub pending: usize,
}

/// A group as reported by XINFO GROUPS.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
}

/// Stream operations against one store connection.
#[derive(Clone)]
pub struct StreamStore {
    conn: ConnectionManager,
}

impl StreamStore {
    /// Open a new connection to the store. Fails if it is unreachable.
    pub async fn connect(client: &Client) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    /// XADD a record with a store-assigned id; returns that id.
    pub async fn append(&self, key: &str, payload: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(key, "*", &[(MESSAGE_FIELD, payload)]).await?;
        Ok(id)
    }

    /// Blocking XREADGROUP of up to `count` new records for `consumer`.
    ///
    /// Returns an empty batch when the block timeout elapses without data.
    pub async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamRecord>> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&[key], &[">"], &options).await?;

        let mut records = Vec::new();
        if let Some(reply) = reply {
            for stream in reply.keys {
                for entry in stream.ids {
                    let payload: Option<Vec<u8>> = entry.get(MESSAGE_FIELD);
                    records.push(StreamRecord {
                        id: entry.id,
                        payload,
                    });
                }
            }
        }
        Ok(records)
    }

    /// XACK a single record.
    pub async fn ack(&self, key: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(key, group, &[id]).await?;
        Ok(())
    }

    /// XGROUP CREATE with MKSTREAM; a pre-existing group is not an error.
    pub async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(key, group, start_id)
            .await
        {
            Ok(_) => {
                debug!(key = %key, group = %group, start_id = %start_id, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// XGROUP DELCONSUMER; returns the consumer's pending count.
    pub async fn delete_consumer(&self, key: &str, group: &str, consumer: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let pending: i64 = conn.xgroup_delconsumer(key, group, consumer).await?;
        Ok(pending)
    }

    /// XGROUP DESTROY; destroying an already-gone group reports `false`.
    pub async fn destroy_group(&self, key: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let destroyed: i64 = conn.xgroup_destroy(key, group).await?;
        Ok(destroyed != 0)
    }

    /// Approximate XTRIM MAXLEN.
    pub async fn trim(&self, key: &str, max_len: usize) -> Result<i64> {
        let mut conn = self.conn.clone();
        let trimmed: i64 = conn.xtrim(key, StreamMaxlen::Approx(max_len)).await?;
        Ok(trimmed)
    }

    /// EXPIRE the key.
    pub async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, seconds).await?;
        Ok(())
    }

    /// EXISTS.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    /// XINFO CONSUMERS for one group.
    pub async fn consumers(&self, key: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = conn.xinfo_consumers(key, group).await?;
        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                idle_ms: c.idle as u64,
                pending: c.pending,
            })
            .collect())
    }

    /// XINFO GROUPS for one stream.
    pub async fn groups(&self, key: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(key).await?;
        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers,
                pending: g.pending,
            })
            .collect())
    }
}
