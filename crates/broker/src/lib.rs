//! Redis Streams implementation of the shared broker.
//!
//! Per worker key: one stream `{prefix}:{cluster}:{ns}:{pod}:{container}`
//! trimmed with `MAXLEN ~`, and one lock key `{prefix}:lock:{key}` held by
//! the single writer and refreshed at a third of its TTL. Followers read
//! the stream with `XREAD BLOCK` and never touch the cluster.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tailgate_core::{BrokerConfig, Error, Record, Result, ResumeCursor, WorkerKey};
use tailgate_stream::{LogBroker, StreamHandle};

pub struct RedisLogBroker {
    client: redis::Client,
    conn: ConnectionManager,
    cfg: BrokerConfig,
}

impl RedisLogBroker {
    pub async fn connect(cfg: BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;
        debug!(url = %cfg.url, "broker connected");
        Ok(Self { client, conn, cfg })
    }

    fn stream_id(&self, key: &WorkerKey) -> String {
        stream_id(&self.cfg.prefix, key)
    }

    fn lock_id(&self, key: &WorkerKey) -> String {
        lock_id(&self.cfg.prefix, key)
    }
}

fn stream_id(prefix: &str, key: &WorkerKey) -> String {
    format!("{prefix}:{key}")
}

fn lock_id(prefix: &str, key: &WorkerKey) -> String {
    format!("{prefix}:lock:{key}")
}

fn broker_err(e: redis::RedisError) -> Error {
    Error::BrokerUnavailable(e.to_string())
}

/// Parse one stream entry payload, dropping anything at or before `after`.
fn decode_payload(text: &str, after: Option<ResumeCursor>) -> Option<Record> {
    let record: Record = serde_json::from_str(text).ok()?;
    after
        .map_or(true, |c| c.precedes(record.ts, record.seq))
        .then_some(record)
}

#[async_trait]
impl LogBroker for RedisLogBroker {
    async fn publish(&self, key: &WorkerKey, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(self.stream_id(key))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.cfg.stream_max_len)
            .arg("*")
            .arg("json")
            .arg(payload)
            .query_async::<String>(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn try_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = self.cfg.lock_ttl().as_millis() as u64;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.lock_id(key))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        if set.is_some() {
            return Ok(true);
        }
        // Reentrant for the holder that already owns it.
        let current: Option<String> = redis::cmd("GET")
            .arg(self.lock_id(key))
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(current.as_deref() == Some(holder))
    }

    async fn renew_lock(&self, key: &WorkerKey, holder: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let current: Option<String> = redis::cmd("GET")
            .arg(self.lock_id(key))
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        if current.as_deref() != Some(holder) {
            return Ok(false);
        }
        let refreshed: i64 = redis::cmd("PEXPIRE")
            .arg(self.lock_id(key))
            .arg(self.cfg.lock_ttl().as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(refreshed == 1)
    }

    async fn release_lock(&self, key: &WorkerKey, holder: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let current: Option<String> = redis::cmd("GET")
            .arg(self.lock_id(key))
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        if current.as_deref() == Some(holder) {
            let _: i64 = redis::cmd("DEL")
                .arg(self.lock_id(key))
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;
        }
        Ok(())
    }

    async fn follow(
        &self,
        key: &WorkerKey,
        after: Option<ResumeCursor>,
    ) -> Result<StreamHandle<Record>> {
        // Blocking reads get their own connection so they never stall the
        // shared one.
        let mut conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(broker_err)?;
        let stream = self.stream_id(key);
        let block = self.cfg.block_millis;
        let (tx, rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            // Replay the whole retained stream; `after` gates what goes out.
            let mut last_id = "0".to_string();
            loop {
                if child.is_cancelled() || tx.is_closed() {
                    return;
                }
                let mut cmd = redis::cmd("XREAD");
                cmd.arg("COUNT")
                    .arg(128)
                    .arg("BLOCK")
                    .arg(block)
                    .arg("STREAMS")
                    .arg(&stream)
                    .arg(&last_id);
                let read = tokio::select! {
                    _ = child.cancelled() => return,
                    r = cmd.query_async::<Option<StreamReadReply>>(&mut conn) => r,
                };
                match read {
                    Ok(Some(reply)) => {
                        for stream_key in reply.keys {
                            for entry in stream_key.ids {
                                last_id = entry.id.clone();
                                let Some(value) = entry.map.get("json") else { continue };
                                let Ok(text) = redis::from_redis_value::<String>(value) else {
                                    continue;
                                };
                                if let Some(record) = decode_payload(&text, after) {
                                    if tx.send(record).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    // Block timeout: nothing appended, poll again.
                    Ok(None) => {}
                    Err(e) => {
                        warn!(stream = %stream, error = %e, "broker read error; retrying");
                        tokio::select! {
                            _ = child.cancelled() => return,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        });
        Ok(StreamHandle { rx, cancel })
    }
}
