//! Redis Streams-backed task queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream** `jobq:{queue}`: deliverable tasks, one entry per message
//! - **Consumer group** `jobq.workers`: all workers share it, so each entry
//!   goes to exactly one of them
//! - **Delayed set** `jobq:{queue}:delayed`: retries, scored by due time in ms
//! - **Dead-letter stream** `jobq:{queue}:dlq`
//!
//! Entries stay in the group's pending list until acked. Entries idle for
//! longer than the visibility timeout are claimed by the next fetching
//! worker, which is how a crashed worker's task gets redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::{BrokerError, Delivery, TaskBroker, TaskMessage};
use super::in_memory::DEFAULT_VISIBILITY_TIMEOUT;

const KEY_PREFIX: &str = "jobq";
const DEFAULT_GROUP: &str = "jobq.workers";
const PAYLOAD_FIELD: &str = "payload";

/// Upper bound of delayed entries promoted per fetch.
const PROMOTE_BATCH: usize = 100;

/// Atomically moves due members of the delayed set onto the stream.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('XADD', KEYS[2], '*', 'payload', payload)
end
return #due
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsTaskQueue {
    client: Arc<redis::Client>,
    queue_name: String,
    stream_key: String,
    delayed_key: String,
    dlq_key: String,
    group: String,
    visibility_timeout: Duration,
}

impl RedisStreamsTaskQueue {
    /// `redis_url` e.g. "redis://localhost:6379".
    pub fn new(redis_url: impl AsRef<str>, queue_name: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let queue_name = queue_name.into();

        Ok(Self {
            client: Arc::new(client),
            stream_key: format!("{KEY_PREFIX}:{queue_name}"),
            delayed_key: format!("{KEY_PREFIX}:{queue_name}:delayed"),
            dlq_key: format!("{KEY_PREFIX}:{queue_name}:dlq"),
            group: DEFAULT_GROUP.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            queue_name,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Create the stream and consumer group if missing (idempotent).
    pub fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    /// Connectivity check run at startup, before the consumer group is touched.
    pub fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| map_redis_error("PING", e))?;
        Ok(())
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn encode(message: &TaskMessage) -> Result<String, BrokerError> {
        serde_json::to_string(message).map_err(|e| BrokerError::Serialization(e.to_string()))
    }

    fn promote_due(&self, conn: &mut redis::Connection) -> Result<usize, BrokerError> {
        let promoted: usize = redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(&self.delayed_key)
            .key(&self.stream_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke(conn)
            .map_err(|e| map_redis_error("promote delayed", e))?;
        if promoted > 0 {
            debug!(queue = %self.queue_name, promoted, "promoted delayed tasks");
        }
        Ok(promoted)
    }

    /// Claim one entry another consumer left pending for too long.
    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as u64;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .map_err(|e| map_redis_error("XPENDING", e))?;

        let Some((entry_id, owner, idle_ms, deliveries)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&entry_id)
            .query(conn)
            .map_err(|e| map_redis_error("XCLAIM", e))?;

        warn!(
            entry_id = %entry_id,
            previous_owner = %owner,
            idle_ms,
            deliveries,
            "reclaiming unacknowledged task"
        );

        self.first_delivery(conn, bulk_items(claimed))
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(consumer).arg("COUNT").arg(1);
        // BLOCK 0 would block forever.
        let block_ms = wait.as_millis() as u64;
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        let reply: redis::Value = cmd
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        // Reply: [[stream_key, [entry, ...]], ...] or nil on timeout.
        let entries = bulk_items(reply)
            .into_iter()
            .flat_map(|stream| bulk_items(stream).into_iter().nth(1))
            .flat_map(bulk_items)
            .collect();

        self.first_delivery(conn, entries)
    }

    /// Parse entries, dead-lettering any that cannot be decoded.
    fn first_delivery(
        &self,
        conn: &mut redis::Connection,
        entries: Vec<redis::Value>,
    ) -> Result<Option<Delivery>, BrokerError> {
        for entry in entries {
            match parse_stream_entry(entry) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(ParseError { entry_id, raw, reason }) => {
                    warn!(entry_id = ?entry_id, reason = %reason, "dropping undecodable task");
                    if let Some(entry_id) = entry_id {
                        self.park_raw(conn, &entry_id, &raw, &reason)?;
                    }
                }
            }
        }
        Ok(None)
    }

    fn park_raw(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
        payload: &str,
        reason: &str,
    ) -> Result<(), BrokerError> {
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(entry_id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(entry_id)
            .ignore()
            .query::<()>(conn)
            .map_err(|e| map_redis_error("dead-letter", e))
    }
}

impl TaskBroker for RedisStreamsTaskQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    #[instrument(skip(self, message), fields(queue = %self.queue_name, job_id = %message.job_id), err)]
    fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError> {
        let payload = Self::encode(&message)?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XADD", e))?;

        Ok(())
    }

    fn enqueue_after(&self, message: TaskMessage, delay: Duration) -> Result<(), BrokerError> {
        if delay.is_zero() {
            return self.enqueue(message);
        }
        let payload = Self::encode(&message)?;
        let mut conn = self.connection()?;

        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| map_redis_error("ZADD", e))?;

        Ok(())
    }

    fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.connection()?;

        self.promote_due(&mut conn)?;

        if let Some(delivery) = self.claim_stale(&mut conn, consumer)? {
            return Ok(Some(delivery));
        }

        self.read_new(&mut conn, consumer, wait)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        redis::pipe()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&delivery.receipt)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| map_redis_error("XACK", e))
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let payload = Self::encode(&delivery.message)?;
        let mut conn = self.connection()?;
        self.park_raw(&mut conn, &delivery.receipt, &payload, reason)?;

        warn!(
            entry_id = %delivery.receipt,
            job_id = %delivery.message.job_id,
            reason,
            "task sent to dead-letter stream"
        );
        Ok(())
    }
}

struct ParseError {
    entry_id: Option<String>,
    raw: String,
    reason: String,
}

fn bulk_items(value: redis::Value) -> Vec<redis::Value> {
    match value {
        redis::Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

fn data_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Entry format: [entry_id, [field1, value1, field2, value2, ...]]
fn parse_stream_entry(entry: redis::Value) -> Result<Delivery, ParseError> {
    let mut parts = bulk_items(entry).into_iter();
    let entry_id = parts.next().as_ref().and_then(data_string);
    let fail = |reason: &str, raw: String| ParseError {
        entry_id: entry_id.clone(),
        raw,
        reason: reason.to_string(),
    };

    let Some(receipt) = entry_id.clone() else {
        return Err(fail("missing entry id", String::new()));
    };

    let fields_vec = parts.next().map(bulk_items).unwrap_or_default();
    let mut fields = HashMap::new();
    for chunk in fields_vec.chunks(2) {
        if let [key, value] = chunk {
            if let (Some(key), Some(value)) = (data_string(key), data_string(value)) {
                fields.insert(key, value);
            }
        }
    }

    let Some(raw) = fields.remove(PAYLOAD_FIELD) else {
        return Err(fail("missing payload field", String::new()));
    };

    match serde_json::from_str::<TaskMessage>(&raw) {
        Ok(message) => Ok(Delivery { receipt, message }),
        Err(e) => Err(fail(&format!("invalid task payload: {e}"), raw)),
    }
}

fn map_redis_error(command: &str, err: redis::RedisError) -> BrokerError {
    if err.is_connection_refusal() || err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        BrokerError::Connection(format!("{command} failed: {err}"))
    } else {
        BrokerError::Command(format!("{command} failed: {err}"))
    }
}
