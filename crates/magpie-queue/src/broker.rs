use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use magpie_types::JobRecord;

/// Low-level queue storage. The queue and worker logic are written against
/// this trait; production uses Redis, tests use the in-memory variant.
///
/// Ready and delayed sets order members by score ascending; the ready score
/// folds priority (major) and enqueue time (minor) so equal priorities pop
/// FIFO.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn put_record(&self, queue: &str, record: &JobRecord) -> anyhow::Result<()>;
    async fn get_record(&self, queue: &str, id: &str) -> anyhow::Result<Option<JobRecord>>;
    async fn delete_job(&self, queue: &str, id: &str) -> anyhow::Result<()>;

    async fn push_ready(&self, queue: &str, id: &str, score: f64) -> anyhow::Result<()>;
    async fn pop_ready(&self, queue: &str) -> anyhow::Result<Option<String>>;
    async fn remove_ready(&self, queue: &str, id: &str) -> anyhow::Result<bool>;

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: u64) -> anyhow::Result<()>;
    async fn remove_delayed(&self, queue: &str, id: &str) -> anyhow::Result<bool>;
    async fn take_due_delayed(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>>;

    async fn set_lease(&self, queue: &str, id: &str, expires_at_ms: u64) -> anyhow::Result<()>;
    async fn clear_lease(&self, queue: &str, id: &str) -> anyhow::Result<()>;
    async fn take_expired_leases(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>>;

    async fn set_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()>;
    async fn cancel_requested(&self, queue: &str, id: &str) -> anyhow::Result<bool>;
    async fn clear_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()>;
}

pub fn ready_score(priority: i64, enqueued_ms: u64) -> f64 {
    // Priority dominates; within a priority band jobs pop in enqueue order.
    priority as f64 * 1e13 + enqueued_ms as f64
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

const NS: &str = "magpie";
const CANCEL_FLAG_TTL_SECS: u64 = 24 * 60 * 60;

/// Redis-backed broker. At-least-once delivery: a claim is a lease entry in
/// a sorted set scored by expiry, and expired leases are swept back into
/// the ready set.
#[derive(Clone)]
pub struct RedisBroker {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }

    fn record_key(queue: &str, id: &str) -> String {
        format!("{NS}:{queue}:job:{id}")
    }

    fn ready_key(queue: &str) -> String {
        format!("{NS}:{queue}:ready")
    }

    fn delayed_key(queue: &str) -> String {
        format!("{NS}:{queue}:delayed")
    }

    fn lease_key(queue: &str) -> String {
        format!("{NS}:{queue}:leases")
    }

    fn cancel_key(queue: &str, id: &str) -> String {
        format!("{NS}:{queue}:cancel:{id}")
    }

    async fn take_due(&self, key: &str, now_ms: u64) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn.zrangebyscore(key, "-inf", now_ms as f64).await?;
        for id in &due {
            let _: i64 = conn.zrem(key, id).await?;
        }
        Ok(due)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn put_record(&self, queue: &str, record: &JobRecord) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let _: () = conn.set(Self::record_key(queue, &record.id), payload).await?;
        Ok(())
    }

    async fn get_record(&self, queue: &str, id: &str) -> anyhow::Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::record_key(queue, id)).await?;
        Ok(raw
            .map(|raw| serde_json::from_str::<JobRecord>(&raw))
            .transpose()?)
    }

    async fn delete_job(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::record_key(queue, id)).await?;
        let _: i64 = conn.zrem(Self::ready_key(queue), id).await?;
        let _: i64 = conn.zrem(Self::delayed_key(queue), id).await?;
        let _: i64 = conn.zrem(Self::lease_key(queue), id).await?;
        let _: () = conn.del(Self::cancel_key(queue, id)).await?;
        Ok(())
    }

    async fn push_ready(&self, queue: &str, id: &str, score: f64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(Self::ready_key(queue), id, score).await?;
        Ok(())
    }

    async fn pop_ready(&self, queue: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(Self::ready_key(queue), 1).await?;
        Ok(popped.into_iter().next().map(|(id, _)| id))
    }

    async fn remove_ready(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(Self::ready_key(queue), id).await?;
        Ok(removed > 0)
    }

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(Self::delayed_key(queue), id, ready_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn remove_delayed(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(Self::delayed_key(queue), id).await?;
        Ok(removed > 0)
    }

    async fn take_due_delayed(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>> {
        self.take_due(&Self::delayed_key(queue), now_ms).await
    }

    async fn set_lease(&self, queue: &str, id: &str, expires_at_ms: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(Self::lease_key(queue), id, expires_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn clear_lease(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(Self::lease_key(queue), id).await?;
        Ok(())
    }

    async fn take_expired_leases(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>> {
        self.take_due(&Self::lease_key(queue), now_ms).await
    }

    async fn set_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::cancel_key(queue, id), 1i64, CANCEL_FLAG_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn cancel_requested(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::cancel_key(queue, id)).await?;
        Ok(exists)
    }

    async fn clear_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::cancel_key(queue, id)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryQueueState {
    records: HashMap<String, JobRecord>,
    // (total-order bits of the score, id)
    ready: BTreeSet<(u64, String)>,
    delayed: HashMap<String, u64>,
    leases: HashMap<String, u64>,
    cancels: HashSet<String>,
}

/// IEEE-754 total-order mapping so f64 scores sort correctly as integers.
fn order_bits(score: f64) -> u64 {
    let bits = score.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// In-memory broker with the same semantics as the Redis one. Used by tests
/// and by deployments without a broker configured (single-process mode).
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, MemoryQueueState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn put_record(&self, queue: &str, record: &JobRecord) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, queue: &str, id: &str) -> anyhow::Result<Option<JobRecord>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .and_then(|state| state.records.get(id))
            .cloned())
    }

    async fn delete_job(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.records.remove(id);
            state.ready.retain(|(_, member)| member != id);
            state.delayed.remove(id);
            state.leases.remove(id);
            state.cancels.remove(id);
        }
        Ok(())
    }

    async fn push_ready(&self, queue: &str, id: &str, score: f64) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.retain(|(_, member)| member != id);
        state.ready.insert((order_bits(score), id.to_string()));
        Ok(())
    }

    async fn pop_ready(&self, queue: &str) -> anyhow::Result<Option<String>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let first = state.ready.iter().next().cloned();
        if let Some(entry) = first {
            state.ready.remove(&entry);
            return Ok(Some(entry.1));
        }
        Ok(None)
    }

    async fn remove_ready(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let before = state.ready.len();
        state.ready.retain(|(_, member)| member != id);
        Ok(state.ready.len() < before)
    }

    async fn push_delayed(&self, queue: &str, id: &str, ready_at_ms: u64) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .delayed
            .insert(id.to_string(), ready_at_ms);
        Ok(())
    }

    async fn remove_delayed(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .map(|state| state.delayed.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn take_due_delayed(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let due: Vec<String> = state
            .delayed
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            state.delayed.remove(id);
        }
        Ok(due)
    }

    async fn set_lease(&self, queue: &str, id: &str, expires_at_ms: u64) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .leases
            .insert(id.to_string(), expires_at_ms);
        Ok(())
    }

    async fn clear_lease(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.leases.remove(id);
        }
        Ok(())
    }

    async fn take_expired_leases(&self, queue: &str, now_ms: u64) -> anyhow::Result<Vec<String>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, expires)| **expires <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.leases.remove(id);
        }
        Ok(expired)
    }

    async fn set_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .cancels
            .insert(id.to_string());
        Ok(())
    }

    async fn cancel_requested(&self, queue: &str, id: &str) -> anyhow::Result<bool> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| state.cancels.contains(id))
            .unwrap_or(false))
    }

    async fn clear_cancel_flag(&self, queue: &str, id: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.cancels.remove(id);
        }
        Ok(())
    }
}
