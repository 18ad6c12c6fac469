use std::time::Duration;

use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{Client, Script, aio::MultiplexedConnection};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cli::config::QueueSettings;
use crate::queue::{
    BackoffSettings, EnqueueOptions, FailureOutcome, Lane, LaneStats, LaneWeights, Lease,
    MaintenanceReport, QueueError, QueueStats, RetryDecision, TaskBroker, TaskEnvelope,
    TaskHandle, TaskKind, TaskQueue,
};

/// Pop a ready id and record its lease and token. Returns `{id, envelope}` or nil.
const LEASE_SCRIPT: &str = r"
local id = redis.call('RPOP', KEYS[1])
if not id then return false end
redis.call('ZADD', KEYS[2], ARGV[1], id)
redis.call('HSET', KEYS[3], id, ARGV[2])
return {id, redis.call('HGET', KEYS[4], id)}
";

// Settling scripts share KEYS[1] = leases, KEYS[2] = lease tokens,
// ARGV[1] = id, ARGV[2] = token, and only act while that token holds the lease.

/// Drop a lease and its envelope
const ACK_SCRIPT: &str = r"
if (redis.call('HGET', KEYS[2], ARGV[1]) or '') ~= ARGV[2] then return 0 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
";

/// Move a lease into its lane's retry set with the updated envelope
const RETRY_SCRIPT: &str = r"
if (redis.call('HGET', KEYS[2], ARGV[1]) or '') ~= ARGV[2] then return 0 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
";

/// Move a lease to the capped dead-letter list
const BURY_SCRIPT: &str = r"
if (redis.call('HGET', KEYS[2], ARGV[1]) or '') ~= ARGV[2] then return 0 end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('LPUSH', KEYS[4], ARGV[3])
redis.call('LTRIM', KEYS[4], 0, tonumber(ARGV[4]) - 1)
return 1
";

/// Move due retries back to their lane
const PROMOTE_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
";

/// Redis key layout under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    /// Ready ids of a lane (LPUSH in, RPOP out)
    fn lane(&self, lane: Lane) -> String {
        format!("{}:lane:{}", self.prefix, lane)
    }

    /// Ids waiting out their backoff, scored by ready time in ms
    fn retry(&self, lane: Lane) -> String {
        format!("{}:retry:{}", self.prefix, lane)
    }

    /// Envelope JSON by task id
    fn tasks(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    /// Leased ids, scored by lease deadline in ms
    fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    /// Token of the current lease by task id
    fn lease_tokens(&self) -> String {
        format!("{}:lease_tokens", self.prefix)
    }

    /// Dead-lettered envelope JSON, newest first
    fn dead(&self) -> String {
        format!("{}:dead", self.prefix)
    }
}

/// Redis-backed work queue
pub struct RedisQueue {
    /// Multiplexed connection, cloned per operation
    conn: MultiplexedConnection,

    keys: QueueKeys,
    lanes: LaneWeights,
    backoff: BackoffSettings,
    lease_timeout: Duration,
    dead_letter_limit: usize,
    maintenance_batch: usize,

    lease_script: Script,
    ack_script: Script,
    retry_script: Script,
    bury_script: Script,
    promote_script: Script,
}

impl RedisQueue {
    /// Connect to the queue described by `config`
    pub async fn new(config: &QueueSettings, lease_timeout: Duration) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        debug!("Connected to Redis queue with prefix {}", config.key_prefix);

        Ok(Self {
            conn,
            keys: QueueKeys { prefix: config.key_prefix.clone() },
            lanes: config.lanes,
            backoff: config.backoff.clone(),
            lease_timeout,
            dead_letter_limit: config.dead_letter_limit.max(1),
            maintenance_batch: config.maintenance_batch.max(1),
            lease_script: Script::new(LEASE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            bury_script: Script::new(BURY_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
        })
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_timeout).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Record a failed attempt on a leased envelope and settle the lease `token`
    async fn settle_failure(
        &self,
        mut envelope: TaskEnvelope,
        token: &str,
        error: &str,
        retriable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        envelope.record_failure(error);
        let failures = envelope.failures;
        let decision = envelope
            .retry
            .decide(failures, retriable, &self.backoff, &mut rand::thread_rng());

        let id = envelope.id.to_string();
        let json = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();

        match decision {
            RetryDecision::Retry { delay } => {
                let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let settled: i32 = self.retry_script
                    .key(self.keys.leases())
                    .key(self.keys.lease_tokens())
                    .key(self.keys.tasks())
                    .key(self.keys.retry(envelope.lane))
                    .arg(&id)
                    .arg(token)
                    .arg(&json)
                    .arg(retry_at.timestamp_millis())
                    .invoke_async(&mut conn)
                    .await?;

                if settled == 0 {
                    return Ok(FailureOutcome::Stale);
                }
                Ok(FailureOutcome::Retrying { failures, retry_at })
            }
            RetryDecision::Dead => {
                let settled: i32 = self.bury_script
                    .key(self.keys.leases())
                    .key(self.keys.lease_tokens())
                    .key(self.keys.tasks())
                    .key(self.keys.dead())
                    .arg(&id)
                    .arg(token)
                    .arg(&json)
                    .arg(self.dead_letter_limit)
                    .invoke_async(&mut conn)
                    .await?;

                if settled == 0 {
                    return Ok(FailureOutcome::Stale);
                }
                Ok(FailureOutcome::Dead { failures })
            }
        }
    }

    /// Dead-letter a lease whose envelope is missing or unreadable
    async fn bury_corrupt(&self, id: &str, token: &str, raw: Option<&str>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i32 = self.bury_script
            .key(self.keys.leases())
            .key(self.keys.lease_tokens())
            .key(self.keys.tasks())
            .key(self.keys.dead())
            .arg(id)
            .arg(token)
            .arg(raw.unwrap_or(id))
            .arg(self.dead_letter_limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Settle leases whose deadline has passed as failed attempts
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.leases())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(self.maintenance_batch)
            .query_async(&mut conn)
            .await?;

        let mut reclaimed = 0;
        for id in expired {
            let (token, raw): (Option<String>, Option<String>) = redis::pipe()
                .cmd("HGET").arg(self.keys.lease_tokens()).arg(&id)
                .cmd("HGET").arg(self.keys.tasks()).arg(&id)
                .query_async(&mut conn)
                .await?;

            // an entry without a token is settled with the empty token
            let token = token.unwrap_or_default();

            let envelope = match raw.as_deref().map(serde_json::from_str::<TaskEnvelope>) {
                Some(Ok(envelope)) => envelope,
                _ => {
                    warn!("Dead-lettering expired lease {} with unreadable envelope", id);
                    self.bury_corrupt(&id, &token, raw.as_deref()).await?;
                    continue;
                }
            };

            if self.settle_failure(envelope, &token, "lease expired", true).await? != FailureOutcome::Stale {
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, kind: TaskKind, payload: String, options: EnqueueOptions) -> Result<TaskHandle, QueueError> {
        let envelope = TaskEnvelope::new(kind, payload, options);
        let json = serde_json::to_string(&envelope)?;
        let id = envelope.id.to_string();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET").arg(self.keys.tasks()).arg(&id).arg(&json).ignore()
            .cmd("LPUSH").arg(self.keys.lane(envelope.lane)).arg(&id).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!("Enqueued task {} on {} lane", id, envelope.lane);

        Ok(envelope.handle())
    }
}

#[async_trait]
impl TaskBroker for RedisQueue {
    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let order = self.lanes.pick_order(&mut rand::thread_rng());
        let deadline = self.deadline(Utc::now());
        let token = Uuid::new_v4();
        let mut conn = self.conn.clone();

        for lane in order {
            let leased: Option<(String, Option<String>)> = self.lease_script
                .key(self.keys.lane(lane))
                .key(self.keys.leases())
                .key(self.keys.lease_tokens())
                .key(self.keys.tasks())
                .arg(deadline.timestamp_millis())
                .arg(token.to_string())
                .invoke_async(&mut conn)
                .await?;

            let Some((id, raw)) = leased else {
                continue;
            };

            let decoded = match raw.as_deref() {
                Some(raw) => serde_json::from_str::<TaskEnvelope>(raw).map_err(|e| e.to_string()),
                None => Err("envelope missing".to_string()),
            };

            return match decoded {
                Ok(envelope) => Ok(Some(Lease { envelope, deadline, token })),
                Err(reason) => {
                    error!("Dead-lettering task {} from {} lane: {}", id, lane, reason);
                    self.bury_corrupt(&id, &token.to_string(), raw.as_deref()).await?;
                    Err(QueueError::CorruptEnvelope { id, reason })
                }
            };
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let settled: i32 = self.ack_script
            .key(self.keys.leases())
            .key(self.keys.lease_tokens())
            .key(self.keys.tasks())
            .arg(lease.envelope.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(settled == 1)
    }

    async fn fail(&self, lease: &Lease, error: &str, retriable: bool) -> Result<FailureOutcome, QueueError> {
        self.settle_failure(lease.envelope.clone(), &lease.token.to_string(), error, retriable).await
    }

    async fn run_maintenance(&self) -> Result<MaintenanceReport, QueueError> {
        let now = Utc::now();
        let mut report = MaintenanceReport {
            reclaimed: self.reclaim_expired(now).await?,
            ..Default::default()
        };

        let mut conn = self.conn.clone();
        for lane in Lane::ALL {
            let promoted: usize = self.promote_script
                .key(self.keys.retry(lane))
                .key(self.keys.lane(lane))
                .arg(now.timestamp_millis())
                .arg(self.maintenance_batch)
                .invoke_async(&mut conn)
                .await?;
            report.promoted += promoted;
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut pipe = redis::pipe();
        for lane in Lane::ALL {
            pipe.cmd("LLEN").arg(self.keys.lane(lane));
            pipe.cmd("ZCARD").arg(self.keys.retry(lane));
        }
        pipe.cmd("ZCARD").arg(self.keys.leases());
        pipe.cmd("LLEN").arg(self.keys.dead());

        let mut conn = self.conn.clone();
        let counts: Vec<usize> = pipe.query_async(&mut conn).await?;

        let lanes = Lane::ALL
            .into_iter()
            .enumerate()
            .map(|(i, lane)| LaneStats {
                lane,
                ready: counts.get(i * 2).copied().unwrap_or(0),
                retrying: counts.get(i * 2 + 1).copied().unwrap_or(0),
            })
            .collect();

        Ok(QueueStats {
            lanes,
            leased: counts.get(6).copied().unwrap_or(0),
            dead: counts.get(7).copied().unwrap_or(0),
        })
    }
}
