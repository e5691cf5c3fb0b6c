//! Redis Streams transport.
//!
//! Each topic is a stream, each subscription a consumer group. Properties
//! travel as `p:`-prefixed stream fields. Delayed messages wait in a sorted
//! set until a scheduler moves them onto their stream. Deliveries that stay
//! pending past `claim_idle` (a consumer died mid-handler) are reclaimed
//! with `XAUTOCLAIM`. Entries carrying an ordering key are handed to the
//! listener one at a time per key, in the order this consumer read them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimReply, StreamClaimReply, StreamId, StreamPendingCountReply,
    StreamReadReply,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broker::lanes::OrderingLanes;
use crate::broker::{
    Broker, Consumer, MessageId, MessageListener, OutboundMessage, RawMessage,
    SubscriptionConfig,
};
use crate::error::{MessagingError, Result};
use crate::messaging::properties::{PropertyMap, RawProperties};

const PROPERTY_PREFIX: &str = "p:";
const PAYLOAD_FIELD: &str = "payload";
const PUBLISH_TS_FIELD: &str = "publish_ts";
const EVENT_TS_FIELD: &str = "event_ts";
const ORDERING_KEY_FIELD: &str = "ordering_key";
const START_CURSOR: &str = "0-0";

#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub url: String,
    /// Prefix for every key this broker touches.
    pub key_prefix: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Pending entries idle this long are reclaimed from their consumer.
    pub claim_idle: Duration,
    pub redelivery_delay: Duration,
    pub schedule_poll_interval: Duration,
    /// Approximate stream length cap applied on every append.
    pub max_len: Option<usize>,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            key_prefix: "stepwire".to_owned(),
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            claim_idle: Duration::from_secs(60),
            redelivery_delay: Duration::from_secs(1),
            schedule_poll_interval: Duration::from_millis(500),
            max_len: Some(100_000),
        }
    }
}

impl RedisStreamConfig {
    fn stream_key(&self, topic: &str) -> String {
        format!("{}:stream:{topic}", self.key_prefix)
    }

    fn schedule_key(&self) -> String {
        format!("{}:scheduled", self.key_prefix)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ScheduledMessage {
    token: String,
    topic: String,
    payload: Vec<u8>,
    properties: PropertyMap,
    event_time_ms: i64,
    ordering_key: Option<String>,
}

fn redis_err(op: &str) -> impl FnOnce(redis::RedisError) -> MessagingError + '_ {
    move |err| MessagingError::Broker(format!("Redis {op} failed: {err}"))
}

#[derive(Clone)]
pub struct RedisStreamBroker {
    conn: ConnectionManager,
    config: Arc<RedisStreamConfig>,
    shutdown: CancellationToken,
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("connection", &"ConnectionManager")
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisStreamBroker {
    pub async fn connect(config: RedisStreamConfig) -> Result<Self> {
        info!("Connecting to Redis broker at {}", config.url);
        let client = redis::Client::open(config.url.as_str())
            .map_err(redis_err("client creation"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(redis_err("connection"))?;

        let broker = Self {
            conn,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            scheduler: Arc::new(Mutex::new(None)),
        };
        let scheduler = tokio::spawn(run_scheduler(
            broker.conn.clone(),
            Arc::clone(&broker.config),
            broker.shutdown.child_token(),
        ));
        *broker.scheduler.lock() = Some(scheduler);
        info!("Successfully connected to Redis broker");
        Ok(broker)
    }

    /// Stops the delayed-delivery scheduler and every consumer poll loop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.await;
        }
    }
}

async fn append(
    conn: &mut ConnectionManager,
    config: &RedisStreamConfig,
    topic: &str,
    payload: &[u8],
    properties: &PropertyMap,
    event_time_ms: i64,
    ordering_key: Option<&str>,
) -> Result<MessageId> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(config.stream_key(topic));
    if let Some(max_len) = config.max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .arg(PUBLISH_TS_FIELD)
        .arg(Utc::now().timestamp_millis())
        .arg(EVENT_TS_FIELD)
        .arg(event_time_ms);
    if let Some(key) = ordering_key {
        cmd.arg(ORDERING_KEY_FIELD).arg(key);
    }
    for (name, value) in properties {
        cmd.arg(format!("{PROPERTY_PREFIX}{name}")).arg(value);
    }
    cmd.query_async::<String>(conn).await.map_err(redis_err("XADD"))
}

async fn run_scheduler(
    mut conn: ConnectionManager,
    config: Arc<RedisStreamConfig>,
    shutdown: CancellationToken,
) {
    let key = config.schedule_key();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(config.schedule_poll_interval) => {}
        }

        let due: Vec<String> = match redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(Utc::now().timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(config.batch_size)
            .query_async(&mut conn)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "delayed message scan failed");
                continue;
            }
        };

        for member in due {
            // Whoever removes the member owns the append.
            let removed: i64 = match redis::cmd("ZREM")
                .arg(&key)
                .arg(&member)
                .query_async(&mut conn)
                .await
            {
                Ok(removed) => removed,
                Err(err) => {
                    error!(error = %err, "failed to claim delayed message");
                    continue;
                }
            };
            if removed == 0 {
                continue;
            }
            let scheduled: ScheduledMessage = match serde_json::from_str(&member) {
                Ok(scheduled) => scheduled,
                Err(err) => {
                    warn!(error = %err, "discarding unreadable delayed message");
                    continue;
                }
            };
            match append(
                &mut conn,
                &config,
                &scheduled.topic,
                &scheduled.payload,
                &scheduled.properties,
                scheduled.event_time_ms,
                scheduled.ordering_key.as_deref(),
            )
            .await
            {
                Ok(message_id) => trace!(
                    token = %scheduled.token,
                    %message_id,
                    topic = %scheduled.topic,
                    "released delayed message"
                ),
                Err(err) => error!(
                    token = %scheduled.token,
                    topic = %scheduled.topic,
                    error = %err,
                    "failed to release delayed message"
                ),
            }
        }
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId> {
        let mut conn = self.conn.clone();
        let event_time_ms = message
            .options
            .event_time
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(0);

        if let Some(deliver_at) = message.options.deliver_at.filter(|at| *at > Utc::now()) {
            let scheduled = ScheduledMessage {
                token: Uuid::now_v7().to_string(),
                topic: topic.to_owned(),
                payload: message.payload,
                properties: message.properties,
                event_time_ms,
                ordering_key: message.options.ordering_key,
            };
            let member = serde_json::to_string(&scheduled)?;
            redis::cmd("ZADD")
                .arg(self.config.schedule_key())
                .arg(deliver_at.timestamp_millis())
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
                .map_err(redis_err("ZADD"))?;
            debug!(topic, token = %scheduled.token, %deliver_at, "scheduled delayed message");
            return Ok(format!("scheduled:{}", scheduled.token));
        }

        append(
            &mut conn,
            &self.config,
            topic,
            &message.payload,
            &message.properties,
            event_time_ms,
            message.options.ordering_key.as_deref(),
        )
        .await
    }

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>> {
        let mut conn = self.conn.clone();
        let stream = self.config.stream_key(&config.topic);
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&config.subscription)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(err) = created {
            if err.code() != Some("BUSYGROUP") {
                return Err(redis_err("XGROUP CREATE")(err));
            }
        }

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(RedisStreamConsumer {
            conn,
            topic: config.topic.clone(),
            stream,
            group: config.subscription.clone(),
            name: config
                .consumer_name
                .clone()
                .unwrap_or_else(|| format!("consumer-{}", Uuid::now_v7())),
            settings: Arc::clone(&self.config),
            cancel: self.shutdown.child_token(),
            connected: AtomicBool::new(true),
            retry_tx,
            poller: Mutex::new(None),
        });
        let poller = tokio::spawn(poll(
            Arc::clone(&consumer),
            retry_rx,
            listener,
            config.max_in_flight.max(1),
        ));
        *consumer.poller.lock() = Some(poller);
        info!(
            topic = %config.topic,
            subscription = %config.subscription,
            consumer = %consumer.name,
            "redis stream consumer attached"
        );
        Ok(consumer)
    }
}

struct RedisStreamConsumer {
    conn: ConnectionManager,
    topic: String,
    stream: String,
    group: String,
    name: String,
    settings: Arc<RedisStreamConfig>,
    cancel: CancellationToken,
    connected: AtomicBool,
    retry_tx: mpsc::UnboundedSender<String>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RedisStreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamConsumer")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("name", &self.name)
            .finish()
    }
}

impl RedisStreamConsumer {
    fn to_raw(&self, entry: &StreamId, redelivery_count: u32) -> RawMessage {
        let properties = entry
            .map
            .keys()
            .filter_map(|field| {
                let name = field.strip_prefix(PROPERTY_PREFIX)?;
                Some((name.to_owned(), entry.get::<String>(field)?))
            })
            .collect();
        RawMessage {
            message_id: entry.id.clone(),
            topic: self.topic.clone(),
            payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
            properties: RawProperties::Pairs(properties),
            publish_time_ms: entry.get::<i64>(PUBLISH_TS_FIELD).unwrap_or(0),
            event_time_ms: entry.get::<i64>(EVENT_TS_FIELD).unwrap_or(0),
            redelivery_count,
        }
    }

    async fn read_new(&self) -> Result<Vec<StreamId>> {
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.name)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(redis_err("XREADGROUP"))?;
        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    /// One `XAUTOCLAIM` step starting at `cursor`. Returns the cursor for
    /// the next step (`0-0` once the pending list was walked) and the
    /// entries now owned by this consumer.
    async fn reclaim_idle(&self, cursor: &str) -> Result<(String, Vec<StreamId>)> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.name)
            .arg(self.settings.claim_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .query_async(&mut conn)
            .await
            .map_err(redis_err("XAUTOCLAIM"))?;
        Ok((reply.next_stream_id, reply.claimed))
    }

    async fn claim(&self, id: &str) -> Result<Option<StreamId>> {
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.name)
            .arg(0)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err("XCLAIM"))?;
        Ok(reply.ids.into_iter().next())
    }

    async fn delivery_count(&self, id: &str) -> u32 {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<StreamPendingCountReply> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(reply) => reply
                .ids
                .first()
                .map(|pending| pending.times_delivered.saturating_sub(1) as u32)
                .unwrap_or(0),
            Err(err) => {
                warn!(message_id = id, error = %err, "failed to read delivery count");
                0
            }
        }
    }
}

fn ordering_key(entry: &StreamId) -> Option<String> {
    entry.get(ORDERING_KEY_FIELD)
}

/// Walks the pending entries list in `XAUTOCLAIM` steps, independent of how
/// busy the stream is.
#[derive(Debug)]
struct IdleReclaim {
    cursor: String,
    every: Duration,
    last: Instant,
}

impl IdleReclaim {
    fn new(settings: &RedisStreamConfig) -> Self {
        Self {
            cursor: START_CURSOR.to_owned(),
            every: (settings.claim_idle / 2).max(settings.poll_interval),
            last: Instant::now(),
        }
    }

    fn due(&self) -> bool {
        self.last.elapsed() >= self.every
    }

    /// A partial walk resumes right away; a finished one waits a full period.
    fn advance(&mut self, next: String) {
        if next == START_CURSOR {
            self.last = Instant::now();
        }
        self.cursor = next;
    }
}

async fn poll(
    consumer: Arc<RedisStreamConsumer>,
    mut retries: mpsc::UnboundedReceiver<String>,
    listener: Arc<dyn MessageListener>,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<String>();
    let mut lanes: OrderingLanes<(StreamId, u32)> = OrderingLanes::default();
    let mut reclaim = IdleReclaim::new(&consumer.settings);

    loop {
        if consumer.cancel.is_cancelled() {
            break;
        }

        let mut ready: Vec<(StreamId, u32)> = Vec::new();
        while let Ok(key) = settled_rx.try_recv() {
            ready.extend(lanes.release(&key));
        }

        let mut fetched: Vec<(StreamId, u32)> = Vec::new();
        while let Ok(id) = retries.try_recv() {
            match consumer.claim(&id).await {
                Ok(Some(entry)) => {
                    let count = consumer.delivery_count(&entry.id).await;
                    fetched.push((entry, count));
                }
                Ok(None) => trace!(message_id = %id, "retry target no longer pending"),
                Err(err) => {
                    warn!(message_id = %id, error = %err, "failed to reclaim nacked message");
                }
            }
        }

        match consumer.read_new().await {
            Ok(entries) => fetched.extend(entries.into_iter().map(|entry| (entry, 0))),
            Err(err) => {
                error!(stream = %consumer.stream, error = %err, "stream polling failed");
            }
        }

        if reclaim.due() {
            match consumer.reclaim_idle(&reclaim.cursor).await {
                Ok((next, entries)) => {
                    reclaim.advance(next);
                    for entry in entries {
                        let count = consumer.delivery_count(&entry.id).await;
                        fetched.push((entry, count));
                    }
                }
                Err(err) => {
                    warn!(stream = %consumer.stream, error = %err, "idle reclaim failed");
                }
            }
        }

        for (entry, count) in fetched {
            let key = ordering_key(&entry);
            ready.extend(lanes.admit(key.as_deref(), (entry, count)));
        }

        if ready.is_empty() {
            tokio::select! {
                _ = consumer.cancel.cancelled() => break,
                Some(key) = settled_rx.recv() => ready.extend(lanes.release(&key)),
                _ = sleep(consumer.settings.poll_interval) => {}
            }
            if ready.is_empty() {
                continue;
            }
        }

        debug!(count = ready.len(), stream = %consumer.stream, "delivering stream entries");
        for (entry, redelivery_count) in ready {
            let permit = tokio::select! {
                _ = consumer.cancel.cancelled() => return,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let key = ordering_key(&entry);
            let raw = consumer.to_raw(&entry, redelivery_count);
            let listener = Arc::clone(&listener);
            let handle: Arc<dyn Consumer> = consumer.clone();
            let settled = settled_tx.clone();
            tokio::spawn(async move {
                listener.on_message(raw, handle).await;
                drop(permit);
                if let Some(key) = key {
                    let _ = settled.send(key);
                }
            });
        }
    }
    // Held entries stay pending and are reclaimed once idle.
    let held = lanes.drain().len();
    trace!(
        stream = %consumer.stream,
        group = %consumer.group,
        held,
        "poll loop stopped"
    );
}

#[async_trait]
impl Consumer for RedisStreamConsumer {
    async fn acknowledge(&self, message: &RawMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&message.message_id)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(redis_err("XACK"))?;
        Ok(())
    }

    /// The entry stays pending; after the redelivery delay it is claimed
    /// again and handed back to the listener.
    async fn negative_acknowledge(&self, message: &RawMessage) -> Result<()> {
        let retry_tx = self.retry_tx.clone();
        let id = message.message_id.clone();
        let delay = self.settings.redelivery_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = retry_tx.send(id);
        });
        Ok(())
    }

    async fn pause(&self) {
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.pause().await;
        self.connected.store(false, Ordering::Release);
        debug!(stream = %self.stream, group = %self.group, "redis stream consumer closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let config = RedisStreamConfig {
            key_prefix: "acme".into(),
            ..RedisStreamConfig::default()
        };
        assert_eq!(config.stream_key("tasks"), "acme:stream:tasks");
        assert_eq!(config.schedule_key(), "acme:scheduled");
    }

    #[test]
    fn scheduled_messages_survive_the_sorted_set() {
        let scheduled = ScheduledMessage {
            token: "t1".into(),
            topic: "tasks".into(),
            payload: br#"{"id":"1"}"#.to_vec(),
            properties: PropertyMap::from([("x-workflow-id".into(), "wf".into())]),
            event_time_ms: 0,
            ordering_key: None,
        };
        let member = serde_json::to_string(&scheduled).unwrap();
        let back: ScheduledMessage = serde_json::from_str(&member).unwrap();
        assert_eq!(back.payload, scheduled.payload);
        assert_eq!(back.properties, scheduled.properties);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reclaim_resumes_partial_walks_and_rests_after_full_ones() {
        let settings = RedisStreamConfig {
            claim_idle: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            ..RedisStreamConfig::default()
        };
        let mut reclaim = IdleReclaim::new(&settings);
        assert!(!reclaim.due());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reclaim.due());
        assert_eq!(reclaim.cursor, "0-0");

        reclaim.advance("1700000000000-5".into());
        assert_eq!(reclaim.cursor, "1700000000000-5");
        assert!(reclaim.due());

        reclaim.advance("0-0".into());
        assert!(!reclaim.due());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reclaim.due());
    }
}
