//! Deduplicating, rate-limited, retrying alert delivery.
//!
//! Each channel has its own state behind its own lock, so a slow or failing
//! channel never holds up the others. The lock is never held across a
//! `send`, a journal write or a backoff sleep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AlertChannel, AlertDispatch, AlertEntity, DispatchStatus, EntityRef, Envelope, SendError};
use crate::config::AlertConfig;
use crate::detect::Severity;
use crate::storage::{self, Pool};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const DRAIN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub dedupe_window: chrono::Duration,
    pub max_alerts_per_minute: u32,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&AlertConfig::default())
    }
}

impl From<&AlertConfig> for RouterSettings {
    fn from(c: &AlertConfig) -> Self {
        Self {
            dedupe_window: c.dedupe_window(),
            max_alerts_per_minute: c.max_alerts_per_minute,
            max_attempts: c.max_attempts,
            retry_base: c.retry_base(),
            retry_max: c.retry_max(),
        }
    }
}

/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

struct Queued {
    entity_id: Uuid,
    envelope: Envelope,
    detected_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct ChannelState {
    /// Latest dispatch per entity on this channel.
    records: HashMap<Uuid, AlertDispatch>,
    /// Start times of sends in the trailing rate window.
    sent: VecDeque<Instant>,
    /// Work waiting for rate budget, oldest detection first.
    queue: VecDeque<Queued>,
}

impl ChannelState {
    fn expire_window(&mut self, now: Instant) {
        while let Some(front) = self.sent.front() {
            if now.duration_since(*front) < RATE_WINDOW {
                break;
            }
            self.sent.pop_front();
        }
    }

    fn try_acquire(&mut self, limit: u32, now: Instant) -> bool {
        self.expire_window(now);
        if self.sent.len() < limit as usize {
            self.sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// When the next rate slot frees up.
    fn next_slot_at(&self) -> Option<Instant> {
        self.sent.front().map(|t| *t + RATE_WINDOW)
    }

    fn enqueue(&mut self, item: Queued) {
        let idx = self.queue.partition_point(|q| q.detected_at <= item.detected_at);
        self.queue.insert(idx, item);
    }

    /// Forget successful sends whose dedupe window has passed.
    fn prune(&mut self, dedupe_window: chrono::Duration) {
        let now = Utc::now();
        self.records.retain(|_, r| {
            r.status != DispatchStatus::Sent
                || r.last_attempt_at.map_or(true, |at| now - at <= dedupe_window)
        });
    }
}

struct ChannelSlot {
    channel: Arc<dyn AlertChannel>,
    min_severity: Severity,
    state: Mutex<ChannelState>,
}

pub struct AlertRouter {
    settings: RouterSettings,
    channels: HashMap<String, Arc<ChannelSlot>>,
    pool: Option<Pool>,
}

impl AlertRouter {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings,
            channels: HashMap::new(),
            pool: None,
        }
    }

    /// Journal every dispatch state change to SQLite.
    pub fn with_journal(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn add_channel(&mut self, channel: Arc<dyn AlertChannel>, min_severity: Severity) {
        let name = channel.name().to_string();
        let slot = ChannelSlot {
            channel,
            min_severity,
            state: Mutex::new(ChannelState::default()),
        };
        if self.channels.insert(name.clone(), Arc::new(slot)).is_some() {
            warn!(channel = %name, "Replaced existing channel");
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch to every channel whose severity floor the entity meets.
    pub async fn route(&self, entity: &AlertEntity) -> Vec<AlertDispatch> {
        let severity = entity.severity();
        let targets: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, slot)| severity >= slot.min_severity)
            .map(|(name, _)| name.clone())
            .collect();
        if targets.is_empty() {
            debug!(entity = %entity.entity_ref(), %severity, "No channel accepts this severity");
            return Vec::new();
        }
        self.dispatch(entity, &targets).await
    }

    /// Deliver `entity` to each named channel.
    ///
    /// Returns one record per known channel: the prior record when the pair
    /// was already handled, a `Pending` record when the channel is rate
    /// limited, else the outcome of delivery.
    pub async fn dispatch(&self, entity: &AlertEntity, channels: &[String]) -> Vec<AlertDispatch> {
        let entity_ref = entity.entity_ref();
        let envelope = entity.envelope();
        let detected_at = entity.detected_at();

        let jobs = channels.iter().filter_map(|name| match self.channels.get(name) {
            Some(slot) => Some(self.dispatch_one(slot, entity_ref, envelope.clone(), detected_at)),
            None => {
                warn!(channel = %name, entity = %entity_ref, "Unknown channel, skipping");
                None
            }
        });
        join_all(jobs).await
    }

    async fn dispatch_one(
        &self,
        slot: &ChannelSlot,
        entity: EntityRef,
        envelope: Envelope,
        detected_at: chrono::DateTime<Utc>,
    ) -> AlertDispatch {
        let channel = slot.channel.name().to_string();
        let mut st = slot.state.lock().await;
        st.prune(self.settings.dedupe_window);

        if let Some(prev) = st.records.get(&entity.id()) {
            // Anything still in the map is live: pending, terminally failed,
            // or sent inside the dedupe window.
            debug!(%channel, %entity, status = %prev.status, "Duplicate dispatch suppressed");
            return prev.clone();
        }

        let record = AlertDispatch::new(entity, &channel);
        st.records.insert(entity.id(), record.clone());

        let item = Queued {
            entity_id: entity.id(),
            envelope,
            detected_at,
        };
        if st.queue.is_empty() && st.try_acquire(self.settings.max_alerts_per_minute, Instant::now()) {
            drop(st);
            self.journal(&record, &item.envelope, detected_at).await;
            self.deliver(slot, item).await
        } else {
            let envelope = item.envelope.clone();
            st.enqueue(item);
            info!(%channel, %entity, queued = st.queue.len(), "Channel rate limited, alert queued");
            drop(st);
            self.journal(&record, &envelope, detected_at).await;
            record
        }
    }

    /// Send with retries. The caller has already taken a rate slot for the
    /// first attempt.
    async fn deliver(&self, slot: &ChannelSlot, item: Queued) -> AlertDispatch {
        let channel = slot.channel.name().to_string();
        loop {
            let before = {
                let mut st = slot.state.lock().await;
                let Some(rec) = st.records.get_mut(&item.entity_id) else {
                    // Unreachable while records are only pruned once sent.
                    error!(%channel, entity_id = %item.entity_id, "Dispatch record vanished");
                    return AlertDispatch::new(EntityRef::Anomaly(item.entity_id), &channel);
                };
                rec.attempt_count += 1;
                rec.last_attempt_at = Some(Utc::now());
                rec.clone()
            };
            let attempt = before.attempt_count;
            self.journal(&before, &item.envelope, item.detected_at).await;

            let outcome = slot.channel.send(&item.envelope).await;

            let (after, retry) = {
                let mut st = slot.state.lock().await;
                let Some(rec) = st.records.get_mut(&item.entity_id) else {
                    error!(%channel, entity_id = %item.entity_id, "Dispatch record vanished");
                    return AlertDispatch::new(EntityRef::Anomaly(item.entity_id), &channel);
                };
                let retry = match outcome {
                    Ok(()) => {
                        rec.status = DispatchStatus::Sent;
                        rec.last_error = None;
                        info!(%channel, entity = %rec.entity, attempt, "Alert sent");
                        false
                    }
                    Err(SendError::Permanent(msg)) => {
                        rec.status = DispatchStatus::Failed;
                        rec.last_error = Some(msg);
                        error!(%channel, entity = %rec.entity, attempt, error = ?rec.last_error, "Alert rejected, moved to dead-letter");
                        false
                    }
                    Err(SendError::Transient(msg)) => {
                        rec.last_error = Some(msg);
                        if attempt >= self.settings.max_attempts {
                            rec.status = DispatchStatus::Failed;
                            error!(%channel, entity = %rec.entity, attempt, error = ?rec.last_error, "Retries exhausted, moved to dead-letter");
                            false
                        } else {
                            warn!(%channel, entity = %rec.entity, attempt, error = ?rec.last_error, "Transient send failure, will retry");
                            true
                        }
                    }
                };
                (rec.clone(), retry)
            };
            self.journal(&after, &item.envelope, item.detected_at).await;
            if !retry {
                return after;
            }

            tokio::time::sleep(backoff_delay(attempt, self.settings.retry_base, self.settings.retry_max)).await;
            self.acquire_slot(slot).await;
        }
    }

    async fn acquire_slot(&self, slot: &ChannelSlot) {
        loop {
            let wait_until = {
                let mut st = slot.state.lock().await;
                let now = Instant::now();
                if st.try_acquire(self.settings.max_alerts_per_minute, now) {
                    return;
                }
                st.next_slot_at().unwrap_or(now + Duration::from_millis(100))
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// One pass over every channel's queue, sending as far as rate budget
    /// allows. Returns how many were taken off the queues.
    pub async fn drain(&self) -> usize {
        let jobs = self.channels.values().map(|slot| self.drain_channel(slot));
        join_all(jobs).await.into_iter().sum()
    }

    async fn drain_channel(&self, slot: &ChannelSlot) -> usize {
        let mut drained = 0;
        loop {
            let item = {
                let mut st = slot.state.lock().await;
                if st.queue.is_empty() {
                    break;
                }
                if !st.try_acquire(self.settings.max_alerts_per_minute, Instant::now()) {
                    break;
                }
                st.queue.pop_front()
            };
            let Some(item) = item else { break };
            drained += 1;
            self.deliver(slot, item).await;
        }
        drained
    }

    /// Drain one channel every `tick` until cancelled. Each channel gets its
    /// own loop so retries on one never hold up another.
    async fn drain_channel_loop(&self, name: &str, tick: Duration, cancel: CancellationToken) {
        let Some(slot) = self.channels.get(name) else { return };
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                drained = async {
                    interval.tick().await;
                    self.drain_channel(slot).await
                } => {
                    if drained > 0 {
                        debug!(channel = %name, drained, "Drained queued alerts");
                    }
                }
            }
        }
    }

    /// Number of alerts waiting for rate budget, per channel.
    pub async fn queue_depths(&self) -> HashMap<String, usize> {
        let mut out = HashMap::new();
        for (name, slot) in &self.channels {
            out.insert(name.clone(), slot.state.lock().await.queue.len());
        }
        out
    }

    /// Permanently failed dispatches still held in memory.
    pub async fn dead_letter(&self) -> Vec<AlertDispatch> {
        let mut out = Vec::new();
        for slot in self.channels.values() {
            let st = slot.state.lock().await;
            out.extend(
                st.records
                    .values()
                    .filter(|r| r.status == DispatchStatus::Failed)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Reload journaled dispatches after a restart.
    ///
    /// Failed and recently sent records are restored for deduplication;
    /// pending ones are re-queued unless they already used every attempt,
    /// in which case they are failed now.
    pub async fn restore(&self) -> Result<usize> {
        let Some(pool) = self.pool.clone() else {
            return Ok(0);
        };
        let since = Utc::now() - self.settings.dedupe_window;
        let rows = tokio::task::spawn_blocking(move || storage::dispatches::load_for_resume(&pool, since)).await??;

        let mut restored = 0;
        let mut exhausted = Vec::new();
        for row in rows {
            let Some(slot) = self.channels.get(&row.dispatch.channel) else {
                debug!(channel = %row.dispatch.channel, "Journaled dispatch for unconfigured channel ignored");
                continue;
            };
            let mut st = slot.state.lock().await;
            let mut rec = row.dispatch;
            if rec.status == DispatchStatus::Pending {
                if rec.attempt_count >= self.settings.max_attempts {
                    rec.status = DispatchStatus::Failed;
                    rec.last_error.get_or_insert_with(|| "interrupted after final attempt".to_string());
                    warn!(channel = %rec.channel, entity = %rec.entity, "Interrupted dispatch had no attempts left, moved to dead-letter");
                    exhausted.push((rec.clone(), row.envelope, row.detected_at));
                } else {
                    st.enqueue(Queued {
                        entity_id: rec.entity.id(),
                        envelope: row.envelope,
                        detected_at: row.detected_at,
                    });
                }
            }
            st.records.insert(rec.entity.id(), rec);
            restored += 1;
        }
        for (rec, envelope, detected_at) in &exhausted {
            self.journal(rec, envelope, *detected_at).await;
        }
        info!(restored, "Restored alert dispatch journal");
        Ok(restored)
    }

    /// Persist a dispatch state change. SQLite work runs on the blocking
    /// pool and never under a channel lock.
    async fn journal(&self, rec: &AlertDispatch, envelope: &Envelope, detected_at: chrono::DateTime<Utc>) {
        let Some(pool) = self.pool.clone() else { return };
        let (rec, envelope) = (rec.clone(), envelope.clone());
        let id = rec.id;
        let saved =
            tokio::task::spawn_blocking(move || storage::dispatches::save(&pool, &rec, &envelope, detected_at)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(dispatch = %id, "Failed to journal dispatch: {:#}", e),
            Err(e) => error!(dispatch = %id, "Journal task failed: {}", e),
        }
    }
}

/// Drain every channel's queue until cancelled, one task per channel.
pub async fn run_drain_loop(router: Arc<AlertRouter>, cancel: CancellationToken) {
    info!(channels = router.channels.len(), "Alert drain loop started");
    let tasks = TaskTracker::new();
    for name in router.channel_names() {
        let router = Arc::clone(&router);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            router.drain_channel_loop(&name, DRAIN_TICK, cancel).await;
        });
    }
    tasks.close();
    tasks.wait().await;
    info!("Alert drain loop stopped");
}
