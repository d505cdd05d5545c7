//! Dispatch queue: per-contact lanes, bounded concurrency, retry with backoff.
//!
//! Each contact gets a lane: its items are sent strictly one after another,
//! in acceptance order. Lanes of different contacts run concurrently, bounded
//! by a semaphore. A lane's drain task exits when the lane is empty and is
//! spawned again by the next enqueue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gateway::{Gateway, SendCommand};
use super::model::{DispatchEvent, EnqueueReceipt, OutboundDraft, OutboundQueueItem, QueueStatus};
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, GatewayError};
use crate::ratelimit::retry_after_secs;
use crate::store::Repository;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Default)]
struct QueueState {
    items: HashMap<Uuid, OutboundQueueItem>,
    lanes: HashMap<String, VecDeque<Uuid>>,
    /// Contacts with a running drain task.
    active: HashSet<String>,
}

impl QueueState {
    /// Items that still need work.
    fn in_flight(&self) -> usize {
        self.items.values().filter(|i| !i.is_terminal()).count()
    }

    /// Queue `id` on its contact's lane. Returns true when the lane needs a
    /// drain task.
    fn push_lane(&mut self, contact_id: &str, id: Uuid) -> bool {
        self.lanes.entry(contact_id.to_string()).or_default().push_back(id);
        self.active.insert(contact_id.to_string())
    }
}

pub struct DispatchQueue {
    config: DispatchConfig,
    /// In-flight items allowed before enqueue pushes back.
    capacity: usize,
    gateway: Arc<dyn Gateway>,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    tx: broadcast::Sender<DispatchEvent>,
}

impl DispatchQueue {
    /// `capacity` is normally the system-wide per-minute cap.
    pub fn new(
        config: DispatchConfig,
        capacity: usize,
        gateway: Arc<dyn Gateway>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Arc::new(Self {
            config,
            capacity: capacity.max(1),
            gateway,
            repo,
            clock,
            state: Mutex::new(QueueState::default()),
            permits,
            tx,
        })
    }

    /// Subscribe to dispatch events. Delivery is best-effort.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Accept an approved reply for delivery.
    ///
    /// Rejected with `Backpressure` when the in-flight depth has reached the
    /// capacity; `retry_after_secs` points at the next minute boundary.
    pub async fn enqueue(self: &Arc<Self>, draft: OutboundDraft) -> Result<EnqueueReceipt, DispatchError> {
        let now = self.clock.now();
        let (item, position, start_lane) = {
            let mut state = self.state.lock().await;
            let depth = state.in_flight();
            if depth >= self.capacity {
                let retry_after = retry_after_secs(next_minute(now), now);
                warn!(depth, capacity = self.capacity, retry_after, "Dispatch queue full, rejecting");
                return Err(DispatchError::Backpressure {
                    depth,
                    retry_after_secs: retry_after,
                });
            }

            let item = OutboundQueueItem::from_draft(draft, self.config.max_attempts, now);
            state.items.insert(item.id, item.clone());
            let start_lane = state.push_lane(&item.contact_id, item.id);
            (item, depth + 1, start_lane)
        };

        let estimated_seconds = self.estimate_seconds(position);
        info!(
            item_id = %item.id,
            contact = %item.contact_id,
            rule_id = ?item.rule_id,
            position,
            "Message queued"
        );
        self.persist(&item).await;
        let _ = self.tx.send(DispatchEvent::Queued {
            item: item.clone(),
            position,
            estimated_seconds,
        });

        if start_lane {
            self.spawn_lane(item.contact_id.clone());
        }

        Ok(EnqueueReceipt {
            accepted: true,
            item_id: item.id,
            position,
            estimated_seconds,
        })
    }

    /// Manually retry a terminally failed item. Attempts keep counting; the
    /// item gets `max_attempts` more automatic attempts on top of them.
    ///
    /// Subject to the same capacity as `enqueue`.
    pub async fn retry(self: &Arc<Self>, id: Uuid) -> Result<OutboundQueueItem, DispatchError> {
        let now = self.clock.now();
        let (item, position, start_lane) = {
            let mut state = self.state.lock().await;
            let depth = state.in_flight();
            let item = state.items.get_mut(&id).ok_or(DispatchError::NotFound { id })?;

            if !(item.status == QueueStatus::Failed && item.is_terminal()) {
                return Err(DispatchError::InvalidTransition {
                    id,
                    state: item.status.to_string(),
                    target: QueueStatus::Queued.to_string(),
                });
            }
            if depth >= self.capacity {
                let retry_after = retry_after_secs(next_minute(now), now);
                warn!(item_id = %id, depth, capacity = self.capacity, "Dispatch queue full, refusing manual retry");
                return Err(DispatchError::Backpressure {
                    depth,
                    retry_after_secs: retry_after,
                });
            }
            item.transition_to(QueueStatus::Queued)
                .map_err(|(from, to)| DispatchError::InvalidTransition {
                    id,
                    state: from.to_string(),
                    target: to.to_string(),
                })?;
            item.max_attempts = item.attempts + self.config.max_attempts;
            item.error = None;
            let item = item.clone();

            let start_lane = state.push_lane(&item.contact_id, id);
            (item, depth + 1, start_lane)
        };

        info!(item_id = %id, attempts = item.attempts, "Manual retry queued");
        self.persist(&item).await;
        let _ = self.tx.send(DispatchEvent::Queued {
            item: item.clone(),
            position,
            estimated_seconds: self.estimate_seconds(position),
        });

        if start_lane {
            self.spawn_lane(item.contact_id.clone());
        }
        Ok(item)
    }

    /// Reload unfinished items after a restart and resume their lanes.
    ///
    /// An item that was mid-send when the process stopped counts that attempt
    /// as failed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let mut items = self.repo.list_unfinished_queue_items().await?;
        items.sort_by_key(|i| i.queued_at);

        let mut to_start = Vec::new();
        let mut resumed = 0;
        let mut interrupted = Vec::new();
        {
            let mut state = self.state.lock().await;
            for mut item in items {
                if state.items.contains_key(&item.id) {
                    continue;
                }
                if item.status == QueueStatus::Sending {
                    item.status = QueueStatus::Failed;
                    item.error = Some("interrupted by restart".to_string());
                    interrupted.push(item.clone());
                }
                let id = item.id;
                let contact = item.contact_id.clone();
                let terminal = item.is_terminal();
                state.items.insert(id, item);
                if terminal {
                    continue;
                }
                resumed += 1;
                if state.push_lane(&contact, id) {
                    to_start.push(contact);
                }
            }
        }

        for item in &interrupted {
            self.persist(item).await;
        }
        for contact in to_start {
            self.spawn_lane(contact);
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed unfinished dispatch items");
        }
        Ok(resumed)
    }

    pub async fn get(&self, id: Uuid) -> Option<OutboundQueueItem> {
        self.state.lock().await.items.get(&id).cloned()
    }

    /// All items held in memory, oldest first.
    pub async fn items(&self) -> Vec<OutboundQueueItem> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state.items.values().cloned().collect();
        items.sort_by_key(|i| i.queued_at);
        items
    }

    /// Terminally failed items waiting for a manual retry.
    pub async fn failed_items(&self) -> Vec<OutboundQueueItem> {
        self.items()
            .await
            .into_iter()
            .filter(|i| i.status == QueueStatus::Failed && i.is_terminal())
            .collect()
    }

    /// Items not yet sent or terminally failed.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.in_flight()
    }

    /// Drop terminal items whose last activity is older than the retention
    /// period. They stay persisted in the repository.
    pub async fn prune_terminal(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|_, item| {
            let last = item.last_attempt_at.unwrap_or(item.queued_at);
            !(item.is_terminal() && now - last >= retention)
        });
        let pruned = before - state.items.len();
        if pruned > 0 {
            debug!(count = pruned, "Pruned terminal dispatch items");
        }
        pruned
    }

    /// Stop taking new send permits. Lanes finish their current attempt and
    /// leave the rest queued for `recover`.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    fn estimate_seconds(&self, position: usize) -> u64 {
        let per_send_ms = self.config.estimated_send.as_millis() as u64;
        let workers = self.config.concurrency.max(1) as u64;
        (position as u64 * per_send_ms).div_ceil(workers * 1000)
    }

    fn spawn_lane(self: &Arc<Self>, contact_id: String) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.drain_lane(contact_id).await;
        });
    }

    async fn drain_lane(self: Arc<Self>, contact_id: String) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.lanes.get_mut(&contact_id).and_then(|lane| lane.pop_front()) {
                    Some(id) => id,
                    None => {
                        state.lanes.remove(&contact_id);
                        state.active.remove(&contact_id);
                        return;
                    }
                }
            };
            if !self.deliver(next).await {
                // Shut down; put the item back for whoever resumes the lane.
                let mut state = self.state.lock().await;
                state.lanes.entry(contact_id.clone()).or_default().push_front(next);
                state.active.remove(&contact_id);
                return;
            }
        }
    }

    /// Run attempts until the item is sent or terminally failed. Returns
    /// false if the queue shut down before the item finished.
    async fn deliver(&self, id: Uuid) -> bool {
        loop {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return false;
            };

            let Some((command, contact_id, attempt)) = self.begin_attempt(id).await else {
                return true;
            };

            let result = match tokio::time::timeout(self.config.send_timeout, self.gateway.send(&command)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(self.config.send_timeout)),
            };
            drop(permit);

            let error = match result {
                Ok(receipt) => {
                    self.finish_sent(id, receipt.message_id).await;
                    return true;
                }
                Err(e) => e,
            };

            let hinted = match &error {
                GatewayError::RateLimited { retry_after, .. } => {
                    retry_after.map(|hint| hint.min(self.config.max_retry_hint))
                }
                _ => None,
            };
            let Some(delay) = self.finish_failed(id, &contact_id, attempt, &error, hinted).await else {
                return true;
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Move to `sending` and count the attempt.
    async fn begin_attempt(&self, id: Uuid) -> Option<(SendCommand, String, u32)> {
        let now = self.clock.now();
        let item = {
            let mut state = self.state.lock().await;
            let item = state.items.get_mut(&id)?;
            if let Err((from, to)) = item.transition_to(QueueStatus::Sending) {
                warn!(item_id = %id, %from, %to, "Skipping item in unexpected state");
                return None;
            }
            item.attempts += 1;
            item.last_attempt_at = Some(now);
            item.clone()
        };

        debug!(item_id = %id, contact = %item.contact_id, attempt = item.attempts, "Sending");
        self.persist(&item).await;
        let _ = self.tx.send(DispatchEvent::Sending {
            id,
            contact_id: item.contact_id.clone(),
            attempt: item.attempts,
        });

        let command = SendCommand {
            contact_id: item.contact_id.clone(),
            body: item.body.clone(),
            template: if item.requires_template { item.template.clone() } else { None },
        };
        Some((command, item.contact_id, item.attempts))
    }

    async fn finish_sent(&self, id: Uuid, message_id: Option<String>) {
        let item = {
            let mut state = self.state.lock().await;
            let Some(item) = state.items.get_mut(&id) else {
                return;
            };
            if item.transition_to(QueueStatus::Sent).is_err() {
                return;
            }
            item.error = None;
            item.gateway_message_id = message_id;
            item.clone()
        };

        info!(item_id = %id, contact = %item.contact_id, attempts = item.attempts, "Message sent");
        self.persist(&item).await;
        let _ = self.tx.send(DispatchEvent::Sent {
            id,
            contact_id: item.contact_id,
            attempts: item.attempts,
            gateway_message_id: item.gateway_message_id,
        });
    }

    /// Record a failed attempt. Returns the backoff delay when another
    /// automatic attempt follows.
    async fn finish_failed(
        &self,
        id: Uuid,
        contact_id: &str,
        attempt: u32,
        error: &GatewayError,
        hinted: Option<Duration>,
    ) -> Option<Duration> {
        let message = error.to_string();
        let item = {
            let mut state = self.state.lock().await;
            let item = state.items.get_mut(&id)?;
            item.transition_to(QueueStatus::Failed).ok()?;
            item.error = Some(message.clone());
            item.clone()
        };
        self.persist(&item).await;

        if item.is_terminal() {
            error!(
                item_id = %id,
                contact = %contact_id,
                attempts = item.attempts,
                error = %message,
                "Message failed permanently, waiting for manual retry"
            );
            let _ = self.tx.send(DispatchEvent::Failed {
                id,
                contact_id: contact_id.to_string(),
                attempts: item.attempts,
                error: message,
                terminal: true,
                retry_in_ms: None,
            });
            return None;
        }

        let delay = backoff_delay(self.config.base_backoff, self.config.max_jitter, attempt)
            .max(hinted.unwrap_or_default());
        warn!(
            item_id = %id,
            contact = %contact_id,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Send attempt failed, retrying"
        );
        let _ = self.tx.send(DispatchEvent::Failed {
            id,
            contact_id: contact_id.to_string(),
            attempts: item.attempts,
            error: message,
            terminal: false,
            retry_in_ms: Some(delay.as_millis() as u64),
        });
        Some(delay)
    }

    async fn persist(&self, item: &OutboundQueueItem) {
        if let Err(e) = self.repo.save_queue_item(item).await {
            warn!(item_id = %item.id, error = %e, "Failed to persist queue item");
        }
    }
}

/// `base * 2^(attempt - 1)` plus up to `max_jitter` of random delay.
pub fn backoff_delay(base: Duration, max_jitter: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp);
    let jitter_ms = max_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
    delay + Duration::from_millis(jitter)
}

fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(60) + 1) * 60;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}

/// Spawn a background task that prunes old terminal items every minute.
pub fn spawn_retention_task(queue: Arc<DispatchQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            queue.prune_terminal(queue.clock.now()).await;
        }
    })
}
