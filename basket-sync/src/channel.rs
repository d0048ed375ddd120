//! Per-list subscription to the remote change-stream.
//!
//! One transport subscription pair (lists + list_items) is opened per list
//! regardless of how many observers subscribe; observers share the driver
//! task through a refcount and tear it down only when the last handle is
//! returned. On transport failure the driver enters `Reconnecting` and
//! retries with exponential backoff (full jitter); a successful reconnect
//! re-issues the same filtered subscription and reports a new epoch so the
//! coordinator can resynchronize — no delivery guarantee is made across the
//! disconnect window.
//!
//! Publishes from the coordinator ride the live connection; while
//! disconnected they land in a bounded outbox replayed on reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{ChangeEvent, SubscribeRequest, Table};
use crate::transport::{Transport, TransportConn, TransportError};

/// Lifecycle of one list's shared subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

/// Events fanned out to subscription observers.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A decoded change for the subscribed list.
    Change(ChangeEvent),
    /// Stream is live. Emitted on every (re)connect; `epoch` starts at 1.
    /// Any epoch after a gap means events may have been missed — resync.
    Connected { epoch: u64 },
    /// Retry budget exhausted; the stream stays down until resubscribed.
    Lost,
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (0-based): uniform over
    /// `[0, min(cap, base * 2^attempt)]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);
        let millis = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub backoff: BackoffConfig,
    /// Events buffered per observer before it lags.
    pub event_capacity: usize,
    /// Publishes queued while disconnected.
    pub outbox_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            event_capacity: 256,
            outbox_capacity: 1024,
        }
    }
}

/// Channel errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// No live subscription for the list
    NotSubscribed(String),
    /// Disconnected and the outbox is full
    QueueFull,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::NotSubscribed(id) => write!(f, "Not subscribed to list {id}"),
            ChannelError::QueueFull => write!(f, "Publish outbox full"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Bounded queue of publishes made while disconnected.
///
/// Drained in order on reconnection.
pub struct Outbox {
    queue: VecDeque<(Table, serde_json::Value)>,
    max_size: usize,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Queue a publish for later replay. Returns false when full.
    pub fn enqueue(&mut self, table: Table, frame: serde_json::Value) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((table, frame));
        true
    }

    /// Drain all queued publishes for replay.
    pub fn drain(&mut self) -> Vec<(Table, serde_json::Value)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Ticket returned by `subscribe`; return it to `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    list_id: String,
    ticket: Uuid,
}

impl SubscriptionHandle {
    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn ticket(&self) -> Uuid {
        self.ticket
    }
}

struct SubEntry {
    refcount: usize,
    /// Last epoch the driver connected at; 0 until the first connect.
    epoch: Arc<AtomicU64>,
    events_tx: broadcast::Sender<ChannelEvent>,
    state_tx: watch::Sender<SubscriptionState>,
    outbound: Arc<RwLock<HashMap<Table, mpsc::Sender<serde_json::Value>>>>,
    outbox: Arc<Mutex<Outbox>>,
    task: tokio::task::JoinHandle<()>,
}

/// The remote change-stream channel.
pub struct RemoteChannel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    subs: Mutex<HashMap<String, SubEntry>>,
}

impl RemoteChannel {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a list's change-stream.
    ///
    /// Reuses the shared driver task when one is already running.
    pub async fn subscribe(
        &self,
        list_id: &str,
    ) -> (
        broadcast::Receiver<ChannelEvent>,
        watch::Receiver<SubscriptionState>,
        SubscriptionHandle,
    ) {
        let mut subs = self.subs.lock().await;
        if let Some(entry) = subs.get_mut(list_id) {
            if !entry.task.is_finished() {
                entry.refcount += 1;
                let events_rx = entry.events_tx.subscribe();
                // A late observer missed the original connect notification;
                // repeat it so their consumer still resynchronizes
                let epoch = entry.epoch.load(Ordering::SeqCst);
                if epoch > 0 {
                    let _ = entry.events_tx.send(ChannelEvent::Connected { epoch });
                }
                let handle = SubscriptionHandle {
                    list_id: list_id.to_string(),
                    ticket: Uuid::new_v4(),
                };
                return (events_rx, entry.state_tx.subscribe(), handle);
            }
            // Driver previously gave up (retry budget); restart it
            subs.remove(list_id);
        }

        let (events_tx, events_rx) = broadcast::channel(self.config.event_capacity);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
        let epoch = Arc::new(AtomicU64::new(0));
        let outbound = Arc::new(RwLock::new(HashMap::new()));
        let outbox = Arc::new(Mutex::new(Outbox::new(self.config.outbox_capacity)));

        let task = tokio::spawn(drive(
            self.transport.clone(),
            list_id.to_string(),
            events_tx.clone(),
            state_tx.clone(),
            epoch.clone(),
            outbound.clone(),
            outbox.clone(),
            self.config.backoff.clone(),
        ));

        subs.insert(
            list_id.to_string(),
            SubEntry {
                refcount: 1,
                epoch,
                events_tx,
                state_tx,
                outbound,
                outbox,
                task,
            },
        );

        let handle = SubscriptionHandle {
            list_id: list_id.to_string(),
            ticket: Uuid::new_v4(),
        };
        (events_rx, state_rx, handle)
    }

    /// Return a handle. The shared subscription is torn down — driver task,
    /// pending backoff timer and transport connections — when the refcount
    /// reaches zero.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = self.subs.lock().await;
        let Some(entry) = subs.get_mut(&handle.list_id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let entry = subs.remove(&handle.list_id).expect("entry present");
            entry.task.abort();
            let _ = entry.state_tx.send(SubscriptionState::Closed);
            log::debug!("subscription for list {} closed", handle.list_id);
        }
    }

    /// Publish a change frame upstream.
    ///
    /// While disconnected the frame is queued and replayed on reconnect;
    /// `QueueFull` is the only terminal failure.
    pub async fn publish(
        &self,
        list_id: &str,
        table: Table,
        frame: serde_json::Value,
    ) -> Result<(), ChannelError> {
        // Take the per-list handles and release the map before awaiting on
        // the connection, so one backpressured list cannot stall the others
        let (outbound, outbox) = {
            let subs = self.subs.lock().await;
            let entry = subs
                .get(list_id)
                .ok_or_else(|| ChannelError::NotSubscribed(list_id.to_string()))?;
            (entry.outbound.clone(), entry.outbox.clone())
        };

        let sender = outbound.read().await.get(&table).cloned();
        let frame = match sender {
            Some(tx) => match tx.send(frame).await {
                Ok(()) => return Ok(()),
                // Connection died under us; fall through to the outbox
                Err(err) => err.0,
            },
            None => frame,
        };

        if outbox.lock().await.enqueue(table, frame) {
            Ok(())
        } else {
            Err(ChannelError::QueueFull)
        }
    }

    /// Observer refcount for a list (0 when not subscribed).
    pub async fn refcount(&self, list_id: &str) -> usize {
        self.subs
            .lock()
            .await
            .get(list_id)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    /// Queued publishes awaiting reconnect.
    pub async fn outbox_len(&self, list_id: &str) -> usize {
        let outbox = match self.subs.lock().await.get(list_id) {
            Some(entry) => entry.outbox.clone(),
            None => return 0,
        };
        let len = outbox.lock().await.len();
        len
    }
}

/// Open the filtered subscription pair for one list.
async fn open_pair(
    transport: &Arc<dyn Transport>,
    list_id: &str,
) -> Result<(TransportConn, TransportConn), TransportError> {
    let lists = transport
        .open_changes(SubscribeRequest::for_list(Table::Lists, list_id))
        .await?;
    let items = transport
        .open_changes(SubscribeRequest::for_list(Table::ListItems, list_id))
        .await?;
    Ok((lists, items))
}

/// Driver task for one list's shared subscription.
#[allow(clippy::too_many_arguments)]
async fn drive(
    transport: Arc<dyn Transport>,
    list_id: String,
    events_tx: broadcast::Sender<ChannelEvent>,
    state_tx: watch::Sender<SubscriptionState>,
    epoch_counter: Arc<AtomicU64>,
    outbound: Arc<RwLock<HashMap<Table, mpsc::Sender<serde_json::Value>>>>,
    outbox: Arc<Mutex<Outbox>>,
    backoff: BackoffConfig,
) {
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            if attempt > backoff.max_retries {
                log::warn!(
                    "subscription for list {list_id} lost after {} attempts",
                    attempt - 1
                );
                let _ = events_tx.send(ChannelEvent::Lost);
                let _ = state_tx.send(SubscriptionState::Closed);
                return;
            }
            let _ = state_tx.send(if epoch_counter.load(Ordering::SeqCst) == 0 {
                SubscriptionState::Connecting
            } else {
                SubscriptionState::Reconnecting
            });
            let delay = backoff.delay_for(attempt - 1);
            log::debug!("retry {attempt} for list {list_id} in {delay:?}");
            tokio::time::sleep(delay).await;
        } else {
            let _ = state_tx.send(SubscriptionState::Connecting);
        }

        let (mut lists_conn, mut items_conn) = match open_pair(&transport, &list_id).await {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!("subscribe failed for list {list_id}: {e}");
                attempt += 1;
                continue;
            }
        };

        attempt = 0;
        let epoch = epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut out = outbound.write().await;
            out.insert(Table::Lists, lists_conn.sender());
            out.insert(Table::ListItems, items_conn.sender());
        }
        let _ = state_tx.send(SubscriptionState::Active);
        let _ = events_tx.send(ChannelEvent::Connected { epoch });

        // Replay publishes queued during the disconnect window
        let queued = outbox.lock().await.drain();
        if !queued.is_empty() {
            log::info!("replaying {} queued publishes for list {list_id}", queued.len());
            let out = outbound.read().await;
            for (table, frame) in queued {
                if let Some(tx) = out.get(&table) {
                    let _ = tx.send(frame).await;
                }
            }
        }

        // Pump frames until either connection drops
        loop {
            tokio::select! {
                frame = lists_conn.frames.recv() => match frame {
                    Some(frame) => deliver(&events_tx, &list_id, Table::Lists, frame),
                    None => break,
                },
                frame = items_conn.frames.recv() => match frame {
                    Some(frame) => deliver(&events_tx, &list_id, Table::ListItems, frame),
                    None => break,
                },
            }
        }

        outbound.write().await.clear();
        log::info!("change stream dropped for list {list_id}");
        attempt = 1;
    }
}

/// Decode and fan out one delivery frame. Malformed frames are dropped.
fn deliver(
    events_tx: &broadcast::Sender<ChannelEvent>,
    list_id: &str,
    table: Table,
    frame: serde_json::Value,
) {
    match ChangeEvent::decode(table, &frame) {
        Ok(ev) => {
            if ev.list_id != list_id {
                log::debug!("dropping event for foreign list {}", ev.list_id);
                return;
            }
            let _ = events_tx.send(ChannelEvent::Change(ev));
        }
        Err(e) => log::warn!("dropping malformed change frame: {e}"),
    }
}
