//! The sync coordinator: glue between the local store, the remote
//! change-stream and the session.
//!
//! ```text
//!   UI writes ──► SyncCoordinator ──► LocalStore (optimistic, provisional ts)
//!                      │                  ▲
//!                      │ publish          │ apply (LWW guard)
//!                      ▼                  │
//!                 RemoteChannel ◄─── change-stream (incl. our own echo)
//! ```
//!
//! Local mutations apply to the store immediately with a provisional
//! timestamp, register an echo fingerprint, and publish upstream. The echoed
//! delivery carries the authoritative server timestamp; it is applied like
//! any remote change (advancing the stored timestamp), the fingerprint
//! confirms it, and the store suppresses the redundant snapshot — one user
//! action, one visible mutation.
//!
//! Every `Connected` notification triggers a resynchronization: bulk-fetch
//! the list's current rows, LWW-apply them, and prune local rows the server
//! no longer has (unless an optimistic write is still in flight for them).
//! Events may have been missed while disconnected, so this runs on the first
//! connect and after every reconnect alike.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use crate::channel::{
    ChannelConfig, ChannelEvent, RemoteChannel, SubscriptionHandle, SubscriptionState,
};
use crate::model::{ListItem, ShoppingList};
use crate::protocol::{ChangeEvent, ChangeKind, EntityType, RowSnapshot, Table};
use crate::session::SessionContext;
use crate::store::{LocalStore, StoreError, WriteOutcome};
use crate::transport::{Transport, TransportError};

/// Coordinator errors.
#[derive(Debug)]
pub enum SyncError {
    Store(StoreError),
    Transport(TransportError),
    /// Operation needs a signed-in user
    SignedOut,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "Store error: {e}"),
            SyncError::Transport(e) => write!(f, "Transport error: {e}"),
            SyncError::SignedOut => write!(f, "No signed-in user"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}

/// Connection health of one attached list, for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    /// Stream live, changes flowing.
    Live,
    /// Stream down, retrying; local edits queue.
    Reconnecting,
    /// Retry budget exhausted; local-only until reattached.
    Degraded,
}

/// Whether the coordinator is currently folding remote state in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncActivity {
    Idle,
    Syncing,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub channel: ChannelConfig,
    /// Unconfirmed echo fingerprints are dropped after this long.
    pub pending_ttl: Duration,
    /// Server stamps may lag the provisional timestamp by this much and
    /// still confirm the fingerprint (clock skew allowance).
    pub echo_tolerance: Duration,
    /// Cadence of the expired-fingerprint sweep.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            pending_ttl: Duration::from_secs(10),
            echo_tolerance: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Fingerprint of an optimistic write awaiting its echo.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub entity: EntityType,
    pub entity_id: String,
    /// What the write does; resync must not re-upsert an entity whose
    /// delete is still in flight.
    pub kind: ChangeKind,
    /// Provisional timestamp stamped on the local row.
    pub local_timestamp: i64,
    registered_at: Instant,
}

/// In-flight optimistic writes, keyed by entity. A newer write to the same
/// entity replaces the older fingerprint.
pub struct PendingWriteRegistry {
    entries: Mutex<HashMap<(EntityType, String), PendingWrite>>,
}

impl PendingWriteRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        entity: EntityType,
        entity_id: &str,
        kind: ChangeKind,
        local_timestamp: i64,
    ) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (entity, entity_id.to_string()),
            PendingWrite {
                entity,
                entity_id: entity_id.to_string(),
                kind,
                local_timestamp,
                registered_at: Instant::now(),
            },
        );
    }

    /// Take the fingerprint confirmed by an incoming change, if any.
    ///
    /// A delivery confirms a fingerprint when it targets the same entity and
    /// its server timestamp is not older than the provisional timestamp by
    /// more than the skew tolerance. Non-matching fingerprints stay put.
    pub async fn take_match(
        &self,
        entity: EntityType,
        entity_id: &str,
        server_timestamp: i64,
        tolerance: Duration,
    ) -> Option<PendingWrite> {
        let key = (entity, entity_id.to_string());
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(&key)
            .map(|pw| server_timestamp >= pw.local_timestamp - tolerance.as_millis() as i64)
            .unwrap_or(false);
        if matches {
            entries.remove(&key)
        } else {
            None
        }
    }

    /// Kind of the in-flight write for an entity, if any.
    pub async fn pending_kind(&self, entity: EntityType, entity_id: &str) -> Option<ChangeKind> {
        self.entries
            .lock()
            .await
            .get(&(entity, entity_id.to_string()))
            .map(|pw| pw.kind)
    }

    pub async fn contains(&self, entity: EntityType, entity_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(entity, entity_id.to_string()))
    }

    /// Drop fingerprints older than `ttl` — their echo never came (publish
    /// lost, or rejected upstream) and they must not mask pruning forever.
    pub async fn purge_expired(&self, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, pw| pw.registered_at.elapsed() <= ttl);
        let dropped = before - entries.len();
        if dropped > 0 {
            log::debug!("dropped {dropped} expired write fingerprints");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for PendingWriteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One attached list: status observation plus the teardown ticket.
pub struct ListSync {
    list_id: String,
    status_rx: watch::Receiver<SyncStatus>,
    activity_rx: watch::Receiver<SyncActivity>,
    handle: SubscriptionHandle,
    task: tokio::task::JoinHandle<()>,
}

impl ListSync {
    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    /// Connection health, live.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Sync activity (idle vs folding remote state), live.
    pub fn activity(&self) -> watch::Receiver<SyncActivity> {
        self.activity_rx.clone()
    }
}

/// The sync coordinator. One per app session; lists attach and detach as
/// the UI navigates.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    channel: Arc<RemoteChannel>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionContext>,
    pending: Arc<PendingWriteRegistry>,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionContext>,
        config: CoordinatorConfig,
    ) -> Self {
        let channel = Arc::new(RemoteChannel::new(transport.clone(), config.channel.clone()));
        Self {
            store: Arc::new(LocalStore::new()),
            channel,
            transport,
            session,
            pending: Arc::new(PendingWriteRegistry::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<RemoteChannel> {
        &self.channel
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Unconfirmed optimistic writes.
    pub async fn pending_writes(&self) -> usize {
        self.pending.len().await
    }

    /// Attach a list: subscribe to its change-stream and keep the local
    /// store converged with it until detached.
    pub async fn attach(&self, list_id: &str) -> ListSync {
        let (events_rx, sub_state_rx, handle) = self.channel.subscribe(list_id).await;
        let (status_tx, status_rx) = watch::channel(SyncStatus::Connecting);
        let (activity_tx, activity_rx) = watch::channel(SyncActivity::Idle);

        let task = tokio::spawn(run_list(
            self.store.clone(),
            self.transport.clone(),
            self.pending.clone(),
            self.config.clone(),
            list_id.to_string(),
            events_rx,
            sub_state_rx,
            status_tx,
            activity_tx,
        ));

        ListSync {
            list_id: list_id.to_string(),
            status_rx,
            activity_rx,
            handle,
            task,
        }
    }

    /// Detach a list, releasing its share of the subscription.
    pub async fn detach(&self, sync: ListSync) {
        sync.task.abort();
        self.channel.unsubscribe(sync.handle).await;
        log::debug!("detached list {}", sync.list_id);
    }

    /// Force a resynchronization of one list against the server's rows.
    pub async fn resync(&self, list_id: &str) -> Result<(), SyncError> {
        resync_list(&self.store, &self.transport, &self.pending, list_id).await?;
        Ok(())
    }

    /// Create a new list owned by the signed-in user.
    pub async fn create_list(&self, name: &str) -> Result<ShoppingList, SyncError> {
        let owner = self
            .session
            .current_user_id()
            .ok_or(SyncError::SignedOut)?;
        let list = ShoppingList::new(Uuid::new_v4().to_string(), name, owner);
        self.upsert_list(list).await
    }

    /// Optimistically upsert a list row and publish it.
    ///
    /// The row is stamped with a provisional timestamp strictly past the
    /// stored one; the echoed delivery replaces it with the server's stamp.
    pub async fn upsert_list(&self, mut list: ShoppingList) -> Result<ShoppingList, SyncError> {
        let current = self.store.get_list(&list.id).await;
        let kind = match current {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        list.updated_at = provisional_stamp(current.map(|c| c.updated_at));

        self.pending
            .register(EntityType::List, &list.id, kind, list.updated_at)
            .await;
        self.store.upsert_list(list.clone()).await?;

        let event = match kind {
            ChangeKind::Insert => ChangeEvent::insert_list(list.clone()),
            _ => ChangeEvent::update_list(list.clone()),
        };
        self.publish(&list.id, event).await;
        Ok(list)
    }

    /// Add a new item to a list.
    pub async fn add_item(
        &self,
        list_id: &str,
        name: &str,
        quantity: u32,
    ) -> Result<ListItem, SyncError> {
        let mut item = ListItem::new(Uuid::new_v4().to_string(), list_id, name);
        item.quantity = quantity;
        self.upsert_item(item).await
    }

    /// Optimistically upsert an item row and publish it.
    pub async fn upsert_item(&self, mut item: ListItem) -> Result<ListItem, SyncError> {
        let current = self.store.get_item(&item.list_id, &item.id).await;
        let kind = match current {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        item.updated_at = provisional_stamp(current.map(|c| c.updated_at));

        self.pending
            .register(EntityType::Item, &item.id, kind, item.updated_at)
            .await;
        self.store.upsert_item(item.clone()).await?;

        let event = match kind {
            ChangeKind::Insert => ChangeEvent::insert_item(item.clone()),
            _ => ChangeEvent::update_item(item.clone()),
        };
        self.publish(&item.list_id, event).await;
        Ok(item)
    }

    /// Optimistically delete an item. Deleting an absent item is a no-op.
    pub async fn delete_item(&self, list_id: &str, item_id: &str) -> Result<(), SyncError> {
        let Some(mut prior) = self.store.get_item(list_id, item_id).await else {
            log::debug!("delete of absent item {item_id} ignored");
            return Ok(());
        };
        let stamp = provisional_stamp(Some(prior.updated_at));
        prior.updated_at = stamp;

        self.pending
            .register(EntityType::Item, item_id, ChangeKind::Delete, stamp)
            .await;
        self.store.delete_item(list_id, item_id, stamp).await?;
        self.publish(list_id, ChangeEvent::delete_item(prior)).await;
        Ok(())
    }

    /// Optimistically delete a list and everything in it.
    pub async fn delete_list(&self, list_id: &str) -> Result<(), SyncError> {
        let Some(mut prior) = self.store.get_list(list_id).await else {
            log::debug!("delete of absent list {list_id} ignored");
            return Ok(());
        };
        let stamp = provisional_stamp(Some(prior.updated_at));
        prior.updated_at = stamp;

        self.pending
            .register(EntityType::List, list_id, ChangeKind::Delete, stamp)
            .await;
        self.store.delete_list(list_id, stamp).await?;
        self.publish(list_id, ChangeEvent::delete_list(prior)).await;
        Ok(())
    }

    /// Publish a change upstream. Failures never roll back the local write;
    /// the next resync reconciles whatever the server ends up holding.
    async fn publish(&self, list_id: &str, event: ChangeEvent) {
        let table = event.table();
        if let Err(e) = self.channel.publish(list_id, table, event.encode()).await {
            log::warn!("publish failed for list {list_id}: {e}");
        }
    }
}

/// Provisional timestamp for an optimistic write: wall clock, pushed past
/// the stored row's timestamp so the LWW guard accepts it even under skew.
fn provisional_stamp(current: Option<i64>) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    match current {
        Some(ts) => now.max(ts + 1),
        None => now,
    }
}

/// Per-attached-list loop: fold channel events into the store, map
/// subscription state to sync status, sweep expired fingerprints.
#[allow(clippy::too_many_arguments)]
async fn run_list(
    store: Arc<LocalStore>,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingWriteRegistry>,
    config: CoordinatorConfig,
    list_id: String,
    mut events: broadcast::Receiver<ChannelEvent>,
    mut sub_state: watch::Receiver<SubscriptionState>,
    status_tx: watch::Sender<SyncStatus>,
    activity_tx: watch::Sender<SyncActivity>,
) {
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChannelEvent::Change(change)) => {
                    let _ = activity_tx.send(SyncActivity::Syncing);
                    apply_change(&store, &pending, &config, &change).await;
                    let _ = activity_tx.send(SyncActivity::Idle);
                }
                Ok(ChannelEvent::Connected { epoch }) => {
                    let _ = status_tx.send(SyncStatus::Live);
                    // Deliveries may have been missed before this point:
                    // reconcile against the server's current rows
                    log::info!("list {list_id} connected (epoch {epoch}), resyncing");
                    let _ = activity_tx.send(SyncActivity::Syncing);
                    if let Err(e) = resync_list(&store, &transport, &pending, &list_id).await {
                        log::warn!("resync failed for list {list_id}: {e}");
                    }
                    let _ = activity_tx.send(SyncActivity::Idle);
                }
                Ok(ChannelEvent::Lost) => {
                    log::warn!("list {list_id} degraded to local-only");
                    let _ = status_tx.send(SyncStatus::Degraded);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("event stream for list {list_id} lagged by {n}, resyncing");
                    let _ = activity_tx.send(SyncActivity::Syncing);
                    if let Err(e) = resync_list(&store, &transport, &pending, &list_id).await {
                        log::warn!("resync failed for list {list_id}: {e}");
                    }
                    let _ = activity_tx.send(SyncActivity::Idle);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            changed = sub_state.changed() => {
                if changed.is_err() {
                    return;
                }
                let mapped = match *sub_state.borrow_and_update() {
                    SubscriptionState::Connecting => SyncStatus::Connecting,
                    SubscriptionState::Active => SyncStatus::Live,
                    SubscriptionState::Reconnecting => SyncStatus::Reconnecting,
                    SubscriptionState::Closed => SyncStatus::Degraded,
                };
                let _ = status_tx.send(mapped);
            }
            _ = sweep.tick() => {
                pending.purge_expired(config.pending_ttl).await;
            }
        }
    }
}

/// Apply one change-stream delivery to the store, LWW-guarded, and confirm
/// the matching fingerprint when the delivery is our own echo.
async fn apply_change(
    store: &LocalStore,
    pending: &PendingWriteRegistry,
    config: &CoordinatorConfig,
    change: &ChangeEvent,
) {
    let outcome = match (&change.kind, &change.snapshot) {
        (ChangeKind::Delete, RowSnapshot::List(prior)) => {
            store.delete_list(&prior.id, change.server_timestamp).await
        }
        (ChangeKind::Delete, RowSnapshot::Item(prior)) => {
            store
                .delete_item(&prior.list_id, &prior.id, change.server_timestamp)
                .await
        }
        (_, RowSnapshot::List(list)) => store.upsert_list(list.clone()).await,
        (_, RowSnapshot::Item(item)) => store.upsert_item(item.clone()).await,
    };

    match outcome {
        Ok(result) => {
            let confirmed = pending
                .take_match(
                    change.entity,
                    &change.entity_id,
                    change.server_timestamp,
                    config.echo_tolerance,
                )
                .await;
            if let Some(fingerprint) = confirmed {
                log::debug!(
                    "echo confirmed for {} (provisional ts {}, server ts {})",
                    fingerprint.entity_id,
                    fingerprint.local_timestamp,
                    change.server_timestamp
                );
            } else if result == WriteOutcome::StaleIgnored {
                log::debug!("stale remote change for {} dropped", change.entity_id);
            }
        }
        Err(e) => log::warn!("remote change for {} not applied: {e}", change.entity_id),
    }
}

/// Reconcile the store with the server's current rows for one list.
///
/// Server rows are LWW-applied like deliveries; local rows absent from the
/// server set are pruned unless an optimistic write for them is still
/// awaiting its echo.
async fn resync_list(
    store: &LocalStore,
    transport: &Arc<dyn Transport>,
    pending: &PendingWriteRegistry,
    list_id: &str,
) -> Result<(), TransportError> {
    let list_rows = transport.fetch_rows(Table::Lists, list_id).await?;
    let item_rows = transport.fetch_rows(Table::ListItems, list_id).await?;

    let mut server_has_list = false;
    for row in &list_rows {
        match serde_json::from_value::<ShoppingList>(row.clone()) {
            Ok(list) if list.id == list_id => {
                server_has_list = true;
                // The server may not have seen a queued delete yet; do not
                // resurrect the row the user just removed
                if pending.pending_kind(EntityType::List, list_id).await
                    == Some(ChangeKind::Delete)
                {
                    log::debug!("resync skipping list {list_id}: delete in flight");
                } else if let Err(e) = store.upsert_list(list).await {
                    log::warn!("resync list row not applied: {e}");
                }
            }
            Ok(other) => log::debug!("resync ignoring foreign list row {}", other.id),
            Err(e) => log::warn!("resync dropping bad list row: {e}"),
        }
    }

    let mut server_item_ids = HashSet::new();
    for row in &item_rows {
        match serde_json::from_value::<ListItem>(row.clone()) {
            Ok(item) => {
                server_item_ids.insert(item.id.clone());
                if pending.pending_kind(EntityType::Item, &item.id).await
                    == Some(ChangeKind::Delete)
                {
                    log::debug!("resync skipping item {}: delete in flight", item.id);
                } else if let Err(e) = store.upsert_item(item).await {
                    log::warn!("resync item row not applied: {e}");
                }
            }
            Err(e) => log::warn!("resync dropping bad item row: {e}"),
        }
    }

    for item_id in store.item_ids(list_id).await {
        if server_item_ids.contains(&item_id) {
            continue;
        }
        if pending.contains(EntityType::Item, &item_id).await {
            continue;
        }
        log::debug!("pruning item {item_id} absent from server");
        store.prune_item(list_id, &item_id).await;
    }

    if !server_has_list
        && store.get_list(list_id).await.is_some()
        && !pending.contains(EntityType::List, list_id).await
    {
        log::info!("list {list_id} deleted remotely, pruning");
        store.prune_list(list_id).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BackoffConfig;
    use crate::transport::LocalHub;
    use tokio::time::{timeout, Duration};

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            channel: ChannelConfig {
                backoff: BackoffConfig {
                    base: Duration::from_millis(10),
                    cap: Duration::from_millis(50),
                    max_retries: 1000,
                },
                ..ChannelConfig::default()
            },
            pending_ttl: Duration::from_secs(10),
            echo_tolerance: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
        }
    }

    fn coordinator(hub: &Arc<LocalHub>) -> SyncCoordinator {
        let session = Arc::new(SessionContext::new(Some("alice".into())));
        SyncCoordinator::new(hub.clone(), session, test_config())
    }

    async fn wait_live(sync: &ListSync) {
        let mut status = sync.status();
        timeout(Duration::from_secs(2), status.wait_for(|s| *s == SyncStatus::Live))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_registry_match_and_removal() {
        let registry = PendingWriteRegistry::new();
        registry
            .register(EntityType::Item, "I1", ChangeKind::Update, 1000)
            .await;

        // Server stamp past the provisional one confirms and removes
        let hit = registry
            .take_match(EntityType::Item, "I1", 1005, Duration::from_millis(50))
            .await;
        assert!(hit.is_some());
        assert!(registry.is_empty().await);

        // Nothing left to confirm
        let miss = registry
            .take_match(EntityType::Item, "I1", 1010, Duration::from_millis(50))
            .await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_registry_skew_tolerance() {
        let registry = PendingWriteRegistry::new();
        registry
            .register(EntityType::Item, "I1", ChangeKind::Update, 1000)
            .await;

        // Slightly-behind server stamp still confirms within tolerance
        let hit = registry
            .take_match(EntityType::Item, "I1", 980, Duration::from_millis(50))
            .await;
        assert!(hit.is_some());

        // Far-behind stamp does not; the fingerprint stays
        registry
            .register(EntityType::Item, "I2", ChangeKind::Insert, 1000)
            .await;
        let miss = registry
            .take_match(EntityType::Item, "I2", 900, Duration::from_millis(50))
            .await;
        assert!(miss.is_none());
        assert!(registry.contains(EntityType::Item, "I2").await);
    }

    #[tokio::test]
    async fn test_registry_purge_expired() {
        let registry = PendingWriteRegistry::new();
        registry
            .register(EntityType::List, "L1", ChangeKind::Insert, 1)
            .await;
        assert_eq!(registry.len().await, 1);

        registry.purge_expired(Duration::ZERO).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_requires_signed_in_user() {
        let hub = Arc::new(LocalHub::new());
        let session = Arc::new(SessionContext::anonymous());
        let coordinator = SyncCoordinator::new(hub, session, test_config());

        assert!(matches!(
            coordinator.create_list("Groceries").await,
            Err(SyncError::SignedOut)
        ));
    }

    #[tokio::test]
    async fn test_optimistic_write_is_immediately_visible() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);
        let sync = coordinator.attach("L1").await;
        wait_live(&sync).await;

        let mut list = ShoppingList::new("L1", "Groceries", "alice");
        list = coordinator.upsert_list(list).await.unwrap();
        assert!(list.updated_at > 0, "provisional stamp assigned");

        // Visible before any network round-trip completes
        assert_eq!(coordinator.store().get_list("L1").await.unwrap().name, "Groceries");

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_echo_confirms_fingerprint() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);
        let sync = coordinator.attach("L1").await;
        wait_live(&sync).await;

        coordinator
            .upsert_list(ShoppingList::new("L1", "Groceries", "alice"))
            .await
            .unwrap();
        coordinator.add_item("L1", "Milk", 2).await.unwrap();
        assert!(coordinator.pending_writes().await > 0);

        // Echoes come back, confirm the fingerprints, and advance the
        // stored timestamps to the server's stamps
        timeout(Duration::from_secs(2), async {
            while coordinator.pending_writes().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_remote_change_reaches_store() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);
        let sync = coordinator.attach("L1").await;
        wait_live(&sync).await;

        let mut list = ShoppingList::new("L1", "Groceries", "bob");
        list.updated_at = 100;
        hub.inject_change(Table::Lists, "L1", ChangeEvent::insert_list(list).encode())
            .await;

        let mut list_rx = coordinator.store().query("L1").await;
        timeout(Duration::from_secs(2), list_rx.wait_for(|l| l.is_some()))
            .await
            .unwrap()
            .unwrap();

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_resync_pulls_rows_written_while_detached() {
        let hub = Arc::new(LocalHub::new());

        // Rows exist on the server before we ever attach
        let mut list = ShoppingList::new("L1", "Groceries", "bob");
        list.updated_at = 50;
        hub.inject_change(Table::Lists, "L1", ChangeEvent::insert_list(list).encode())
            .await;
        let mut item = ListItem::new("I1", "L1", "Milk");
        item.updated_at = 60;
        hub.inject_change(Table::ListItems, "L1", ChangeEvent::insert_item(item).encode())
            .await;

        let coordinator = coordinator(&hub);
        let sync = coordinator.attach("L1").await;
        wait_live(&sync).await;

        let mut items_rx = coordinator.store().query_items("L1").await;
        timeout(Duration::from_secs(2), items_rx.wait_for(|rows| rows.len() == 1))
            .await
            .unwrap()
            .unwrap();

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_resync_prunes_rows_deleted_remotely() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);
        let sync = coordinator.attach("L1").await;
        wait_live(&sync).await;

        coordinator
            .upsert_list(ShoppingList::new("L1", "Groceries", "alice"))
            .await
            .unwrap();
        let item = coordinator.add_item("L1", "Milk", 1).await.unwrap();

        // Wait for the echoes so no fingerprint shields the item
        timeout(Duration::from_secs(2), async {
            while coordinator.pending_writes().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Another collaborator deletes the item while our stream is down
        hub.disconnect_all().await;
        let mut prior = item.clone();
        prior.updated_at += 1000;
        hub.inject_change(Table::ListItems, "L1", ChangeEvent::delete_item(prior).encode())
            .await;

        // Reconnect resyncs and the pruned item disappears locally
        let mut items_rx = coordinator.store().query_items("L1").await;
        timeout(Duration::from_secs(5), items_rx.wait_for(|rows| rows.is_empty()))
            .await
            .unwrap()
            .unwrap();

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_resync_respects_delete_in_flight() {
        let hub = Arc::new(LocalHub::new());

        // The server still holds the row
        let mut list = ShoppingList::new("L1", "Groceries", "alice");
        list.updated_at = 10;
        hub.inject_change(Table::Lists, "L1", ChangeEvent::insert_list(list.clone()).encode())
            .await;
        let mut item = ListItem::new("I1", "L1", "Milk");
        item.updated_at = 20;
        hub.inject_change(Table::ListItems, "L1", ChangeEvent::insert_item(item.clone()).encode())
            .await;

        // Seed the local cache, then delete the item while not subscribed:
        // the publish queues nowhere and the delete fingerprint stays open
        let coordinator = coordinator(&hub);
        coordinator.store().upsert_list(list).await.unwrap();
        coordinator.store().upsert_item(item).await.unwrap();
        coordinator.delete_item("L1", "I1").await.unwrap();
        assert!(coordinator.pending_writes().await > 0);

        // The bulk fetch still reports the item, but the in-flight delete
        // keeps it out of the store
        coordinator.resync("L1").await.unwrap();
        assert!(coordinator.store().get_item("L1", "I1").await.is_none());
        assert!(coordinator.store().get_list("L1").await.is_some());
    }

    /// Delegates to a hub but holds every bulk fetch until a permit is
    /// released, so resync stays observable mid-flight.
    struct GatedFetch {
        hub: Arc<LocalHub>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedFetch {
        async fn open_changes(
            &self,
            req: crate::protocol::SubscribeRequest,
        ) -> Result<crate::transport::TransportConn, TransportError> {
            self.hub.open_changes(req).await
        }

        async fn open_presence(
            &self,
            list_id: &str,
        ) -> Result<crate::transport::TransportConn, TransportError> {
            self.hub.open_presence(list_id).await
        }

        async fn fetch_rows(
            &self,
            table: Table,
            list_id: &str,
        ) -> Result<Vec<serde_json::Value>, TransportError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| TransportError::FetchFailed("gate closed".into()))?;
            self.hub.fetch_rows(table, list_id).await
        }
    }

    #[tokio::test]
    async fn test_activity_reports_syncing_during_resync() {
        let hub = Arc::new(LocalHub::new());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let transport = Arc::new(GatedFetch {
            hub,
            gate: gate.clone(),
        });
        let session = Arc::new(SessionContext::new(Some("alice".into())));
        let coordinator = SyncCoordinator::new(transport, session, test_config());

        let sync = coordinator.attach("L1").await;
        let mut activity = sync.activity();

        // Connecting triggers a resync whose fetch is gated shut: the
        // activity watch holds Syncing for as long as the fetch is pending
        timeout(
            Duration::from_secs(2),
            activity.wait_for(|a| *a == SyncActivity::Syncing),
        )
        .await
        .unwrap()
        .unwrap();

        // Release the gate; the resync completes and activity settles
        gate.add_permits(1);
        timeout(
            Duration::from_secs(2),
            activity.wait_for(|a| *a == SyncActivity::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        coordinator.detach(sync).await;
    }

    #[tokio::test]
    async fn test_delete_absent_item_is_noop() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);
        assert!(coordinator.delete_item("L1", "ghost").await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_releases_subscription() {
        let hub = Arc::new(LocalHub::new());
        let coordinator = coordinator(&hub);

        let sync = coordinator.attach("L1").await;
        assert_eq!(coordinator.channel().refcount("L1").await, 1);
        coordinator.detach(sync).await;
        assert_eq!(coordinator.channel().refcount("L1").await, 0);
    }
}
