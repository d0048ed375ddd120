//! Local queryable cache of lists and items — the single source of truth
//! for the UI.
//!
//! Every point write is guarded by the entity's stored `updated_at`:
//! a write lands only if its timestamp is strictly newer (last-writer-wins),
//! otherwise it reports [`WriteOutcome::StaleIgnored`] as a no-op, not an
//! error. All writes to one list's aggregate are serialized behind a per-list
//! async mutex so a multi-row write is never observed half-applied; different
//! lists proceed in parallel.
//!
//! Observers query through tokio `watch` receivers: live, lazily updated,
//! restartable snapshot sequences that release immediately when dropped.
//! A write that changes only `updated_at` (an echoed optimistic write)
//! updates the stored row but does not re-broadcast a snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};

use crate::model::{ListItem, ShoppingList};

/// Outcome of a guarded point write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write landed; observers were notified if row content changed.
    Applied,
    /// Incoming timestamp was not strictly newer than the stored row.
    StaleIgnored,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Item references a list that does not exist at apply time
    ConstraintViolation(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConstraintViolation(e) => write!(f, "Constraint violation: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// All state for one list's aggregate, guarded by a single mutex.
struct ListState {
    list: Option<ShoppingList>,
    items: HashMap<String, ListItem>,
    list_tx: watch::Sender<Option<ShoppingList>>,
    items_tx: watch::Sender<Vec<ListItem>>,
}

impl ListState {
    fn new() -> Self {
        let (list_tx, _) = watch::channel(None);
        let (items_tx, _) = watch::channel(Vec::new());
        Self {
            list: None,
            items: HashMap::new(),
            list_tx,
            items_tx,
        }
    }

    fn publish_list(&self) {
        let _ = self.list_tx.send(self.list.clone());
    }

    fn publish_items(&self) {
        let mut rows: Vec<ListItem> = self.items.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let _ = self.items_tx.send(rows);
    }
}

/// The local store.
///
/// Keyed by list id; each list's state is created lazily on first touch and
/// lives for the app session. Deletes clear the rows but keep the entry and
/// its watch senders, so receivers held across a delete stay valid; there
/// is no eviction.
pub struct LocalStore {
    lists: RwLock<HashMap<String, Arc<Mutex<ListState>>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the per-list state.
    async fn state_for(&self, list_id: &str) -> Arc<Mutex<ListState>> {
        // Fast path: read lock
        {
            let lists = self.lists.read().await;
            if let Some(state) = lists.get(list_id) {
                return state.clone();
            }
        }

        // Slow path: write lock to create
        let mut lists = self.lists.write().await;
        // Double-check after acquiring write lock
        if let Some(state) = lists.get(list_id) {
            return state.clone();
        }
        let state = Arc::new(Mutex::new(ListState::new()));
        lists.insert(list_id.to_string(), state.clone());
        state
    }

    /// Upsert a list row, guarded by `updated_at`.
    pub async fn upsert_list(&self, list: ShoppingList) -> Result<WriteOutcome, StoreError> {
        let state = self.state_for(&list.id).await;
        let mut st = state.lock().await;
        match &st.list {
            Some(current) if list.updated_at <= current.updated_at => {
                log::debug!("stale list write ignored: {} ts {}", list.id, list.updated_at);
                Ok(WriteOutcome::StaleIgnored)
            }
            Some(current) => {
                let visible = !current.same_content(&list);
                st.list = Some(list);
                if visible {
                    st.publish_list();
                }
                Ok(WriteOutcome::Applied)
            }
            None => {
                st.list = Some(list);
                st.publish_list();
                Ok(WriteOutcome::Applied)
            }
        }
    }

    /// Upsert an item row, guarded by `updated_at`.
    ///
    /// Rejects items whose parent list is not present.
    pub async fn upsert_item(&self, item: ListItem) -> Result<WriteOutcome, StoreError> {
        let state = self.state_for(&item.list_id).await;
        let mut st = state.lock().await;
        if st.list.is_none() {
            return Err(StoreError::ConstraintViolation(format!(
                "item {} references missing list {}",
                item.id, item.list_id
            )));
        }
        match st.items.get(&item.id) {
            Some(current) if item.updated_at <= current.updated_at => {
                log::debug!("stale item write ignored: {} ts {}", item.id, item.updated_at);
                Ok(WriteOutcome::StaleIgnored)
            }
            Some(current) => {
                let visible = !current.same_content(&item);
                st.items.insert(item.id.clone(), item);
                if visible {
                    st.publish_items();
                }
                Ok(WriteOutcome::Applied)
            }
            None => {
                st.items.insert(item.id.clone(), item);
                st.publish_items();
                Ok(WriteOutcome::Applied)
            }
        }
    }

    /// Delete an item once timestamp ordering is satisfied.
    pub async fn delete_item(
        &self,
        list_id: &str,
        item_id: &str,
        timestamp: i64,
    ) -> Result<WriteOutcome, StoreError> {
        let state = self.state_for(list_id).await;
        let mut st = state.lock().await;
        match st.items.get(item_id) {
            Some(current) if timestamp <= current.updated_at => Ok(WriteOutcome::StaleIgnored),
            Some(_) => {
                st.items.remove(item_id);
                st.publish_items();
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::StaleIgnored),
        }
    }

    /// Delete a list and its items once timestamp ordering is satisfied.
    pub async fn delete_list(
        &self,
        list_id: &str,
        timestamp: i64,
    ) -> Result<WriteOutcome, StoreError> {
        let state = self.state_for(list_id).await;
        let mut st = state.lock().await;
        match &st.list {
            Some(current) if timestamp <= current.updated_at => Ok(WriteOutcome::StaleIgnored),
            Some(_) => {
                st.list = None;
                st.items.clear();
                st.publish_list();
                st.publish_items();
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::StaleIgnored),
        }
    }

    /// Remove an item without a timestamp guard.
    ///
    /// Used by resync when the server's row set no longer contains the item:
    /// the authoritative set wins over whatever the local cache holds.
    pub async fn prune_item(&self, list_id: &str, item_id: &str) {
        let state = self.state_for(list_id).await;
        let mut st = state.lock().await;
        if st.items.remove(item_id).is_some() {
            st.publish_items();
        }
    }

    /// Remove a list and its items without a timestamp guard (resync only).
    pub async fn prune_list(&self, list_id: &str) {
        let state = self.state_for(list_id).await;
        let mut st = state.lock().await;
        if st.list.take().is_some() || !st.items.is_empty() {
            st.items.clear();
            st.publish_list();
            st.publish_items();
        }
    }

    /// Live snapshot sequence of the list row.
    pub async fn query(&self, list_id: &str) -> watch::Receiver<Option<ShoppingList>> {
        let state = self.state_for(list_id).await;
        let st = state.lock().await;
        st.list_tx.subscribe()
    }

    /// Live snapshot sequence of the list's items, sorted by id.
    pub async fn query_items(&self, list_id: &str) -> watch::Receiver<Vec<ListItem>> {
        let state = self.state_for(list_id).await;
        let st = state.lock().await;
        st.items_tx.subscribe()
    }

    /// Point read of the list row.
    pub async fn get_list(&self, list_id: &str) -> Option<ShoppingList> {
        let state = self.state_for(list_id).await;
        let st = state.lock().await;
        st.list.clone()
    }

    /// Point read of one item.
    pub async fn get_item(&self, list_id: &str, item_id: &str) -> Option<ListItem> {
        let state = self.state_for(list_id).await;
        let st = state.lock().await;
        st.items.get(item_id).cloned()
    }

    /// Ids of all cached items for a list.
    pub async fn item_ids(&self, list_id: &str) -> Vec<String> {
        let state = self.state_for(list_id).await;
        let st = state.lock().await;
        st.items.keys().cloned().collect()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}
