//! Collaborator presence: who is currently online on a list.
//!
//! `track` announces this user's heartbeat on the list's shared presence
//! topic and keeps announcing on a fixed interval while the handle is held.
//! Join/leave deltas received from other participants are folded into a
//! per-list map `user_id -> online`; a peer whose heartbeats stop is flipped
//! offline after a liveness timeout (3x the heartbeat interval by default) —
//! a local policy, not a server guarantee. Deltas mutate the map in place;
//! only an explicit baseline reported on (re)subscribe is set-union'd in.
//!
//! Observers read the aggregated map through a `watch` receiver; the
//! snapshot only changes when membership or online-ness changes, not on
//! every heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::channel::BackoffConfig;
use crate::protocol::{Heartbeat, PresenceDelta, PresenceFrame, PresenceRef};
use crate::transport::Transport;

/// One collaborator's presence state. One entry per (list, user).
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub online: bool,
    pub last_seen: Instant,
}

/// Presence configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Interval between our own heartbeats.
    pub heartbeat_interval: Duration,
    /// A peer is offline after this many missed heartbeat intervals.
    pub liveness_multiplier: u32,
    /// Reconnect policy for the presence topic.
    pub backoff: BackoffConfig,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            liveness_multiplier: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PresenceConfig {
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.liveness_multiplier
    }
}

/// Folds presence deltas into the current per-list map.
pub struct PresenceAggregator {
    local_user: String,
    entries: HashMap<String, PresenceEntry>,
    snapshot_tx: watch::Sender<HashMap<String, bool>>,
}

impl PresenceAggregator {
    pub fn new(local_user: impl Into<String>) -> Self {
        let (snapshot_tx, _) = watch::channel(HashMap::new());
        Self {
            local_user: local_user.into(),
            entries: HashMap::new(),
            snapshot_tx,
        }
    }

    /// Live view of `user_id -> online`.
    pub fn snapshot(&self) -> watch::Receiver<HashMap<String, bool>> {
        self.snapshot_tx.subscribe()
    }

    /// Fold one frame observed at `now`.
    pub fn apply_at(&mut self, frame: &PresenceFrame, now: Instant) {
        match frame {
            PresenceFrame::Delta(delta) => self.fold(delta, now),
            PresenceFrame::Baseline(users) => self.merge_baseline(users, now),
        }
        self.publish();
    }

    pub fn apply(&mut self, frame: &PresenceFrame) {
        self.apply_at(frame, Instant::now());
    }

    fn fold(&mut self, delta: &PresenceDelta, now: Instant) {
        for user_id in delta.joins.keys() {
            if *user_id == self.local_user {
                continue;
            }
            self.entries
                .entry(user_id.clone())
                .and_modify(|e| {
                    e.online = true;
                    e.last_seen = now;
                })
                .or_insert_with(|| PresenceEntry {
                    user_id: user_id.clone(),
                    online: true,
                    last_seen: now,
                });
        }
        for user_id in delta.leaves.keys() {
            if *user_id == self.local_user {
                continue;
            }
            self.entries.remove(user_id);
        }
    }

    /// Set-union a reported baseline into the map.
    fn merge_baseline(&mut self, users: &HashMap<String, PresenceRef>, now: Instant) {
        let delta = PresenceDelta {
            joins: users.clone(),
            leaves: HashMap::new(),
        };
        self.fold(&delta, now);
    }

    /// Flip peers with no recent heartbeat offline. Returns true when the
    /// visible map changed.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> bool {
        let mut changed = false;
        for entry in self.entries.values_mut() {
            if entry.online && now.duration_since(entry.last_seen) > timeout {
                entry.online = false;
                changed = true;
            }
        }
        if changed {
            self.publish();
        }
        changed
    }

    /// Mark every peer offline (used when the topic is lost for good).
    pub fn all_offline(&mut self) {
        for entry in self.entries.values_mut() {
            entry.online = false;
        }
        self.publish();
    }

    pub fn entries(&self) -> &HashMap<String, PresenceEntry> {
        &self.entries
    }

    fn publish(&self) {
        let map: HashMap<String, bool> = self
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.online))
            .collect();
        self.snapshot_tx.send_if_modified(|cur| {
            if *cur != map {
                *cur = map;
                true
            } else {
                false
            }
        });
    }
}

/// Ticket returned by `track`; return it to `untrack`.
#[derive(Debug)]
pub struct PresenceHandle {
    list_id: String,
    ticket: Uuid,
}

impl PresenceHandle {
    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn ticket(&self) -> Uuid {
        self.ticket
    }
}

struct PresenceSub {
    refcount: usize,
    user_id: String,
    snapshot_rx: watch::Receiver<HashMap<String, bool>>,
    task: tokio::task::JoinHandle<()>,
}

/// Per-list presence subscriptions, shared by refcount like the
/// change-stream channel.
pub struct PresenceChannel {
    transport: Arc<dyn Transport>,
    config: PresenceConfig,
    subs: Mutex<HashMap<String, PresenceSub>>,
}

impl PresenceChannel {
    pub fn new(transport: Arc<dyn Transport>, config: PresenceConfig) -> Self {
        Self {
            transport,
            config,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Announce this user on the list's presence topic and observe the
    /// aggregated map. Observers of the same list share one subscription.
    pub async fn track(
        &self,
        list_id: &str,
        user_id: &str,
    ) -> (watch::Receiver<HashMap<String, bool>>, PresenceHandle) {
        let mut subs = self.subs.lock().await;
        if let Some(entry) = subs.get_mut(list_id) {
            if !entry.task.is_finished() {
                if entry.user_id != user_id {
                    log::debug!(
                        "presence for list {list_id} already tracked as {}; ignoring {user_id}",
                        entry.user_id
                    );
                }
                entry.refcount += 1;
                let handle = PresenceHandle {
                    list_id: list_id.to_string(),
                    ticket: Uuid::new_v4(),
                };
                return (entry.snapshot_rx.clone(), handle);
            }
            subs.remove(list_id);
        }

        let aggregator = PresenceAggregator::new(user_id);
        let snapshot_rx = aggregator.snapshot();
        let task = tokio::spawn(drive_presence(
            self.transport.clone(),
            list_id.to_string(),
            user_id.to_string(),
            aggregator,
            self.config.clone(),
        ));

        subs.insert(
            list_id.to_string(),
            PresenceSub {
                refcount: 1,
                user_id: user_id.to_string(),
                snapshot_rx: snapshot_rx.clone(),
                task,
            },
        );

        let handle = PresenceHandle {
            list_id: list_id.to_string(),
            ticket: Uuid::new_v4(),
        };
        (snapshot_rx, handle)
    }

    /// Return a handle; the shared subscription (heartbeat task, backoff
    /// timer, transport connection) is torn down at refcount zero.
    pub async fn untrack(&self, handle: PresenceHandle) {
        let mut subs = self.subs.lock().await;
        let Some(entry) = subs.get_mut(&handle.list_id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let entry = subs.remove(&handle.list_id).expect("entry present");
            entry.task.abort();
            log::debug!("presence for list {} released", handle.list_id);
        }
    }

    pub async fn refcount(&self, list_id: &str) -> usize {
        self.subs
            .lock()
            .await
            .get(list_id)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

/// Driver task for one list's presence subscription.
async fn drive_presence(
    transport: Arc<dyn Transport>,
    list_id: String,
    user_id: String,
    mut aggregator: PresenceAggregator,
    config: PresenceConfig,
) {
    let timeout = config.liveness_timeout();
    let sweep_every = (config.heartbeat_interval / 2).max(Duration::from_millis(10));
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            if attempt > config.backoff.max_retries {
                log::warn!("presence topic for list {list_id} lost, marking peers offline");
                aggregator.all_offline();
                return;
            }
            let delay = config.backoff.delay_for(attempt - 1);
            tokio::time::sleep(delay).await;
        }

        let conn = match transport.open_presence(&list_id).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("presence subscribe failed for list {list_id}: {e}");
                attempt += 1;
                continue;
            }
        };
        attempt = 0;

        let heartbeat_out = conn.sender();
        let mut frames = conn.frames;
        let heartbeat = Heartbeat::new(user_id.clone()).encode();

        let mut beat = tokio::time::interval(config.heartbeat_interval);
        let mut sweep = tokio::time::interval(sweep_every);

        loop {
            tokio::select! {
                _ = beat.tick() => {
                    if heartbeat_out.send(heartbeat.clone()).await.is_err() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    aggregator.sweep(Instant::now(), timeout);
                }
                frame = frames.recv() => match frame {
                    Some(frame) => match PresenceFrame::decode(&frame) {
                        Ok(f) => aggregator.apply(&f),
                        Err(e) => log::warn!("dropping malformed presence frame: {e}"),
                    },
                    None => break,
                },
            }
        }

        log::info!("presence topic dropped for list {list_id}");
        attempt = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use tokio::time::timeout as tokio_timeout;

    fn at(base: Instant, offset_ms: u64) -> Instant {
        base + Duration::from_millis(offset_ms)
    }

    #[test]
    fn test_fold_join_and_leave() {
        let now = Instant::now();
        let mut agg = PresenceAggregator::new("me");
        let rx = agg.snapshot();

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), now);
        assert_eq!(rx.borrow().get("alice"), Some(&true));

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::leave("alice")), now);
        assert!(rx.borrow().get("alice").is_none());
    }

    #[test]
    fn test_own_deltas_ignored() {
        let now = Instant::now();
        let mut agg = PresenceAggregator::new("me");
        let rx = agg.snapshot();

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("me")), now);
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn test_repeat_join_refreshes_silently() {
        let now = Instant::now();
        let mut agg = PresenceAggregator::new("me");
        let mut rx = agg.snapshot();

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), now);
        rx.borrow_and_update();

        // A later heartbeat join refreshes last_seen but the visible map
        // does not change
        agg.apply_at(
            &PresenceFrame::Delta(PresenceDelta::join("alice")),
            at(now, 100),
        );
        assert!(!rx.has_changed().unwrap());
        assert_eq!(agg.entries()["alice"].last_seen, at(now, 100));
    }

    #[test]
    fn test_baseline_is_union() {
        let now = Instant::now();
        let mut agg = PresenceAggregator::new("me");
        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), now);

        let mut users = HashMap::new();
        users.insert("bob".to_string(), PresenceRef::default());
        agg.apply_at(&PresenceFrame::Baseline(users), now);

        let rx = agg.snapshot();
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(rx.borrow().get("alice"), Some(&true));
        assert_eq!(rx.borrow().get("bob"), Some(&true));
    }

    #[test]
    fn test_sweep_flips_offline_after_timeout() {
        let now = Instant::now();
        let timeout = Duration::from_millis(300);
        let mut agg = PresenceAggregator::new("me");
        let rx = agg.snapshot();

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), now);

        // Within the window: still online
        assert!(!agg.sweep(at(now, 200), timeout));
        assert_eq!(rx.borrow().get("alice"), Some(&true));

        // Past the window: offline, entry kept
        assert!(agg.sweep(at(now, 400), timeout));
        assert_eq!(rx.borrow().get("alice"), Some(&false));
        assert!(agg.entries().contains_key("alice"));
    }

    #[test]
    fn test_join_after_timeout_revives() {
        let now = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut agg = PresenceAggregator::new("me");
        let rx = agg.snapshot();

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), now);
        agg.sweep(at(now, 200), timeout);
        assert_eq!(rx.borrow().get("alice"), Some(&false));

        agg.apply_at(&PresenceFrame::Delta(PresenceDelta::join("alice")), at(now, 250));
        assert_eq!(rx.borrow().get("alice"), Some(&true));
    }

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(50),
            liveness_multiplier: 3,
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
                max_retries: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_two_trackers_see_each_other() {
        let hub = Arc::new(LocalHub::new());
        let alice = PresenceChannel::new(hub.clone(), fast_config());
        let bob = PresenceChannel::new(hub.clone(), fast_config());

        let (mut alice_view, _ha) = alice.track("L1", "alice").await;
        let (mut bob_view, _hb) = bob.track("L1", "bob").await;

        tokio_timeout(Duration::from_secs(2), async {
            alice_view
                .wait_for(|m| m.get("bob") == Some(&true))
                .await
                .unwrap();
            bob_view
                .wait_for(|m| m.get("alice") == Some(&true))
                .await
                .unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stalled_heartbeat_goes_offline() {
        let hub = Arc::new(LocalHub::new());
        let channel = PresenceChannel::new(hub.clone(), fast_config());
        let (mut view, _handle) = channel.track("L1", "me").await;

        // A ghost peer joins once and never heartbeats again
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.emit_presence(
            "L1",
            PresenceFrame::Delta(PresenceDelta::join("ghost")).encode(),
        )
        .await;

        tokio_timeout(Duration::from_secs(2), view.wait_for(|m| m.get("ghost") == Some(&true)))
            .await
            .unwrap()
            .unwrap();

        // Liveness timeout (150ms) passes with no further heartbeats
        tokio_timeout(Duration::from_secs(2), view.wait_for(|m| m.get("ghost") == Some(&false)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_refcounted_tracking() {
        let hub = Arc::new(LocalHub::new());
        let channel = PresenceChannel::new(hub, fast_config());

        let (_v1, h1) = channel.track("L1", "me").await;
        let (_v2, h2) = channel.track("L1", "me").await;
        assert_eq!(channel.refcount("L1").await, 2);

        channel.untrack(h1).await;
        assert_eq!(channel.refcount("L1").await, 1);
        channel.untrack(h2).await;
        assert_eq!(channel.refcount("L1").await, 0);
    }
}
