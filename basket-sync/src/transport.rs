//! Transport seam between the sync engine and the backend.
//!
//! The engine never sees sockets directly: it opens subscriptions and gets
//! back a [`TransportConn`] — an inbound frame receiver plus an outbound
//! frame sender, both JSON. The end of the frame stream is the disconnect
//! signal; reconnecting is the channel layer's job.
//!
//! Two implementations:
//! - [`WsTransport`] — WebSocket transport, one socket per subscription,
//!   subscribe request sent as the first frame.
//! - [`LocalHub`] — in-process loopback bus with an authoritative row table,
//!   timestamp stamping on publish, and fault injection. Used by the
//!   integration tests and as an offline backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ChangeEvent, ChangeKind, Heartbeat, PresenceDelta, PresenceFrame, SubscribeRequest, Table};

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Subscription could not be opened
    ConnectFailed(String),
    /// Connection is gone
    Closed,
    /// Bulk row fetch failed
    FetchFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            TransportError::Closed => write!(f, "Connection closed"),
            TransportError::FetchFailed(e) => write!(f, "Row fetch failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One live transport subscription.
///
/// `frames` yields decoded JSON frames until the connection drops; frames
/// sent through `send` go to the backend. Dropping the connection releases
/// both directions.
pub struct TransportConn {
    pub frames: mpsc::Receiver<serde_json::Value>,
    outbound: mpsc::Sender<serde_json::Value>,
}

impl TransportConn {
    pub fn new(
        frames: mpsc::Receiver<serde_json::Value>,
        outbound: mpsc::Sender<serde_json::Value>,
    ) -> Self {
        Self { frames, outbound }
    }

    /// Send a frame upstream.
    pub async fn send(&self, frame: serde_json::Value) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Clone of the outbound sender, for publishing while the frame
    /// receiver is consumed elsewhere.
    pub fn sender(&self) -> mpsc::Sender<serde_json::Value> {
        self.outbound.clone()
    }
}

/// Abstract subscribe/publish channel to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a server-side filtered change-stream subscription.
    async fn open_changes(&self, req: SubscribeRequest) -> Result<TransportConn, TransportError>;

    /// Open the shared presence topic for a list.
    async fn open_presence(&self, list_id: &str) -> Result<TransportConn, TransportError>;

    /// Bulk-fetch the current row set for a list (resync path).
    async fn fetch_rows(
        &self,
        table: Table,
        list_id: &str,
    ) -> Result<Vec<serde_json::Value>, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket transport
// ───────────────────────────────────────────────────────────────────

/// WebSocket transport: one socket per subscription.
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Connect, optionally send a first frame, and wire reader/writer tasks.
    async fn open_socket(
        &self,
        path: &str,
        first_frame: Option<serde_json::Value>,
    ) -> Result<TransportConn, TransportError> {
        let url = format!("{}/{path}", self.base_url);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut writer, mut reader) = ws.split();

        if let Some(frame) = first_frame {
            writer
                .send(Message::Text(frame.to_string().into()))
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer
                    .send(Message::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: decode incoming frames, drop undecodable ones
        let (frames_tx, frames_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                            Ok(v) => {
                                if frames_tx.send(v).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        match serde_json::from_slice::<serde_json::Value>(&data) {
                            Ok(v) => {
                                if frames_tx.send(v).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(TransportConn::new(frames_rx, out_tx))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open_changes(&self, req: SubscribeRequest) -> Result<TransportConn, TransportError> {
        let frame = serde_json::to_value(&req)
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        self.open_socket("changes", Some(frame)).await
    }

    async fn open_presence(&self, list_id: &str) -> Result<TransportConn, TransportError> {
        self.open_socket(&format!("presence/{list_id}"), None).await
    }

    async fn fetch_rows(
        &self,
        table: Table,
        list_id: &str,
    ) -> Result<Vec<serde_json::Value>, TransportError> {
        let req = SubscribeRequest::for_list(table, list_id);
        let mut conn = self
            .open_socket("rows", Some(serde_json::to_value(&req).unwrap_or_default()))
            .await?;
        // Single response frame: { "rows": [ ...rows ] }
        match conn.frames.recv().await {
            Some(v) => v
                .get("rows")
                .and_then(|r| r.as_array())
                .cloned()
                .ok_or_else(|| TransportError::FetchFailed("response missing rows".into())),
            None => Err(TransportError::FetchFailed("connection closed".into())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process loopback hub
// ───────────────────────────────────────────────────────────────────

/// In-process backend: authoritative row tables, change fan-out, presence
/// topics. Published changes are restamped with a monotonic timestamp before
/// being stored and echoed to every subscriber — including the publisher,
/// which is exactly the echo the coordinator must suppress.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    changes: RwLock<HashMap<(Table, String), broadcast::Sender<serde_json::Value>>>,
    presence: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    rows: RwLock<HashMap<(Table, String), HashMap<String, serde_json::Value>>>,
    tracked: RwLock<HashMap<String, HashSet<String>>>,
    clock: AtomicI64,
    down: AtomicBool,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                changes: RwLock::new(HashMap::new()),
                presence: RwLock::new(HashMap::new()),
                rows: RwLock::new(HashMap::new()),
                tracked: RwLock::new(HashMap::new()),
                clock: AtomicI64::new(0),
                down: AtomicBool::new(false),
            }),
        }
    }

    /// Refuse new subscriptions and fetches while true.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    /// Drop every live subscription, simulating a transport failure.
    /// Row tables survive; clients are expected to reconnect and resync.
    pub async fn disconnect_all(&self) {
        self.inner.changes.write().await.clear();
        self.inner.presence.write().await.clear();
    }

    /// Deliver a change as if another collaborator had written it.
    ///
    /// The frame's timestamps are taken verbatim (tests pick them); the hub
    /// clock is advanced so later published writes stamp newer.
    pub async fn inject_change(&self, table: Table, list_id: &str, frame: serde_json::Value) {
        if let Ok(ev) = ChangeEvent::decode(table, &frame) {
            self.inner.clock.fetch_max(ev.server_timestamp, Ordering::SeqCst);
        }
        self.inner.apply_frame(table, list_id, &frame).await;
        self.inner.broadcast_change(table, list_id, frame).await;
    }

    /// Current hub timestamp, for tests.
    pub fn clock(&self) -> i64 {
        self.inner.clock.load(Ordering::SeqCst)
    }

    /// Emit a raw presence frame to a list's topic (tests).
    pub async fn emit_presence(&self, list_id: &str, frame: serde_json::Value) {
        if let Some(tx) = self.inner.presence.read().await.get(list_id) {
            let _ = tx.send(frame);
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl HubInner {
    fn next_stamp(&self, at_least: i64) -> i64 {
        let mut cur = self.clock.load(Ordering::SeqCst);
        loop {
            let next = cur.max(at_least) + 1;
            match self
                .clock
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(seen) => cur = seen,
            }
        }
    }

    async fn change_topic(&self, table: Table, list_id: &str) -> broadcast::Sender<serde_json::Value> {
        let key = (table, list_id.to_string());
        let mut topics = self.changes.write().await;
        topics
            .entry(key)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    async fn presence_topic(&self, list_id: &str) -> broadcast::Sender<serde_json::Value> {
        let mut topics = self.presence.write().await;
        topics
            .entry(list_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    async fn broadcast_change(&self, table: Table, list_id: &str, frame: serde_json::Value) {
        let key = (table, list_id.to_string());
        if let Some(tx) = self.changes.read().await.get(&key) {
            let _ = tx.send(frame);
        }
    }

    /// Apply a delivery frame to the authoritative row table.
    async fn apply_frame(&self, table: Table, list_id: &str, frame: &serde_json::Value) {
        let ev = match ChangeEvent::decode(table, frame) {
            Ok(ev) => ev,
            Err(e) => {
                log::warn!("hub dropping undecodable publish: {e}");
                return;
            }
        };
        let key = (table, list_id.to_string());
        let mut rows = self.rows.write().await;
        let table_rows = rows.entry(key).or_default();
        match ev.kind {
            ChangeKind::Delete => {
                table_rows.remove(&ev.entity_id);
            }
            _ => {
                let row = frame.get("record").cloned().unwrap_or_default();
                table_rows.insert(ev.entity_id.clone(), row);
            }
        }
    }

    /// Restamp a published frame with an authoritative timestamp.
    fn restamp(&self, frame: &mut serde_json::Value) {
        let field = if frame.get("record").is_some() {
            "record"
        } else {
            "old_record"
        };
        if let Some(row) = frame.get_mut(field) {
            let provisional = row.get("updated_at").and_then(|v| v.as_i64()).unwrap_or(0);
            let assigned = self.next_stamp(provisional);
            row["updated_at"] = serde_json::json!(assigned);
        }
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn open_changes(&self, req: SubscribeRequest) -> Result<TransportConn, TransportError> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("hub is down".into()));
        }
        let list_id = list_id_from_filter(&req.filter)
            .ok_or_else(|| TransportError::ConnectFailed(format!("bad filter: {}", req.filter)))?;
        let table = req.table;
        let topic = self.inner.change_topic(table, &list_id).await;
        let mut topic_rx = topic.subscribe();

        // Inbound: fan topic frames out to this subscriber
        let (frames_tx, frames_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match topic_rx.recv().await {
                    Ok(frame) => {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("hub subscriber lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Outbound: published frames become authoritative rows and echo back
        let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(256);
        let inner = self.inner.clone();
        let out_list = list_id.clone();
        tokio::spawn(async move {
            while let Some(mut frame) = out_rx.recv().await {
                inner.restamp(&mut frame);
                inner.apply_frame(table, &out_list, &frame).await;
                inner.broadcast_change(table, &out_list, frame).await;
            }
        });

        Ok(TransportConn::new(frames_rx, out_tx))
    }

    async fn open_presence(&self, list_id: &str) -> Result<TransportConn, TransportError> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("hub is down".into()));
        }
        let topic = self.inner.presence_topic(list_id).await;
        let mut topic_rx = topic.subscribe();

        let (frames_tx, frames_rx) = mpsc::channel(256);

        // Baseline of currently tracked users, delivered first
        {
            let tracked = self.inner.tracked.read().await;
            if let Some(users) = tracked.get(list_id) {
                if !users.is_empty() {
                    let baseline = PresenceFrame::Baseline(
                        users
                            .iter()
                            .map(|u| (u.clone(), crate::protocol::PresenceRef::default()))
                            .collect(),
                    );
                    let _ = frames_tx.send(baseline.encode()).await;
                }
            }
        }

        tokio::spawn(async move {
            loop {
                match topic_rx.recv().await {
                    Ok(frame) => {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Outbound heartbeats: first one registers the user and announces a
        // join; closing the connection announces a leave.
        let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(64);
        let inner = self.inner.clone();
        let topic_list = list_id.to_string();
        tokio::spawn(async move {
            let mut user: Option<String> = None;
            while let Some(frame) = out_rx.recv().await {
                let hb = match Heartbeat::decode(&frame) {
                    Ok(hb) => hb,
                    Err(e) => {
                        log::warn!("hub dropping bad heartbeat: {e}");
                        continue;
                    }
                };
                if user.is_none() {
                    user = Some(hb.user_id.clone());
                    inner
                        .tracked
                        .write()
                        .await
                        .entry(topic_list.clone())
                        .or_default()
                        .insert(hb.user_id.clone());
                }
                // Every heartbeat re-announces the join; folding is idempotent
                let delta = PresenceFrame::Delta(PresenceDelta::join(hb.user_id));
                if let Some(tx) = inner.presence.read().await.get(&topic_list) {
                    let _ = tx.send(delta.encode());
                }
            }
            if let Some(user_id) = user {
                if let Some(users) = inner.tracked.write().await.get_mut(&topic_list) {
                    users.remove(&user_id);
                }
                let delta = PresenceFrame::Delta(PresenceDelta::leave(user_id));
                if let Some(tx) = inner.presence.read().await.get(&topic_list) {
                    let _ = tx.send(delta.encode());
                }
            }
        });

        Ok(TransportConn::new(frames_rx, out_tx))
    }

    async fn fetch_rows(
        &self,
        table: Table,
        list_id: &str,
    ) -> Result<Vec<serde_json::Value>, TransportError> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(TransportError::FetchFailed("hub is down".into()));
        }
        let rows = self.inner.rows.read().await;
        let key = (table, list_id.to_string());
        let mut out: Vec<(String, serde_json::Value)> = rows
            .get(&key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }
}

/// Extract the list id from a `list_id=eq.<id>` filter.
fn list_id_from_filter(filter: &str) -> Option<String> {
    filter
        .strip_prefix("list_id=eq.")
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.to_string())
}
