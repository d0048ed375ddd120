//! Wire protocol for the remote change-stream and presence topic.
//!
//! Change-stream frames (JSON):
//! ```text
//! subscribe:  { "table": "list_items", "filter": "list_id=eq.<id>" }
//! delivery:   { "type": "insert"|"update", "record": { ...row } }
//!             { "type": "delete", "old_record": { ...prior row } }
//! ```
//!
//! Presence frames (JSON):
//! ```text
//! heartbeat:  { "user_id": "...", "online": true }
//! delta:      { "joins": { "<user>": {"ref": "..."} }, "leaves": { ... } }
//! baseline:   { "state": { "<user>": {"ref": "..."} } }
//! ```
//!
//! Malformed frames decode to a `ProtocolError`; callers drop and log them,
//! they are never fatal to a subscription.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{ListItem, ShoppingList};

/// Change-stream operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which aggregate a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    List,
    Item,
}

/// Backend tables carrying the two row types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    #[serde(rename = "lists")]
    Lists,
    #[serde(rename = "list_items")]
    ListItems,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Lists => "lists",
            Table::ListItems => "list_items",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Table::Lists => EntityType::List,
            Table::ListItems => EntityType::Item,
        }
    }
}

impl EntityType {
    pub fn table(&self) -> Table {
        match self {
            EntityType::List => Table::Lists,
            EntityType::Item => Table::ListItems,
        }
    }
}

/// Server-side filtered subscription request, sent as the first frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub table: Table,
    pub filter: String,
}

impl SubscribeRequest {
    /// Subscribe to one table filtered to a single list.
    pub fn for_list(table: Table, list_id: &str) -> Self {
        Self {
            table,
            filter: format!("list_id=eq.{list_id}"),
        }
    }
}

/// Full row carried by a change event.
///
/// Insert/Update carry the new row; Delete carries the prior row so the
/// consumer still sees the deleted id and its last timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum RowSnapshot {
    List(ShoppingList),
    Item(ListItem),
}

impl RowSnapshot {
    pub fn entity_id(&self) -> &str {
        match self {
            RowSnapshot::List(l) => &l.id,
            RowSnapshot::Item(i) => &i.id,
        }
    }

    pub fn list_id(&self) -> &str {
        match self {
            RowSnapshot::List(l) => &l.id,
            RowSnapshot::Item(i) => &i.list_id,
        }
    }

    pub fn updated_at(&self) -> i64 {
        match self {
            RowSnapshot::List(l) => l.updated_at,
            RowSnapshot::Item(i) => i.updated_at,
        }
    }
}

/// A decoded change-stream event. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: EntityType,
    pub entity_id: String,
    pub list_id: String,
    pub snapshot: RowSnapshot,
    /// Backend-assigned timestamp of the row (epoch milliseconds).
    pub server_timestamp: i64,
}

/// Raw delivery frame before the row is typed.
#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<serde_json::Value>,
    #[serde(default)]
    old_record: Option<serde_json::Value>,
}

impl ChangeEvent {
    fn from_snapshot(kind: ChangeKind, snapshot: RowSnapshot) -> Self {
        Self {
            kind,
            entity: match snapshot {
                RowSnapshot::List(_) => EntityType::List,
                RowSnapshot::Item(_) => EntityType::Item,
            },
            entity_id: snapshot.entity_id().to_string(),
            list_id: snapshot.list_id().to_string(),
            server_timestamp: snapshot.updated_at(),
            snapshot,
        }
    }

    pub fn insert_list(list: ShoppingList) -> Self {
        Self::from_snapshot(ChangeKind::Insert, RowSnapshot::List(list))
    }

    pub fn update_list(list: ShoppingList) -> Self {
        Self::from_snapshot(ChangeKind::Update, RowSnapshot::List(list))
    }

    pub fn delete_list(prior: ShoppingList) -> Self {
        Self::from_snapshot(ChangeKind::Delete, RowSnapshot::List(prior))
    }

    pub fn insert_item(item: ListItem) -> Self {
        Self::from_snapshot(ChangeKind::Insert, RowSnapshot::Item(item))
    }

    pub fn update_item(item: ListItem) -> Self {
        Self::from_snapshot(ChangeKind::Update, RowSnapshot::Item(item))
    }

    pub fn delete_item(prior: ListItem) -> Self {
        Self::from_snapshot(ChangeKind::Delete, RowSnapshot::Item(prior))
    }

    /// Decode a delivery frame for the given table.
    pub fn decode(table: Table, frame: &serde_json::Value) -> Result<Self, ProtocolError> {
        let wire: WireChange = serde_json::from_value(frame.clone())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let row = match wire.kind {
            ChangeKind::Delete => wire.old_record,
            _ => wire.record,
        }
        .ok_or(ProtocolError::MissingRow)?;

        let snapshot = match table {
            Table::Lists => RowSnapshot::List(
                serde_json::from_value(row).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            ),
            Table::ListItems => RowSnapshot::Item(
                serde_json::from_value(row).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            ),
        };

        Ok(Self::from_snapshot(wire.kind, snapshot))
    }

    /// Encode to a delivery frame for publishing upstream.
    pub fn encode(&self) -> serde_json::Value {
        let row = match &self.snapshot {
            RowSnapshot::List(l) => serde_json::to_value(l).unwrap_or_default(),
            RowSnapshot::Item(i) => serde_json::to_value(i).unwrap_or_default(),
        };
        match self.kind {
            ChangeKind::Delete => serde_json::json!({ "type": "delete", "old_record": row }),
            ChangeKind::Insert => serde_json::json!({ "type": "insert", "record": row }),
            ChangeKind::Update => serde_json::json!({ "type": "update", "record": row }),
        }
    }

    pub fn table(&self) -> Table {
        self.entity.table()
    }
}

/// Opaque per-connection reference attached to presence deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceRef {
    #[serde(rename = "ref", default)]
    pub topic_ref: String,
}

/// Incremental presence delta: who joined, who left.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDelta {
    #[serde(default)]
    pub joins: HashMap<String, PresenceRef>,
    #[serde(default)]
    pub leaves: HashMap<String, PresenceRef>,
}

impl PresenceDelta {
    pub fn join(user_id: impl Into<String>) -> Self {
        let mut joins = HashMap::new();
        joins.insert(user_id.into(), PresenceRef::default());
        Self {
            joins,
            leaves: HashMap::new(),
        }
    }

    pub fn leave(user_id: impl Into<String>) -> Self {
        let mut leaves = HashMap::new();
        leaves.insert(user_id.into(), PresenceRef::default());
        Self {
            joins: HashMap::new(),
            leaves,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// A decoded presence frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceFrame {
    /// Incremental join/leave delta, folded into the current map.
    Delta(PresenceDelta),
    /// Full baseline reported on (re)subscribe, set-union'd into the map.
    Baseline(HashMap<String, PresenceRef>),
}

impl PresenceFrame {
    pub fn decode(frame: &serde_json::Value) -> Result<Self, ProtocolError> {
        if let Some(state) = frame.get("state") {
            let users: HashMap<String, PresenceRef> = serde_json::from_value(state.clone())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            return Ok(PresenceFrame::Baseline(users));
        }
        let delta: PresenceDelta = serde_json::from_value(frame.clone())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(PresenceFrame::Delta(delta))
    }

    pub fn encode(&self) -> serde_json::Value {
        match self {
            PresenceFrame::Delta(d) => serde_json::to_value(d).unwrap_or_default(),
            PresenceFrame::Baseline(users) => serde_json::json!({ "state": users }),
        }
    }
}

/// Heartbeat announced on the presence topic while a subscription is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub user_id: String,
    pub online: bool,
}

impl Heartbeat {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            online: true,
        }
    }

    pub fn decode(frame: &serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(frame.clone()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame did not decode as the expected shape
    Malformed(String),
    /// Delivery frame without a `record`/`old_record`
    MissingRow,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Malformed frame: {e}"),
            ProtocolError::MissingRow => write!(f, "Delivery frame missing row payload"),
        }
    }
}

impl std::error::Error for ProtocolError {}
