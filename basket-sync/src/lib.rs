//! # basket-sync — Real-time sync engine for collaborative shopping lists
//!
//! Keeps a local queryable cache of lists and items converged with a remote
//! backend while several people edit the same list at once. Conflicts
//! resolve by last-writer-wins on the backend-assigned `updated_at`
//! timestamp; local edits apply optimistically and are reconciled when
//! their echo comes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   attach/mutate    ┌─────────────────┐
//! │     UI      │ ◄─────────────────► │ SyncCoordinator │
//! └──────┬──────┘   watch snapshots  └────────┬────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌─────────────────┐
//! │ LocalStore  │ ◄── LWW apply ──── │  RemoteChannel  │
//! │ (source of  │                    │ (per-list subs, │
//! │  truth)     │                    │  backoff, outbox)│
//! └─────────────┘                    └────────┬────────┘
//!                                             │ JSON frames
//!                                             ▼
//!                                    ┌─────────────────┐
//!                                    │    Transport    │
//!                                    │ (WebSocket or   │
//!                                    │  in-proc hub)   │
//!                                    └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — List and item rows with LWW timestamps
//! - [`protocol`] — JSON wire protocol (change-stream and presence frames)
//! - [`store`] — Local LWW-guarded cache with live `watch` queries
//! - [`transport`] — Transport seam: WebSocket and in-process loopback hub
//! - [`channel`] — Refcounted per-list subscriptions with reconnect/backoff
//! - [`coordinator`] — Optimistic writes, echo suppression, resync
//! - [`presence`] — Who-is-online tracking per list
//! - [`session`] — Signed-in user context

pub mod channel;
pub mod coordinator;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use channel::{
    BackoffConfig, ChannelConfig, ChannelError, ChannelEvent, Outbox, RemoteChannel,
    SubscriptionHandle, SubscriptionState,
};
pub use coordinator::{
    CoordinatorConfig, ListSync, PendingWrite, PendingWriteRegistry, SyncActivity,
    SyncCoordinator, SyncError, SyncStatus,
};
pub use model::{ListItem, ShoppingList};
pub use presence::{
    PresenceAggregator, PresenceChannel, PresenceConfig, PresenceEntry, PresenceHandle,
};
pub use protocol::{
    ChangeEvent, ChangeKind, EntityType, Heartbeat, PresenceDelta, PresenceFrame, ProtocolError,
    RowSnapshot, SubscribeRequest, Table,
};
pub use session::SessionContext;
pub use store::{LocalStore, StoreError, WriteOutcome};
pub use transport::{LocalHub, Transport, TransportConn, TransportError, WsTransport};
