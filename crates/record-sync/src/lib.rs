// File: record-sync/src/lib.rs
// Purpose: Main entry point for record-sync library

//! # record-sync
//!
//! Live change-feed subscriptions for records open in edit forms, with
//! field-level protection for whatever the local user is typing into.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use record_sync::{
//!     MemoryQueryCache, MemoryTransport, RecordCallbacks, RecordSubscriptionSlot, SyncConfig,
//!     SyncServices,
//! };
//! use std::sync::Arc;
//!
//! // 1. Wire the collaborators once per process
//! let config = SyncConfig::load_default()?;
//! let transport = MemoryTransport::from_config(&config.realtime);
//! let services = SyncServices::new(
//!     config,
//!     Arc::new(transport),
//!     Arc::new(MemoryQueryCache::new()),
//! );
//!
//! // 2. One slot per open form
//! let mut slot = RecordSubscriptionSlot::new(
//!     services,
//!     RecordCallbacks::new()
//!         .on_smart_update(|fields| form.set_values(fields))
//!         .on_record_deleted(|| form.close()),
//! );
//! slot.sync("categories", Some("cat-1"), true);
//!
//! // 3. Route field focus/blur through the resolver
//! let name = slot.smart_form_sync().field_handlers("name");
//! name.on_focus();
//! ```

pub mod cache;
pub mod change_tracker;
pub mod channel;
pub mod config;
pub mod conflict;
pub mod error;
pub mod item_subscription;
pub mod latest;
pub mod notify;
pub mod subscription;

// Re-export main types
pub use cache::{MemoryQueryCache, QueryCache, QueryKey};
pub use change_tracker::{
    diff_fields, structurally_equal, ChangeAction, ChangeEvent, ChangeEventDeduplicator,
    CommitMarker, Row,
};
pub use channel::{
    ChangeFilter, ChannelMessage, ChannelStatus, EventKind, MemoryTransport, RealtimeChannel,
    RealtimeTransport, RowFilter,
};
pub use config::{ItemConfig, RealtimeConfig, SyncConfig};
pub use conflict::{FieldConflictResolver, FieldHandlers, FieldValues, RemoteUpdateOutcome};
pub use error::{Result, SyncError};
pub use item_subscription::{normalize_discounts, DiscountFetcher, ItemChangeSubscription};
pub use latest::LatestRef;
pub use notify::{Notice, NoticeLevel, Notifier, TracingNotifier};
pub use subscription::{
    EventOutcome, FormBinding, RecordCallbacks, RecordChangeSubscription, RecordEventProcessor,
    RecordFeed, RecordIdentity, RecordSubscriptionSlot, SubscriptionState, SyncServices,
};
