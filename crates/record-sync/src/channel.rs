// File: record-sync/src/channel.rs
// Purpose: Change-feed transport interface and an in-process implementation

//! A transport hands out named channels. Each channel carries one or more
//! table bindings and, once subscribed, yields [`ChannelMessage`]s in
//! delivery order: status acknowledgements and matching change events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::change_tracker::{ChangeAction, ChangeEvent};
use crate::config::RealtimeConfig;
use crate::error::{Result, SyncError};

/// Which row events a binding receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    All,
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn matches(&self, action: ChangeAction) -> bool {
        match self {
            EventKind::All => true,
            EventKind::Insert => action == ChangeAction::Insert,
            EventKind::Update => action == ChangeAction::Update,
            EventKind::Delete => action == ChangeAction::Delete,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::All => write!(f, "*"),
            EventKind::Insert => write!(f, "INSERT"),
            EventKind::Update => write!(f, "UPDATE"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Column equality filter, by primary key or by foreign key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.column_text(&self.column).as_deref() == Some(self.value.as_str())
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// One table binding on a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: EventKind,
    pub filter: Option<RowFilter>,
}

impl ChangeFilter {
    pub fn new(schema: &str, table: &str, event: EventKind) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            event,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        // Payloads without a schema are accepted for any schema
        let schema_ok = event.schema.is_empty() || event.schema == self.schema;

        schema_ok
            && event.table == self.table
            && self.event.matches(event.event_type)
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// Status reported by the transport for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Item delivered on a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

/// A named channel owned by exactly one subscription
pub trait RealtimeChannel: Send {
    fn name(&self) -> &str;

    /// Add a table binding; only valid before `subscribe`
    fn on(&mut self, filter: ChangeFilter);

    /// Start delivery. Messages arrive on the returned receiver until the
    /// channel is unsubscribed.
    fn subscribe(&mut self) -> Result<mpsc::Receiver<ChannelMessage>>;

    /// Stop delivery. Safe to call more than once.
    fn unsubscribe(&mut self);
}

/// Managed publish/subscribe service delivering row changes
pub trait RealtimeTransport: Send + Sync {
    fn create_channel(&self, name: &str) -> Box<dyn RealtimeChannel>;

    /// Release a channel created by this transport
    fn remove_channel(&self, channel: Box<dyn RealtimeChannel>);
}

struct MemorySubscriber {
    name: String,
    filters: Vec<ChangeFilter>,
    tx: mpsc::Sender<ChannelMessage>,
}

#[derive(Default)]
struct MemoryHub {
    next_id: u64,
    subscribers: HashMap<u64, MemorySubscriber>,
    created: Vec<String>,
    removed: usize,
    auto_ack: bool,
}

/// In-process transport: events passed to [`MemoryTransport::publish`] are
/// delivered to every subscribed channel with a matching binding.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Mutex<MemoryHub>>,
    capacity: usize,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        let hub = MemoryHub {
            auto_ack: true,
            ..MemoryHub::default()
        };

        Self {
            hub: Arc::new(Mutex::new(hub)),
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.event_buffer)
    }

    fn hub(&self) -> MutexGuard<'_, MemoryHub> {
        lock_hub(&self.hub)
    }

    /// When disabled, channels stay unacknowledged until
    /// [`MemoryTransport::acknowledge`] is called.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.hub().auto_ack = enabled;
    }

    /// Deliver an event; returns how many channels received it
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let hub = self.hub();
        let mut delivered = 0;

        for subscriber in hub.subscribers.values() {
            if !subscriber.filters.iter().any(|f| f.matches(event)) {
                continue;
            }

            match subscriber
                .tx
                .try_send(ChannelMessage::Change(event.clone()))
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("Dropping change for channel {}: {}", subscriber.name, e)
                }
            }
        }

        delivered
    }

    /// Send a status to every subscribed channel called `name`
    pub fn send_status(&self, name: &str, status: ChannelStatus) -> usize {
        let hub = self.hub();
        hub.subscribers
            .values()
            .filter(|s| s.name == name)
            .filter(|s| s.tx.try_send(ChannelMessage::Status(status.clone())).is_ok())
            .count()
    }

    pub fn acknowledge(&self, name: &str) -> usize {
        self.send_status(name, ChannelStatus::Subscribed)
    }

    pub fn fail_channel(&self, name: &str, reason: &str) -> usize {
        self.send_status(name, ChannelStatus::ChannelError(reason.to_string()))
    }

    /// Names of currently subscribed channels
    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hub()
            .subscribers
            .values()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every channel name handed out so far, in creation order
    pub fn created_channels(&self) -> Vec<String> {
        self.hub().created.clone()
    }

    pub fn removed_channels(&self) -> usize {
        self.hub().removed
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::from_config(&RealtimeConfig::default())
    }
}

impl RealtimeTransport for MemoryTransport {
    fn create_channel(&self, name: &str) -> Box<dyn RealtimeChannel> {
        let id = {
            let mut hub = self.hub();
            hub.next_id += 1;
            hub.created.push(name.to_string());
            hub.next_id
        };

        tracing::debug!("Created channel {}", name);

        Box::new(MemoryChannel {
            id,
            name: name.to_string(),
            filters: Vec::new(),
            hub: Arc::clone(&self.hub),
            capacity: self.capacity,
            subscribed: false,
        })
    }

    fn remove_channel(&self, mut channel: Box<dyn RealtimeChannel>) {
        channel.unsubscribe();
        self.hub().removed += 1;
        tracing::debug!("Removed channel {}", channel.name());
    }
}

fn lock_hub(hub: &Mutex<MemoryHub>) -> MutexGuard<'_, MemoryHub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel handed out by [`MemoryTransport`]
pub struct MemoryChannel {
    id: u64,
    name: String,
    filters: Vec<ChangeFilter>,
    hub: Arc<Mutex<MemoryHub>>,
    capacity: usize,
    subscribed: bool,
}

impl RealtimeChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&mut self, filter: ChangeFilter) {
        if self.subscribed {
            tracing::warn!("Ignoring binding added after subscribe on {}", self.name);
            return;
        }
        self.filters.push(filter);
    }

    fn subscribe(&mut self) -> Result<mpsc::Receiver<ChannelMessage>> {
        if self.subscribed {
            return Err(SyncError::Transport(format!(
                "channel {} is already subscribed",
                self.name
            )));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut hub = lock_hub(&self.hub);

        if hub.auto_ack {
            tx.try_send(ChannelMessage::Status(ChannelStatus::Subscribed))
                .map_err(|e| SyncError::Transport(e.to_string()))?;
        }

        hub.subscribers.insert(
            self.id,
            MemorySubscriber {
                name: self.name.clone(),
                filters: self.filters.clone(),
                tx,
            },
        );
        self.subscribed = true;

        Ok(rx)
    }

    fn unsubscribe(&mut self) {
        if lock_hub(&self.hub).subscribers.remove(&self.id).is_some() {
            tracing::debug!("Unsubscribed channel {}", self.name);
        }
    }
}
