// File: record-sync/src/subscription.rs
// Purpose: Change-feed subscription for the record open in a form

//! One [`RecordChangeSubscription`] owns one channel bound to a single
//! (table, primary key) pair. Incoming events are deduplicated, diffed and
//! routed through the form's [`FieldConflictResolver`]; dependent queries
//! are invalidated and the owner's callbacks are invoked.
//!
//! Callbacks are read through a [`LatestRef`] cell at call time. Replacing
//! them never recreates the channel; only a change of table, id or the
//! enabled flag does (see [`RecordSubscriptionSlot::sync`]).
//!
//! Events for one subscription are handled sequentially on a single Tokio
//! task, in transport delivery order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cache::{QueryCache, QueryKey};
use crate::change_tracker::{diff_fields, ChangeAction, ChangeEvent, ChangeEventDeduplicator};
use crate::channel::{
    ChangeFilter, ChannelMessage, ChannelStatus, EventKind, RealtimeChannel, RealtimeTransport,
    RowFilter,
};
use crate::config::SyncConfig;
use crate::conflict::{ApplyFn, FieldConflictResolver, FieldValues, RemoteUpdateOutcome};
use crate::error::Result;
use crate::latest::LatestRef;
use crate::notify::{Notice, Notifier, TracingNotifier};

pub type UpdatedFn = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type DeletedFn = Arc<dyn Fn() + Send + Sync>;

/// Callbacks supplied by the form that owns a subscription
#[derive(Clone, Default)]
pub struct RecordCallbacks {
    on_record_updated: Option<UpdatedFn>,
    on_record_deleted: Option<DeletedFn>,
    on_smart_update: Option<ApplyFn>,
}

impl RecordCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the raw event after every processed update
    pub fn on_record_updated<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.on_record_updated = Some(Arc::new(f));
        self
    }

    /// Called once when the record is deleted remotely
    pub fn on_record_deleted<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_record_deleted = Some(Arc::new(f));
        self
    }

    /// Writes resolved field values into the form
    pub fn on_smart_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&FieldValues) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_smart_update = Some(Arc::new(f));
        self
    }

    fn record_updated(&self, event: &ChangeEvent) {
        if let Some(callback) = &self.on_record_updated {
            callback(event);
        }
    }

    fn record_deleted(&self) {
        if let Some(callback) = &self.on_record_deleted {
            callback();
        }
    }

    fn smart_update(&self, fields: &FieldValues) -> anyhow::Result<()> {
        match &self.on_smart_update {
            Some(callback) => callback(fields),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RecordCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCallbacks")
            .field("on_record_updated", &self.on_record_updated.is_some())
            .field("on_record_deleted", &self.on_record_deleted.is_some())
            .field("on_smart_update", &self.on_smart_update.is_some())
            .finish()
    }
}

/// State owned by one form instance: its callbacks cell and its resolver.
///
/// Cloning shares both.
#[derive(Clone)]
pub struct FormBinding {
    callbacks: LatestRef<RecordCallbacks>,
    resolver: Arc<FieldConflictResolver>,
}

impl FormBinding {
    pub fn new(callbacks: RecordCallbacks) -> Self {
        let callbacks = LatestRef::new(callbacks);
        let cell = callbacks.clone();
        let resolver = FieldConflictResolver::new(move |fields| cell.get().smart_update(fields));

        Self {
            callbacks,
            resolver: Arc::new(resolver),
        }
    }

    /// Swap callbacks; subscriptions pick them up on the next event
    pub fn set_callbacks(&self, callbacks: RecordCallbacks) {
        self.callbacks.set(callbacks);
    }

    pub fn callbacks(&self) -> Arc<RecordCallbacks> {
        self.callbacks.get()
    }

    pub fn smart_form_sync(&self) -> &Arc<FieldConflictResolver> {
        &self.resolver
    }
}

/// Collaborators shared by every subscription in the process
#[derive(Clone)]
pub struct SyncServices {
    pub config: Arc<SyncConfig>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub cache: Arc<dyn QueryCache>,
    pub notifier: Arc<dyn Notifier>,
}

impl SyncServices {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn RealtimeTransport>,
        cache: Arc<dyn QueryCache>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            cache,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// The (table, primary key) pair a subscription tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordIdentity {
    pub table: String,
    pub id: String,
}

impl RecordIdentity {
    pub fn new(table: &str, id: &str) -> Self {
        Self {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    /// Deterministic channel name, stable across remounts
    pub fn channel_name(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.table, self.id)
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Lifecycle of a subscription's channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Subscribed,
    /// Degraded: no retry happens at this layer
    ChannelError(String),
    Unsubscribed,
}

impl SubscriptionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SubscriptionState::Subscribed)
    }
}

/// What processing one event amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Same commit as the previous event
    Duplicate,
    Updated(RemoteUpdateOutcome),
    Deleted,
    /// Not an update or delete of the tracked row
    Ignored,
}

/// Synchronous event-handling core of a record subscription
pub struct RecordEventProcessor {
    identity: RecordIdentity,
    primary_key: String,
    dedup: ChangeEventDeduplicator,
    structural_keys: HashSet<String>,
    binding: FormBinding,
    cache: Arc<dyn QueryCache>,
    notifier: Arc<dyn Notifier>,
    detail_keys: Vec<QueryKey>,
    refetch_list: bool,
    deleted: bool,
}

impl RecordEventProcessor {
    pub fn new(services: &SyncServices, identity: RecordIdentity, binding: FormBinding) -> Self {
        let detail_keys = vec![QueryKey::detail(&identity.table, &identity.id)];

        Self {
            identity,
            primary_key: services.config.realtime.primary_key.clone(),
            dedup: ChangeEventDeduplicator::new(),
            structural_keys: HashSet::new(),
            binding,
            cache: Arc::clone(&services.cache),
            notifier: Arc::clone(&services.notifier),
            detail_keys,
            refetch_list: false,
            deleted: false,
        }
    }

    /// Fields compared by structural equality when diffing
    pub fn with_structural_keys(mut self, keys: HashSet<String>) -> Self {
        self.structural_keys = keys;
        self
    }

    /// Additional detail query invalidated on every processed update
    pub fn with_detail_key(mut self, key: QueryKey) -> Self {
        self.detail_keys.push(key);
        self
    }

    /// Refetch the list query right after invalidating it
    pub fn with_list_refetch(mut self, enabled: bool) -> Self {
        self.refetch_list = enabled;
        self
    }

    pub fn identity(&self) -> &RecordIdentity {
        &self.identity
    }

    /// Process one event from the primary feed.
    ///
    /// An apply-callback failure is returned after caches were invalidated
    /// and the update callback ran.
    pub fn handle(&mut self, event: &ChangeEvent) -> Result<EventOutcome> {
        if !self.targets_record(event) {
            return Ok(EventOutcome::Ignored);
        }

        match event.event_type {
            ChangeAction::Update => self.handle_update(event),
            ChangeAction::Delete => Ok(self.handle_delete(event)),
            // Not bound by the subscriptions; the record already exists.
            ChangeAction::Insert => Ok(EventOutcome::Ignored),
        }
    }

    // Trust the channel filter when the payload omits the key.
    fn targets_record(&self, event: &ChangeEvent) -> bool {
        event.table == self.identity.table
            && event
                .column_text(&self.primary_key)
                .map_or(true, |id| id == self.identity.id)
    }

    fn handle_update(&mut self, event: &ChangeEvent) -> Result<EventOutcome> {
        if !self.dedup.should_process(&event.commit_timestamp) {
            return Ok(EventOutcome::Duplicate);
        }

        let diff = diff_fields(
            event.old_row.as_ref(),
            event.new_row.as_ref(),
            &self.structural_keys,
        );
        tracing::debug!(
            "{} changed {} field(s) in commit {}",
            self.identity,
            diff.len(),
            event.commit_timestamp
        );

        let resolved = if diff.is_empty() {
            Ok(RemoteUpdateOutcome::default())
        } else {
            self.binding.smart_form_sync().handle_remote_update(diff)
        };

        // List views must reflect the write even when no form field changed
        self.invalidate_list();
        for key in &self.detail_keys {
            self.cache.invalidate_queries(key);
        }
        self.binding.callbacks().record_updated(event);

        Ok(EventOutcome::Updated(resolved?))
    }

    fn handle_delete(&mut self, event: &ChangeEvent) -> EventOutcome {
        // A delete may share its commit marker with an update of the same
        // transaction, so only the latch decides.
        if self.deleted {
            tracing::debug!("{} already deleted, ignoring {}", self.identity, event.commit_timestamp);
            return EventOutcome::Duplicate;
        }
        self.deleted = true;

        tracing::warn!("{} was deleted remotely", self.identity);
        self.notifier
            .notify(Notice::record_deleted(&self.identity.table, &self.identity.id));
        self.cache.invalidate_queries(&QueryKey::list(&self.identity.table));
        self.binding.callbacks().record_deleted();

        EventOutcome::Deleted
    }

    fn invalidate_list(&self) {
        let list = QueryKey::list(&self.identity.table);
        self.cache.invalidate_queries(&list);
        if self.refetch_list {
            self.cache.refetch_queries(&list);
        }
    }
}

/// Receiver of change events from a channel's event loop
pub(crate) trait ChangeHandler: Send + 'static {
    fn handle_change(&mut self, event: ChangeEvent);
}

impl ChangeHandler for RecordEventProcessor {
    fn handle_change(&mut self, event: ChangeEvent) {
        match self.handle(&event) {
            Ok(outcome) => tracing::debug!("{}: {:?}", self.identity, outcome),
            Err(err) => tracing::error!("Failed to apply change to {}: {}", self.identity, err),
        }
    }
}

/// Liveness flag of one subscription instance.
///
/// `retire` waits for any closure running under [`SubscriptionGuard::run_if_current`],
/// so nothing guarded runs once it returns.
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionGuard(Arc<Mutex<bool>>);

impl SubscriptionGuard {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    fn live(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_current(&self) -> bool {
        *self.live()
    }

    /// Run `f` while holding the flag, or return None once retired
    pub(crate) fn run_if_current<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let live = self.live();
        if !*live {
            return None;
        }
        let result = f();
        drop(live);
        Some(result)
    }

    fn retire(&self) {
        *self.live() = false;
    }
}

/// A subscribed channel plus the task draining it
pub(crate) struct LiveChannel {
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    channel: Option<Box<dyn RealtimeChannel>>,
    state: Arc<watch::Sender<SubscriptionState>>,
    task: Option<JoinHandle<()>>,
    guard: SubscriptionGuard,
}

impl LiveChannel {
    /// Create, bind and subscribe a channel. Must run inside a Tokio runtime.
    ///
    /// A failed subscribe leaves the channel registered in the
    /// `ChannelError` state.
    pub(crate) fn open<H: ChangeHandler>(
        transport: Arc<dyn RealtimeTransport>,
        name: String,
        filters: Vec<ChangeFilter>,
        handler: H,
        guard: SubscriptionGuard,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Idle);
        let state = Arc::new(state);

        let mut channel = transport.create_channel(&name);
        for filter in filters {
            channel.on(filter);
        }

        state.send_replace(SubscriptionState::Subscribing);
        let task = match channel.subscribe() {
            Ok(rx) => {
                tracing::info!("Subscribing to channel {}", name);
                Some(tokio::spawn(run_channel(
                    name.clone(),
                    rx,
                    handler,
                    Arc::clone(&state),
                    guard.clone(),
                )))
            }
            Err(err) => {
                tracing::warn!("Channel {} failed to subscribe: {}", name, err);
                state.send_replace(SubscriptionState::ChannelError(err.to_string()));
                None
            }
        };

        Self {
            name,
            transport,
            channel: Some(channel),
            state,
            task,
            guard,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Unsubscribe and release the channel. Idempotent.
    pub(crate) fn close(&mut self) {
        self.guard.retire();

        if let Some(task) = self.task.take() {
            task.abort();
        }

        if let Some(mut channel) = self.channel.take() {
            channel.unsubscribe();
            self.transport.remove_channel(channel);
            tracing::info!("Closed channel {}", self.name);
        }

        self.state.send_replace(SubscriptionState::Unsubscribed);
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel<H: ChangeHandler>(
    name: String,
    mut rx: mpsc::Receiver<ChannelMessage>,
    mut handler: H,
    state: Arc<watch::Sender<SubscriptionState>>,
    guard: SubscriptionGuard,
) {
    while let Some(message) = rx.recv().await {
        if !guard.is_current() {
            break;
        }

        match message {
            ChannelMessage::Status(ChannelStatus::Subscribed) => {
                tracing::debug!("Channel {} subscribed", name);
                advance_state(&state, SubscriptionState::Subscribed);
            }
            ChannelMessage::Status(ChannelStatus::ChannelError(reason)) => {
                tracing::warn!("Channel {} error: {}", name, reason);
                advance_state(&state, SubscriptionState::ChannelError(reason));
            }
            ChannelMessage::Status(ChannelStatus::TimedOut) => {
                tracing::warn!("Channel {} timed out", name);
                advance_state(&state, SubscriptionState::ChannelError("timed out".to_string()));
            }
            ChannelMessage::Status(ChannelStatus::Closed) => {
                advance_state(&state, SubscriptionState::Unsubscribed);
                break;
            }
            ChannelMessage::Change(event) => handler.handle_change(event),
        }
    }

    tracing::debug!("Event loop for channel {} finished", name);
}

// Never leave Unsubscribed once a close happened.
fn advance_state(state: &watch::Sender<SubscriptionState>, next: SubscriptionState) {
    state.send_if_modified(|current| {
        if *current == SubscriptionState::Unsubscribed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// A live feed for one record, as held by a [`RecordSubscriptionSlot`]
pub trait RecordFeed: Send {
    fn identity(&self) -> &RecordIdentity;
    fn state(&self) -> SubscriptionState;
    fn close(&mut self);

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

/// Generic subscription for one record of any table
pub struct RecordChangeSubscription {
    identity: RecordIdentity,
    binding: FormBinding,
    live: LiveChannel,
}

impl RecordChangeSubscription {
    /// Open a subscription. Must run inside a Tokio runtime.
    pub fn open(services: &SyncServices, identity: RecordIdentity, binding: FormBinding) -> Self {
        let realtime = &services.config.realtime;
        let name = identity.channel_name(&realtime.channel_prefix);
        let row = RowFilter::eq(&realtime.primary_key, &identity.id);
        let filters = vec![
            ChangeFilter::new(&realtime.schema, &identity.table, EventKind::Update)
                .with_filter(row.clone()),
            ChangeFilter::new(&realtime.schema, &identity.table, EventKind::Delete)
                .with_filter(row),
        ];

        let processor = RecordEventProcessor::new(services, identity.clone(), binding.clone());
        let live = LiveChannel::open(
            Arc::clone(&services.transport),
            name,
            filters,
            processor,
            SubscriptionGuard::new(),
        );

        Self {
            identity,
            binding,
            live,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.live.name()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.live.watch()
    }

    pub fn smart_form_sync(&self) -> &Arc<FieldConflictResolver> {
        self.binding.smart_form_sync()
    }

    /// Swap callbacks without touching the channel
    pub fn set_callbacks(&self, callbacks: RecordCallbacks) {
        self.binding.set_callbacks(callbacks);
    }
}

impl RecordFeed for RecordChangeSubscription {
    fn identity(&self) -> &RecordIdentity {
        &self.identity
    }

    fn state(&self) -> SubscriptionState {
        self.live.state()
    }

    fn close(&mut self) {
        self.live.close();
    }
}

type Opener<S> = Box<dyn Fn(&RecordIdentity, &FormBinding) -> S + Send + Sync>;

/// Holds at most one live subscription for a form instance and recreates it
/// only when the tracked identity changes.
pub struct RecordSubscriptionSlot<S: RecordFeed = RecordChangeSubscription> {
    binding: FormBinding,
    opener: Opener<S>,
    fixed_table: Option<String>,
    /// Requested identity and the feed opened for it
    current: Option<(RecordIdentity, S)>,
}

impl RecordSubscriptionSlot<RecordChangeSubscription> {
    pub fn new(services: SyncServices, callbacks: RecordCallbacks) -> Self {
        Self::with_opener(callbacks, move |identity, binding| {
            RecordChangeSubscription::open(&services, identity.clone(), binding.clone())
        })
    }
}

impl<S: RecordFeed> RecordSubscriptionSlot<S> {
    pub fn with_opener<F>(callbacks: RecordCallbacks, opener: F) -> Self
    where
        F: Fn(&RecordIdentity, &FormBinding) -> S + Send + Sync + 'static,
    {
        Self {
            binding: FormBinding::new(callbacks),
            opener: Box::new(opener),
            fixed_table: None,
            current: None,
        }
    }

    /// Track only `table`; any other table passed to `sync` is replaced
    pub fn with_fixed_table(mut self, table: &str) -> Self {
        self.fixed_table = Some(table.to_string());
        self
    }

    pub fn fixed_table(&self) -> Option<&str> {
        self.fixed_table.as_deref()
    }

    /// Reconcile with the owner's current table, id and enabled flag.
    ///
    /// Returns true when a new subscription was opened. Deferred values of
    /// the previous record are discarded on an identity change.
    pub fn sync(&mut self, table: &str, id: Option<&str>, enabled: bool) -> bool {
        let table = match &self.fixed_table {
            Some(fixed) if fixed != table => {
                tracing::warn!("Slot is pinned to table '{}', ignoring '{}'", fixed, table);
                fixed.clone()
            }
            _ => table.to_string(),
        };
        let table = table.as_str();

        let wanted = match id {
            Some(id) if enabled && !table.is_empty() && !id.is_empty() => {
                Some(RecordIdentity::new(table, id))
            }
            _ => None,
        };

        // Compare with what was requested; an opener may normalize the identity.
        if self.current.as_ref().map(|(requested, _)| requested) == wanted.as_ref() {
            return false;
        }

        if self.current.is_some() {
            self.close();
            let discarded = self.binding.smart_form_sync().clear_pending();
            if !discarded.is_empty() {
                tracing::debug!("Discarded {} deferred field(s)", discarded.len());
            }
        }

        match wanted {
            Some(identity) => {
                let feed = (self.opener)(&identity, &self.binding);
                self.current = Some((identity, feed));
                true
            }
            None => false,
        }
    }

    /// Swap callbacks without recreating the subscription
    pub fn set_callbacks(&self, callbacks: RecordCallbacks) {
        self.binding.set_callbacks(callbacks);
    }

    pub fn current(&self) -> Option<&S> {
        self.current.as_ref().map(|(_, feed)| feed)
    }

    pub fn is_connected(&self) -> bool {
        self.current().map_or(false, |s| s.is_connected())
    }

    pub fn smart_form_sync(&self) -> &Arc<FieldConflictResolver> {
        self.binding.smart_form_sync()
    }

    /// Tear down the live subscription, if any. Idempotent.
    pub fn close(&mut self) {
        if let Some((_, mut subscription)) = self.current.take() {
            subscription.close();
        }
    }
}

impl<S: RecordFeed> Drop for RecordSubscriptionSlot<S> {
    fn drop(&mut self) {
        self.close();
    }
}
