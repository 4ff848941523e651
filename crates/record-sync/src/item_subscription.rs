// File: record-sync/src/item_subscription.rs
// Purpose: Item subscription with a secondary per-customer discount feed

use async_trait::async_trait;
use serde_json::{Number, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::QueryKey;
use crate::change_tracker::{ChangeEvent, Row};
use crate::channel::{ChangeFilter, EventKind, RowFilter};
use crate::conflict::{FieldConflictResolver, FieldValues};
use crate::subscription::{
    ChangeHandler, FormBinding, LiveChannel, RecordCallbacks, RecordEventProcessor, RecordFeed,
    RecordIdentity, RecordSubscriptionSlot, SubscriptionGuard, SubscriptionState, SyncServices,
};

/// Loads the discount rows belonging to one item
#[async_trait]
pub trait DiscountFetcher: Send + Sync {
    async fn fetch_child_discounts(&self, item_id: &str) -> anyhow::Result<Vec<Row>>;
}

/// Coerce `discount_field` of every row to a number, 0 when unparseable
pub fn normalize_discounts(rows: Vec<Row>, discount_field: &str) -> Vec<Value> {
    rows.into_iter()
        .map(|mut row| {
            let discount = coerce_number(row.get(discount_field));
            let number = Number::from_f64(discount).unwrap_or_else(|| Number::from(0));
            row.insert(discount_field.to_string(), Value::Number(number));
            Value::Object(row)
        })
        .collect()
}

fn coerce_number(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed.filter(|n| n.is_finite()).unwrap_or(0.0)
}

/// Re-fetches the discount collection and routes it through the resolver.
///
/// A result is applied only while its subscription is still open and no
/// newer refresh has already been applied.
#[derive(Clone)]
struct DiscountRefresher {
    item_id: String,
    fetcher: Arc<dyn DiscountFetcher>,
    resolver: Arc<FieldConflictResolver>,
    discount_field: String,
    collection_field: String,
    guard: SubscriptionGuard,
    started: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
}

impl DiscountRefresher {
    fn spawn_refresh(&self) -> JoinHandle<()> {
        let ticket = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let refresher = self.clone();
        tokio::spawn(async move { refresher.refresh(ticket).await })
    }

    async fn refresh(&self, ticket: u64) {
        let rows = match self.fetcher.fetch_child_discounts(&self.item_id).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Failed to refresh discounts for item {}: {}", self.item_id, err);
                return;
            }
        };

        let discounts = normalize_discounts(rows, &self.discount_field);
        tracing::debug!("Loaded {} discount row(s) for item {}", discounts.len(), self.item_id);

        // Closing waits for this block, so nothing lands after teardown.
        let applied = self.guard.run_if_current(|| {
            if self.applied.fetch_max(ticket, Ordering::SeqCst) > ticket {
                tracing::debug!("Dropping outdated discount refresh for item {}", self.item_id);
                return;
            }
            self.apply(discounts);
        });

        if applied.is_none() {
            tracing::debug!("Dropping discount refresh for closed item {}", self.item_id);
        }
    }

    fn apply(&self, discounts: Vec<Value>) {
        let fields = FieldValues::from([(self.collection_field.clone(), Value::Array(discounts))]);
        match self.resolver.handle_remote_update(fields) {
            Ok(outcome) if outcome.has_conflicts() => {
                tracing::debug!("Discounts for item {} deferred while edited", self.item_id)
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!("Failed to apply discounts for item {}: {}", self.item_id, err)
            }
        }
    }
}

struct ItemEventRouter {
    processor: RecordEventProcessor,
    child_table: String,
    refresher: DiscountRefresher,
}

impl ChangeHandler for ItemEventRouter {
    fn handle_change(&mut self, event: ChangeEvent) {
        if event.table == self.child_table {
            // The payload is not diffed; the whole collection is reloaded
            self.refresher.spawn_refresh();
        } else {
            self.processor.handle_change(event);
        }
    }
}

/// Subscription for one item plus its discount rows
pub struct ItemChangeSubscription {
    identity: RecordIdentity,
    binding: FormBinding,
    refresher: DiscountRefresher,
    live: LiveChannel,
}

impl ItemChangeSubscription {
    /// Open a subscription. Must run inside a Tokio runtime.
    pub fn open(
        services: &SyncServices,
        fetcher: Arc<dyn DiscountFetcher>,
        item_id: &str,
        binding: FormBinding,
    ) -> Self {
        let realtime = &services.config.realtime;
        let item = &services.config.item;
        let identity = RecordIdentity::new(&item.table, item_id);

        let name = format!(
            "{}:with-{}",
            identity.channel_name(&realtime.channel_prefix),
            item.child_table
        );
        let row = RowFilter::eq(&realtime.primary_key, item_id);
        let filters = vec![
            ChangeFilter::new(&realtime.schema, &item.table, EventKind::Update)
                .with_filter(row.clone()),
            ChangeFilter::new(&realtime.schema, &item.table, EventKind::Delete).with_filter(row),
            ChangeFilter::new(&realtime.schema, &item.child_table, EventKind::All)
                .with_filter(RowFilter::eq(&item.foreign_key, item_id)),
        ];

        let guard = SubscriptionGuard::new();
        let refresher = DiscountRefresher {
            item_id: item_id.to_string(),
            fetcher,
            resolver: Arc::clone(binding.smart_form_sync()),
            discount_field: item.discount_field.clone(),
            collection_field: item.collection_field.clone(),
            guard: guard.clone(),
            started: Arc::new(AtomicU64::new(0)),
            applied: Arc::new(AtomicU64::new(0)),
        };

        let processor = RecordEventProcessor::new(services, identity.clone(), binding.clone())
            .with_structural_keys(item.structural_key_set())
            .with_detail_key(QueryKey::namespaced(&item.detail_namespace, item_id))
            .with_list_refetch(item.refetch_list_on_update);

        let router = ItemEventRouter {
            processor,
            child_table: item.child_table.clone(),
            refresher: refresher.clone(),
        };

        let live = LiveChannel::open(
            Arc::clone(&services.transport),
            name,
            filters,
            router,
            guard,
        );

        Self {
            identity,
            binding,
            refresher,
            live,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.live.name()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.live.watch()
    }

    pub fn smart_form_sync(&self) -> &Arc<FieldConflictResolver> {
        self.binding.smart_form_sync()
    }

    pub fn set_callbacks(&self, callbacks: RecordCallbacks) {
        self.binding.set_callbacks(callbacks);
    }

    /// Reload the discount collection outside of a feed event
    pub fn refresh_discounts(&self) -> JoinHandle<()> {
        self.refresher.spawn_refresh()
    }
}

impl RecordFeed for ItemChangeSubscription {
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

impl RecordSubscriptionSlot<ItemChangeSubscription> {
    /// Slot for item forms, pinned to the configured item table
    pub fn items(
        services: SyncServices,
        fetcher: Arc<dyn DiscountFetcher>,
        callbacks: RecordCallbacks,
    ) -> Self {
        let table = services.config.item.table.clone();
        Self::with_opener(callbacks, move |identity, binding| {
            ItemChangeSubscription::open(&services, Arc::clone(&fetcher), &identity.id, binding.clone())
        })
        .with_fixed_table(&table)
    }

    /// Reconcile with the item id and enabled flag of the owning form
    pub fn sync_item(&mut self, id: Option<&str>, enabled: bool) -> bool {
        let table = self.fixed_table().unwrap_or_default().to_string();
        self.sync(&table, id, enabled)
    }
}
