// Integration tests for the generic record subscription
// Events travel through MemoryTransport and are handled on the subscription task.

use pretty_assertions::assert_eq;
use record_sync::{
    ChangeEvent, FieldValues, FormBinding, MemoryQueryCache, MemoryTransport, Notice, Notifier,
    QueryKey, RecordCallbacks, RecordChangeSubscription, RecordFeed, RecordIdentity,
    RecordSubscriptionSlot, Row, SubscriptionState, SyncConfig, SyncServices,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<Notice>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.0.lock().unwrap().push(notice);
    }
}

struct Harness {
    transport: MemoryTransport,
    cache: Arc<MemoryQueryCache>,
    notifier: Arc<RecordingNotifier>,
    services: SyncServices,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let transport = MemoryTransport::default();
    let cache = Arc::new(MemoryQueryCache::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let services = SyncServices::new(
        SyncConfig::default(),
        Arc::new(transport.clone()),
        cache.clone(),
    )
    .with_notifier(notifier.clone());

    Harness {
        transport,
        cache,
        notifier,
        services,
    }
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn category_update(id: &str, marker: &str, old: Value, new: Value) -> ChangeEvent {
    let mut old = row(old);
    let mut new = row(new);
    old.insert("id".to_string(), json!(id));
    new.insert("id".to_string(), json!(id));
    ChangeEvent::update("categories", marker, old, new)
}

/// Callbacks that forward everything they receive to channels
struct Seen {
    applied: mpsc::UnboundedReceiver<FieldValues>,
    updated: mpsc::UnboundedReceiver<String>,
    deleted: mpsc::UnboundedReceiver<()>,
}

fn recording_callbacks() -> (RecordCallbacks, Seen) {
    let (applied_tx, applied) = mpsc::unbounded_channel();
    let (updated_tx, updated) = mpsc::unbounded_channel();
    let (deleted_tx, deleted) = mpsc::unbounded_channel();

    let callbacks = RecordCallbacks::new()
        .on_smart_update(move |fields| {
            applied_tx.send(fields.clone())?;
            Ok(())
        })
        .on_record_updated(move |event| {
            let _ = updated_tx.send(event.commit_timestamp.to_string());
        })
        .on_record_deleted(move || {
            let _ = deleted_tx.send(());
        });

    (
        callbacks,
        Seen {
            applied,
            updated,
            deleted,
        },
    )
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

async fn wait_for_state<F>(subscription: &RecordChangeSubscription, predicate: F)
where
    F: FnMut(&SubscriptionState) -> bool,
{
    let mut rx = subscription.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

fn open(h: &Harness, id: &str, callbacks: RecordCallbacks) -> RecordChangeSubscription {
    RecordChangeSubscription::open(
        &h.services,
        RecordIdentity::new("categories", id),
        FormBinding::new(callbacks),
    )
}

#[tokio::test]
async fn test_subscription_reaches_subscribed() {
    let h = harness();
    let (callbacks, _seen) = recording_callbacks();

    let subscription = open(&h, "cat-1", callbacks);

    assert_eq!(subscription.channel_name(), "realtime:categories:cat-1");
    wait_for_state(&subscription, |s| s.is_connected()).await;
    assert!(subscription.is_connected());
    assert_eq!(h.transport.open_channels(), vec!["realtime:categories:cat-1"]);
}

#[tokio::test]
async fn test_active_field_deferred_until_blur() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let subscription = open(&h, "cat-1", callbacks);
    let name = subscription.smart_form_sync().field_handlers("name");
    name.on_focus();

    h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A", "code": "K0"}),
        json!({"name": "B", "code": "K1"}),
    ));

    let applied = recv(&mut seen.applied).await;
    assert_eq!(applied, FieldValues::from([("code".to_string(), json!("K1"))]));
    assert_eq!(recv(&mut seen.updated).await, "t1");
    assert!(subscription.smart_form_sync().has_pending_update("name"));

    name.on_blur().unwrap();

    let applied = recv(&mut seen.applied).await;
    assert_eq!(applied, FieldValues::from([("name".to_string(), json!("B"))]));
    assert!(!subscription.smart_form_sync().has_pending_update("name"));
}

#[tokio::test]
async fn test_redelivered_commit_is_dropped() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let _subscription = open(&h, "cat-1", callbacks);

    let first = category_update("cat-1", "t1", json!({"name": "A"}), json!({"name": "B"}));
    h.transport.publish(&first);
    h.transport.publish(&first);
    h.transport.publish(&category_update(
        "cat-1",
        "t2",
        json!({"name": "B"}),
        json!({"name": "C"}),
    ));

    assert_eq!(recv(&mut seen.updated).await, "t1");
    assert_eq!(recv(&mut seen.updated).await, "t2");
    assert_eq!(recv(&mut seen.applied).await.get("name"), Some(&json!("B")));
    assert_eq!(recv(&mut seen.applied).await.get("name"), Some(&json!("C")));
    assert!(seen.applied.try_recv().is_err());

    assert_eq!(h.cache.invalidation_count(&QueryKey::list("categories")), 2);
    assert_eq!(
        h.cache
            .invalidation_count(&QueryKey::detail("categories", "cat-1")),
        2
    );
}

#[tokio::test]
async fn test_remote_delete_notifies_once() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let subscription = open(&h, "cat-1", callbacks);
    subscription.smart_form_sync().register_active_field("name");

    let delete = ChangeEvent::delete("categories", "t9", row(json!({"id": "cat-1"})));
    h.transport.publish(&delete);
    h.transport.publish(&delete);
    // Sentinel: once this is seen, both deletes were handled
    h.transport.publish(&category_update(
        "cat-1",
        "t10",
        json!({"code": "K0"}),
        json!({"code": "K1"}),
    ));

    recv(&mut seen.deleted).await;
    assert_eq!(recv(&mut seen.updated).await, "t10");
    assert!(seen.deleted.try_recv().is_err());

    let notices = h.notifier.0.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0], Notice::record_deleted("categories", "cat-1"));
}

#[tokio::test]
async fn test_other_records_do_not_reach_the_form() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let _subscription = open(&h, "cat-1", callbacks);

    let delivered = h.transport.publish(&category_update(
        "cat-2",
        "t1",
        json!({"name": "A"}),
        json!({"name": "B"}),
    ));
    h.transport.publish(&category_update(
        "cat-1",
        "t2",
        json!({"name": "A"}),
        json!({"name": "Z"}),
    ));

    assert_eq!(delivered, 0);
    assert_eq!(recv(&mut seen.updated).await, "t2");
}

#[tokio::test]
async fn test_channel_error_degrades_without_closing() {
    let h = harness();
    h.transport.set_auto_ack(false);
    let (callbacks, mut seen) = recording_callbacks();
    let subscription = open(&h, "cat-1", callbacks);

    assert_eq!(subscription.state(), SubscriptionState::Subscribing);

    h.transport
        .fail_channel("realtime:categories:cat-1", "connection refused");
    wait_for_state(&subscription, |s| {
        matches!(s, SubscriptionState::ChannelError(_))
    })
    .await;
    assert!(!subscription.is_connected());
    assert_eq!(h.transport.open_channels(), vec!["realtime:categories:cat-1"]);

    // A late acknowledgement recovers the channel
    h.transport.acknowledge("realtime:categories:cat-1");
    wait_for_state(&subscription, |s| s.is_connected()).await;

    h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A"}),
        json!({"name": "B"}),
    ));
    assert_eq!(recv(&mut seen.updated).await, "t1");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let mut subscription = open(&h, "cat-1", callbacks);

    subscription.close();
    subscription.close();

    assert_eq!(subscription.state(), SubscriptionState::Unsubscribed);
    assert!(h.transport.open_channels().is_empty());
    assert_eq!(h.transport.removed_channels(), 1);

    let delivered = h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A"}),
        json!({"name": "B"}),
    ));
    assert_eq!(delivered, 0);
    assert!(seen.updated.try_recv().is_err());
}

#[tokio::test]
async fn test_callback_swap_keeps_channel() {
    let h = harness();
    let (first, mut first_seen) = recording_callbacks();
    let (second, mut second_seen) = recording_callbacks();
    let mut slot = RecordSubscriptionSlot::new(h.services.clone(), first);

    assert!(slot.sync("categories", Some("cat-1"), true));
    slot.set_callbacks(second);
    assert!(!slot.sync("categories", Some("cat-1"), true));

    h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A"}),
        json!({"name": "B"}),
    ));

    assert_eq!(recv(&mut second_seen.updated).await, "t1");
    assert!(first_seen.updated.try_recv().is_err());
    assert_eq!(h.transport.created_channels().len(), 1);
}

#[tokio::test]
async fn test_identity_change_recreates_channel() {
    let h = harness();
    let (callbacks, _seen) = recording_callbacks();
    let mut slot = RecordSubscriptionSlot::new(h.services.clone(), callbacks);

    assert!(slot.sync("categories", Some("cat-1"), true));
    slot.smart_form_sync().register_active_field("name");
    let current = slot.current().unwrap();
    assert_eq!(current.identity(), &RecordIdentity::new("categories", "cat-1"));

    assert!(slot.sync("categories", Some("cat-2"), true));
    assert_eq!(h.transport.open_channels(), vec!["realtime:categories:cat-2"]);
    assert_eq!(h.transport.removed_channels(), 1);
    // The resolver belongs to the form, not to the channel
    assert!(slot.smart_form_sync().is_active("name"));

    assert!(!slot.sync("categories", Some("cat-2"), false));
    assert!(slot.current().is_none());
    assert!(!slot.is_connected());
    assert!(h.transport.open_channels().is_empty());

    assert!(!slot.sync("categories", None, true));
    assert!(slot.sync("suppliers", Some("cat-2"), true));
    assert_eq!(h.transport.open_channels(), vec!["realtime:suppliers:cat-2"]);
}

#[tokio::test]
async fn test_deferred_values_discarded_on_identity_change() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let mut slot = RecordSubscriptionSlot::new(h.services.clone(), callbacks);
    slot.sync("categories", Some("cat-1"), true);
    slot.smart_form_sync().register_active_field("name");

    h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A"}),
        json!({"name": "B"}),
    ));
    assert_eq!(recv(&mut seen.updated).await, "t1");
    assert!(slot.smart_form_sync().has_pending_update("name"));

    slot.sync("categories", Some("cat-2"), true);

    assert!(!slot.smart_form_sync().has_pending_update("name"));
    assert_eq!(slot.smart_form_sync().unregister_active_field("name").unwrap(), None);
}

#[tokio::test]
async fn test_dropping_slot_tears_down_channel() {
    let h = harness();
    let (callbacks, _seen) = recording_callbacks();
    {
        let mut slot = RecordSubscriptionSlot::new(h.services.clone(), callbacks);
        slot.sync("categories", Some("cat-1"), true);
        assert_eq!(h.transport.open_channels().len(), 1);
    }

    assert!(h.transport.open_channels().is_empty());
    assert_eq!(h.transport.removed_channels(), 1);
}

#[tokio::test]
async fn test_force_apply_before_submit() {
    let h = harness();
    let (callbacks, mut seen) = recording_callbacks();
    let subscription = open(&h, "cat-1", callbacks);
    let resolver = subscription.smart_form_sync();
    resolver.register_active_field("name");
    resolver.register_active_field("code");

    h.transport.publish(&category_update(
        "cat-1",
        "t1",
        json!({"name": "A", "code": "K0"}),
        json!({"name": "B", "code": "K1"}),
    ));
    assert_eq!(recv(&mut seen.updated).await, "t1");
    assert!(seen.applied.try_recv().is_err());

    let applied = resolver.apply_all_pending_updates().unwrap();

    assert_eq!(applied.len(), 2);
    assert_eq!(recv(&mut seen.applied).await, applied);
    assert!(resolver.pending_fields().is_empty());
}
