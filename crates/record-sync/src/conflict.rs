// File: record-sync/src/conflict.rs
// Purpose: Field-level conflict protection for forms edited during live sync

//! A field the local user is editing holds an exclusive write lease.
//! Remote values for that field are deferred until the user disengages;
//! every other field is applied as soon as it arrives.
//!
//! All resolver state for one form instance sits behind a single mutex. The
//! apply callback is always invoked after that lock is released, so it may
//! call back into the resolver.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, SyncError};

/// Field name to value, ordered by name
pub type FieldValues = BTreeMap<String, Value>;

/// Callback that writes a batch of field values into the form
pub type ApplyFn = Arc<dyn Fn(&FieldValues) -> anyhow::Result<()> + Send + Sync>;

/// Result of routing one remote update through the resolver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteUpdateOutcome {
    /// Fields written to the form right away
    pub applied_immediately: FieldValues,
    /// Active fields whose remote value was deferred
    pub pending_conflicts: Vec<String>,
}

impl RemoteUpdateOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.pending_conflicts.is_empty()
    }
}

#[derive(Debug, Default)]
struct ResolverState {
    active: HashSet<String>,
    pending: FieldValues,
    last_focused: Option<String>,
}

/// Per-form tracker of active fields and deferred remote values
pub struct FieldConflictResolver {
    state: Mutex<ResolverState>,
    apply: ApplyFn,
}

impl FieldConflictResolver {
    /// Create a resolver that writes values through `apply`
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&FieldValues) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_apply_fn(Arc::new(apply))
    }

    pub fn with_apply_fn(apply: ApplyFn) -> Self {
        Self {
            state: Mutex::new(ResolverState::default()),
            apply,
        }
    }

    fn state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_batch(&self, fields: &FieldValues) -> Result<()> {
        (self.apply)(fields).map_err(SyncError::Apply)
    }

    /// Mark `name` as under local edit. Idempotent.
    pub fn register_active_field(&self, name: &str) {
        let mut state = self.state();
        if state.active.insert(name.to_string()) {
            tracing::debug!("Field '{}' is now active", name);
        }
        state.last_focused = Some(name.to_string());
    }

    /// Mark `name` inactive and flush its deferred remote value, if any.
    ///
    /// Returns the flushed value. If the apply callback fails the value is
    /// kept pending and the error is returned.
    pub fn unregister_active_field(&self, name: &str) -> Result<Option<Value>> {
        let pending = {
            let mut state = self.state();
            state.active.remove(name);
            state.pending.remove(name)
        };

        let Some(value) = pending else {
            return Ok(None);
        };

        tracing::debug!("Flushing deferred remote value for '{}'", name);
        let batch = FieldValues::from([(name.to_string(), value)]);
        if let Err(err) = self.apply_batch(&batch) {
            self.restore_pending(batch);
            return Err(err);
        }

        Ok(batch.into_values().next())
    }

    /// Partition a remote update into applied-now and deferred fields.
    ///
    /// The apply callback runs at most once, with every non-active field.
    pub fn handle_remote_update(&self, fields: FieldValues) -> Result<RemoteUpdateOutcome> {
        let mut outcome = RemoteUpdateOutcome::default();

        {
            let mut state = self.state();
            for (name, value) in fields {
                if state.active.contains(&name) {
                    state.pending.insert(name.clone(), value);
                    outcome.pending_conflicts.push(name);
                } else {
                    outcome.applied_immediately.insert(name, value);
                }
            }
        }

        if outcome.has_conflicts() {
            tracing::debug!(
                "Deferred remote values for active fields: {:?}",
                outcome.pending_conflicts
            );
        }

        if !outcome.applied_immediately.is_empty() {
            self.apply_batch(&outcome.applied_immediately)?;
        }

        Ok(outcome)
    }

    pub fn has_pending_update(&self, name: &str) -> bool {
        self.state().pending.contains_key(name)
    }

    /// Apply and clear every deferred value in one batch.
    ///
    /// Used before submitting a form. Nothing is invoked when no value is
    /// pending.
    pub fn apply_all_pending_updates(&self) -> Result<FieldValues> {
        let pending = std::mem::take(&mut self.state().pending);
        if pending.is_empty() {
            return Ok(pending);
        }

        tracing::debug!("Force-applying {} deferred field(s)", pending.len());
        if let Err(err) = self.apply_batch(&pending) {
            self.restore_pending(pending);
            return Err(err);
        }

        Ok(pending)
    }

    /// Drop every deferred value without applying it.
    ///
    /// Used when the form switches to a different record.
    pub fn clear_pending(&self) -> FieldValues {
        std::mem::take(&mut self.state().pending)
    }

    // Values that arrived while the failed batch was in flight are newer.
    fn restore_pending(&self, batch: FieldValues) {
        let mut state = self.state();
        for (name, value) in batch {
            state.pending.entry(name).or_insert(value);
        }
    }

    /// Focus, change and blur handlers bound to one field
    pub fn field_handlers(self: &Arc<Self>, name: &str) -> FieldHandlers {
        FieldHandlers {
            resolver: Arc::clone(self),
            name: name.to_string(),
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.state().active.contains(name)
    }

    pub fn active_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.state().active.iter().cloned().collect();
        fields.sort();
        fields
    }

    pub fn pending_fields(&self) -> Vec<String> {
        self.state().pending.keys().cloned().collect()
    }

    /// Most recently focused field, informational only
    pub fn last_focused(&self) -> Option<String> {
        self.state().last_focused.clone()
    }
}

impl std::fmt::Debug for FieldConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("FieldConflictResolver")
            .field("active", &state.active)
            .field("pending", &state.pending)
            .field("last_focused", &state.last_focused)
            .finish()
    }
}

/// Event handlers for a single form field
#[derive(Clone)]
pub struct FieldHandlers {
    resolver: Arc<FieldConflictResolver>,
    name: String,
}

impl FieldHandlers {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_focus(&self) {
        self.resolver.register_active_field(&self.name);
    }

    /// Keeps the field active so continued typing does not flush a
    /// deferred value.
    pub fn on_change(&self) {
        self.resolver.register_active_field(&self.name);
    }

    pub fn on_blur(&self) -> Result<Option<Value>> {
        self.resolver.unregister_active_field(&self.name)
    }
}
