// File: record-sync/src/latest.rs
// Purpose: Latest-value cell read by long-lived subscriptions

use std::sync::{Arc, PoisonError, RwLock};

/// A shared cell holding the most recent value written by its owner.
///
/// Subscriptions read callbacks through this cell at call time, so the
/// owner can swap callbacks on every render without the channel being torn
/// down and recreated.
pub struct LatestRef<T> {
    cell: Arc<RwLock<Arc<T>>>,
}

impl<T> LatestRef<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Replace the current value; readers see it on their next `get`
    pub fn set(&self, value: T) {
        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.cell.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T> Clone for LatestRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Default> Default for LatestRef<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
