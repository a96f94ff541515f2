use parking_lot::Mutex;
use std::sync::Arc;

/// Mutable state shared between sessions of the in-memory backend and the
/// health counters. Locks are never held across an await.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
