use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub(crate) fn new_id() -> Uuid {
    let id = Uuid::new_v4();
    id
}

/// Server ids follow the nats-server convention of
/// an upper-case string without separators.
pub(crate) fn new_server_id() -> String {
    new_id().to_simple().to_string().to_uppercase()
}

// A panicked connection task must not take the
// whole broker down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
