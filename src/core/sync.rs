//! Synchronization utilities for robust mutex handling
//!
//! Queue engines, the dispatcher and the in-memory backend all guard their
//! in-memory lists with std mutexes. A poisoned lock means a panic happened
//! while a list was half-swapped, so the poison is surfaced as a domain error
//! instead of being unwrapped.

use std::sync::{LockResult, MutexGuard};

/// Convert a poisoned lock result into an application error
///
/// # Examples
/// ```
/// use std::sync::Mutex;
/// use brokerqueue::core::sync::handle_mutex_poison;
/// use brokerqueue::queue::api::QueueError;
///
/// let pending = Mutex::new(Vec::<u32>::new());
/// let guard = handle_mutex_poison(pending.lock(), |message| QueueError::Synchronisation {
///     message,
/// })
/// .unwrap();
/// assert!(guard.is_empty());
/// ```
pub fn handle_mutex_poison<T, E>(
    result: LockResult<T>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<T, E> {
    result.map_err(|poison_err| {
        error_constructor(
            format!(
                "Internal synchronisation error (mutex poisoned). This indicates a panic occurred while holding a lock. PoisonError: {:?}",
                poison_err
            )
        )
    })
}

/// Lock a mutex from a context that cannot propagate errors
///
/// Used by timer callbacks and `Drop` paths. The poisoned state is logged and
/// the inner guard recovered, since the protected lists stay structurally valid
/// even when a holder panicked.
pub fn lock_recovering<'a, T>(
    result: LockResult<MutexGuard<'a, T>>,
    context: &str,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poison_err| {
        log::error!("Recovered poisoned lock in {}", context);
        poison_err.into_inner()
    })
}
