//! Utility helpers shared by the discovery and pool subsystems

use envoy_types::pb::google::protobuf::Any;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Refcounted completion sentinel. The wrapped closure runs when the last
/// clone of the owning `Arc<Cleanup>` is dropped.
pub struct Cleanup {
    on_done: Mutex<Option<CleanupFn>>,
}

impl Cleanup {
    pub fn new<F>(on_done: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self { on_done: Mutex::new(Some(Box::new(on_done))) })
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let hook = self.on_done.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Apply a callback to every member of a snapshot, handing each invocation a
/// clone of a shared [`Cleanup`] sentinel. `done` runs once every callback
/// has released its sentinel, which makes the broadcast robust to members
/// holding their completion past the loop and to membership changing while
/// the callbacks run.
pub fn apply_to_all_with_cleanup<T, I, F, D>(items: I, mut apply: F, done: D)
where
    I: IntoIterator<Item = T>,
    F: FnMut(T, Arc<Cleanup>),
    D: FnOnce() + Send + 'static,
{
    let sentinel = Cleanup::new(done);
    for item in items {
        apply(item, Arc::clone(&sentinel));
    }
}

/// Stable in-process hash of an `Any` payload (type URL + value bytes).
/// Used for update de-duplication, not for persistence.
pub fn hash_any(payload: &Any) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    payload.type_url.hash(&mut hasher);
    payload.value.hash(&mut hasher);
    hasher.finish()
}
