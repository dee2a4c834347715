//! # Listener Init Targets
//!
//! A listener becomes live only once every registered init target has
//! signalled readiness. Targets are one-shot: `ready()` is idempotent, and a
//! target abandoned mid-warm-up (its owner dropped) must still signal so the
//! listener cannot hang on a silent control plane.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

type InitFn = Box<dyn FnOnce() + Send>;

struct InitTargetInner {
    name: String,
    ready_tx: watch::Sender<bool>,
    on_init: Mutex<Option<InitFn>>,
    ready_on_init: bool,
}

/// One-shot readiness token gating listener activation
#[derive(Clone)]
pub struct InitTarget {
    inner: Arc<InitTargetInner>,
}

impl InitTarget {
    /// Create a target whose `on_init` hook runs when the init manager starts
    /// initialization (typically: start the underlying subscription)
    pub fn new<F>(name: impl Into<String>, on_init: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(name, on_init, false)
    }

    /// Create a target that signals readiness as soon as its hook has run.
    /// Used to activate a subscription without waiting for a response, when a
    /// default config covers the gap.
    pub fn new_ready_on_init<F>(name: impl Into<String>, on_init: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(name, on_init, true)
    }

    fn build<F>(name: impl Into<String>, on_init: F, ready_on_init: bool) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(InitTargetInner {
                name: name.into(),
                ready_tx,
                on_init: Mutex::new(Some(Box::new(on_init))),
                ready_on_init,
            }),
        }
    }

    /// Target name, for warm-up diagnostics
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run the on-initialize hook. Subsequent calls are no-ops.
    pub fn initialize(&self) {
        let hook = self.inner.on_init.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            debug!(target = %self.inner.name, "initializing init target");
            hook();
            if self.inner.ready_on_init {
                self.ready();
            }
        }
    }

    /// Signal readiness. Idempotent.
    pub fn ready(&self) {
        self.inner.ready_tx.send_replace(true);
    }

    /// Whether the target has signalled readiness
    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    /// Observe readiness changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }
}

/// Listener-scoped set of init targets
#[derive(Clone, Default)]
pub struct InitManager {
    targets: Arc<Mutex<Vec<InitTarget>>>,
}

impl InitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Targets added after `initialize()` are initialized
    /// by the next `initialize()` call.
    pub fn add(&self, target: InitTarget) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(target);
        }
    }

    /// Run every target's on-initialize hook
    pub fn initialize(&self) {
        let snapshot: Vec<InitTarget> = match self.targets.lock() {
            Ok(targets) => targets.clone(),
            Err(_) => return,
        };
        for target in snapshot {
            target.initialize();
        }
    }

    /// Whether every registered target is ready
    pub fn all_ready(&self) -> bool {
        match self.targets.lock() {
            Ok(targets) => targets.iter().all(InitTarget::is_ready),
            Err(_) => false,
        }
    }

    /// Names of targets still blocking readiness
    pub fn pending_targets(&self) -> Vec<String> {
        match self.targets.lock() {
            Ok(targets) => targets
                .iter()
                .filter(|target| !target.is_ready())
                .map(|target| target.name().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of registered targets
    pub fn target_count(&self) -> usize {
        self.targets.lock().map(|targets| targets.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ready_is_idempotent() {
        let target = InitTarget::new("test", || {});
        assert!(!target.is_ready());

        target.ready();
        target.ready();
        assert!(target.is_ready());
    }

    #[test]
    fn initialize_runs_hook_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = calls.clone();
        let target = InitTarget::new("test", move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

        target.initialize();
        target.initialize();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_tracks_pending_targets() {
        let manager = InitManager::new();
        let first = InitTarget::new("first", || {});
        let second = InitTarget::new("second", || {});
        manager.add(first.clone());
        manager.add(second.clone());

        manager.initialize();
        assert!(!manager.all_ready());
        assert_eq!(manager.pending_targets(), vec!["first", "second"]);

        first.ready();
        assert_eq!(manager.pending_targets(), vec!["second"]);

        second.ready();
        assert!(manager.all_ready());
    }

    #[test]
    fn readiness_is_observable() {
        let target = InitTarget::new("test", || {});
        let mut rx = target.subscribe();
        assert!(!*rx.borrow_and_update());

        target.ready();
        assert!(rx.has_changed().unwrap_or(false));
        assert!(*rx.borrow_and_update());
    }
}
