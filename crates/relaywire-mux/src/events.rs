//! Listener registry for inbound ordered events.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use relaywire_protocol::Value;

/// Returns `false` once the listener wants to be dropped.
type Listener = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;
type AnyListener = Arc<dyn Fn(&str, &[Value]) -> bool + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventListeners {
    next_id: u64,
    named: HashMap<String, Vec<(u64, Listener)>>,
    any: Vec<(u64, AnyListener)>,
}

/// A snapshot of the listeners interested in one event, taken so the
/// registry lock is not held while user code runs.
pub(crate) struct Delivery {
    named: Vec<(u64, Listener)>,
    any: Vec<(u64, AnyListener)>,
}

impl EventListeners {
    pub(crate) fn add(&mut self, event: String, listener: Listener) {
        let id = self.next_id();
        self.named.entry(event).or_default().push((id, listener));
    }

    pub(crate) fn add_any(&mut self, listener: AnyListener) {
        let id = self.next_id();
        self.any.push((id, listener));
    }

    pub(crate) fn snapshot(&self, event: &str) -> Delivery {
        Delivery {
            named: self.named.get(event).cloned().unwrap_or_default(),
            any: self.any.clone(),
        }
    }

    /// Drops the listeners that asked to be removed during a delivery.
    pub(crate) fn prune(&mut self, event: &str, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        if let Some(named) = self.named.get_mut(event) {
            named.retain(|(id, _)| !dead.contains(id));
            if named.is_empty() {
                self.named.remove(event);
            }
        }
        self.any.retain(|(id, _)| !dead.contains(id));
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Delivery {
    pub(crate) fn is_empty(&self) -> bool {
        self.named.is_empty() && self.any.is_empty()
    }

    /// Calls every listener with `args`. Returns the ids of listeners that
    /// are gone. A panicking listener is logged and kept.
    pub(crate) fn run(&self, event: &str, args: &[Value]) -> Vec<u64> {
        let mut dead = Vec::new();
        for (id, listener) in &self.named {
            if !guarded(event, || listener(args)) {
                dead.push(*id);
            }
        }
        for (id, listener) in &self.any {
            if !guarded(event, || listener(event, args)) {
                dead.push(*id);
            }
        }
        dead
    }
}

fn guarded(event: &str, call: impl FnOnce() -> bool) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(keep) => keep,
        Err(_) => {
            tracing::error!(%event, "event listener panicked");
            true
        }
    }
}

/// Wraps a plain listener so it is never removed.
pub(crate) fn keep<F>(f: F) -> Listener
where
    F: Fn(&[Value]) + Send + Sync + 'static,
{
    Arc::new(move |args: &[Value]| {
        f(args);
        true
    })
}

/// Wraps a plain any-event listener so it is never removed.
pub(crate) fn keep_any<F>(f: F) -> AnyListener
where
    F: Fn(&str, &[Value]) + Send + Sync + 'static,
{
    Arc::new(move |event: &str, args: &[Value]| {
        f(event, args);
        true
    })
}
