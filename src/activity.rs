use crate::models::activity::ActivityEvent;
use crate::timer::Registration;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Invoked once per physical activity event. Must be cheap and must not block.
pub type ActivityCallback = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

/// Port through which a host delivers "the user is active" signals.
pub trait ActivitySource: Send + Sync {
    fn subscribe(&self, events: &[ActivityEvent], callback: ActivityCallback) -> Registration;
}

struct Listener {
    id: u64,
    events: HashSet<ActivityEvent>,
    callback: ActivityCallback,
}

/// In-process activity source: the host calls [`ActivityEmitter::emit`] from whatever
/// observes input (a terminal, a heartbeat endpoint, a UI bridge).
#[derive(Default)]
pub struct ActivityEmitter {
    listeners: Arc<Mutex<Vec<Listener>>>,
    next_id: AtomicU64,
}

impl ActivityEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every listener subscribed to it. Returns how many were notified.
    pub fn emit(&self, event: ActivityEvent) -> usize {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<ActivityCallback> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|listener| listener.events.contains(&event))
            .map(|listener| listener.callback.clone())
            .collect();

        trace!(event = %event, listeners = callbacks.len(), "activity emitted");
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ActivitySource for ActivityEmitter {
    fn subscribe(&self, events: &[ActivityEvent], callback: ActivityCallback) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(Listener {
            id,
            events: events.iter().copied().collect(),
            callback,
        });

        let listeners = Arc::downgrade(&self.listeners);
        Registration::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().unwrap_or_else(PoisonError::into_inner).retain(|listener| listener.id != id);
            }
        })
    }
}
