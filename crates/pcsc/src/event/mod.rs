//! Publish/subscribe plumbing for client and reader notifications
//!
//! Each notification kind gets its own [`EventEmitter`]. Listeners run in
//! registration order, synchronously, on the task that emits.

pub mod channel;
pub use channel::*;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::driver::Protocol;
use crate::flags::ReaderStatusFlags;

/// Payload of a reader's "change" notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderChange {
    /// Reported status
    pub status: ReaderStatusFlags,
    /// Answer to reset reported with the status
    pub atr: Bytes,
    /// Protocol of the reader's card session once the status was applied
    pub protocol: Option<Protocol>,
}

/// Handle to a registered listener, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: ListenerId,
    once: bool,
    listener: Listener<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Ordered listener list for one kind of notification
pub struct EventEmitter<T> {
    listeners: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
}

impl<T> EventEmitter<T> {
    /// Create an emitter with no listeners
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, once: bool, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Entry { id, once, listener });
        id
    }

    /// Call `listener` for every future event
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(false, Arc::new(listener))
    }

    /// Call `listener` for the next event only
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(true, Arc::new(listener))
    }

    /// Remove a listener. Safe to call from inside a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver `event` to every listener, returning how many were called.
    ///
    /// Delivery works on a snapshot: listeners added during delivery see the
    /// next event, listeners removed during delivery are skipped.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot = self.listeners.lock().clone();

        let mut delivered = 0;
        for entry in snapshot {
            if !self.claim(&entry) {
                continue;
            }
            (entry.listener)(event);
            delivered += 1;
        }
        delivered
    }

    /// Whether `entry` is still registered. Once-listeners are unregistered
    /// here, before they run.
    fn claim(&self, entry: &Entry<T>) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(index) = listeners.iter().position(|e| e.id == entry.id) else {
            return false;
        };
        if entry.once {
            listeners.remove(index);
        }
        true
    }
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    /// Receive every future event on a channel.
    ///
    /// The listener stays registered after the receiver is dropped; remove it
    /// with the returned id.
    pub fn subscribe(&self) -> (ListenerId, EventReceiver<T>) {
        let (tx, rx) = event_channel();
        let id = self.on(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
