//! Change notifier: per-document subscriptions to tile set updates

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::debug;

use super::types::{DocumentId, TileSet};

/// Tile set of a document after a store change
#[derive(Clone, Debug)]
pub struct TileSetChanged {
    pub document: DocumentId,
    pub tiles: Arc<TileSet>,
}

#[derive(Debug)]
struct Listener {
    id: u64,
    tx: Sender<TileSetChanged>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<DocumentId, Vec<Listener>>,
}

impl Registry {
    fn remove(&mut self, document: DocumentId, id: u64) {
        if let Some(listeners) = self.listeners.get_mut(&document) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                self.listeners.remove(&document);
            }
        }
    }
}

/// Fan-out of tile set changes, keyed by document
#[derive(Clone, Debug, Default)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `document`; dropping the handle unsubscribes
    #[must_use]
    pub fn subscribe(&self, document: DocumentId) -> Subscription {
        let (tx, rx) = flume::unbounded();
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .listeners
            .entry(document)
            .or_default()
            .push(Listener { id, tx });

        Subscription {
            document,
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Send `tiles` to every listener of `document`, pruning dead ones
    pub fn notify(&self, document: DocumentId, tiles: &TileSet) {
        let mut registry = self.lock();
        let Some(listeners) = registry.listeners.get_mut(&document) else {
            return;
        };

        let event = TileSetChanged {
            document,
            tiles: Arc::new(tiles.clone()),
        };
        listeners.retain(|listener| listener.tx.send(event.clone()).is_ok());
        if listeners.is_empty() {
            debug!("All listeners of {document} are gone");
            registry.listeners.remove(&document);
        }
    }

    /// Drop every listener of `document`; their receivers disconnect
    pub fn close(&self, document: DocumentId) {
        self.lock().listeners.remove(&document);
    }

    #[must_use]
    pub fn listener_count(&self, document: DocumentId) -> usize {
        self.lock().listeners.get(&document).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one stream of tile set changes
#[derive(Debug)]
pub struct Subscription {
    document: DocumentId,
    id: u64,
    receiver: Receiver<TileSetChanged>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    #[must_use]
    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Underlying receiver, for `select`-style loops
    #[must_use]
    pub fn receiver(&self) -> &Receiver<TileSetChanged> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Result<TileSetChanged, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<TileSetChanged, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Skip to the newest queued change, if any
    #[must_use]
    pub fn latest(&self) -> Option<TileSetChanged> {
        self.receiver.try_iter().last()
    }

    /// True once the document has been closed
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.receiver.is_disconnected()
    }

    /// Explicit unsubscribe, same as dropping the handle
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.document, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_only_see_their_document() {
        let notifier = ChangeNotifier::new();
        let first = notifier.subscribe(DocumentId(1));
        let second = notifier.subscribe(DocumentId(2));

        notifier.notify(DocumentId(1), &TileSet::new());

        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe(DocumentId(1));
        let other = notifier.subscribe(DocumentId(1));
        assert_eq!(notifier.listener_count(DocumentId(1)), 2);

        sub.unsubscribe();
        assert_eq!(notifier.listener_count(DocumentId(1)), 1);
        drop(other);
        assert_eq!(notifier.listener_count(DocumentId(1)), 0);
    }

    #[test]
    fn close_disconnects_receivers() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe(DocumentId(7));

        notifier.close(DocumentId(7));

        assert!(sub.is_disconnected());
        assert_eq!(notifier.listener_count(DocumentId(7)), 0);
    }

    #[test]
    fn latest_skips_queued_changes() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe(DocumentId(1));
        let mut tiles = TileSet::new();
        notifier.notify(DocumentId(1), &tiles);
        tiles.insert(4, Vec::new());
        notifier.notify(DocumentId(1), &tiles);

        let latest = sub.latest().expect("two queued");
        assert!(latest.tiles.contains_key(&4));
        assert!(sub.try_recv().is_err());
    }
}
