//! Path-addressed routing for at-least-once deliveries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::record::ActorPath;

/// Maps [`ActorPath`]s to mailboxes.
///
/// Cloning is cheap; clones share the same routing table. Sends to a path
/// with no live mailbox are dropped, and the delivery ledger retries them
/// on the next redelivery tick.
///
/// # Panics
///
/// Every method panics if the inner [`RwLock`] is poisoned (a writer
/// panicked while holding it).
#[derive(Debug)]
pub struct Router<M> {
    routes: Arc<RwLock<HashMap<ActorPath, mpsc::UnboundedSender<M>>>>,
}

impl<M> Clone for Router<M> {
    fn clone(&self) -> Self {
        Self {
            routes: Arc::clone(&self.routes),
        }
    }
}

impl<M> Default for Router<M> {
    fn default() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<M> Router<M> {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox for `path`, replacing any previous one.
    pub fn register(&self, path: impl Into<ActorPath>) -> mpsc::UnboundedReceiver<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_sender(path, tx);
        rx
    }

    /// Route `path` to an existing sender, replacing any previous one.
    pub fn register_sender(&self, path: impl Into<ActorPath>, sender: mpsc::UnboundedSender<M>) {
        self.routes
            .write()
            .expect("router lock poisoned")
            .insert(path.into(), sender);
    }

    /// Remove the route for `path`. Returns `true` if one existed.
    pub fn unregister(&self, path: &ActorPath) -> bool {
        self.routes
            .write()
            .expect("router lock poisoned")
            .remove(path)
            .is_some()
    }

    /// Send `message` to `path`.
    ///
    /// Returns `false` if nothing is registered there or its mailbox has
    /// closed.
    pub fn send(&self, path: &ActorPath, message: M) -> bool {
        let routes = self.routes.read().expect("router lock poisoned");
        match routes.get(path) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_path_receives() {
        let router = Router::new();
        let mut rx = router.register("/user/a");
        assert!(router.send(&ActorPath::new("/user/a"), 7));
        assert_eq!(rx.try_recv().ok(), Some(7));
    }

    #[test]
    fn unknown_or_closed_path_is_reported() {
        let router = Router::new();
        assert!(!router.send(&ActorPath::new("/user/nobody"), 1));

        let rx = router.register("/user/gone");
        drop(rx);
        assert!(!router.send(&ActorPath::new("/user/gone"), 1));
    }

    #[test]
    fn clones_share_routes() {
        let router = Router::new();
        let clone = router.clone();
        let mut rx = clone.register("/user/b");
        assert!(router.send(&ActorPath::new("/user/b"), "hi"));
        assert_eq!(rx.try_recv().ok(), Some("hi"));

        assert!(router.unregister(&ActorPath::new("/user/b")));
        assert!(!clone.send(&ActorPath::new("/user/b"), "again"));
    }
}
