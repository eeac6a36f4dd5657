// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network state source.
//!
//! The platform reports connectivity; the orchestrator only cares about the
//! offline→online edge and about "is it still online" between batches.
//!
//! # Example
//!
//! ```
//! use fleet_sync::network::{NetworkStateSource, WatchNetwork};
//!
//! let net = WatchNetwork::new(false);
//! let rx = net.subscribe();
//! net.set_online(true);
//! assert!(net.is_online());
//! assert!(*rx.borrow());
//! ```

use tokio::sync::watch;
use tracing::debug;

/// Connectivity signal consumed by the orchestrator.
pub trait NetworkStateSource: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that observes every change of the online flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// `watch`-backed source. Platform glue calls [`set_online`](Self::set_online).
#[derive(Debug)]
pub struct WatchNetwork {
    tx: watch::Sender<bool>,
}

impl WatchNetwork {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Publish connectivity. Repeating the current value wakes nobody.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "Network state changed");
        }
    }
}

impl NetworkStateSource for WatchNetwork {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_online_does_not_notify() {
        let net = WatchNetwork::new(true);
        let mut rx = net.subscribe();
        rx.borrow_and_update();

        net.set_online(true);
        assert!(!rx.has_changed().unwrap());

        net.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_subscriber_sees_transition() {
        let net = WatchNetwork::new(false);
        let mut rx = net.subscribe();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow()
        });

        net.set_online(true);
        assert!(waiter.await.unwrap());
    }
}
