use super::stream_key::StreamKey;
use futures::future::poll_fn;
use quickchat_core::error::Result;
use quickchat_core::store::{DocumentStore, ListenTarget, SnapshotEvent, SnapshotReceiver};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Handle to one opened subscription.
///
/// Cloning the handle does not duplicate the subscription; every clone
/// closes the same one.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    key: StreamKey,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    receiver: SnapshotReceiver,
}

/// Owns the live queries of the current view.
///
/// `SubscriptionManager` is responsible for:
/// - Keeping at most one open subscription per `StreamKey`
/// - Closing subscriptions idempotently, cancelling them at the store
/// - Handing out deliveries of open subscriptions, one at a time
///
/// Closing a subscription drops its receiver, so no delivery made after the
/// close can reach the caller. Subscriptions are polled round-robin, starting
/// after the one served last, so a busy stream cannot starve the others.
pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
    active: BTreeMap<StreamKey, ActiveSubscription>,
    last_served: Option<StreamKey>,
    next_id: u64,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            active: BTreeMap::new(),
            last_served: None,
            next_id: 1,
        }
    }

    /// Opens a subscription for `key`, closing any prior one for the same key first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the listener. The prior
    /// subscription for `key` is closed either way.
    pub async fn open(&mut self, key: StreamKey, target: ListenTarget) -> Result<SubscriptionHandle> {
        self.close_key(&key);

        let cancel = CancellationToken::new();
        let receiver = self.store.listen(target, cancel.clone()).await?;

        let handle = SubscriptionHandle {
            id: self.next_id,
            key: key.clone(),
            cancel,
        };
        self.next_id += 1;

        tracing::debug!("[SubscriptionManager] Opened {} (#{})", key, handle.id);
        self.active.insert(
            key,
            ActiveSubscription {
                handle: handle.clone(),
                receiver,
            },
        );
        Ok(handle)
    }

    /// Closes the subscription behind `handle`.
    ///
    /// Idempotent: closing an already-closed or superseded handle is a no-op.
    /// Returns whether an open subscription was removed.
    pub fn close(&mut self, handle: &SubscriptionHandle) -> bool {
        handle.cancel.cancel();
        let is_current = self
            .active
            .get(&handle.key)
            .is_some_and(|sub| sub.handle.id == handle.id);
        if is_current {
            self.active.remove(&handle.key);
            tracing::debug!("[SubscriptionManager] Closed {} (#{})", handle.key, handle.id);
        }
        is_current
    }

    /// Closes whatever subscription is open for `key`.
    pub fn close_key(&mut self, key: &StreamKey) -> bool {
        match self.active.remove(key) {
            Some(sub) => {
                sub.handle.cancel.cancel();
                tracing::debug!("[SubscriptionManager] Closed {} (#{})", key, sub.handle.id);
                true
            }
            None => false,
        }
    }

    /// Closes every subscription whose key fails `keep`. Returns how many were closed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&StreamKey) -> bool,
    {
        let stale: Vec<StreamKey> = self
            .active
            .keys()
            .filter(|key| !keep(key))
            .cloned()
            .collect();
        for key in &stale {
            self.close_key(key);
        }
        stale.len()
    }

    pub fn close_all(&mut self) -> usize {
        self.retain(|_| false)
    }

    pub fn is_open(&self, key: &StreamKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn open_keys(&self) -> Vec<StreamKey> {
        self.active.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Waits for the next delivery on any open subscription.
    ///
    /// Returns `None` once no subscription is open. A stream error is
    /// terminal: its subscription is removed before the error is returned.
    pub async fn next_event(&mut self) -> Option<(StreamKey, SnapshotEvent)> {
        let delivered = poll_fn(|cx| {
            if self.active.is_empty() {
                return Poll::Ready(None);
            }

            let mut ended = Vec::new();
            let mut delivered = None;
            for key in self.poll_order() {
                let Some(sub) = self.active.get_mut(&key) else {
                    continue;
                };
                match sub.receiver.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        delivered = Some((key, event));
                        break;
                    }
                    Poll::Ready(None) => ended.push(key),
                    Poll::Pending => {}
                }
            }

            for key in ended {
                tracing::debug!("[SubscriptionManager] Stream {} ended by the store", key);
                self.close_key(&key);
            }

            match delivered {
                Some(event) => Poll::Ready(Some(event)),
                None if self.active.is_empty() => Poll::Ready(None),
                None => Poll::Pending,
            }
        })
        .await?;

        Some(self.settle(delivered))
    }

    /// Returns a delivery that is already queued, without waiting.
    pub fn try_next_event(&mut self) -> Option<(StreamKey, SnapshotEvent)> {
        let mut ended = Vec::new();
        let mut delivered = None;
        for key in self.poll_order() {
            let Some(sub) = self.active.get_mut(&key) else {
                continue;
            };
            match sub.receiver.try_recv() {
                Ok(event) => {
                    delivered = Some((key, event));
                    break;
                }
                Err(TryRecvError::Disconnected) => ended.push(key),
                Err(TryRecvError::Empty) => {}
            }
        }

        for key in ended {
            tracing::debug!("[SubscriptionManager] Stream {} ended by the store", key);
            self.close_key(&key);
        }

        delivered.map(|event| self.settle(event))
    }

    /// Open keys, starting after the one served last.
    fn poll_order(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.active.keys().cloned().collect();
        if let Some(last) = &self.last_served {
            let split = keys.partition_point(|key| key <= last);
            keys.rotate_left(split);
        }
        keys
    }

    fn settle(&mut self, delivered: (StreamKey, SnapshotEvent)) -> (StreamKey, SnapshotEvent) {
        self.last_served = Some(delivered.0.clone());
        if let (key, Err(e)) = &delivered {
            tracing::warn!("[SubscriptionManager] Stream {} failed: {}", key, e);
            self.close_key(key);
        }
        delivered
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
