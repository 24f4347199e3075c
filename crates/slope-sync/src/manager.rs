//! One upstream subscription per (resource, filter), shared by every view
//! that asks for it.
//!
//! Each live subscription has a pump task that reads the store's change
//! stream and fans it out over a broadcast channel. When the stream ends
//! the pump reconnects with exponential backoff and tells listeners to
//! resynchronize, since events may have been missed in between.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slope_store::{ChangeStream, DataStore, StoreError};
use slope_types::api::Filter;
use slope_types::events::{ChangeEvent, ChangeKind, Resource};

use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub resource: Resource,
    pub filter: Filter,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for (column, value) in self.filter.iter() {
            write!(f, " {}={}", column, value)?;
        }
        Ok(())
    }
}

/// What listeners of a subscription receive.
#[derive(Debug, Clone)]
pub enum SyncSignal {
    Change(ChangeEvent),
    /// The stream was re-established after a drop. Events in the gap are
    /// lost, so listeners should refetch.
    Reconnected,
    /// Reconnecting failed with a non-retryable error. No more signals follow.
    Lost(StoreError),
}

pub struct SubscriptionManager<S> {
    store: Arc<S>,
    registry: Arc<Registry>,
    config: SyncConfig,
}

impl<S> Clone for SubscriptionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    active: Mutex<HashMap<SubscriptionKey, Active>>,
}

struct Active {
    refs: usize,
    tx: broadcast::Sender<SyncSignal>,
    cancel: CancellationToken,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, key: &SubscriptionKey) -> Option<broadcast::Receiver<SyncSignal>> {
        let mut active = self.lock();
        let entry = active.get_mut(key)?;
        entry.refs += 1;
        Some(entry.tx.subscribe())
    }

    fn release(&self, key: &SubscriptionKey) {
        let mut active = self.lock();
        let Some(entry) = active.get_mut(key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = active.remove(key) {
                entry.cancel.cancel();
            }
            info!("Subscription to {} released", key);
        }
    }
}

/// Keeps a subscription reference alive. Dropping it releases the
/// reference; the last release cancels the upstream subscription.
pub struct Lease {
    key: SubscriptionKey,
    registry: Arc<Registry>,
}

impl Lease {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

pub struct SubscriptionHandle {
    lease: Lease,
    events: broadcast::Receiver<SyncSignal>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        self.lease.key()
    }

    pub async fn recv(&mut self) -> Result<SyncSignal, broadcast::error::RecvError> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (Lease, broadcast::Receiver<SyncSignal>) {
        (self.lease, self.events)
    }
}

impl<S: DataStore> SubscriptionManager<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::default()),
            config,
        }
    }

    /// Join the subscription for `(resource, filter)`, creating it if this
    /// is the first reference.
    pub async fn open(&self, resource: Resource, filter: Filter) -> Result<SubscriptionHandle, StoreError> {
        let key = SubscriptionKey { resource, filter };
        if let Some(events) = self.registry.join(&key) {
            debug!("Reusing subscription to {}", key);
            return Ok(self.handle(key, events));
        }

        let stream = subscribe(&*self.store, &key, self.config.request_timeout).await?;

        let mut active = self.registry.lock();
        // Someone else may have connected the same key while we were waiting
        if let Some(entry) = active.get_mut(&key) {
            entry.refs += 1;
            let events = entry.tx.subscribe();
            drop(active);
            debug!("Subscription to {} raced, reusing the winner", key);
            return Ok(self.handle(key, events));
        }

        let (tx, events) = broadcast::channel(self.config.event_buffer);
        let cancel = CancellationToken::new();
        active.insert(
            key.clone(),
            Active {
                refs: 1,
                tx: tx.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(active);

        info!("Subscribed to {}", key);
        tokio::spawn(pump(
            self.store.clone(),
            key.clone(),
            stream,
            tx,
            cancel,
            self.config.clone(),
        ));

        Ok(self.handle(key, events))
    }

    /// Release a reference. Same as dropping the handle.
    pub fn close(&self, handle: SubscriptionHandle) {
        drop(handle);
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.registry.lock().get(key).map_or(0, |a| a.refs)
    }

    fn handle(&self, key: SubscriptionKey, events: broadcast::Receiver<SyncSignal>) -> SubscriptionHandle {
        SubscriptionHandle {
            lease: Lease {
                key,
                registry: self.registry.clone(),
            },
            events,
        }
    }
}

async fn subscribe<S: DataStore>(
    store: &S,
    key: &SubscriptionKey,
    limit: Duration,
) -> Result<ChangeStream, StoreError> {
    let attempt = store.subscribe(key.resource, key.filter.clone(), ChangeKind::ALL.to_vec());
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Transient(format!(
            "subscribing to {} timed out after {:?}",
            key, limit
        ))),
    }
}

async fn pump<S: DataStore>(
    store: Arc<S>,
    key: SubscriptionKey,
    mut stream: ChangeStream,
    tx: broadcast::Sender<SyncSignal>,
    cancel: CancellationToken,
    config: SyncConfig,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            Some(event) => {
                // No receivers just means every view is between recv calls
                let _ = tx.send(SyncSignal::Change(event));
            }
            None => {
                warn!("Subscription to {} dropped, reconnecting", key);
                match reconnect(&*store, &key, &cancel, &config).await {
                    Ok(Some(fresh)) => {
                        stream = fresh;
                        info!("Subscription to {} re-established", key);
                        let _ = tx.send(SyncSignal::Reconnected);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Giving up on subscription to {}: {}", key, e);
                        let _ = tx.send(SyncSignal::Lost(e));
                        break;
                    }
                }
            }
        }
    }
    debug!("Pump for {} stopped", key);
}

/// `Ok(None)` means the subscription was cancelled while reconnecting.
async fn reconnect<S: DataStore>(
    store: &S,
    key: &SubscriptionKey,
    cancel: &CancellationToken,
    config: &SyncConfig,
) -> Result<Option<ChangeStream>, StoreError> {
    let mut backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = subscribe(store, key, config.request_timeout) => result,
        };

        match attempt {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) if e.is_retryable() => {
                warn!("Reconnect {} to {} failed: {}", backoff.attempts(), key, e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff with up to 25% additive jitter.
pub struct Backoff {
    current: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.min(max),
            max,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;

        let spread = (delay.as_millis() / 4) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        (delay + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
