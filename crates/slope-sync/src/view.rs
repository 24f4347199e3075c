//! Live views: an ordered, deduplicated slice of one resource kept current
//! by change events.
//!
//! Each view runs one task that owns its [`Timeline`]. Change events are
//! applied strictly in arrival order: inserts and updates are resolved by
//! fetching the row by id, since event payloads lack the joined author.
//! The UI reads [`ViewSnapshot`]s from a watch channel.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slope_store::{DataStore, StoreError, StoreExt};
use slope_types::api::{Filter, LikeToggle, NewMessage, NewPhoto, Order};
use slope_types::events::{ChangeEvent, ChangeKind};
use slope_types::models::{Message, MessageKind, Photo, Principal, Record, RideData};

use crate::identity::IdentityProvider;
use crate::manager::{Lease, SubscriptionHandle, SyncSignal};
use crate::timeline::Timeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    /// Initial bulk fetch in flight.
    Loading,
    Ready,
    /// A change is being resolved; items are still valid.
    Updating,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ViewSnapshot<R> {
    pub state: ViewState,
    pub items: Vec<R>,
}

impl<R> ViewSnapshot<R> {
    fn loading() -> Self {
        Self {
            state: ViewState::Loading,
            items: Vec::new(),
        }
    }

    /// Loaded and showing data, whether or not a change is mid-flight.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ViewState::Ready | ViewState::Updating)
    }
}

/// Once closed, nothing is published. Closing and publishing take the same
/// lock, so no snapshot can land after `close` returns.
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
}

impl Gate {
    fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_open<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed { None } else { Some(f()) }
    }
}

enum Command<R> {
    /// Apply a row the caller already has, e.g. the result of its own write.
    Merge { row: R, ack: oneshot::Sender<()> },
}

/// Handle on a running view task. Dropping it closes the view.
pub struct LiveView<R: Record> {
    snapshots: watch::Receiver<ViewSnapshot<R>>,
    commands: mpsc::UnboundedSender<Command<R>>,
    gate: Arc<Gate>,
    cancel: CancellationToken,
    lease: Option<Lease>,
}

impl<R: Record> LiveView<R> {
    pub(crate) fn spawn<S: DataStore>(
        store: Arc<S>,
        subscription: SubscriptionHandle,
        limit: u32,
        timeout: Duration,
        label: String,
    ) -> Self {
        let filter = subscription.key().filter.clone();
        let (lease, events) = subscription.into_parts();
        let (tx, snapshots) = watch::channel(ViewSnapshot::loading());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate::default());
        let cancel = CancellationToken::new();

        let task = ViewTask {
            store,
            filter,
            limit,
            timeout,
            label,
            events,
            commands: command_rx,
            timeline: Timeline::new(),
            tx,
            gate: gate.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self {
            snapshots,
            commands,
            gate,
            cancel,
            lease: Some(lease),
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot<R> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<R>> {
        self.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `ready`, or the view stops publishing.
    pub async fn wait_for(&self, ready: impl FnMut(&ViewSnapshot<R>) -> bool) -> Option<ViewSnapshot<R>> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(ready).await.ok()?;
        Some(snapshot.clone())
    }

    /// Hand the view a row to upsert, returning once it is applied.
    pub async fn merge(&self, row: R) {
        let (ack, applied) = oneshot::channel();
        if self.commands.send(Command::Merge { row, ack }).is_ok() {
            // A closed view drops the command, which is fine
            let _ = applied.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Stop the view: no snapshot is published after this returns, pending
    /// fetches are abandoned and the subscription reference is released.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.gate.close();
        self.cancel.cancel();
        self.lease.take();
    }
}

impl<R: Record> Drop for LiveView<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ViewTask<S, R: Record> {
    store: Arc<S>,
    filter: Filter,
    limit: u32,
    timeout: Duration,
    label: String,
    events: broadcast::Receiver<SyncSignal>,
    commands: mpsc::UnboundedReceiver<Command<R>>,
    timeline: Timeline<R>,
    tx: watch::Sender<ViewSnapshot<R>>,
    gate: Arc<Gate>,
    cancel: CancellationToken,
}

impl<S: DataStore, R: Record> ViewTask<S, R> {
    async fn run(mut self) {
        match self.bulk_fetch().await {
            None => return,
            Some(Ok(rows)) => {
                debug!("Loaded {} rows into {}", rows.len(), self.label);
                self.timeline.reset(rows);
                self.publish(ViewState::Ready);
            }
            Some(Err(e)) => {
                warn!("Initial load of {} failed: {}", self.label, e);
                self.publish(ViewState::Error(e.to_string()));
                return;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.apply(command),
                signal = self.events.recv() => match signal {
                    Ok(SyncSignal::Change(event)) => self.on_change(event).await,
                    Ok(SyncSignal::Reconnected) => self.resync().await,
                    Ok(SyncSignal::Lost(e)) => {
                        self.publish(ViewState::Error(format!("realtime connection lost: {}", e)));
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} fell {} events behind, resynchronizing", self.label, skipped);
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("View {} stopped", self.label);
    }

    /// Newest `limit` rows, whatever the display order.
    async fn bulk_fetch(&mut self) -> Option<Result<Vec<R>, StoreError>> {
        let query = self
            .store
            .query_as::<R>(self.filter.clone(), Some(Order::desc("created_at")), Some(self.limit));
        guarded(&self.cancel, self.timeout, query).await
    }

    fn apply(&mut self, command: Command<R>) {
        match command {
            Command::Merge { row, ack } => {
                self.timeline.upsert(row);
                self.publish(ViewState::Ready);
                let _ = ack.send(());
            }
        }
    }

    async fn on_change(&mut self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Insert if self.timeline.contains(event.id) => {
                debug!("{} already has {}", self.label, event.id);
            }
            // Only rows already in the window are kept current
            ChangeKind::Update if !self.timeline.contains(event.id) => {
                debug!("{} does not hold {}, ignoring update", self.label, event.id);
            }
            ChangeKind::Insert | ChangeKind::Update => {
                self.publish(ViewState::Updating);
                let resolved = guarded(&self.cancel, self.timeout, self.store.fetch_as::<R>(event.id)).await;
                match resolved {
                    None => return,
                    Some(Ok(row)) => {
                        self.timeline.upsert(row);
                    }
                    // Deleted between the event and the fetch
                    Some(Err(e)) if e.is_not_found() => debug!("{} vanished before fetch", event.id),
                    Some(Err(e)) => warn!("Failed to resolve {} for {}: {}", event.id, self.label, e),
                }
                self.publish(ViewState::Ready);
            }
            ChangeKind::Delete => {
                if self.timeline.remove(event.id) {
                    self.publish(ViewState::Ready);
                }
            }
        }
    }

    async fn resync(&mut self) {
        info!("Resynchronizing {}", self.label);
        self.publish(ViewState::Updating);
        match self.bulk_fetch().await {
            None => return,
            Some(Ok(rows)) => {
                let added = self.timeline.merge(rows);
                debug!("Resync of {} picked up {} rows", self.label, added);
            }
            Some(Err(e)) => warn!("Resync of {} failed: {}", self.label, e),
        }
        self.publish(ViewState::Ready);
    }

    fn publish(&self, state: ViewState) {
        let snapshot = ViewSnapshot {
            state,
            items: self.timeline.items().to_vec(),
        };
        self.gate.run_open(|| self.tx.send_replace(snapshot));
    }
}

/// Bound `fut` by the request timeout. `None` if the view was closed first.
async fn guarded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Option<Result<T, StoreError>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = with_timeout(limit, fut) => Some(result),
    }
}

pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(StoreError::Transient(format!("request timed out after {:?}", limit))))
}

fn require_principal(identity: &dyn IdentityProvider) -> Result<Principal, StoreError> {
    identity
        .current_principal()
        .ok_or_else(|| StoreError::Unauthorized("not signed in".into()))
}

/// Messages of one channel, oldest first.
pub struct MessageView<S> {
    view: LiveView<Message>,
    channel: String,
    store: Arc<S>,
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
}

impl<S: DataStore> MessageView<S> {
    pub(crate) fn new(
        view: LiveView<Message>,
        channel: String,
        store: Arc<S>,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            view,
            channel,
            store,
            identity,
            timeout,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn snapshot(&self) -> ViewSnapshot<Message> {
        self.view.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<Message>> {
        self.view.watch()
    }

    pub async fn wait_for(
        &self,
        ready: impl FnMut(&ViewSnapshot<Message>) -> bool,
    ) -> Option<ViewSnapshot<Message>> {
        self.view.wait_for(ready).await
    }

    /// Post a text message. Surrounding whitespace is trimmed and empty
    /// messages are rejected without touching the store.
    pub async fn send(&self, text: &str) -> Result<Message, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Rejected("message is empty".into()));
        }
        self.post(text.to_string(), MessageKind::Text).await
    }

    /// Post the placeholder for a voice note of `seconds` length. Audio
    /// itself is not uploaded.
    pub async fn send_voice_placeholder(&self, seconds: u32) -> Result<Message, StoreError> {
        self.post(format!("Voice message ({}s)", seconds), MessageKind::Voice).await
    }

    pub fn is_own(&self, message: &Message) -> bool {
        self.identity.current_principal().is_some_and(|p| p.id == message.user_id)
    }

    pub fn close(self) {
        self.view.close();
    }

    pub fn is_closed(&self) -> bool {
        self.view.is_closed()
    }

    async fn post(&self, message: String, kind: MessageKind) -> Result<Message, StoreError> {
        let principal = require_principal(&*self.identity)?;
        let row = NewMessage {
            user_id: principal.id,
            channel: self.channel.clone(),
            message,
            message_type: kind,
        };
        let created: Message = with_timeout(self.timeout, self.store.insert_as::<Message, _>(&row)).await?;
        debug!("Sent {} to #{}", created.id, self.channel);

        // Show our own message right away; its insert event then dedupes
        self.view.merge(created.clone()).await;
        Ok(created)
    }
}

/// A photo ready to post. `photo_url` is whatever the capture layer
/// produced; it is stored as-is.
#[derive(Debug, Clone)]
pub struct PhotoDraft {
    pub photo_url: String,
    pub caption: Option<String>,
    pub location: Option<String>,
    pub ride_data: Option<RideData>,
}

impl PhotoDraft {
    /// A fresh capture with the default caption and location.
    pub fn from_capture(photo_url: impl Into<String>) -> Self {
        Self {
            photo_url: photo_url.into(),
            caption: Some("New ride photo".into()),
            location: Some("Current Location".into()),
            ride_data: None,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn ride_data(mut self, ride_data: RideData) -> Self {
        self.ride_data = Some(ride_data);
        self
    }
}

/// The shared photo feed, newest first.
pub struct PhotoView<S> {
    view: LiveView<Photo>,
    store: Arc<S>,
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
}

impl<S: DataStore> PhotoView<S> {
    pub(crate) fn new(
        view: LiveView<Photo>,
        store: Arc<S>,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            view,
            store,
            identity,
            timeout,
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot<Photo> {
        self.view.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot<Photo>> {
        self.view.watch()
    }

    pub async fn wait_for(&self, ready: impl FnMut(&ViewSnapshot<Photo>) -> bool) -> Option<ViewSnapshot<Photo>> {
        self.view.wait_for(ready).await
    }

    pub async fn post(&self, draft: PhotoDraft) -> Result<Photo, StoreError> {
        if draft.photo_url.trim().is_empty() {
            return Err(StoreError::Rejected("photo_url is empty".into()));
        }
        let principal = require_principal(&*self.identity)?;
        let row = NewPhoto {
            user_id: principal.id,
            photo_url: draft.photo_url,
            caption: draft.caption,
            location: draft.location,
            ride_data: draft.ride_data,
        };
        let created: Photo = with_timeout(self.timeout, self.store.insert_as::<Photo, _>(&row)).await?;
        info!("Posted photo {}", created.id);
        self.view.merge(created.clone()).await;
        Ok(created)
    }

    /// Like if the signed-in principal has not liked `photo_id`, unlike
    /// otherwise. The photo is then refetched so its count is authoritative.
    pub async fn toggle_like(&self, photo_id: Uuid) -> Result<LikeToggle, StoreError> {
        let principal = require_principal(&*self.identity)?;
        let toggle = with_timeout(self.timeout, self.store.toggle_like(principal.id, photo_id)).await?;
        debug!(
            "{} photo {} ({} likes)",
            if toggle.liked { "Liked" } else { "Unliked" },
            photo_id,
            toggle.likes_count
        );

        match with_timeout(self.timeout, self.store.fetch_as::<Photo>(photo_id)).await {
            Ok(photo) => self.view.merge(photo).await,
            // The update event will still refresh it
            Err(e) => warn!("Like on {} applied but refetch failed: {}", photo_id, e),
        }
        Ok(toggle)
    }

    pub fn is_own(&self, photo: &Photo) -> bool {
        self.identity.current_principal().is_some_and(|p| p.id == photo.user_id)
    }

    pub fn close(self) {
        self.view.close();
    }

    pub fn is_closed(&self) -> bool {
        self.view.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_gate_swallows_publishes() {
        let gate = Gate::default();
        assert_eq!(gate.run_open(|| 1), Some(1));
        gate.close();
        assert!(gate.is_closed());
        assert_eq!(gate.run_open(|| 1), None);
    }

    #[test]
    fn capture_draft_defaults() {
        let draft = PhotoDraft::from_capture("file:///DCIM/1.jpg");
        assert_eq!(draft.caption.as_deref(), Some("New ride photo"));
        assert_eq!(draft.location.as_deref(), Some("Current Location"));
        assert!(draft.ride_data.is_none());

        let draft = draft.caption("Fresh pow").ride_data(RideData {
            speed: 42.0,
            elevation: 2453.0,
        });
        assert_eq!(draft.caption.as_deref(), Some("Fresh pow"));
        assert!(draft.ride_data.is_some());
    }

    #[test]
    fn live_states() {
        let mut snapshot = ViewSnapshot::<Message>::loading();
        assert!(!snapshot.is_live());
        snapshot.state = ViewState::Updating;
        assert!(snapshot.is_live());
        snapshot.state = ViewState::Error("down".into());
        assert!(!snapshot.is_live());
    }

    #[tokio::test]
    async fn timeouts_are_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
