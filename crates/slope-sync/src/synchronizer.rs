use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use slope_store::{DataStore, StoreError};
use slope_types::api::Filter;
use slope_types::models::{Message, Photo, Record, channel_slug};

use crate::config::SyncConfig;
use crate::identity::IdentityProvider;
use crate::manager::SubscriptionManager;
use crate::view::{LiveView, MessageView, PhotoView};

/// Entry point for the UI: opens chat channels and the photo feed over a
/// shared store and subscription manager.
pub struct Synchronizer<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityProvider>,
    manager: SubscriptionManager<S>,
    config: SyncConfig,
}

impl<S: DataStore> Synchronizer<S> {
    pub fn new(store: Arc<S>, identity: Arc<dyn IdentityProvider>, config: SyncConfig) -> Self {
        let manager = SubscriptionManager::new(store.clone(), config.clone());
        Self {
            store,
            identity,
            manager,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn manager(&self) -> &SubscriptionManager<S> {
        &self.manager
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// Open the channel behind a display label such as "Safety Channel".
    /// The view starts in `Loading` and moves to `Ready` once the newest
    /// messages are in.
    pub async fn open_channel(&self, label: &str) -> Result<MessageView<S>, StoreError> {
        let channel = channel_slug(label);
        if channel.is_empty() {
            return Err(StoreError::Rejected(format!("'{}' does not name a channel", label)));
        }

        let filter = Filter::new().eq("channel", channel.as_str());
        let view = self
            .open_view::<Message>(filter, self.config.message_limit, format!("#{}", channel))
            .await?;
        info!("Opened channel #{}", channel);

        Ok(MessageView::new(
            view,
            channel,
            self.store.clone(),
            self.identity.clone(),
            self.config.request_timeout,
        ))
    }

    /// Close `current` before opening the next channel, so nothing from the
    /// old channel can publish into the new view.
    pub async fn switch_channel(&self, current: MessageView<S>, label: &str) -> Result<MessageView<S>, StoreError> {
        current.close();
        self.open_channel(label).await
    }

    pub async fn open_photos(&self) -> Result<PhotoView<S>, StoreError> {
        let view = self
            .open_view::<Photo>(Filter::new(), self.config.photo_limit, "photo feed".into())
            .await?;
        Ok(PhotoView::new(
            view,
            self.store.clone(),
            self.identity.clone(),
            self.config.request_timeout,
        ))
    }

    /// Whether `author` is the signed-in principal.
    pub fn is_own(&self, author: Uuid) -> bool {
        self.identity.current_principal().is_some_and(|p| p.id == author)
    }

    async fn open_view<R: Record>(&self, filter: Filter, limit: u32, label: String) -> Result<LiveView<R>, StoreError> {
        let subscription = self.manager.open(R::RESOURCE, filter).await?;
        Ok(LiveView::spawn(
            self.store.clone(),
            subscription,
            limit,
            self.config.request_timeout,
            label,
        ))
    }
}
