//! Realtime sync core: keeps chat and photo views consistent across
//! concurrently connected clients.
//!
//! - [`manager::SubscriptionManager`] holds one upstream subscription per
//!   (resource, filter) pair and re-establishes it after transport drops.
//! - [`synchronizer::Synchronizer`] opens views: each view owns an ordered,
//!   deduplicated slice of one resource and publishes snapshots to the UI.
//! - [`identity::Session`] is the injected identity provider.

pub mod config;
pub mod identity;
pub mod manager;
pub mod ride;
pub mod synchronizer;
pub mod timeline;
pub mod view;

pub use config::SyncConfig;
pub use identity::{IdentityProvider, Session};
pub use manager::{SubscriptionHandle, SubscriptionKey, SubscriptionManager, SyncSignal};
pub use synchronizer::Synchronizer;
pub use view::{MessageView, PhotoDraft, PhotoView, ViewSnapshot, ViewState};
