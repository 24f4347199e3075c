//! Data store client: a typed wrapper over the remote relational store.
//!
//! Rows travel as JSON objects, exactly as the backend serves them. The
//! [`StoreExt`] helpers decode them into `slope_types` records.
//!
//! Two implementations ship here:
//! - [`LocalStore`]: an embedded SQLite store with an in-process change feed.
//!   The server runs on top of it and tests use it directly.
//! - [`RemoteStore`]: HTTP + WebSocket client for a running server.

pub mod error;
pub mod local;
pub mod remote;

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use slope_types::api::{Filter, LikeToggle, Order, Query};
use slope_types::events::{ChangeEvent, ChangeKind, Resource};
use slope_types::models::Record;

pub use error::StoreError;
pub use local::LocalStore;
pub use remote::RemoteStore;

pub trait DataStore: Send + Sync + 'static {
    /// Filtered, ordered, limited read. Rows carry joined author data.
    fn query(&self, query: Query) -> impl Future<Output = Result<Vec<Value>, StoreError>> + Send;

    /// Single row by id, with joined author data.
    fn fetch(&self, resource: Resource, id: Uuid) -> impl Future<Output = Result<Value, StoreError>> + Send;

    /// Create a row. The store assigns `id` and `created_at` and returns the
    /// stored row.
    fn insert(&self, resource: Resource, row: Value) -> impl Future<Output = Result<Value, StoreError>> + Send;

    /// Like if absent, unlike if present, in one round trip.
    fn toggle_like(
        &self,
        user_id: Uuid,
        photo_id: Uuid,
    ) -> impl Future<Output = Result<LikeToggle, StoreError>> + Send;

    /// Start receiving change events for rows of `resource` matching
    /// `filter`. The subscription is live once this resolves.
    fn subscribe(
        &self,
        resource: Resource,
        filter: Filter,
        events: Vec<ChangeKind>,
    ) -> impl Future<Output = Result<ChangeStream, StoreError>> + Send;
}

/// Change events for one subscription, in the order the store emitted them.
///
/// `next` returning `None` means the transport dropped. Dropping the stream
/// cancels the subscription.
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Typed access on top of any [`DataStore`].
pub trait StoreExt: DataStore {
    fn query_as<R: Record>(
        &self,
        filter: Filter,
        order: Option<Order>,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<R>, StoreError>> + Send {
        async move {
            let query = Query { resource: R::RESOURCE, filter, order, limit };
            self.query(query).await?.into_iter().map(decode::<R>).collect()
        }
    }

    fn fetch_as<R: Record>(&self, id: Uuid) -> impl Future<Output = Result<R, StoreError>> + Send {
        async move { decode(self.fetch(R::RESOURCE, id).await?) }
    }

    fn insert_as<R: Record, N: Serialize + Sync>(
        &self,
        row: &N,
    ) -> impl Future<Output = Result<R, StoreError>> + Send {
        async move {
            let value = serde_json::to_value(row)
                .map_err(|e| StoreError::Rejected(format!("unserializable {} row: {}", R::RESOURCE, e)))?;
            decode(self.insert(R::RESOURCE, value).await?)
        }
    }
}

impl<S: DataStore> StoreExt for S {}

pub fn decode<R: Record>(row: Value) -> Result<R, StoreError> {
    serde_json::from_value(row)
        .map_err(|e| StoreError::Rejected(format!("malformed {} row: {}", R::RESOURCE, e)))
}
