//! The remote charger collection.
//!
//! Every adapter pushes a fresh full snapshot to each live
//! [`Subscription`] whenever the data behind it changes. Point reads and
//! writes are plain futures.

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    Stream, StreamExt as _, TryStreamExt as _,
};
use snafu::prelude::*;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio_util::sync::DropGuard;
use tracing::trace;

use crate::model::{
    Charger, ChargerId, ChargingSlot, NearbyService, Rating, ServiceId, SlotId, SlotUpdate,
    UserId,
};

pub mod live;
pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Entity {
    Charger,
    Slot,
    Service,
    Rating,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Charger => "charger",
            Entity::Slot => "charging slot",
            Entity::Service => "nearby service",
            Entity::Rating => "rating",
        };
        f.write_str(name)
    }
}

/// The coarse classification callers branch on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    Network,
    NotFound,
    PermissionDenied,
    Unknown,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("Timed out after {timeout:?} waiting to {operation}"))]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[snafu(display("Could not reach the charger store"))]
    Unreachable { source: BoxError },

    #[snafu(display("The {entity} `{id}` does not exist"))]
    NotFound { entity: Entity, id: String },

    #[snafu(display("Not permitted to {operation}"))]
    PermissionDenied { operation: &'static str },

    #[snafu(display("The charger store failed"))]
    Backend { source: BoxError },
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        use StoreError::*;

        match self {
            Timeout { .. } | Unreachable { .. } => StoreErrorKind::Network,
            NotFound { .. } => StoreErrorKind::NotFound,
            PermissionDenied { .. } => StoreErrorKind::PermissionDenied,
            Backend { .. } => StoreErrorKind::Unknown,
        }
    }

    pub(crate) fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        NotFoundSnafu {
            entity,
            id: id.to_string(),
        }
        .build()
    }
}

pub type StoreResult<T, E = StoreError> = std::result::Result<T, E>;

/// Bounds a store call by `timeout`, reporting expiry as a network
/// failure.
pub async fn with_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => TimeoutSnafu { operation, timeout }.fail(),
    }
}

/// A live, push-based view of the store.
///
/// Each item is a complete snapshot. A store failure is delivered as a
/// single `Err` after which the stream ends. Dropping the subscription
/// (or calling [`Subscription::close`]) releases the underlying
/// listener.
#[must_use = "a subscription does nothing unless polled"]
pub struct Subscription<T> {
    label: Label,
    inner: BoxStream<'static, StoreResult<T>>,
    guard: Option<DropGuard>,
}

impl<T> Subscription<T> {
    pub fn new(
        name: &'static str,
        inner: impl Stream<Item = StoreResult<T>> + Send + 'static,
    ) -> Self
    where
        T: Send + 'static,
    {
        trace!(name, "subscription opened");
        Self {
            label: Label(name),
            inner: end_after_error(inner.boxed()).boxed(),
            guard: None,
        }
    }

    /// Ties the lifetime of a background task to this subscription.
    pub(crate) fn with_guard(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn name(&self) -> &'static str {
        self.label.0
    }

    /// Transforms every snapshot, keeping errors and lifetime intact.
    pub fn map<U>(
        self,
        name: &'static str,
        f: impl FnMut(T) -> U + Send + 'static,
    ) -> Subscription<U>
    where
        T: 'static,
    {
        let Self {
            mut label,
            inner,
            guard,
        } = self;
        label.0 = name;

        Subscription {
            label,
            inner: inner.map_ok(f).boxed(),
            guard,
        }
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Yields up to and including the first `Err`. The inner stream is
/// dropped as soon as the error has been handed out.
fn end_after_error<T>(
    inner: BoxStream<'static, StoreResult<T>>,
) -> impl Stream<Item = StoreResult<T>> + Send + 'static
where
    T: Send + 'static,
{
    stream::unfold(Some(inner), |inner| async move {
        let mut inner = inner?;
        let item = inner.next().await?;
        let rest = item.is_ok().then_some(inner);
        Some((item, rest))
    })
}

struct Label(&'static str);

impl Drop for Label {
    fn drop(&mut self) {
        trace!(name = self.0, "subscription released");
    }
}

impl<T> Stream for Subscription<T> {
    type Item = StoreResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.label.0)
            .finish_non_exhaustive()
    }
}

/// A remote document collection of chargers with nested slot, service
/// and rating sub-collections.
///
/// Removing a charger removes everything nested under it. Favorite
/// membership is mutated with set semantics so that concurrent changes
/// by different users commute.
pub trait ChargerStore: Send + Sync + fmt::Debug {
    fn subscribe_all(&self) -> Subscription<Vec<Charger>>;

    fn subscribe_favorites(&self, user: &UserId) -> Subscription<Vec<Charger>>;

    /// `None` while the charger does not exist (yet).
    fn subscribe_charger(&self, id: &ChargerId) -> Subscription<Option<Charger>>;

    fn subscribe_slots(&self, charger: &ChargerId) -> Subscription<Vec<ChargingSlot>>;

    fn subscribe_services(&self, charger: &ChargerId) -> Subscription<Vec<NearbyService>>;

    fn subscribe_ratings(&self, charger: &ChargerId) -> Subscription<Vec<Rating>>;

    fn list(&self) -> BoxFuture<'_, StoreResult<Vec<Charger>>>;

    fn list_slots(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<ChargingSlot>>>;

    fn list_services(&self, charger: &ChargerId)
        -> BoxFuture<'_, StoreResult<Vec<NearbyService>>>;

    fn list_ratings(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<Rating>>>;

    fn get(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<Charger>>;

    /// Writes `charger` under its pre-assigned id. Writing the same id
    /// again overwrites the document.
    fn create(&self, charger: Charger) -> BoxFuture<'_, StoreResult<Charger>>;

    fn delete(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<()>>;

    /// Adds `user` to (or removes it from) the favorite set, returning
    /// the charger as stored afterwards.
    fn set_favorite(
        &self,
        id: &ChargerId,
        user: &UserId,
        desired: bool,
    ) -> BoxFuture<'_, StoreResult<Charger>>;

    fn create_slot(&self, slot: ChargingSlot) -> BoxFuture<'_, StoreResult<ChargingSlot>>;

    fn update_slot(
        &self,
        id: &SlotId,
        update: SlotUpdate,
    ) -> BoxFuture<'_, StoreResult<ChargingSlot>>;

    fn report_damage(&self, id: &SlotId, damaged: bool)
        -> BoxFuture<'_, StoreResult<ChargingSlot>>;

    fn add_service(&self, service: NearbyService) -> BoxFuture<'_, StoreResult<NearbyService>>;

    fn remove_service(
        &self,
        charger: &ChargerId,
        id: &ServiceId,
    ) -> BoxFuture<'_, StoreResult<NearbyService>>;

    /// One rating per (charger, user); rating again replaces the stars.
    fn rate(&self, rating: Rating) -> BoxFuture<'_, StoreResult<Rating>>;
}
