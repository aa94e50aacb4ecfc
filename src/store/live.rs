use futures::{future, stream, Future, StreamExt as _};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{trace, warn};

use super::{StoreResult, Subscription};
use crate::model::ChargerId;

/// Something in the store changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A charger document (including its favorite set) was written or
    /// removed.
    Chargers,
    Slots(ChargerId),
    Services(ChargerId),
    Ratings(ChargerId),
    /// Anything may have changed; every subscription re-reads.
    Refresh,
}

impl Change {
    pub fn concerns_chargers(&self) -> bool {
        matches!(self, Change::Chargers | Change::Refresh)
    }

    pub fn concerns_slots_of(&self, charger: &ChargerId) -> bool {
        match self {
            Change::Slots(c) => c == charger,
            Change::Refresh => true,
            _ => false,
        }
    }

    pub fn concerns_services_of(&self, charger: &ChargerId) -> bool {
        match self {
            Change::Services(c) => c == charger,
            Change::Refresh => true,
            _ => false,
        }
    }

    pub fn concerns_ratings_of(&self, charger: &ChargerId) -> bool {
        match self {
            Change::Ratings(c) => c == charger,
            Change::Refresh => true,
            _ => false,
        }
    }
}

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ChangeBus(broadcast::Sender<Change>);

impl Default for ChangeBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Self(tx)
    }
}

impl ChangeBus {
    pub fn publish(&self, change: Change) {
        trace!(?change, "publishing change");
        self.0.send(change).ok(/* Don't care if no listener */);
    }

    /// The number of live subscriptions currently attached.
    pub fn listeners(&self) -> usize {
        self.0.receiver_count()
    }

    fn listen(&self) -> BroadcastStream<Change> {
        BroadcastStream::new(self.0.subscribe())
    }

    /// A subscription that reads a snapshot right away and again after
    /// every change `relevant` accepts.
    ///
    /// The listener is attached before the first read so no change can
    /// slip between the two. After `fetch` fails once the error is
    /// delivered and the subscription ends, releasing the listener.
    pub fn live_query<T, R, F, Fut>(
        &self,
        name: &'static str,
        relevant: R,
        mut fetch: F,
    ) -> Subscription<T>
    where
        T: Send + 'static,
        R: Fn(&Change) -> bool + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let changes = self.listen().filter_map(move |change| {
            let hit = match change {
                Ok(change) => relevant(&change),
                Err(BroadcastStreamRecvError::Lagged(amt)) => {
                    warn!(name, "Lost {amt} changes due to lag; re-reading");
                    true
                }
            };
            future::ready(hit.then_some(()))
        });

        let snapshots = stream::once(future::ready(()))
            .chain(changes)
            .then(move |()| fetch());

        Subscription::new(name, snapshots)
    }
}
