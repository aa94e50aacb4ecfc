//! The charger directory: live views over the store plus validated
//! mutations and an in-memory search.
//!
//! Bounds filtering happens here rather than in the store, once per
//! upstream snapshot.

use chrono::{DateTime, Utc};
use futures::{
    future::{self, BoxFuture},
    stream, Future, FutureExt as _, StreamExt as _, TryFutureExt as _, TryStreamExt as _,
};
use serde::Deserialize;
use snafu::prelude::*;
use std::{cmp::Ordering, fmt, sync::Arc, time::Duration};
use tokio::{select, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::{
    geo::{self, Bounds, Coordinate},
    identity::IdentityProvider,
    model::{
        Charger, ChargerId, ChargerWithDetails, ChargingSlot, ChargingSpeed, NearbyService,
        NewCharger, NewService, NewSlot, Price, Rating, RatingId, RatingSummary, ServiceId,
        SlotId, SlotUpdate, UserId,
    },
    store::{
        with_timeout, ChargerStore, Entity, StoreError, StoreErrorKind, StoreResult, Subscription,
    },
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        chrono::Utc::now()
    }
}

/// Rejected input. Nothing was sent to the store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    #[snafu(display("The name must not be blank"))]
    BlankName,

    #[snafu(display("A location is required"))]
    MissingLocation,

    #[snafu(display("{location} is not a valid location"))]
    InvalidLocation { location: Coordinate },

    #[snafu(display("Bounds need all of south, west, north and east"))]
    IncompleteBounds,

    #[snafu(display(
        "The bounds {}, {} to {}, {} are not a valid area",
        bounds.south, bounds.west, bounds.north, bounds.east
    ))]
    InvalidBounds { bounds: Bounds },

    #[snafu(display("The price {price} must not be negative"))]
    InvalidPrice { price: Price },

    #[snafu(display("A rating of {stars} is not between 1 and 5 stars"))]
    InvalidStars { stars: u8 },
}

#[derive(Debug, Snafu)]
pub enum DirectoryError {
    #[snafu(display("Invalid request"))]
    #[snafu(context(false))]
    Invalid { source: ValidationError },

    #[snafu(display("Could not {operation}"))]
    Store {
        operation: &'static str,
        source: StoreError,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirectoryErrorKind {
    Invalid,
    Store(StoreErrorKind),
}

impl DirectoryError {
    pub fn kind(&self) -> DirectoryErrorKind {
        match self {
            DirectoryError::Invalid { .. } => DirectoryErrorKind::Invalid,
            DirectoryError::Store { source, .. } => DirectoryErrorKind::Store(source.kind()),
        }
    }
}

pub type DirectoryResult<T, E = DirectoryError> = std::result::Result<T, E>;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Distance,
    Price,
    Availability,
}

/// Criteria for [`ChargerDirectory::search`]. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Case-insensitive substring of the charger's name.
    pub query: Option<String>,
    /// At least one slot of this speed.
    pub speed: Option<ChargingSpeed>,
    /// Whether a usable slot (available and not damaged) matching
    /// `speed` exists.
    pub available: Option<bool>,
    /// Ceiling for the cheapest slot matching `speed`.
    pub max_price: Option<Price>,
    pub sort: SortKey,
    /// Where distances are measured from. Without it the distance sort
    /// orders by id alone.
    pub origin: Option<Coordinate>,
}

impl SearchFilter {
    fn slot_matches(&self, slot: &ChargingSlot) -> bool {
        self.speed.map_or(true, |speed| slot.speed == speed)
    }

    fn matches(&self, details: &ChargerWithDetails) -> bool {
        if let Some(query) = &self.query {
            let query = query.trim().to_lowercase();
            if !details.charger.name.to_lowercase().contains(&query) {
                return false;
            }
        }

        let mut matching = details.slots.iter().filter(|s| self.slot_matches(s));

        if self.speed.is_some() && matching.clone().next().is_none() {
            return false;
        }

        if let Some(available) = self.available {
            if matching.any(ChargingSlot::is_usable) != available {
                return false;
            }
        }

        if let Some(max_price) = self.max_price {
            match details.cheapest_price(|s| self.slot_matches(s)) {
                Some(price) if price <= max_price => {}
                _ => return false,
            }
        }

        true
    }

    fn compare(&self, a: &ChargerWithDetails, b: &ChargerWithDetails) -> Ordering {
        let by_key = match self.sort {
            SortKey::Distance => match self.origin {
                Some(origin) => {
                    let d = |c: &ChargerWithDetails| geo::distance_meters(origin, c.charger.location);
                    d(a).total_cmp(&d(b))
                }
                None => Ordering::Equal,
            },

            SortKey::Price => {
                let p = |c: &ChargerWithDetails| c.cheapest_price(|s| self.slot_matches(s));
                match (p(a), p(b)) {
                    (Some(a), Some(b)) => a.0.total_cmp(&b.0),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }

            SortKey::Availability => b.usable_slots().cmp(&a.usable_slots()),
        };

        by_key.then_with(|| a.charger.id.cmp(&b.charger.id))
    }
}

/// The core service consumers talk to.
///
/// Point reads and writes are bounded by a timeout; expiry is reported
/// as a network failure.
#[derive(Debug, Clone)]
pub struct ChargerDirectory {
    store: Arc<dyn ChargerStore>,
    time: Arc<dyn TimeSource>,
    timeout: Duration,
}

impl ChargerDirectory {
    pub fn new(store: Arc<dyn ChargerStore>) -> Self {
        Self {
            store,
            time: Arc::new(SystemTime),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> DirectoryResult<T> {
        with_timeout(operation, self.timeout, fut)
            .await
            .context(StoreSnafu { operation })
    }

    pub async fn chargers(&self) -> DirectoryResult<Vec<Charger>> {
        self.call("list chargers", self.store.list()).await
    }

    pub fn all_chargers(&self) -> Subscription<Vec<Charger>> {
        self.store.subscribe_all()
    }

    pub fn chargers_in_bounds(&self, bounds: Bounds) -> Subscription<Vec<Charger>> {
        self.store
            .subscribe_all()
            .map("chargers in bounds", move |chargers| {
                chargers
                    .into_iter()
                    .filter(|c| bounds.contains(c.location))
                    .collect()
            })
    }

    pub fn favorites_for(&self, user: &UserId) -> Subscription<Vec<Charger>> {
        self.store.subscribe_favorites(user)
    }

    /// Follows whoever is signed in, switching to their favorites as
    /// the user changes. Emits an empty list while signed out.
    pub fn favorites_for_current_user(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Subscription<Vec<Charger>> {
        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();

        let store = self.store.clone();
        let mut users = identity.user_changes();

        tokio::spawn(async move {
            let mut current: Option<Subscription<Vec<Charger>>> = None;

            loop {
                let next_snapshot = async {
                    match &mut current {
                        Some(s) => s.next().await,
                        None => future::pending().await,
                    }
                };

                select! {
                    () = token.cancelled() => break,

                    user = users.next() => match user {
                        Some(Some(user)) => {
                            debug!(%user, "following favorites");
                            current = Some(store.subscribe_favorites(&user));
                        }
                        Some(None) => {
                            current = None;
                            if tx.send(Ok(vec![])).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },

                    snapshot = next_snapshot => match snapshot {
                        Some(snapshot) => {
                            let failed = snapshot.is_err();
                            if tx.send(snapshot).await.is_err() || failed {
                                break;
                            }
                        }
                        None => current = None,
                    },
                }
            }

            trace!("stopped following favorites");
        });

        Subscription::new("current user's favorites", ReceiverStream::new(rx)).with_guard(guard)
    }

    /// Flips `user`'s membership in the charger's favorite set,
    /// returning the charger as stored afterwards.
    #[instrument(skip(self))]
    pub async fn toggle_favorite(&self, id: &ChargerId, user: &UserId) -> DirectoryResult<Charger> {
        let charger = self.call("read a charger", self.store.get(id)).await?;
        let desired = !charger.is_favorited_by(user);

        self.call("change a favorite", self.store.set_favorite(id, user, desired))
            .await
    }

    /// A live composite of the charger, its slots, services and
    /// ratings.
    ///
    /// Nothing is emitted until every part has arrived and the charger
    /// exists. If the charger disappears afterwards a not-found error
    /// ends the stream.
    pub fn charger_with_details(&self, id: &ChargerId) -> Subscription<ChargerWithDetails> {
        let parts = stream::select_all([
            self.store.subscribe_charger(id).map_ok(Part::Charger).boxed(),
            self.store.subscribe_slots(id).map_ok(Part::Slots).boxed(),
            self.store.subscribe_services(id).map_ok(Part::Services).boxed(),
            self.store.subscribe_ratings(id).map_ok(Part::Ratings).boxed(),
        ]);

        let details = parts
            .scan(Latest::new(id.clone()), |latest, part| {
                future::ready(latest.absorb(part))
            })
            .filter_map(future::ready);

        Subscription::new("charger details", details)
    }

    #[instrument(skip_all, fields(name = %new.name, %creator))]
    pub async fn create_charger(
        &self,
        new: NewCharger,
        creator: &UserId,
    ) -> DirectoryResult<Charger> {
        let NewCharger {
            name,
            location,
            image,
            payment_systems,
        } = new;

        let name = name.trim();
        ensure!(!name.is_empty(), BlankNameSnafu);
        let location = location.context(MissingLocationSnafu)?;
        ensure!(location.is_valid(), InvalidLocationSnafu { location });

        let payment_systems = payment_systems
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        let now = self.time.now();
        let charger = Charger {
            id: ChargerId::random(),
            name: name.into(),
            location,
            image,
            favorited_by: Default::default(),
            created_by: creator.clone(),
            created_at: now,
            updated_at: now,
            payment_systems,
        };

        let charger = self
            .call("create a charger", self.store.create(charger))
            .await?;
        info!(id = %charger.id, "Created charger");
        Ok(charger)
    }

    #[instrument(skip(self))]
    pub async fn delete_charger(&self, id: &ChargerId) -> DirectoryResult<()> {
        self.call("delete a charger", self.store.delete(id)).await
    }

    #[instrument(skip(self, new))]
    pub async fn create_slot(
        &self,
        charger: &ChargerId,
        new: NewSlot,
    ) -> DirectoryResult<ChargingSlot> {
        validate_price(new.price)?;

        let slot = ChargingSlot {
            id: SlotId::random(),
            charger_id: charger.clone(),
            speed: new.speed,
            connector: new.connector,
            available: new.available,
            damaged: false,
            price: new.price,
            updated_at: self.time.now(),
        };

        self.call("create a charging slot", self.store.create_slot(slot))
            .await
    }

    #[instrument(skip(self))]
    pub async fn update_slot(
        &self,
        id: &SlotId,
        update: SlotUpdate,
    ) -> DirectoryResult<ChargingSlot> {
        if let Some(price) = update.price {
            validate_price(price)?;
        }

        self.call("update a charging slot", self.store.update_slot(id, update))
            .await
    }

    #[instrument(skip(self))]
    pub async fn report_damage(&self, id: &SlotId, damaged: bool) -> DirectoryResult<ChargingSlot> {
        self.call("report slot damage", self.store.report_damage(id, damaged))
            .await
    }

    #[instrument(skip(self, new))]
    pub async fn add_service(
        &self,
        charger: &ChargerId,
        new: NewService,
    ) -> DirectoryResult<NearbyService> {
        let name = new.name.trim();
        ensure!(!name.is_empty(), BlankNameSnafu);

        let service = NearbyService {
            id: ServiceId::random(),
            charger_id: charger.clone(),
            name: name.into(),
            category: new.category,
            distance_meters: new.distance_meters,
        };

        self.call("add a nearby service", self.store.add_service(service))
            .await
    }

    #[instrument(skip(self))]
    pub async fn remove_service(
        &self,
        charger: &ChargerId,
        id: &ServiceId,
    ) -> DirectoryResult<NearbyService> {
        self.call("remove a nearby service", self.store.remove_service(charger, id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn rate_charger(
        &self,
        charger: &ChargerId,
        user: &UserId,
        stars: u8,
    ) -> DirectoryResult<Rating> {
        ensure!((1..=5).contains(&stars), InvalidStarsSnafu { stars });

        let now = self.time.now();
        let rating = Rating {
            id: RatingId::random(),
            charger_id: charger.clone(),
            user_id: user.clone(),
            stars,
            created_at: now,
            updated_at: now,
        };

        self.call("rate a charger", self.store.rate(rating)).await
    }

    /// A one-shot search over the current collection. No match is an
    /// empty list, not an error.
    #[instrument(skip(self))]
    pub async fn search(&self, filter: &SearchFilter) -> DirectoryResult<Vec<ChargerWithDetails>> {
        let chargers = self.call("list chargers", self.store.list()).await?;

        let fetches = chargers
            .into_iter()
            .map(|charger| self.details_of(charger));
        let everything = self
            .call("read charger details", future::try_join_all(fetches))
            .await?;

        let total = everything.len();
        let mut found: Vec<_> = everything
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();
        found.sort_by(|a, b| filter.compare(a, b));

        debug!(total, found = found.len(), "Searched chargers");
        Ok(found)
    }

    fn details_of(&self, charger: Charger) -> BoxFuture<'_, StoreResult<ChargerWithDetails>> {
        let id = charger.id.clone();
        let parts = future::try_join3(
            self.store.list_slots(&id),
            self.store.list_services(&id),
            self.store.list_ratings(&id),
        );

        parts
            .map_ok(move |(slots, services, ratings)| ChargerWithDetails {
                charger,
                slots,
                services,
                rating: RatingSummary::from_ratings(&ratings),
            })
            .boxed()
    }
}

fn validate_price(price: Price) -> Result<(), ValidationError> {
    ensure!(price.is_valid(), InvalidPriceSnafu { price });
    Ok(())
}

enum Part {
    Charger(Option<Charger>),
    Slots(Vec<ChargingSlot>),
    Services(Vec<NearbyService>),
    Ratings(Vec<Rating>),
}

struct Latest {
    id: ChargerId,
    charger: Option<Option<Charger>>,
    slots: Option<Vec<ChargingSlot>>,
    services: Option<Vec<NearbyService>>,
    ratings: Option<Vec<Rating>>,
    seen: bool,
    done: bool,
}

impl Latest {
    fn new(id: ChargerId) -> Self {
        Self {
            id,
            charger: None,
            slots: None,
            services: None,
            ratings: None,
            seen: false,
            done: false,
        }
    }

    /// `None` ends the stream; `Some(None)` waits for more parts.
    fn absorb(&mut self, part: StoreResult<Part>) -> Option<Option<StoreResult<ChargerWithDetails>>> {
        if self.done {
            return None;
        }

        let part = match part {
            Ok(part) => part,
            Err(e) => {
                self.done = true;
                return Some(Some(Err(e)));
            }
        };

        match part {
            Part::Charger(c) => {
                self.seen |= c.is_some();
                self.charger = Some(c);
            }
            Part::Slots(s) => self.slots = Some(s),
            Part::Services(s) => self.services = Some(s),
            Part::Ratings(r) => self.ratings = Some(r),
        }

        if self.seen && matches!(self.charger, Some(None)) {
            self.done = true;
            return Some(Some(Err(StoreError::not_found(Entity::Charger, &self.id))));
        }

        Some(self.assemble().map(Ok))
    }

    fn assemble(&self) -> Option<ChargerWithDetails> {
        let Some(Some(charger)) = &self.charger else {
            return None;
        };

        Some(ChargerWithDetails {
            charger: charger.clone(),
            slots: self.slots.clone()?,
            services: self.services.clone()?,
            rating: RatingSummary::from_ratings(self.ratings.as_deref()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::SessionIdentity,
        model::ConnectorType,
        store::memory::{
            tests::{charger, slot},
            Fault, MemoryStore,
        },
    };
    use std::collections::BTreeSet;

    fn directory() -> (MemoryStore, ChargerDirectory) {
        let store = MemoryStore::new();
        let directory = ChargerDirectory::new(Arc::new(store.clone()));
        (store, directory)
    }

    /// Charger A in Lisbon with a usable fast slot and a damaged slow
    /// one.
    async fn lisbon(store: &MemoryStore) -> ChargerId {
        let mut a = charger("a", 38.7369, -9.1366);
        a.name = "Saldanha".into();
        store.create(a).await.unwrap();
        store
            .create_slot(slot("a", ChargingSpeed::Fast, true, false, 0.35))
            .await
            .unwrap();
        store
            .create_slot(slot("a", ChargingSpeed::Slow, true, true, 0.20))
            .await
            .unwrap();
        "a".into()
    }

    fn ids(found: &[ChargerWithDetails]) -> Vec<&str> {
        found.iter().map(|d| d.charger.id.as_str()).collect()
    }

    #[tokio::test]
    async fn search_by_speed_and_availability() {
        let (store, directory) = directory();
        lisbon(&store).await;

        let fast = SearchFilter {
            speed: Some(ChargingSpeed::Fast),
            available: Some(true),
            ..Default::default()
        };
        assert_eq!(ids(&directory.search(&fast).await.unwrap()), ["a"]);

        let slow = SearchFilter {
            speed: Some(ChargingSpeed::Slow),
            available: Some(true),
            ..Default::default()
        };
        assert!(directory.search(&slow).await.unwrap().is_empty());

        let medium = SearchFilter {
            speed: Some(ChargingSpeed::Medium),
            ..Default::default()
        };
        assert!(directory.search(&medium).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_without_filters_returns_everything_in_id_order() {
        let (store, directory) = directory();
        store.create(charger("c", 1.0, 1.0)).await.unwrap();
        store.create(charger("a", 2.0, 2.0)).await.unwrap();
        store.create(charger("b", 3.0, 3.0)).await.unwrap();

        let found = directory.search(&SearchFilter::default()).await.unwrap();
        assert_eq!(ids(&found), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn search_sorts_by_distance_from_the_origin() {
        let (store, directory) = directory();
        store.create(charger("far", 41.1579, -8.6291)).await.unwrap();
        store.create(charger("near", 38.7223, -9.1393)).await.unwrap();
        store.create(charger("mid", 39.7436, -8.8071)).await.unwrap();

        let filter = SearchFilter {
            origin: Some(Coordinate::new(38.7369, -9.1366)),
            ..Default::default()
        };
        let found = directory.search(&filter).await.unwrap();
        assert_eq!(ids(&found), ["near", "mid", "far"]);
    }

    #[tokio::test]
    async fn search_sorts_by_price_and_availability() {
        let (store, directory) = directory();
        for id in ["x", "y", "z"] {
            store.create(charger(id, 0.0, 0.0)).await.unwrap();
        }
        store
            .create_slot(slot("x", ChargingSpeed::Fast, true, false, 0.50))
            .await
            .unwrap();
        store
            .create_slot(slot("y", ChargingSpeed::Fast, true, false, 0.30))
            .await
            .unwrap();
        store
            .create_slot(slot("y", ChargingSpeed::Slow, true, false, 0.30))
            .await
            .unwrap();

        let by_price = SearchFilter {
            sort: SortKey::Price,
            ..Default::default()
        };
        let found = directory.search(&by_price).await.unwrap();
        assert_eq!(ids(&found), ["y", "x", "z"]);

        let by_availability = SearchFilter {
            sort: SortKey::Availability,
            ..Default::default()
        };
        let found = directory.search(&by_availability).await.unwrap();
        assert_eq!(ids(&found), ["y", "x", "z"]);

        let cheap = SearchFilter {
            max_price: Some(Price(0.40)),
            ..Default::default()
        };
        let found = directory.search(&cheap).await.unwrap();
        assert_eq!(ids(&found), ["y"]);
    }

    #[tokio::test]
    async fn search_by_name_ignores_case() {
        let (store, directory) = directory();
        lisbon(&store).await;
        store.create(charger("b", 0.0, 0.0)).await.unwrap();

        let filter = SearchFilter {
            query: Some(" saldanha ".into()),
            ..Default::default()
        };
        assert_eq!(ids(&directory.search(&filter).await.unwrap()), ["a"]);
    }

    #[tokio::test]
    async fn bounds_views_only_contain_chargers_inside() {
        let (store, directory) = directory();
        let bounds = Bounds::new(38.0, -10.0, 39.0, -9.0);
        let mut view = directory.chargers_in_bounds(bounds);

        assert!(view.next().await.unwrap().unwrap().is_empty());

        store.create(charger("lisbon", 38.7369, -9.1366)).await.unwrap();
        store.create(charger("porto", 41.1579, -8.6291)).await.unwrap();
        store.create(charger("edge", 39.0, -9.0)).await.unwrap();

        let mut last = vec![];
        while last.len() < 2 {
            last = view.next().await.unwrap().unwrap();
            for c in &last {
                assert!(bounds.contains(c.location), "{c:?}");
            }
        }

        let names: BTreeSet<_> = last.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(names, BTreeSet::from(["edge", "lisbon"]));
    }

    #[tokio::test]
    async fn toggling_twice_restores_membership() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;
        let u1 = UserId::from("u1");

        let once = directory.toggle_favorite(&a, &u1).await.unwrap();
        assert!(once.is_favorited_by(&u1));

        let twice = directory.toggle_favorite(&a, &u1).await.unwrap();
        assert!(!twice.is_favorited_by(&u1));
    }

    #[tokio::test]
    async fn concurrent_toggles_by_different_users_commute() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));

        let (r1, r2) = tokio::join!(
            directory.toggle_favorite(&a, &u1),
            directory.toggle_favorite(&a, &u2),
        );
        r1.unwrap();
        r2.unwrap();

        let stored = store.get(&a).await.unwrap();
        assert_eq!(stored.favorited_by, BTreeSet::from([u1, u2]));
    }

    #[tokio::test]
    async fn favorites_follow_the_current_user() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;
        store.set_favorite(&a, &"u1".into(), true).await.unwrap();

        let identity = SessionIdentity::signed_out();
        let mut view = directory.favorites_for_current_user(&identity);
        assert!(view.next().await.unwrap().unwrap().is_empty());

        identity.sign_in("u1");
        let favorites = view.next().await.unwrap().unwrap();
        assert_eq!(favorites.len(), 1);

        identity.sign_in("u2");
        assert!(view.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_current_user_view_releases_the_store() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;
        store.set_favorite(&a, &"u1".into(), true).await.unwrap();

        let identity = SessionIdentity::signed_in("u1");
        let mut view = directory.favorites_for_current_user(&identity);
        assert_eq!(view.next().await.unwrap().unwrap().len(), 1);
        assert_eq!(store.listeners(), 1);

        drop(view);

        tokio::time::timeout(Duration::from_secs(1), async {
            while store.listeners() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("the favorites listener was never released");
    }

    #[tokio::test]
    async fn details_combine_every_part() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;

        let mut details = directory.charger_with_details(&a);
        let first = loop {
            let d = details.next().await.unwrap().unwrap();
            if d.slots.len() == 2 {
                break d;
            }
        };
        assert_eq!(first.rating.count, 0);

        directory.rate_charger(&a, &"u1".into(), 4).await.unwrap();
        let rated = loop {
            let d = details.next().await.unwrap().unwrap();
            if d.rating.count == 1 {
                break d;
            }
        };
        assert_eq!(rated.rating.average, Some(4.0));
    }

    #[tokio::test]
    async fn details_wait_for_a_late_charger() {
        let (store, directory) = directory();
        let mut details = directory.charger_with_details(&"late".into());

        let created = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::task::yield_now().await;
                store.create(charger("late", 0.0, 0.0)).await.unwrap();
            }
        });

        let d = details.next().await.unwrap().unwrap();
        assert_eq!(d.charger.id.as_str(), "late");
        created.await.unwrap();
    }

    #[tokio::test]
    async fn details_end_when_the_charger_is_deleted() {
        let (store, directory) = directory();
        let a = lisbon(&store).await;

        let mut details = directory.charger_with_details(&a);
        details.next().await.unwrap().unwrap();

        directory.delete_charger(&a).await.unwrap();

        let e = loop {
            match details.next().await.unwrap() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(e.kind(), StoreErrorKind::NotFound);
        assert!(details.next().await.is_none());
    }

    #[tokio::test]
    async fn validation_happens_before_the_store() {
        let (store, directory) = directory();
        store.set_fault(Some(Fault::Offline));
        let creator = UserId::from("u1");

        let blank = NewCharger {
            name: "  ".into(),
            location: Some(Coordinate::new(0.0, 0.0)),
            ..Default::default()
        };
        let e = directory.create_charger(blank, &creator).await.unwrap_err();
        assert!(
            matches!(e, DirectoryError::Invalid { source: ValidationError::BlankName }),
            "{e:?}"
        );

        let nowhere = NewCharger {
            name: "Somewhere".into(),
            ..Default::default()
        };
        let e = directory.create_charger(nowhere, &creator).await.unwrap_err();
        assert!(
            matches!(e, DirectoryError::Invalid { source: ValidationError::MissingLocation }),
            "{e:?}"
        );

        let negative = NewSlot {
            speed: ChargingSpeed::Fast,
            connector: ConnectorType::Ccs2,
            price: Price(-0.01),
            available: true,
        };
        let e = directory
            .create_slot(&"a".into(), negative)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), DirectoryErrorKind::Invalid);

        let e = directory
            .rate_charger(&"a".into(), &creator, 6)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), DirectoryErrorKind::Invalid);
    }

    #[tokio::test]
    async fn created_chargers_get_fresh_ids() {
        let (_store, directory) = directory();
        let new = NewCharger {
            name: " Alvalade ".into(),
            location: Some(Coordinate::new(38.75, -9.14)),
            payment_systems: vec!["MB WAY".into(), " ".into()],
            ..Default::default()
        };

        let a = directory
            .create_charger(new.clone(), &"u1".into())
            .await
            .unwrap();
        let b = directory
            .create_charger(new, &"u1".into())
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "Alvalade");
        assert_eq!(a.payment_systems, ["MB WAY"]);
        assert!(a.favorited_by.is_empty());
    }

    #[tokio::test]
    async fn stalled_stores_time_out_as_network_errors() {
        let (store, directory) = directory();
        let directory = directory.with_timeout(Duration::from_millis(20));
        let a = lisbon(&store).await;
        store.set_fault(Some(Fault::Stalled));

        let e = directory
            .toggle_favorite(&a, &"u1".into())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), DirectoryErrorKind::Store(StoreErrorKind::Network));
    }

    #[tokio::test]
    async fn live_views_end_after_a_store_failure() {
        let (store, directory) = directory();
        let mut view = directory.chargers_in_bounds(Bounds::new(-90.0, -180.0, 90.0, 180.0));
        view.next().await.unwrap().unwrap();

        store.set_fault(Some(Fault::Offline));

        let e = view.next().await.unwrap().unwrap_err();
        assert_eq!(e.kind(), StoreErrorKind::Network);
        assert!(view.next().await.is_none());
    }

    #[tokio::test]
    async fn missing_chargers_are_not_found() {
        let (_store, directory) = directory();

        let e = directory
            .toggle_favorite(&"nope".into(), &"u1".into())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), DirectoryErrorKind::Store(StoreErrorKind::NotFound));

        let e = directory
            .update_slot(&"nope".into(), SlotUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), DirectoryErrorKind::Store(StoreErrorKind::NotFound));
    }
}
