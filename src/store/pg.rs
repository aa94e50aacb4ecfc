use chrono::Utc;
use diesel::{
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use futures::{future::BoxFuture, FutureExt as _, StreamExt as _};
use snafu::prelude::*;
use std::time::Duration;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, Span};

use super::{
    live::{Change, ChangeBus},
    BoxError, ChargerStore, StoreError, StoreResult, Subscription,
};
use crate::model::{
    Charger, ChargerId, ChargingSlot, NearbyService, Rating, ServiceId, SlotId, SlotUpdate,
    UserId,
};

mod queries;
mod schema;

use queries::{QueryError, QueryResult};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn init(database_url: &str) -> PgResult<PgConnection> {
    let mut db = PgConnection::establish(database_url).context(ConnectSnafu)?;
    apply_migrations(&mut db)?;
    Ok(db)
}

fn apply_migrations(db: &mut PgConnection) -> PgResult<()> {
    let migrations = db
        .pending_migrations(MIGRATIONS)
        .context(MigrationListSnafu)?;

    for migration in migrations {
        info!("Starting migration {}", migration.name());
        db.run_migration(&migration).context(MigrationRunSnafu)?;
    }

    Ok(())
}

type Job = Box<dyn FnOnce(&mut PgConnection) + Send>;

type ChannelData = (Span, Job);

/// A charger store backed by PostgreSQL.
///
/// All queries run on a single connection owned by [`Task`]. Live
/// subscriptions re-read whenever a write goes through this process;
/// writes made by other processes are picked up by
/// [`PgStore::poll_for_changes`].
#[derive(Debug, Clone)]
pub struct PgStore {
    tx: mpsc::Sender<ChannelData>,
    bus: ChangeBus,
}

impl PgStore {
    pub fn new(database_url: &str, token: CancellationToken) -> PgResult<(Self, Task)> {
        let db = init(database_url)?;

        let (tx, rx) = mpsc::channel(4);

        let this = Self {
            tx,
            bus: ChangeBus::default(),
        };
        let task = Task { rx, db, token };

        Ok((this, task))
    }

    /// Periodically tells every subscription to re-read, until `token`
    /// is cancelled.
    pub async fn poll_for_changes(self, every: Duration, token: CancellationToken) {
        let mut ticks = IntervalStream::new(time::interval_at(Instant::now() + every, every));

        loop {
            select! {
                () = token.cancelled() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    debug!(listeners = self.bus.listeners(), "refreshing subscriptions");
                    self.bus.publish(Change::Refresh);
                }
            }
        }
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> QueryResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |db| {
            tx.send(f(db)).ok(/* Don't care if receiver is gone */);
        });

        let span = info_span!("database", operation);
        self.tx
            .send((span, job))
            .await
            .send_context(SendToTaskSnafu)
            .map_err(unreachable)?;
        let r = rx
            .await
            .context(ReceiveFromTaskSnafu)
            .map_err(unreachable)?;

        r.map_err(|e| classify(operation, e))
    }

    async fn write<T, F>(
        &self,
        operation: &'static str,
        changes: impl IntoIterator<Item = Change>,
        f: F,
    ) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> QueryResult<T> + Send + 'static,
    {
        let v = self.run(operation, f).await?;
        for change in changes {
            self.bus.publish(change);
        }
        Ok(v)
    }

    fn live<T, R, F>(&self, name: &'static str, relevant: R, f: F) -> Subscription<T>
    where
        T: Send + 'static,
        R: Fn(&Change) -> bool + Send + 'static,
        F: Fn(&mut PgConnection) -> QueryResult<T> + Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        self.bus.live_query(name, relevant, move || {
            let this = this.clone();
            let f = f.clone();
            async move { this.run(name, f).await }
        })
    }
}

fn unreachable(e: PgError) -> StoreError {
    StoreError::Unreachable {
        source: BoxError::from(e),
    }
}

fn classify(operation: &'static str, e: QueryError) -> StoreError {
    use DatabaseErrorKind::*;

    match e {
        QueryError::Missing { entity, id } => StoreError::NotFound { entity, id },

        QueryError::Diesel {
            source: DieselError::DatabaseError(ClosedConnection | UnableToSendCommand, _),
        }
        | QueryError::Diesel {
            source: DieselError::BrokenTransactionManager,
        } => StoreError::Unreachable {
            source: BoxError::from(e),
        },

        QueryError::Diesel {
            source: DieselError::DatabaseError(ReadOnlyTransaction, _),
        } => StoreError::PermissionDenied { operation },

        e => StoreError::Backend {
            source: BoxError::from(e),
        },
    }
}

impl ChargerStore for PgStore {
    fn subscribe_all(&self) -> Subscription<Vec<Charger>> {
        self.live(
            "all chargers",
            Change::concerns_chargers,
            queries::list_chargers,
        )
    }

    fn subscribe_favorites(&self, user: &UserId) -> Subscription<Vec<Charger>> {
        let user = user.clone();
        self.live(
            "favorite chargers",
            Change::concerns_chargers,
            move |db| queries::favorite_chargers(db, &user),
        )
    }

    fn subscribe_charger(&self, id: &ChargerId) -> Subscription<Option<Charger>> {
        let id = id.clone();
        self.live("charger", Change::concerns_chargers, move |db| {
            queries::find_charger(db, &id)
        })
    }

    fn subscribe_slots(&self, charger: &ChargerId) -> Subscription<Vec<ChargingSlot>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "charging slots",
            move |change| change.concerns_slots_of(&c),
            move |db| queries::slots_of(db, &charger),
        )
    }

    fn subscribe_services(&self, charger: &ChargerId) -> Subscription<Vec<NearbyService>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "nearby services",
            move |change| change.concerns_services_of(&c),
            move |db| queries::services_of(db, &charger),
        )
    }

    fn subscribe_ratings(&self, charger: &ChargerId) -> Subscription<Vec<Rating>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "ratings",
            move |change| change.concerns_ratings_of(&c),
            move |db| queries::ratings_of(db, &charger),
        )
    }

    fn list(&self) -> BoxFuture<'_, StoreResult<Vec<Charger>>> {
        self.run("list chargers", queries::list_chargers).boxed()
    }

    fn list_slots(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<ChargingSlot>>> {
        let charger = charger.clone();
        self.run("list charging slots", move |db| {
            queries::slots_of(db, &charger)
        })
        .boxed()
    }

    fn list_services(
        &self,
        charger: &ChargerId,
    ) -> BoxFuture<'_, StoreResult<Vec<NearbyService>>> {
        let charger = charger.clone();
        self.run("list nearby services", move |db| {
            queries::services_of(db, &charger)
        })
        .boxed()
    }

    fn list_ratings(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<Rating>>> {
        let charger = charger.clone();
        self.run("list ratings", move |db| queries::ratings_of(db, &charger))
            .boxed()
    }

    fn get(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<Charger>> {
        let id = id.clone();
        self.run("read a charger", move |db| queries::get_charger(db, &id))
            .boxed()
    }

    #[instrument(skip_all, fields(id = %charger.id))]
    fn create(&self, charger: Charger) -> BoxFuture<'_, StoreResult<Charger>> {
        self.write("create a charger", [Change::Chargers], move |db| {
            queries::upsert_charger(db, &charger)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<()>> {
        let changes = [
            Change::Chargers,
            Change::Slots(id.clone()),
            Change::Services(id.clone()),
            Change::Ratings(id.clone()),
        ];

        let id = id.clone();
        self.write("delete a charger", changes, move |db| {
            queries::delete_charger(db, &id)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    fn set_favorite(
        &self,
        id: &ChargerId,
        user: &UserId,
        desired: bool,
    ) -> BoxFuture<'_, StoreResult<Charger>> {
        let id = id.clone();
        let user = user.clone();
        self.write("change a favorite", [Change::Chargers], move |db| {
            queries::set_favorite(db, &id, &user, desired, Utc::now())
        })
        .boxed()
    }

    #[instrument(skip_all, fields(id = %slot.id))]
    fn create_slot(&self, slot: ChargingSlot) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        let change = Change::Slots(slot.charger_id.clone());
        self.write("create a charging slot", [change], move |db| {
            queries::insert_slot(db, &slot)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    fn update_slot(
        &self,
        id: &SlotId,
        update: SlotUpdate,
    ) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        let id = id.clone();
        async move {
            let slot = self
                .run("update a charging slot", move |db| {
                    queries::update_slot(db, &id, &update, Utc::now())
                })
                .await?;
            self.bus.publish(Change::Slots(slot.charger_id.clone()));
            Ok(slot)
        }
        .boxed()
    }

    #[instrument(skip(self))]
    fn report_damage(
        &self,
        id: &SlotId,
        damaged: bool,
    ) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        let id = id.clone();
        async move {
            let slot = self
                .run("report slot damage", move |db| {
                    queries::set_slot_damaged(db, &id, damaged, Utc::now())
                })
                .await?;
            self.bus.publish(Change::Slots(slot.charger_id.clone()));
            Ok(slot)
        }
        .boxed()
    }

    #[instrument(skip_all, fields(id = %service.id))]
    fn add_service(&self, service: NearbyService) -> BoxFuture<'_, StoreResult<NearbyService>> {
        let change = Change::Services(service.charger_id.clone());
        self.write("add a nearby service", [change], move |db| {
            queries::insert_service(db, &service)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    fn remove_service(
        &self,
        charger: &ChargerId,
        id: &ServiceId,
    ) -> BoxFuture<'_, StoreResult<NearbyService>> {
        let change = Change::Services(charger.clone());
        let charger = charger.clone();
        let id = id.clone();
        self.write("remove a nearby service", [change], move |db| {
            queries::delete_service(db, &charger, &id)
        })
        .boxed()
    }

    #[instrument(skip_all, fields(charger = %rating.charger_id, user = %rating.user_id))]
    fn rate(&self, rating: Rating) -> BoxFuture<'_, StoreResult<Rating>> {
        let change = Change::Ratings(rating.charger_id.clone());
        self.write("rate a charger", [change], move |db| {
            queries::upsert_rating(db, &rating)
        })
        .boxed()
    }
}

trait SendContext<T, E> {
    fn send_context<C>(self, ctx: C) -> Result<(), E>
    where
        C: snafu::IntoError<E, Source = mpsc::error::SendError<()>>,
        E: snafu::Error + snafu::ErrorCompat;
}

impl<T, E> SendContext<T, E> for Result<(), mpsc::error::SendError<T>> {
    fn send_context<C>(self, ctx: C) -> Result<(), E>
    where
        C: snafu::IntoError<E, Source = mpsc::error::SendError<()>>,
        E: snafu::Error + snafu::ErrorCompat,
    {
        self.map_err(|_| mpsc::error::SendError(())).context(ctx)
    }
}

#[derive(Debug, Snafu)]
pub enum PgError {
    #[snafu(display("Could not connect to database"))]
    Connect {
        source: diesel::result::ConnectionError,
    },

    #[snafu(display("Could not determine migration status"))]
    MigrationList {
        source: Box<dyn snafu::Error + Send + Sync>,
    },

    #[snafu(display("Could not run migrations"))]
    MigrationRun {
        source: Box<dyn snafu::Error + Send + Sync>,
    },

    #[snafu(display("The database task has stopped"))]
    SendToTask {
        source: mpsc::error::SendError<()>,
    },

    #[snafu(display("The database task dropped the request"))]
    ReceiveFromTask {
        source: oneshot::error::RecvError,
    },
}

pub type PgResult<T, E = PgError> = std::result::Result<T, E>;

/// Owns the database connection and runs queued queries one at a
/// time. Must be run on a thread where blocking is allowed.
pub struct Task {
    rx: mpsc::Receiver<ChannelData>,
    db: PgConnection,
    token: CancellationToken,
}

impl Task {
    #[instrument(skip_all)]
    pub fn run(mut self) {
        let Self { rx, db, token } = &mut self;

        info!("starting task");

        let mut next_job = move || {
            futures::executor::block_on(async {
                select! {
                    () = token.cancelled() => None,
                    job = rx.recv() => job,
                }
            })
        };

        while let Some((span, job)) = next_job() {
            let _span = span.enter();
            job(db);
        }

        info!("stopping task");
    }
}
