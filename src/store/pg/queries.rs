use chrono::{DateTime, Utc};
use diesel::{pg::Pg, prelude::*};
use itertools::Itertools as _;
use snafu::prelude::*;

use super::schema::{chargers, charging_slots, favorites, nearby_services, ratings};
use crate::{
    geo::Coordinate,
    model::{
        Charger, ChargerId, ChargingSlot, NearbyService, Price, Rating, RatingId, ServiceId,
        SlotId, SlotUpdate, UserId,
    },
    store::Entity,
};

#[derive(Debug, Snafu)]
pub enum QueryError {
    #[snafu(display("The {entity} `{id}` does not exist"))]
    Missing { entity: Entity, id: String },

    #[snafu(display("Column `{column}` holds the unexpected value `{value}`"))]
    Malformed { column: &'static str, value: String },

    #[snafu(display("The database query failed"))]
    #[snafu(context(false))]
    Diesel { source: diesel::result::Error },
}

pub type QueryResult<T, E = QueryError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = chargers, check_for_backend(Pg), treat_none_as_null = true)]
pub(super) struct ChargerRow {
    id: ChargerId,
    name: String,
    latitude: f64,
    longitude: f64,
    image: Option<String>,
    created_by: UserId,
    payment_systems: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Charger> for ChargerRow {
    fn from(c: &Charger) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            latitude: c.location.latitude,
            longitude: c.location.longitude,
            image: c.image.clone(),
            created_by: c.created_by.clone(),
            payment_systems: c.payment_systems.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl ChargerRow {
    fn into_charger(self, favorited_by: impl IntoIterator<Item = UserId>) -> Charger {
        let Self {
            id,
            name,
            latitude,
            longitude,
            image,
            created_by,
            payment_systems,
            created_at,
            updated_at,
        } = self;

        Charger {
            id,
            name,
            location: Coordinate::new(latitude, longitude),
            image,
            favorited_by: favorited_by.into_iter().collect(),
            created_by,
            created_at,
            updated_at,
            payment_systems,
        }
    }
}

// Field order matches the table so rows can be read back from
// `RETURNING *`.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = charging_slots, check_for_backend(Pg))]
pub(super) struct SlotRow {
    id: SlotId,
    charger_id: ChargerId,
    speed: String,
    connector: String,
    available: bool,
    damaged: bool,
    price: Price,
    updated_at: DateTime<Utc>,
}

impl From<&ChargingSlot> for SlotRow {
    fn from(s: &ChargingSlot) -> Self {
        Self {
            id: s.id.clone(),
            charger_id: s.charger_id.clone(),
            speed: s.speed.as_str().into(),
            connector: s.connector.as_str().into(),
            available: s.available,
            damaged: s.damaged,
            price: s.price,
            updated_at: s.updated_at,
        }
    }
}

impl TryFrom<SlotRow> for ChargingSlot {
    type Error = QueryError;

    fn try_from(row: SlotRow) -> QueryResult<Self> {
        let SlotRow {
            id,
            charger_id,
            speed,
            connector,
            available,
            damaged,
            price,
            updated_at,
        } = row;

        let speed = match speed.parse() {
            Ok(v) => v,
            Err(_) => return MalformedSnafu { column: "speed", value: speed }.fail(),
        };
        let connector = match connector.parse() {
            Ok(v) => v,
            Err(_) => {
                return MalformedSnafu {
                    column: "connector",
                    value: connector,
                }
                .fail()
            }
        };

        Ok(ChargingSlot {
            id,
            charger_id,
            speed,
            connector,
            available,
            damaged,
            price,
            updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = nearby_services, check_for_backend(Pg))]
pub(super) struct ServiceRow {
    id: ServiceId,
    charger_id: ChargerId,
    name: String,
    category: String,
    distance_meters: i64,
}

impl From<&NearbyService> for ServiceRow {
    fn from(s: &NearbyService) -> Self {
        Self {
            id: s.id.clone(),
            charger_id: s.charger_id.clone(),
            name: s.name.clone(),
            category: s.category.clone(),
            distance_meters: s.distance_meters.into(),
        }
    }
}

impl TryFrom<ServiceRow> for NearbyService {
    type Error = QueryError;

    fn try_from(row: ServiceRow) -> QueryResult<Self> {
        let distance_meters = u32::try_from(row.distance_meters).ok().context(MalformedSnafu {
            column: "distance_meters",
            value: row.distance_meters.to_string(),
        })?;

        Ok(NearbyService {
            id: row.id,
            charger_id: row.charger_id,
            name: row.name,
            category: row.category,
            distance_meters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = ratings, check_for_backend(Pg))]
pub(super) struct RatingRow {
    id: RatingId,
    charger_id: ChargerId,
    user_id: UserId,
    stars: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Rating> for RatingRow {
    fn from(r: &Rating) -> Self {
        Self {
            id: r.id.clone(),
            charger_id: r.charger_id.clone(),
            user_id: r.user_id.clone(),
            stars: r.stars.into(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl TryFrom<RatingRow> for Rating {
    type Error = QueryError;

    fn try_from(row: RatingRow) -> QueryResult<Self> {
        let stars = u8::try_from(row.stars).ok().context(MalformedSnafu {
            column: "stars",
            value: row.stars.to_string(),
        })?;

        Ok(Rating {
            id: row.id,
            charger_id: row.charger_id,
            user_id: row.user_id,
            stars,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> QueryResult<Vec<T>>
where
    T: TryFrom<R, Error = QueryError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn with_favorites(db: &mut PgConnection, rows: Vec<ChargerRow>) -> QueryResult<Vec<Charger>> {
    let ids = rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>();

    let memberships = favorites::table
        .filter(favorites::charger_id.eq_any(ids))
        .select((favorites::charger_id, favorites::user_id))
        .load::<(ChargerId, UserId)>(db)?;
    let mut memberships = memberships.into_iter().into_group_map();

    let chargers = rows
        .into_iter()
        .map(|row| {
            let fans = memberships.remove(&row.id).unwrap_or_default();
            row.into_charger(fans)
        })
        .collect();

    Ok(chargers)
}

pub(super) fn list_chargers(db: &mut PgConnection) -> QueryResult<Vec<Charger>> {
    db.transaction(|db| {
        let rows = chargers::table
            .select(ChargerRow::as_select())
            .order(chargers::id.asc())
            .load(db)?;
        with_favorites(db, rows)
    })
}

pub(super) fn favorite_chargers(db: &mut PgConnection, user: &UserId) -> QueryResult<Vec<Charger>> {
    db.transaction(|db| {
        let favorite_ids = favorites::table
            .filter(favorites::user_id.eq(user.clone()))
            .select(favorites::charger_id);

        let rows = chargers::table
            .filter(chargers::id.eq_any(favorite_ids))
            .select(ChargerRow::as_select())
            .order(chargers::id.asc())
            .load(db)?;
        with_favorites(db, rows)
    })
}

pub(super) fn find_charger(db: &mut PgConnection, id: &ChargerId) -> QueryResult<Option<Charger>> {
    let row = chargers::table
        .filter(chargers::id.eq(id.clone()))
        .select(ChargerRow::as_select())
        .first(db)
        .optional()?;

    let Some(row) = row else { return Ok(None) };

    let fans = favorites::table
        .filter(favorites::charger_id.eq(id.clone()))
        .select(favorites::user_id)
        .load::<UserId>(db)?;

    Ok(Some(row.into_charger(fans)))
}

pub(super) fn get_charger(db: &mut PgConnection, id: &ChargerId) -> QueryResult<Charger> {
    find_charger(db, id)?.context(MissingSnafu {
        entity: Entity::Charger,
        id: id.as_str(),
    })
}

fn ensure_charger(db: &mut PgConnection, id: &ChargerId) -> QueryResult<()> {
    let exists = diesel::select(diesel::dsl::exists(
        chargers::table.filter(chargers::id.eq(id.clone())),
    ))
    .get_result::<bool>(db)?;

    ensure!(
        exists,
        MissingSnafu {
            entity: Entity::Charger,
            id: id.as_str(),
        }
    );
    Ok(())
}

/// Inserts or overwrites the charger document. Favorite memberships are
/// only ever added here, so a retried create cannot drop a favorite
/// that another user set in between.
pub(super) fn upsert_charger(db: &mut PgConnection, charger: &Charger) -> QueryResult<Charger> {
    db.transaction(|db| {
        let row = ChargerRow::from(charger);

        diesel::insert_into(chargers::table)
            .values(&row)
            .on_conflict(chargers::id)
            .do_update()
            .set(&row)
            .execute(db)?;

        let memberships = charger
            .favorited_by
            .iter()
            .map(|user| {
                (
                    favorites::charger_id.eq(charger.id.clone()),
                    favorites::user_id.eq(user.clone()),
                )
            })
            .collect::<Vec<_>>();

        if !memberships.is_empty() {
            diesel::insert_into(favorites::table)
                .values(memberships)
                .on_conflict_do_nothing()
                .execute(db)?;
        }

        get_charger(db, &charger.id)
    })
}

pub(super) fn delete_charger(db: &mut PgConnection, id: &ChargerId) -> QueryResult<()> {
    let deleted = diesel::delete(chargers::table.filter(chargers::id.eq(id.clone()))).execute(db)?;

    ensure!(
        deleted > 0,
        MissingSnafu {
            entity: Entity::Charger,
            id: id.as_str(),
        }
    );
    Ok(())
}

pub(super) fn set_favorite(
    db: &mut PgConnection,
    id: &ChargerId,
    user: &UserId,
    desired: bool,
    now: DateTime<Utc>,
) -> QueryResult<Charger> {
    db.transaction(|db| {
        ensure_charger(db, id)?;

        let changed = if desired {
            diesel::insert_into(favorites::table)
                .values((
                    favorites::charger_id.eq(id.clone()),
                    favorites::user_id.eq(user.clone()),
                    favorites::created_at.eq(now),
                ))
                .on_conflict_do_nothing()
                .execute(db)?
        } else {
            diesel::delete(
                favorites::table
                    .filter(favorites::charger_id.eq(id.clone()))
                    .filter(favorites::user_id.eq(user.clone())),
            )
            .execute(db)?
        };

        if changed > 0 {
            diesel::update(chargers::table.filter(chargers::id.eq(id.clone())))
                .set(chargers::updated_at.eq(now))
                .execute(db)?;
        }

        get_charger(db, id)
    })
}

pub(super) fn slots_of(db: &mut PgConnection, charger: &ChargerId) -> QueryResult<Vec<ChargingSlot>> {
    let rows = charging_slots::table
        .filter(charging_slots::charger_id.eq(charger.clone()))
        .select(SlotRow::as_select())
        .order(charging_slots::id.asc())
        .load(db)?;
    convert_all(rows)
}

pub(super) fn insert_slot(db: &mut PgConnection, slot: &ChargingSlot) -> QueryResult<ChargingSlot> {
    db.transaction(|db| {
        ensure_charger(db, &slot.charger_id)?;

        let row = diesel::insert_into(charging_slots::table)
            .values(SlotRow::from(slot))
            .get_result::<SlotRow>(db)?;
        row.try_into()
    })
}

fn find_slot(db: &mut PgConnection, id: &SlotId) -> QueryResult<ChargingSlot> {
    let row = charging_slots::table
        .filter(charging_slots::id.eq(id.clone()))
        .select(SlotRow::as_select())
        .first(db)
        .optional()?
        .context(MissingSnafu {
            entity: Entity::Slot,
            id: id.as_str(),
        })?;
    row.try_into()
}

pub(super) fn update_slot(
    db: &mut PgConnection,
    id: &SlotId,
    update: &SlotUpdate,
    now: DateTime<Utc>,
) -> QueryResult<ChargingSlot> {
    db.transaction(|db| {
        let mut slot = find_slot(db, id)?;
        update.apply(&mut slot);
        slot.updated_at = now;

        diesel::update(charging_slots::table.filter(charging_slots::id.eq(id.clone())))
            .set(&SlotRow::from(&slot))
            .execute(db)?;

        Ok(slot)
    })
}

pub(super) fn set_slot_damaged(
    db: &mut PgConnection,
    id: &SlotId,
    damaged: bool,
    now: DateTime<Utc>,
) -> QueryResult<ChargingSlot> {
    let row = diesel::update(charging_slots::table.filter(charging_slots::id.eq(id.clone())))
        .set((
            charging_slots::damaged.eq(damaged),
            charging_slots::updated_at.eq(now),
        ))
        .get_result::<SlotRow>(db)
        .optional()?
        .context(MissingSnafu {
            entity: Entity::Slot,
            id: id.as_str(),
        })?;
    row.try_into()
}

pub(super) fn services_of(
    db: &mut PgConnection,
    charger: &ChargerId,
) -> QueryResult<Vec<NearbyService>> {
    let rows = nearby_services::table
        .filter(nearby_services::charger_id.eq(charger.clone()))
        .select(ServiceRow::as_select())
        .order((nearby_services::distance_meters.asc(), nearby_services::id.asc()))
        .load(db)?;
    convert_all(rows)
}

pub(super) fn insert_service(
    db: &mut PgConnection,
    service: &NearbyService,
) -> QueryResult<NearbyService> {
    db.transaction(|db| {
        ensure_charger(db, &service.charger_id)?;

        let row = diesel::insert_into(nearby_services::table)
            .values(ServiceRow::from(service))
            .get_result::<ServiceRow>(db)?;
        row.try_into()
    })
}

pub(super) fn delete_service(
    db: &mut PgConnection,
    charger: &ChargerId,
    id: &ServiceId,
) -> QueryResult<NearbyService> {
    let row = diesel::delete(
        nearby_services::table
            .filter(nearby_services::id.eq(id.clone()))
            .filter(nearby_services::charger_id.eq(charger.clone())),
    )
    .get_result::<ServiceRow>(db)
    .optional()?
    .context(MissingSnafu {
        entity: Entity::Service,
        id: id.as_str(),
    })?;
    row.try_into()
}

pub(super) fn ratings_of(db: &mut PgConnection, charger: &ChargerId) -> QueryResult<Vec<Rating>> {
    let rows = ratings::table
        .filter(ratings::charger_id.eq(charger.clone()))
        .select(RatingRow::as_select())
        .order(ratings::created_at.asc())
        .load(db)?;
    convert_all(rows)
}

pub(super) fn upsert_rating(db: &mut PgConnection, rating: &Rating) -> QueryResult<Rating> {
    db.transaction(|db| {
        ensure_charger(db, &rating.charger_id)?;

        let row = RatingRow::from(rating);
        let row = diesel::insert_into(ratings::table)
            .values(&row)
            .on_conflict((ratings::charger_id, ratings::user_id))
            .do_update()
            .set((
                ratings::stars.eq(row.stars),
                ratings::updated_at.eq(row.updated_at),
            ))
            .get_result::<RatingRow>(db)?;
        row.try_into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChargingSpeed, ConnectorType};

    fn slot_row(speed: &str) -> SlotRow {
        SlotRow {
            id: "s".into(),
            charger_id: "c".into(),
            speed: speed.into(),
            connector: "TYPE2".into(),
            available: true,
            damaged: false,
            price: Price(0.25),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn slot_rows_convert_both_ways() {
        let row = slot_row("MEDIUM");

        let slot = ChargingSlot::try_from(row.clone()).unwrap();
        assert_eq!(slot.speed, ChargingSpeed::Medium);
        assert_eq!(slot.connector, ConnectorType::Type2);

        assert_eq!(SlotRow::from(&slot), row);
    }

    #[test]
    fn unknown_speeds_are_malformed() {
        let e = ChargingSlot::try_from(slot_row("LUDICROUS")).unwrap_err();
        assert!(
            matches!(e, QueryError::Malformed { column: "speed", .. }),
            "{e:?}"
        );
    }

    #[test]
    fn negative_distances_are_malformed() {
        let row = ServiceRow {
            id: "s".into(),
            charger_id: "c".into(),
            name: "Café".into(),
            category: "catering.cafe".into(),
            distance_meters: -1,
        };

        let e = NearbyService::try_from(row).unwrap_err();
        assert!(matches!(e, QueryError::Malformed { .. }), "{e:?}");
    }

    #[test]
    fn charger_rows_carry_favorites() {
        let now = Utc::now();
        let row = ChargerRow {
            id: "c".into(),
            name: "Alvalade".into(),
            latitude: 38.75,
            longitude: -9.14,
            image: None,
            created_by: "u0".into(),
            payment_systems: vec!["MB WAY".into()],
            created_at: now,
            updated_at: now,
        };

        let charger = row.clone().into_charger([UserId::from("u1"), UserId::from("u2")]);
        assert_eq!(charger.favorited_by.len(), 2);
        assert_eq!(charger.location, Coordinate::new(38.75, -9.14));
        assert_eq!(ChargerRow::from(&charger), row);
    }
}
