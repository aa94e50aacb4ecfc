use chrono::Utc;
use futures::{future, future::BoxFuture, FutureExt as _};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

use super::{
    live::{Change, ChangeBus},
    ChargerStore, Entity, StoreError, StoreResult, Subscription,
};
use crate::model::{
    Charger, ChargerId, ChargingSlot, NearbyService, Rating, RatingId, ServiceId, SlotId,
    SlotUpdate, UserId,
};

#[derive(Debug, Default)]
struct State {
    chargers: BTreeMap<ChargerId, Charger>,
    slots: BTreeMap<SlotId, ChargingSlot>,
    services: BTreeMap<ServiceId, NearbyService>,
    ratings: BTreeMap<RatingId, Rating>,
    fault: Option<Fault>,
}

/// Simulated outage, used to exercise failure paths.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails as if the network were down.
    Offline,
    /// Every call fails as if the caller lacked write access.
    ReadOnly,
    /// Point reads and writes never complete.
    Stalled,
}

impl State {
    fn check(&self, operation: &'static str) -> StoreResult<()> {
        match self.fault {
            None | Some(Fault::Stalled) => Ok(()),
            Some(Fault::Offline) => Err(StoreError::Unreachable {
                source: "the in-memory store is offline".into(),
            }),
            Some(Fault::ReadOnly) => Err(StoreError::PermissionDenied { operation }),
        }
    }

    fn charger(&self, id: &ChargerId) -> StoreResult<&Charger> {
        self.chargers
            .get(id)
            .ok_or_else(|| StoreError::not_found(Entity::Charger, id))
    }

    fn charger_mut(&mut self, id: &ChargerId) -> StoreResult<&mut Charger> {
        self.chargers
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(Entity::Charger, id))
    }

    fn slot_mut(&mut self, id: &SlotId) -> StoreResult<&mut ChargingSlot> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(Entity::Slot, id))
    }

    fn favorites_of(&self, user: &UserId) -> Vec<Charger> {
        self.chargers
            .values()
            .filter(|c| c.is_favorited_by(user))
            .cloned()
            .collect()
    }

    fn slots_of(&self, charger: &ChargerId) -> Vec<ChargingSlot> {
        self.slots
            .values()
            .filter(|s| &s.charger_id == charger)
            .cloned()
            .collect()
    }

    fn services_of(&self, charger: &ChargerId) -> Vec<NearbyService> {
        self.services
            .values()
            .filter(|s| &s.charger_id == charger)
            .cloned()
            .collect()
    }

    fn ratings_of(&self, charger: &ChargerId) -> Vec<Rating> {
        self.ratings
            .values()
            .filter(|r| &r.charger_id == charger)
            .cloned()
            .collect()
    }
}

/// A charger store held entirely in process memory.
///
/// Cloning yields another handle onto the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    bus: ChangeBus,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live subscriptions currently attached.
    pub fn listeners(&self) -> usize {
        self.bus.listeners()
    }

    /// Starts (or with `None`, ends) a simulated outage. Subscriptions
    /// re-read immediately, so an outage terminates them.
    pub fn set_fault(&self, fault: Option<Fault>) {
        self.state.lock().fault = fault;
        self.bus.publish(Change::Refresh);
    }

    fn read<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&State) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let state = self.state.lock();
        state.check(operation)?;
        f(&state)
    }

    fn query<T: Send + 'static>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&State) -> StoreResult<T>,
    ) -> BoxFuture<'static, StoreResult<T>> {
        let stalled = self.state.lock().fault == Some(Fault::Stalled);
        if stalled {
            return future::pending().boxed();
        }
        future::ready(self.read(operation, f)).boxed()
    }

    fn write<T: Send + 'static>(
        &self,
        operation: &'static str,
        changes: impl IntoIterator<Item = Change>,
        f: impl FnOnce(&mut State) -> StoreResult<T>,
    ) -> BoxFuture<'static, StoreResult<T>> {
        let r = {
            let mut state = self.state.lock();
            if state.fault == Some(Fault::Stalled) {
                return future::pending().boxed();
            }
            state.check(operation).and_then(|()| f(&mut state))
        };

        if r.is_ok() {
            for change in changes {
                self.bus.publish(change);
            }
        }

        future::ready(r).boxed()
    }

    fn live<T, R, F>(&self, name: &'static str, relevant: R, f: F) -> Subscription<T>
    where
        T: Send + 'static,
        R: Fn(&Change) -> bool + Send + 'static,
        F: Fn(&State) -> T + Send + 'static,
    {
        let state = self.state.clone();
        self.bus.live_query(name, relevant, move || {
            let state = state.lock();
            let r = state.check(name).map(|()| f(&state));
            future::ready(r)
        })
    }
}

impl ChargerStore for MemoryStore {
    fn subscribe_all(&self) -> Subscription<Vec<Charger>> {
        self.live("all chargers", Change::concerns_chargers, |s| {
            s.chargers.values().cloned().collect()
        })
    }

    fn subscribe_favorites(&self, user: &UserId) -> Subscription<Vec<Charger>> {
        let user = user.clone();
        self.live("favorite chargers", Change::concerns_chargers, move |s| {
            s.favorites_of(&user)
        })
    }

    fn subscribe_charger(&self, id: &ChargerId) -> Subscription<Option<Charger>> {
        let id = id.clone();
        self.live("charger", Change::concerns_chargers, move |s| {
            s.chargers.get(&id).cloned()
        })
    }

    fn subscribe_slots(&self, charger: &ChargerId) -> Subscription<Vec<ChargingSlot>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "charging slots",
            move |change| change.concerns_slots_of(&c),
            move |s| s.slots_of(&charger),
        )
    }

    fn subscribe_services(&self, charger: &ChargerId) -> Subscription<Vec<NearbyService>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "nearby services",
            move |change| change.concerns_services_of(&c),
            move |s| s.services_of(&charger),
        )
    }

    fn subscribe_ratings(&self, charger: &ChargerId) -> Subscription<Vec<Rating>> {
        let charger = charger.clone();
        let c = charger.clone();
        self.live(
            "ratings",
            move |change| change.concerns_ratings_of(&c),
            move |s| s.ratings_of(&charger),
        )
    }

    fn list(&self) -> BoxFuture<'_, StoreResult<Vec<Charger>>> {
        self.query("list chargers", |s| Ok(s.chargers.values().cloned().collect()))
    }

    fn list_slots(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<ChargingSlot>>> {
        self.query("list charging slots", |s| Ok(s.slots_of(charger)))
    }

    fn list_services(
        &self,
        charger: &ChargerId,
    ) -> BoxFuture<'_, StoreResult<Vec<NearbyService>>> {
        self.query("list nearby services", |s| Ok(s.services_of(charger)))
    }

    fn list_ratings(&self, charger: &ChargerId) -> BoxFuture<'_, StoreResult<Vec<Rating>>> {
        self.query("list ratings", |s| Ok(s.ratings_of(charger)))
    }

    fn get(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<Charger>> {
        self.query("read a charger", |s| s.charger(id).cloned())
    }

    #[instrument(skip_all, fields(id = %charger.id))]
    fn create(&self, mut charger: Charger) -> BoxFuture<'_, StoreResult<Charger>> {
        self.write("create a charger", [Change::Chargers], |s| {
            // Existing favorites are kept
            if let Some(previous) = s.chargers.get(&charger.id) {
                debug!("Overwrote an existing charger");
                charger
                    .favorited_by
                    .extend(previous.favorited_by.iter().cloned());
            }
            s.chargers.insert(charger.id.clone(), charger.clone());
            Ok(charger)
        })
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &ChargerId) -> BoxFuture<'_, StoreResult<()>> {
        let changes = [
            Change::Chargers,
            Change::Slots(id.clone()),
            Change::Services(id.clone()),
            Change::Ratings(id.clone()),
        ];

        self.write("delete a charger", changes, |s| {
            s.chargers
                .remove(id)
                .ok_or_else(|| StoreError::not_found(Entity::Charger, id))?;
            s.slots.retain(|_, v| &v.charger_id != id);
            s.services.retain(|_, v| &v.charger_id != id);
            s.ratings.retain(|_, v| &v.charger_id != id);
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn set_favorite(
        &self,
        id: &ChargerId,
        user: &UserId,
        desired: bool,
    ) -> BoxFuture<'_, StoreResult<Charger>> {
        self.write("change a favorite", [Change::Chargers], |s| {
            let charger = s.charger_mut(id)?;
            let changed = if desired {
                charger.favorited_by.insert(user.clone())
            } else {
                charger.favorited_by.remove(user)
            };
            if changed {
                charger.updated_at = Utc::now();
            }
            Ok(charger.clone())
        })
    }

    #[instrument(skip_all, fields(id = %slot.id))]
    fn create_slot(&self, slot: ChargingSlot) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        let change = Change::Slots(slot.charger_id.clone());
        self.write("create a charging slot", [change], |s| {
            s.charger(&slot.charger_id)?;
            s.slots.insert(slot.id.clone(), slot.clone());
            Ok(slot)
        })
    }

    #[instrument(skip(self))]
    fn update_slot(
        &self,
        id: &SlotId,
        update: SlotUpdate,
    ) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        self.modify_slot("update a charging slot", id, move |slot| update.apply(slot))
    }

    #[instrument(skip(self))]
    fn report_damage(
        &self,
        id: &SlotId,
        damaged: bool,
    ) -> BoxFuture<'_, StoreResult<ChargingSlot>> {
        self.modify_slot("report slot damage", id, move |slot| slot.damaged = damaged)
    }

    #[instrument(skip_all, fields(id = %service.id))]
    fn add_service(&self, service: NearbyService) -> BoxFuture<'_, StoreResult<NearbyService>> {
        let change = Change::Services(service.charger_id.clone());
        self.write("add a nearby service", [change], |s| {
            s.charger(&service.charger_id)?;
            s.services.insert(service.id.clone(), service.clone());
            Ok(service)
        })
    }

    #[instrument(skip(self))]
    fn remove_service(
        &self,
        charger: &ChargerId,
        id: &ServiceId,
    ) -> BoxFuture<'_, StoreResult<NearbyService>> {
        let change = Change::Services(charger.clone());
        self.write("remove a nearby service", [change], |s| {
            match s.services.get(id) {
                Some(service) if &service.charger_id == charger => {}
                _ => return Err(StoreError::not_found(Entity::Service, id)),
            }
            s.services
                .remove(id)
                .ok_or_else(|| StoreError::not_found(Entity::Service, id))
        })
    }

    #[instrument(skip_all, fields(charger = %rating.charger_id, user = %rating.user_id))]
    fn rate(&self, rating: Rating) -> BoxFuture<'_, StoreResult<Rating>> {
        let change = Change::Ratings(rating.charger_id.clone());
        self.write("rate a charger", [change], |s| {
            s.charger(&rating.charger_id)?;

            let existing = s
                .ratings
                .values_mut()
                .find(|r| r.charger_id == rating.charger_id && r.user_id == rating.user_id);

            let stored = match existing {
                Some(existing) => {
                    existing.stars = rating.stars;
                    existing.updated_at = rating.updated_at;
                    existing.clone()
                }
                None => {
                    s.ratings.insert(rating.id.clone(), rating.clone());
                    rating
                }
            };
            Ok(stored)
        })
    }
}

impl MemoryStore {
    fn modify_slot(
        &self,
        operation: &'static str,
        id: &SlotId,
        f: impl FnOnce(&mut ChargingSlot),
    ) -> BoxFuture<'static, StoreResult<ChargingSlot>> {
        // The owning charger is only known once the slot has been found
        let charger = self
            .state
            .lock()
            .slots
            .get(id)
            .map(|slot| slot.charger_id.clone());
        let changes = charger.map(Change::Slots);

        self.write(operation, changes, |s| {
            let slot = s.slot_mut(id)?;
            f(slot);
            slot.updated_at = Utc::now();
            Ok(slot.clone())
        })
    }
}
