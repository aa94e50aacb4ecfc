//! Fake chargers around Lisbon for trying the service out.

use rand::{seq::SliceRandom as _, Rng};
use tracing::info;

use crate::{
    directory::{ChargerDirectory, DirectoryResult},
    geo::{self, Coordinate},
    model::{
        Charger, ChargingSpeed, ConnectorType, NewCharger, NewService, NewSlot, Price, UserId,
    },
};

const CENTER: Coordinate = Coordinate::new(38.7223, -9.1393);
const SPREAD_M: f64 = 5_000.0;

const NEIGHBORHOODS: &[&str] = &[
    "Alvalade",
    "Areeiro",
    "Belém",
    "Benfica",
    "Campo de Ourique",
    "Estrela",
    "Parque das Nações",
    "Saldanha",
];

const PAYMENT_SYSTEMS: &[&str] = &["MB WAY", "Mastercard", "Miio", "Mobi.E", "Visa"];

const SERVICES: &[(&str, &str)] = &[
    ("Pastelaria", "catering.cafe"),
    ("Tasca", "catering.restaurant"),
    ("Mercearia", "commercial.supermarket"),
    ("Hotel", "accommodation.hotel"),
];

struct FakeCharger {
    charger: NewCharger,
    slots: Vec<NewSlot>,
    services: Vec<NewService>,
}

fn fake_charger(rng: &mut impl Rng, n: usize) -> FakeCharger {
    let neighborhood = NEIGHBORHOODS.choose(rng).copied().unwrap_or("Lisboa");
    let location = geo::offset_meters(
        CENTER,
        rng.gen_range(-SPREAD_M..SPREAD_M),
        rng.gen_range(-SPREAD_M..SPREAD_M),
    );

    let count = rng.gen_range(1..=3);
    let payment_systems = PAYMENT_SYSTEMS
        .choose_multiple(rng, count)
        .map(|&p| p.into())
        .collect();

    let slots = (0..rng.gen_range(1..=4))
        .map(|_| NewSlot {
            speed: *ChargingSpeed::ALL.choose(rng).unwrap_or(&ChargingSpeed::Medium),
            connector: *ConnectorType::ALL.choose(rng).unwrap_or(&ConnectorType::Type2),
            price: Price((rng.gen_range(0.15..0.60_f64) * 100.0).round() / 100.0),
            available: rng.gen_bool(0.7),
        })
        .collect();

    let count = rng.gen_range(0..=2);
    let services = SERVICES
        .choose_multiple(rng, count)
        .map(|&(name, category)| NewService {
            name: format!("{name} {neighborhood}"),
            category: category.into(),
            distance_meters: rng.gen_range(20..400),
        })
        .collect();

    FakeCharger {
        charger: NewCharger {
            name: format!("{neighborhood} #{n}"),
            location: Some(location),
            image: None,
            payment_systems,
        },
        slots,
        services,
    }
}

/// Creates `count` chargers, each with a few slots and services.
pub async fn seed(directory: &ChargerDirectory, count: usize) -> DirectoryResult<Vec<Charger>> {
    let fakes: Vec<_> = {
        let mut rng = rand::thread_rng();
        (1..=count).map(|n| fake_charger(&mut rng, n)).collect()
    };

    let creator = UserId::from("fake-data");
    let mut created = Vec::with_capacity(count);

    for FakeCharger {
        charger,
        slots,
        services,
    } in fakes
    {
        let charger = directory.create_charger(charger, &creator).await?;
        for slot in slots {
            directory.create_slot(&charger.id, slot).await?;
        }
        for service in services {
            directory.add_service(&charger.id, service).await?;
        }
        created.push(charger);
    }

    info!(count = created.len(), "Seeded fake chargers");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{directory::SearchFilter, store::MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn seeded_chargers_are_searchable() {
        let directory = ChargerDirectory::new(Arc::new(MemoryStore::new()));

        let created = seed(&directory, 5).await.unwrap();
        assert_eq!(created.len(), 5);

        let found = directory.search(&SearchFilter::default()).await.unwrap();
        assert_eq!(found.len(), 5);
        assert!(found.iter().all(|d| !d.slots.is_empty()));
        assert!(found
            .iter()
            .all(|d| geo::distance_meters(CENTER, d.charger.location) < 2.0 * SPREAD_M));
    }
}
