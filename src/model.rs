use chrono::{DateTime, Utc};
use diesel_derive_newtype::DieselNewType;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::geo::Coordinate;

const ID_LENGTH: usize = 20;

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug,
                Clone,
                PartialEq,
                Eq,
                PartialOrd,
                Ord,
                Hash,
                derive_more::Display,
                derive_more::From,
                DieselNewType,
                Serialize,
                Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub String);

            impl $name {
                /// A fresh random token, assigned client-side so that a
                /// retried write targets the same document.
                pub fn random() -> Self {
                    Self(random_token())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.into())
                }
            }
        )*
    };
}

id_type! {
    ChargerId,
    SlotId,
    ServiceId,
    RatingId,
    /// Stable id of a user as supplied by the identity provider.
    UserId,
}

/// A price per kWh. Never negative once it has passed validation.
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    PartialEq,
    PartialOrd,
    DieselNewType,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Price(pub f64);

impl Price {
    pub const ZERO: Self = Price(0.0);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0.0 && self.0.is_finite()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("`{value}` is not a known {kind}"))]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )*
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)*
                    value => UnknownVariantSnafu { kind: $kind, value }.fail(),
                }
            }
        }
    };
}

wire_enum!(ChargingSpeed, "charging speed", {
    Fast => "FAST",
    Medium => "MEDIUM",
    Slow => "SLOW",
});

wire_enum!(ConnectorType, "connector type", {
    Ccs2 => "CCS2",
    Type2 => "TYPE2",
});

/// A charging station, the root aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charger {
    pub id: ChargerId,
    pub name: String,
    pub location: Coordinate,
    pub image: Option<String>,
    /// Every user that has marked this charger as a favorite.
    pub favorited_by: BTreeSet<UserId>,
    pub created_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    pub payment_systems: Vec<String>,
}

impl Charger {
    pub fn is_favorited_by(&self, user: &UserId) -> bool {
        self.favorited_by.contains(user)
    }
}

/// One charging position within a charger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSlot {
    pub id: SlotId,
    pub charger_id: ChargerId,
    pub speed: ChargingSpeed,
    pub connector: ConnectorType,
    pub available: bool,
    pub damaged: bool,
    pub price: Price,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ChargingSlot {
    /// A damaged slot never counts as available.
    pub fn is_usable(&self) -> bool {
        self.available && !self.damaged
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyService {
    pub id: ServiceId,
    pub charger_id: ChargerId,
    pub name: String,
    pub category: String,
    pub distance_meters: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub id: RatingId,
    pub charger_id: ChargerId,
    pub user_id: UserId,
    pub stars: u8,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub count: usize,
    pub average: Option<f64>,
}

impl RatingSummary {
    pub fn from_ratings(ratings: &[Rating]) -> Self {
        let count = ratings.len();
        let total: u32 = ratings.iter().map(|r| u32::from(r.stars)).sum();
        let average = (count > 0).then(|| f64::from(total) / count as f64);

        Self { count, average }
    }
}

/// A charger together with everything hanging off it. Assembled on
/// read, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerWithDetails {
    pub charger: Charger,
    pub slots: Vec<ChargingSlot>,
    pub services: Vec<NearbyService>,
    pub rating: RatingSummary,
}

impl ChargerWithDetails {
    pub fn payment_systems(&self) -> &[String] {
        &self.charger.payment_systems
    }

    pub fn cheapest_price(&self, filter: impl Fn(&ChargingSlot) -> bool) -> Option<Price> {
        self.slots
            .iter()
            .filter(|s| filter(s))
            .map(|s| s.price)
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }

    pub fn usable_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_usable()).count()
    }
}

/// A point of interest found by the places provider. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub id: String,
    pub name: String,
    pub category: String,
    pub distance_meters: u32,
    pub location: Option<Coordinate>,
}

/// What a user supplies when adding a charger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCharger {
    pub name: String,
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub payment_systems: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSlot {
    pub speed: ChargingSpeed,
    pub connector: ConnectorType,
    pub price: Price,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

/// A partial update of a slot; `None` leaves the field alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlotUpdate {
    pub speed: Option<ChargingSpeed>,
    pub connector: Option<ConnectorType>,
    pub price: Option<Price>,
    pub available: Option<bool>,
}

impl SlotUpdate {
    pub(crate) fn apply(&self, slot: &mut ChargingSlot) {
        let Self {
            speed,
            connector,
            price,
            available,
        } = *self;

        if let Some(speed) = speed {
            slot.speed = speed;
        }
        if let Some(connector) = connector {
            slot.connector = connector;
        }
        if let Some(price) = price {
            slot.price = price;
        }
        if let Some(available) = available {
            slot.available = available;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    pub category: String,
    pub distance_meters: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(stars: u8) -> Rating {
        Rating {
            id: RatingId::random(),
            charger_id: "a".into(),
            user_id: UserId::random(),
            stars,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn random_ids_are_distinct_tokens() {
        let a = ChargerId::random();
        let b = ChargerId::random();

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), ID_LENGTH);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn enums_use_their_wire_names() {
        assert_eq!(serde_json::to_string(&ChargingSpeed::Fast).unwrap(), r#""FAST""#);
        assert_eq!(serde_json::to_string(&ConnectorType::Type2).unwrap(), r#""TYPE2""#);
        assert_eq!("CCS2".parse::<ConnectorType>().unwrap(), ConnectorType::Ccs2);

        for speed in ChargingSpeed::ALL {
            assert_eq!(speed.as_str().parse::<ChargingSpeed>().unwrap(), *speed);
        }

        let e = "WARP".parse::<ChargingSpeed>().unwrap_err();
        assert_eq!(e.to_string(), "`WARP` is not a known charging speed");
    }

    #[test]
    fn damaged_slots_are_not_usable() {
        let mut slot = ChargingSlot {
            id: SlotId::random(),
            charger_id: "a".into(),
            speed: ChargingSpeed::Slow,
            connector: ConnectorType::Type2,
            available: true,
            damaged: false,
            price: Price(0.2),
            updated_at: Utc::now(),
        };
        assert!(slot.is_usable());

        slot.damaged = true;
        assert!(!slot.is_usable());

        slot.damaged = false;
        slot.available = false;
        assert!(!slot.is_usable());
    }

    #[test]
    fn rating_summary() {
        assert_eq!(RatingSummary::from_ratings(&[]), RatingSummary::default());

        let summary = RatingSummary::from_ratings(&[rating(5), rating(2), rating(4)]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.average, Some(11.0 / 3.0));
    }

    #[test]
    fn prices_reject_negative_and_nan() {
        assert!(Price(0.0).is_valid());
        assert!(Price(0.35).is_valid());
        assert!(!Price(-0.01).is_valid());
        assert!(!Price(f64::NAN).is_valid());
        assert_eq!(Price(0.354).to_string(), "0.35");
    }

    #[test]
    fn slot_update_only_touches_given_fields() {
        let mut slot = ChargingSlot {
            id: SlotId::random(),
            charger_id: "a".into(),
            speed: ChargingSpeed::Slow,
            connector: ConnectorType::Type2,
            available: true,
            damaged: true,
            price: Price(0.2),
            updated_at: Utc::now(),
        };

        let update = SlotUpdate {
            price: Some(Price(0.3)),
            ..Default::default()
        };
        update.apply(&mut slot);

        assert_eq!(slot.price, Price(0.3));
        assert_eq!(slot.speed, ChargingSpeed::Slow);
        assert!(slot.damaged);
    }
}
