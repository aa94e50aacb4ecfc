#![deny(rust_2018_idioms)]
#![warn(clippy::items_after_statements)]

//! A directory of electric-vehicle chargers: live, map-bounded views
//! over a charger store, per-user favorites, attribute search, and
//! points of interest around each charger.

pub mod api;
pub mod config;
pub mod directory;
#[cfg(feature = "fake-data")]
pub mod fake;
pub mod geo;
pub mod identity;
pub mod model;
pub mod nearby;
pub mod places;
pub mod store;

pub use directory::{ChargerDirectory, DirectoryError, DirectoryResult, SearchFilter};
pub use nearby::NearbyAggregator;
pub use store::{ChargerStore, MemoryStore, PgStore, Subscription};
