//! Points of interest around a charger, gathered from an external
//! places provider one category at a time.
//!
//! This is enrichment only: provider failures are logged and never
//! reach the caller.

use futures::future::{self, BoxFuture};
use itertools::Itertools as _;
use std::{fmt, sync::Arc};
use tracing::{debug, instrument, warn};

use crate::{
    geo::{self, Bounds, Coordinate},
    model::NearbyPlace,
};

pub type ProviderError = Box<dyn snafu::Error + Send + Sync>;

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "catering.restaurant",
    "catering.cafe",
    "commercial.supermarket",
    "accommodation.hotel",
];

/// One category-scoped request to a [`PlacesProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceQuery {
    pub center: Coordinate,
    pub radius_meters: u32,
    pub category: String,
    /// Where results should preferably come from. Providers may return
    /// places outside it.
    pub bias: Bounds,
}

/// A place as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPlace {
    pub id: String,
    pub name: String,
    pub categories: Vec<String>,
    pub location: Coordinate,
}

pub trait PlacesProvider: Send + Sync + fmt::Debug {
    /// An unsuccessful response should be reported as no places.
    fn search<'a>(
        &'a self,
        query: &'a PlaceQuery,
    ) -> BoxFuture<'a, Result<Vec<ProviderPlace>, ProviderError>>;
}

/// What to answer when the provider finds nothing at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Fallback {
    #[default]
    Builtin,
    Empty,
}

// (name, category, meters north, meters east)
const BUILTIN_PLACES: &[(&str, &str, f64, f64)] = &[
    ("Café", "catering.cafe", 120.0, 80.0),
    ("Restaurant", "catering.restaurant", -150.0, 200.0),
    ("Supermarket", "commercial.supermarket", 300.0, -250.0),
];

#[derive(Debug, Clone)]
pub struct NearbyAggregator {
    provider: Option<Arc<dyn PlacesProvider>>,
    categories: Vec<String>,
    fallback: Fallback,
}

impl NearbyAggregator {
    pub fn new(provider: Option<Arc<dyn PlacesProvider>>) -> Self {
        Self {
            provider,
            categories: DEFAULT_CATEGORIES.iter().map(|&c| c.into()).collect(),
            fallback: Fallback::default(),
        }
    }

    /// Categories queried when the caller does not name any.
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Every place found for any of `categories`, nearest first, each
    /// provider id at most once.
    #[instrument(skip(self))]
    pub async fn nearby_places(
        &self,
        center: Coordinate,
        radius_meters: u32,
        categories: &[String],
    ) -> Vec<NearbyPlace> {
        let categories = if categories.is_empty() {
            &self.categories[..]
        } else {
            categories
        };

        let mut places = match &self.provider {
            Some(provider) => self.query_all(&**provider, center, radius_meters, categories).await,
            None => vec![],
        };

        places.sort_by(|a, b| {
            a.distance_meters
                .cmp(&b.distance_meters)
                .then_with(|| a.id.cmp(&b.id))
        });
        let places: Vec<_> = places.into_iter().unique_by(|p| p.id.clone()).collect();

        if places.is_empty() {
            debug!(fallback = ?self.fallback, "No nearby places found");
            return match self.fallback {
                Fallback::Builtin => builtin_places(center),
                Fallback::Empty => vec![],
            };
        }

        places
    }

    async fn query_all(
        &self,
        provider: &dyn PlacesProvider,
        center: Coordinate,
        radius_meters: u32,
        categories: &[String],
    ) -> Vec<NearbyPlace> {
        let bias = Bounds::around(center, f64::from(radius_meters));

        let queries = categories
            .iter()
            .map(|category| PlaceQuery {
                center,
                radius_meters,
                category: category.clone(),
                bias,
            })
            .collect::<Vec<_>>();

        let results = future::join_all(queries.iter().map(|q| provider.search(q))).await;

        queries
            .iter()
            .zip(results)
            .flat_map(|(query, result)| {
                let found = result.unwrap_or_else(|e| {
                    warn!("Could not find {} places: {e}", query.category);
                    vec![]
                });
                found
                    .into_iter()
                    .map(move |p| to_nearby(center, &query.category, p))
            })
            .collect()
    }
}

fn to_nearby(center: Coordinate, category: &str, place: ProviderPlace) -> NearbyPlace {
    let ProviderPlace {
        id, name, location, ..
    } = place;

    NearbyPlace {
        id,
        name,
        category: category.into(),
        distance_meters: rounded_distance(center, location),
        location: Some(location),
    }
}

fn rounded_distance(a: Coordinate, b: Coordinate) -> u32 {
    geo::distance_meters(a, b).round() as u32
}

fn builtin_places(center: Coordinate) -> Vec<NearbyPlace> {
    BUILTIN_PLACES
        .iter()
        .enumerate()
        .map(|(i, &(name, category, north, east))| {
            let location = geo::offset_meters(center, north, east);
            NearbyPlace {
                id: format!("builtin-{i}"),
                name: name.into(),
                category: category.into(),
                distance_meters: rounded_distance(center, location),
                location: Some(location),
            }
        })
        .sorted_by_key(|p| p.distance_meters)
        .collect()
}
