//! A [`PlacesProvider`] speaking the Geoapify `v2/places` API.

use futures::{future::BoxFuture, FutureExt as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{fmt, time::Duration};
use tracing::{instrument, trace, warn};

use crate::{
    geo::Coordinate,
    nearby::{PlaceQuery, PlacesProvider, ProviderError, ProviderPlace},
};

pub const DEFAULT_URL: &str = "https://api.geoapify.com/v2/places";

const RESULT_LIMIT: usize = 20;

#[derive(Clone)]
pub struct HttpPlaces {
    client: Client,
    url: String,
    api_key: String,
}

impl fmt::Debug for HttpPlaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPlaces")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpPlaces {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlacesError> {
        use places_error::*;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(ClientSnafu)?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        })
    }

    fn request_url(&self, query: &PlaceQuery) -> Result<String, FetchError> {
        use fetch_error::*;

        #[derive(Serialize)]
        struct Params<'a> {
            categories: &'a str,
            filter: String,
            bias: String,
            limit: usize,
            #[serde(rename = "apiKey")]
            api_key: &'a str,
        }

        let PlaceQuery {
            center,
            radius_meters,
            category,
            bias,
        } = query;

        let params = Params {
            categories: category,
            filter: format!(
                "circle:{},{},{radius_meters}",
                center.longitude, center.latitude
            ),
            bias: format!(
                "rect:{},{},{},{}",
                bias.west, bias.south, bias.east, bias.north
            ),
            limit: RESULT_LIMIT,
            api_key: &self.api_key,
        };

        let params = serde_urlencoded::to_string(params).context(EncodeSnafu)?;
        Ok(format!("{}?{params}", self.url))
    }

    #[instrument(skip_all, fields(category = %query.category))]
    async fn fetch(&self, query: &PlaceQuery) -> Result<Vec<ProviderPlace>, FetchError> {
        use fetch_error::*;

        let url = self.request_url(query)?;

        let response = self.client.get(url).send().await.context(SendSnafu)?;

        let status = response.status();
        if !status.is_success() {
            warn!("Places provider answered {status}; treating as no results");
            return Ok(vec![]);
        }

        let collection = response
            .json::<FeatureCollection>()
            .await
            .context(DecodeSnafu)?;

        let places: Vec<_> = collection
            .features
            .into_iter()
            .filter_map(Feature::into_place)
            .collect();
        trace!(found = places.len(), "Fetched places");

        Ok(places)
    }
}

impl PlacesProvider for HttpPlaces {
    fn search<'a>(
        &'a self,
        query: &'a PlaceQuery,
    ) -> BoxFuture<'a, Result<Vec<ProviderPlace>, ProviderError>> {
        self.fetch(query)
            .map(|r| r.map_err(ProviderError::from))
            .boxed()
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum PlacesError {
    #[snafu(display("Could not build the HTTP client"))]
    Client { source: reqwest::Error },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum FetchError {
    #[snafu(display("Could not encode the query"))]
    Encode { source: serde_urlencoded::ser::Error },

    #[snafu(display("Could not reach the places provider"))]
    Send { source: reqwest::Error },

    #[snafu(display("Could not decode the places response"))]
    Decode { source: reqwest::Error },
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: Properties,
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Properties {
    place_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// GeoJSON order: longitude first.
    coordinates: Vec<f64>,
}

impl Feature {
    fn into_place(self) -> Option<ProviderPlace> {
        let Properties {
            place_id,
            name,
            categories,
            lat,
            lon,
        } = self.properties;

        let location = match (lat, lon, self.geometry) {
            (Some(lat), Some(lon), _) => Coordinate::new(lat, lon),
            (_, _, Some(Geometry { coordinates })) => match coordinates[..] {
                [lon, lat, ..] => Coordinate::new(lat, lon),
                _ => return None,
            },
            _ => return None,
        };

        let name = name.filter(|n| !n.trim().is_empty())?;

        location.is_valid().then(|| ProviderPlace {
            id: place_id.unwrap_or_else(|| format!("{location}")),
            name,
            categories,
            location,
        })
    }
}
