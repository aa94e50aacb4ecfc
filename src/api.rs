//! JSON and Server-Sent-Events access to the directory.
//!
//! Live views send one `snapshot` event per emission. A failure is sent
//! as a final `error` event before the stream closes.

use axum::{
    extract::{FromRef, Path, Query, State},
    http::{Request, StatusCode},
    response::{sse, IntoResponse, Response, Sse},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::convert::Infallible;
use tower::ServiceBuilder;
use tower_http::{
    request_id::MakeRequestUuid,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
    ServiceBuilderExt as _,
};
use tracing::info_span;

use crate::{
    directory::{
        ChargerDirectory, DirectoryError, DirectoryErrorKind, IncompleteBoundsSnafu,
        InvalidBoundsSnafu, InvalidLocationSnafu, SearchFilter, SortKey, ValidationError,
    },
    geo::{Bounds, Coordinate},
    model::{
        ChargerId, ChargingSpeed, NewCharger, NewService, NewSlot, Price, ServiceId, SlotId,
        SlotUpdate, UserId,
    },
    nearby::NearbyAggregator,
    store::{StoreErrorKind, Subscription},
};

const X_REQUEST_ID_NAME: &str = "x-request-id";

const DEFAULT_NEARBY_RADIUS_M: u32 = 1_000;

#[derive(Debug, Clone, FromRef)]
pub struct AppState {
    pub directory: ChargerDirectory,
    pub nearby: NearbyAggregator,
}

pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MethodUriAndRequest)
                .on_response(DefaultOnResponse::new()),
        )
        .propagate_x_request_id();

    Router::new()
        .route("/chargers", get(chargers).post(charger_create))
        .route("/chargers/events", get(chargers_events))
        .route("/chargers/:id", delete(charger_delete))
        .route("/chargers/:id/events", get(charger_events))
        .route("/chargers/:id/favorites/:user_id", post(favorite_toggle))
        .route("/users/:user_id/favorites/events", get(favorites_events))
        .route("/chargers/:id/slots", post(slot_create))
        .route("/slots/:id", patch(slot_update))
        .route("/slots/:id/damage", put(slot_damage))
        .route("/chargers/:id/services", post(service_create))
        .route("/chargers/:id/services/:service_id", delete(service_delete))
        .route("/chargers/:id/ratings/:user_id", put(rating_update))
        .route("/search", get(search))
        .route("/nearby", get(nearby))
        .layer(middleware)
        .with_state(state)
}

#[derive(Debug, Copy, Clone)]
struct MethodUriAndRequest;

impl<B> MakeSpan<B> for MethodUriAndRequest {
    fn make_span(&mut self, request: &Request<B>) -> tracing::Span {
        let span = info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = tracing::field::Empty,
        );

        if let Some(id) = request.headers().get(X_REQUEST_ID_NAME) {
            if let Ok(id) = id.to_str() {
                span.record("request_id", id);
            }
        }

        span
    }
}

async fn chargers(State(directory): State<ChargerDirectory>) -> Result<impl IntoResponse> {
    Ok(Json(directory.chargers().await?))
}

#[derive(Debug, Default, Deserialize)]
struct BoundsParams {
    south: Option<f64>,
    west: Option<f64>,
    north: Option<f64>,
    east: Option<f64>,
}

impl BoundsParams {
    /// `None` when no side is given at all.
    fn into_bounds(self) -> Result<Option<Bounds>, ValidationError> {
        let bounds = match self {
            Self {
                south: None,
                west: None,
                north: None,
                east: None,
            } => return Ok(None),
            Self {
                south: Some(south),
                west: Some(west),
                north: Some(north),
                east: Some(east),
            } => Bounds::new(south, west, north, east),
            _ => return IncompleteBoundsSnafu.fail(),
        };

        ensure!(bounds.is_valid(), InvalidBoundsSnafu { bounds });
        Ok(Some(bounds))
    }
}

async fn chargers_events(
    State(directory): State<ChargerDirectory>,
    Query(params): Query<BoundsParams>,
) -> Result<Sse<impl Stream<Item = Result<sse::Event, Infallible>>>> {
    let chargers = match params.into_bounds()? {
        Some(bounds) => directory.chargers_in_bounds(bounds),
        None => directory.all_chargers(),
    };
    Ok(stream_subscription(chargers))
}

#[derive(Debug, Deserialize)]
struct CreateCharger {
    #[serde(flatten)]
    charger: NewCharger,
    created_by: UserId,
}

async fn charger_create(
    State(directory): State<ChargerDirectory>,
    Json(request): Json<CreateCharger>,
) -> Result<impl IntoResponse> {
    let charger = directory
        .create_charger(request.charger, &request.created_by)
        .await?;
    Ok((StatusCode::CREATED, Json(charger)))
}

async fn charger_delete(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<ChargerId>,
) -> Result<impl IntoResponse> {
    directory.delete_charger(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn charger_events(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<ChargerId>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    stream_subscription(directory.charger_with_details(&id))
}

async fn favorite_toggle(
    State(directory): State<ChargerDirectory>,
    Path((id, user)): Path<(ChargerId, UserId)>,
) -> Result<impl IntoResponse> {
    Ok(Json(directory.toggle_favorite(&id, &user).await?))
}

async fn favorites_events(
    State(directory): State<ChargerDirectory>,
    Path(user): Path<UserId>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    stream_subscription(directory.favorites_for(&user))
}

async fn slot_create(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<ChargerId>,
    Json(slot): Json<NewSlot>,
) -> Result<impl IntoResponse> {
    let slot = directory.create_slot(&id, slot).await?;
    Ok((StatusCode::CREATED, Json(slot)))
}

async fn slot_update(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<SlotId>,
    Json(update): Json<SlotUpdate>,
) -> Result<impl IntoResponse> {
    Ok(Json(directory.update_slot(&id, update).await?))
}

#[derive(Debug, Deserialize)]
struct Damage {
    damaged: bool,
}

async fn slot_damage(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<SlotId>,
    Json(Damage { damaged }): Json<Damage>,
) -> Result<impl IntoResponse> {
    Ok(Json(directory.report_damage(&id, damaged).await?))
}

async fn service_create(
    State(directory): State<ChargerDirectory>,
    Path(id): Path<ChargerId>,
    Json(service): Json<NewService>,
) -> Result<impl IntoResponse> {
    let service = directory.add_service(&id, service).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

async fn service_delete(
    State(directory): State<ChargerDirectory>,
    Path((id, service)): Path<(ChargerId, ServiceId)>,
) -> Result<impl IntoResponse> {
    Ok(Json(directory.remove_service(&id, &service).await?))
}

#[derive(Debug, Deserialize)]
struct Stars {
    stars: u8,
}

async fn rating_update(
    State(directory): State<ChargerDirectory>,
    Path((id, user)): Path<(ChargerId, UserId)>,
    Json(Stars { stars }): Json<Stars>,
) -> Result<impl IntoResponse> {
    Ok(Json(directory.rate_charger(&id, &user, stars).await?))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    query: Option<String>,
    speed: Option<ChargingSpeed>,
    available: Option<bool>,
    max_price: Option<Price>,
    sort: Option<SortKey>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl SearchParams {
    fn into_filter(self) -> Result<SearchFilter> {
        let Self {
            query,
            speed,
            available,
            max_price,
            sort,
            latitude,
            longitude,
        } = self;

        let origin = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(valid_location(latitude, longitude)?),
            _ => None,
        };

        Ok(SearchFilter {
            query: query.filter(|q| !q.trim().is_empty()),
            speed,
            available,
            max_price,
            sort: sort.unwrap_or_default(),
            origin,
        })
    }
}

async fn search(
    State(directory): State<ChargerDirectory>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse> {
    let filter = params.into_filter()?;
    Ok(Json(directory.search(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct NearbyParams {
    latitude: f64,
    longitude: f64,
    radius: Option<u32>,
    /// Comma separated.
    categories: Option<String>,
}

async fn nearby(
    State(aggregator): State<NearbyAggregator>,
    Query(params): Query<NearbyParams>,
) -> Result<impl IntoResponse> {
    let center = valid_location(params.latitude, params.longitude)?;
    let radius = params.radius.unwrap_or(DEFAULT_NEARBY_RADIUS_M);
    let categories: Vec<_> = params
        .categories
        .iter()
        .flat_map(|c| c.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();

    Ok(Json(
        aggregator
            .nearby_places(center, radius, &categories)
            .await,
    ))
}

fn valid_location(latitude: f64, longitude: f64) -> Result<Coordinate, ValidationError> {
    let location = Coordinate::new(latitude, longitude);
    ensure!(location.is_valid(), InvalidLocationSnafu { location });
    Ok(location)
}

fn stream_subscription<T>(
    subscription: Subscription<T>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>>
where
    T: Serialize + Send + 'static,
{
    let events = StreamExt::map(subscription, |snapshot| {
        let event = match snapshot {
            Ok(v) => sse::Event::default()
                .event("snapshot")
                .json_data(v)
                .unwrap_or_else(|e| error_event(&e)),
            Err(e) => error_event(&e),
        };
        Ok(event)
    });

    Sse::new(events).keep_alive(sse::KeepAlive::default())
}

fn error_event(e: &dyn snafu::Error) -> sse::Event {
    sse::Event::default().event("error").data(error_chain(e).join(": "))
}

fn error_chain(e: &dyn snafu::Error) -> Vec<String> {
    snafu::CleanedErrorText::new(e)
        .filter_map(|(_e, msg, _cleaned)| (!msg.trim().is_empty()).then_some(msg))
        .collect()
}

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(transparent)]
    Directory { source: DirectoryError },

    #[snafu(transparent)]
    Invalid { source: ValidationError },
}

type Result<T, E = ApiError> = std::result::Result<T, E>;

impl ApiError {
    fn status(&self) -> StatusCode {
        let kind = match self {
            ApiError::Directory { source } => source.kind(),
            ApiError::Invalid { .. } => DirectoryErrorKind::Invalid,
        };

        match kind {
            DirectoryErrorKind::Invalid => StatusCode::UNPROCESSABLE_ENTITY,
            DirectoryErrorKind::Store(StoreErrorKind::NotFound) => StatusCode::NOT_FOUND,
            DirectoryErrorKind::Store(StoreErrorKind::PermissionDenied) => StatusCode::FORBIDDEN,
            DirectoryErrorKind::Store(StoreErrorKind::Network) => StatusCode::SERVICE_UNAVAILABLE,
            DirectoryErrorKind::Store(StoreErrorKind::Unknown) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {self:?}");
        }

        let body = ErrorBody {
            error: error_chain(&self),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        memory::{tests::charger, Fault},
        ChargerStore as _, MemoryStore,
    };
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt as _;

    fn app() -> (MemoryStore, Router) {
        let store = MemoryStore::new();
        let state = AppState {
            directory: ChargerDirectory::new(Arc::new(store.clone())),
            nearby: NearbyAggregator::new(None),
        };
        (store, router(state))
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let mut request = Request::builder().method(method).uri(uri);
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let request = request
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_owned())))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn creating_and_listing_chargers() {
        let (_store, app) = app();

        let (status, body) = send(
            app.clone(),
            "POST",
            "/chargers",
            Some(r#"{"name":"Saldanha","location":{"latitude":38.7369,"longitude":-9.1366},"created_by":"u1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");

        let (status, body) = send(app, "GET", "/chargers", None).await;
        assert_eq!(status, StatusCode::OK);
        let chargers: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(chargers[0]["name"], "Saldanha");
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let (store, app) = app();

        let (status, _) = send(
            app.clone(),
            "POST",
            "/chargers",
            Some(r#"{"name":" ","location":{"latitude":0,"longitude":0},"created_by":"u1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(app.clone(), "POST", "/chargers/nope/favorites/u1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("nope"), "{body}");

        let (status, _) = send(app.clone(), "GET", "/nearby?latitude=95&longitude=0", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        store.set_fault(Some(Fault::ReadOnly));
        let (status, _) = send(app.clone(), "DELETE", "/chargers/a", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        store.set_fault(Some(Fault::Offline));
        let (status, _) = send(app, "GET", "/chargers", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn chargers_events_reject_incomplete_or_inverted_bounds() {
        let (_store, app) = app();

        let (status, body) = send(app.clone(), "GET", "/chargers/events?south=38&west=-10", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        assert!(body.contains("south, west, north and east"), "{body}");

        let (status, body) = send(
            app.clone(),
            "GET",
            "/chargers/events?south=39&west=-10&north=38&east=-9",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");

        let (status, _) = send(
            app,
            "GET",
            "/chargers/events?south=38&west=-10&north=39&east=200",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    /// Complete `\n\n` separated SSE events, skipping keep-alive comments.
    fn sse_events(text: &str) -> Vec<&str> {
        text.split("\n\n")
            .filter(|e| !e.trim().is_empty() && !e.starts_with(':'))
            .collect()
    }

    #[tokio::test]
    async fn chargers_events_end_with_an_error_event() {
        let (store, app) = app();
        store.create(charger("a", 38.7223, -9.1393)).await.unwrap();

        let request = Request::get("/chargers/events").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();

        let mut text = String::new();
        let read = async {
            while !text.contains("event: snapshot") {
                let chunk = body.next().await.unwrap().unwrap();
                text.push_str(std::str::from_utf8(&chunk).unwrap());
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), read)
            .await
            .expect("no snapshot arrived");

        store.set_fault(Some(Fault::Offline));

        let read = async {
            while let Some(chunk) = body.next().await {
                text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), read)
            .await
            .expect("the event stream stayed open after an error");

        let events = sse_events(&text);
        let snapshots = events
            .iter()
            .filter(|e| e.starts_with("event: snapshot"))
            .count();
        assert_eq!(snapshots, 1, "{text}");
        assert!(events.last().unwrap().starts_with("event: error"), "{text}");
        assert_eq!(store.listeners(), 0);
    }

    #[tokio::test]
    async fn search_reads_query_parameters() {
        let (store, app) = app();
        store.create(charger("near", 38.7223, -9.1393)).await.unwrap();
        store.create(charger("far", 41.1579, -8.6291)).await.unwrap();

        let (status, body) = send(
            app,
            "GET",
            "/search?sort=distance&latitude=41.15&longitude=-8.62",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let found: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(found[0]["charger"]["id"], "far");
        assert_eq!(found[1]["charger"]["id"], "near");
    }

    #[tokio::test]
    async fn nearby_falls_back_without_a_provider() {
        let (_store, app) = app();

        let (status, body) = send(app, "GET", "/nearby?latitude=38.7&longitude=-9.1", None).await;
        assert_eq!(status, StatusCode::OK);

        let places: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(!places.as_array().unwrap().is_empty());
    }
}
