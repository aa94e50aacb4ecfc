#![deny(rust_2018_idioms)]
#![warn(clippy::items_after_statements)]

use charger_directory::{
    api::{self, AppState},
    config::{Config, ConfigError},
    directory::ChargerDirectory,
    nearby::{NearbyAggregator, PlacesProvider},
    places::{HttpPlaces, PlacesError},
    store::{pg::PgError, ChargerStore, MemoryStore, PgStore},
};
use futures::future;
use snafu::prelude::*;
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc};
use tokio::{select, task};
use tokio_util::sync::CancellationToken;
use tracing::info;

const LOG_ENV_NAME: &str = "CHARGER_DIRECTORY_LOG";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_env(LOG_ENV_NAME);
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context(ConfigSnafu)?;

    let token = CancellationToken::new();

    let signal_task = tokio::spawn(signal_task(token.clone()));

    let (store, db_task) = store(&config, token.clone())?;

    let directory = ChargerDirectory::new(store).with_timeout(config.store_timeout);

    #[cfg(feature = "fake-data")]
    if let Some(count) = config.seed {
        charger_directory::fake::seed(&directory, count)
            .await
            .context(SeedSnafu)?;
    }

    let nearby = nearby(&config)?;

    let server = webserver(config.listen_address, AppState { directory, nearby });

    let db_task = async move {
        match db_task {
            Some(t) => t.await,
            None => future::pending().await,
        }
    };

    select! {
        () = token.cancelled() => {},
        res = signal_task => match res.context(JoinSnafu { task: "signal" })? {
            Ok(never) => match never {},
            Err(e) => return Err(e),
        },
        res = server => res?,
        res = db_task => {
            res.context(JoinSnafu { task: "database" })?;
            return DatabaseStoppedSnafu.fail();
        }
    }

    Ok(())
}

fn store(
    config: &Config,
    token: CancellationToken,
) -> Result<(Arc<dyn ChargerStore>, Option<task::JoinHandle<()>>), Error> {
    let Some(database_url) = &config.database_url else {
        info!("No database configured; keeping chargers in memory");
        return Ok((Arc::new(MemoryStore::new()), None));
    };

    let (store, task) = PgStore::new(database_url, token.clone()).context(DatabaseSnafu)?;
    let db_task = task::spawn_blocking(|| task.run());

    if let Some(every) = config.refresh_every {
        tokio::spawn(store.clone().poll_for_changes(every, token));
    }

    Ok((Arc::new(store), Some(db_task)))
}

fn nearby(config: &Config) -> Result<NearbyAggregator, Error> {
    let provider = match &config.places {
        Some(places) => {
            let provider = HttpPlaces::new(&places.url, &places.api_key, places.timeout)
                .context(PlacesSnafu)?;
            Some(Arc::new(provider) as Arc<dyn PlacesProvider>)
        }
        None => {
            info!("No places provider configured");
            None
        }
    };

    Ok(NearbyAggregator::new(provider)
        .with_categories(config.nearby_categories.clone())
        .with_fallback(config.nearby_fallback))
}

async fn webserver(address: SocketAddr, state: AppState) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;

    info!("System listening on {address}");

    axum::serve(listener, api::router(state))
        .await
        .context(ServeSnafu)
}

async fn signal_task(token: CancellationToken) -> Result<Infallible, Error> {
    use tokio::signal::unix::*;

    let mut int_signals = signal(SignalKind::interrupt()).context(SignalSnafu)?;
    let mut term_signals = signal(SignalKind::terminate()).context(SignalSnafu)?;

    select! {
        _ = int_signals.recv() => {},
        _ = term_signals.recv() => {},
    };

    info!("Signal received, shutting down...");
    token.cancel();

    select! {
        _ = int_signals.recv() => {},
        _ = term_signals.recv() => {},
    };

    info!("Second signal received, aborting...");
    std::process::abort();
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Could not load the configuration"))]
    Config { source: ConfigError },

    #[snafu(display("Could not start the database"))]
    Database { source: PgError },

    #[snafu(display("The database task stopped unexpectedly"))]
    DatabaseStopped,

    #[snafu(display("Could not set up the places provider"))]
    Places { source: PlacesError },

    #[cfg(feature = "fake-data")]
    #[snafu(display("Could not seed fake chargers"))]
    Seed {
        source: charger_directory::DirectoryError,
    },

    #[snafu(display("Could not listen on {address}"))]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },

    #[snafu(display("The webserver failed"))]
    Serve { source: io::Error },

    #[snafu(display("Could not install the signal handlers"))]
    Signal { source: io::Error },

    #[snafu(display("The {task} task panicked"))]
    Join {
        task: &'static str,
        source: task::JoinError,
    },
}
