use snafu::prelude::*;
use std::{
    env, fs,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::{directory, nearby, places};

const PREFIX: &str = "CHARGER_DIRECTORY_";

type BoxError = Box<dyn snafu::Error + Send + Sync>;

#[derive(Debug)]
pub struct Config {
    /// `None` keeps everything in memory.
    pub database_url: Option<String>,
    pub listen_address: SocketAddr,
    pub store_timeout: Duration,
    pub refresh_every: Option<Duration>,
    pub places: Option<PlacesConfig>,
    pub nearby_categories: Vec<String>,
    pub nearby_fallback: nearby::Fallback,
    pub seed: Option<usize>,
}

#[derive(Debug)]
pub struct PlacesConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").ok();

        let listen_address = parsed("LISTEN_ADDRESS")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let store_timeout = seconds("STORE_TIMEOUT_SECS")?.unwrap_or(directory::DEFAULT_TIMEOUT);

        let refresh_every = seconds("REFRESH_SECS")?;

        let places = match secret("PLACES_API_KEY")? {
            Some(api_key) => Some(PlacesConfig {
                url: var("PLACES_URL").unwrap_or_else(|| places::DEFAULT_URL.into()),
                api_key,
                timeout: seconds("PLACES_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(10)),
            }),
            None => None,
        };

        let nearby_categories = match var("NEARBY_CATEGORIES") {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect(),
            None => nearby::DEFAULT_CATEGORIES
                .iter()
                .map(|&c| c.into())
                .collect(),
        };

        let nearby_fallback = match parsed::<bool>("NEARBY_FALLBACK")? {
            Some(false) => nearby::Fallback::Empty,
            Some(true) | None => nearby::Fallback::Builtin,
        };

        let seed = parsed("SEED")?;

        Ok(Self {
            database_url,
            listen_address,
            store_timeout,
            refresh_every,
            places,
            nearby_categories,
            nearby_fallback,
            seed,
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(format!("{PREFIX}{name}")).ok()
}

fn parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: snafu::Error + Send + Sync + 'static,
{
    let Some(v) = var(name) else {
        return Ok(None);
    };

    let parsed = v
        .trim()
        .parse::<T>()
        .map_err(BoxError::from)
        .context(InvalidSnafu {
            name: format!("{PREFIX}{name}"),
            value: &v,
        })?;
    Ok(Some(parsed))
}

fn seconds(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(name)?.map(Duration::from_secs))
}

/// Read from the variable itself or from the file named by its `_FILE`
/// twin.
fn secret(name: &'static str) -> Result<Option<String>, ConfigError> {
    if let Some(v) = var(name) {
        return Ok(Some(v));
    }

    let Some(path) = var(&format!("{name}_FILE")) else {
        return Ok(None);
    };
    let path = PathBuf::from(path);

    let v = fs::read_to_string(&path).context(ReadSecretSnafu { path })?;
    Ok(Some(v.trim().into()))
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("`{name}` has the invalid value `{value}`"))]
    Invalid {
        name: String,
        value: String,
        source: BoxError,
    },

    #[snafu(display("Could not read the secret file {}", path.display()))]
    ReadSecret {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    // The environment is process-wide; each test uses its own names.

    #[test]
    fn parsing_reports_the_variable() {
        env::set_var("CHARGER_DIRECTORY_TEST_BAD_SECS", "soon");

        let e = seconds("TEST_BAD_SECS").unwrap_err();
        assert_eq!(
            e.to_string(),
            "`CHARGER_DIRECTORY_TEST_BAD_SECS` has the invalid value `soon`"
        );
    }

    #[test]
    fn absent_values_are_none() {
        assert!(seconds("TEST_ABSENT_SECS").unwrap().is_none());
        assert!(secret("TEST_ABSENT_KEY").unwrap().is_none());
    }

    #[test]
    fn secrets_can_come_from_files() {
        let path = env::temp_dir().join(format!("charger-directory-{}", std::process::id()));
        fs::write(&path, "s3cret\n").unwrap();
        env::set_var("CHARGER_DIRECTORY_TEST_KEY_FILE", &path);

        assert_eq!(secret("TEST_KEY").unwrap().as_deref(), Some("s3cret"));
        fs::remove_file(path).ok();
    }
}
