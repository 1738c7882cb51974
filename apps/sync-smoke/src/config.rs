//! Environment-backed configuration for `sync-smoke`.

use std::{env, error::Error, fmt, time::Duration};

use sync_core::SyncConfig;
use url::Url;

const DEFAULT_CSRF_TOKEN: &str = "smoke-csrf";

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Server base URL; `json/events` is resolved against it.
    pub server: Option<Url>,
    /// Event queue registered out of band.
    pub queue_id: Option<String>,
    pub last_event_id: i64,
    pub email: Option<String>,
    pub api_key: Option<String>,
    pub csrf_token: String,
    /// Fragment to treat as the cold-start URL fragment.
    pub reload_fragment: Option<String>,
    /// Tear down after this long; `None` runs until the runtime stops.
    pub run_for: Option<Duration>,
    pub sync: SyncConfig,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server = optional_trimmed_env("EVENTSYNC_SERVER", &mut lookup)
            .map(|value| parse_url("EVENTSYNC_SERVER", value))
            .transpose()?;
        let queue_id = optional_trimmed_env("EVENTSYNC_QUEUE_ID", &mut lookup);
        let last_event_id = parse_optional::<i64, _>("EVENTSYNC_LAST_EVENT_ID", &mut lookup)?
            .unwrap_or(-1);
        if last_event_id < -1 {
            return Err(ConfigError::InvalidValue {
                key: "EVENTSYNC_LAST_EVENT_ID",
                value: last_event_id.to_string(),
                reason: "must be -1 or a server event id".to_owned(),
            });
        }

        let email = optional_trimmed_env("EVENTSYNC_EMAIL", &mut lookup);
        let api_key = optional_trimmed_env("EVENTSYNC_API_KEY", &mut lookup);
        if email.is_some() != api_key.is_some() {
            return Err(ConfigError::InvalidValue {
                key: if email.is_some() {
                    "EVENTSYNC_API_KEY"
                } else {
                    "EVENTSYNC_EMAIL"
                },
                value: String::new(),
                reason: "EVENTSYNC_EMAIL and EVENTSYNC_API_KEY must be set together".to_owned(),
            });
        }

        let csrf_token = optional_trimmed_env("EVENTSYNC_CSRF_TOKEN", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CSRF_TOKEN.to_owned());
        let reload_fragment = optional_trimmed_env("EVENTSYNC_RELOAD_FRAGMENT", &mut lookup);

        let mut sync = SyncConfig::default();
        if let Some(ms) = parse_optional::<u64, _>("EVENTSYNC_POLL_TIMEOUT_MS", &mut lookup)? {
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "EVENTSYNC_POLL_TIMEOUT_MS",
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
            sync.poll_timeout = Duration::from_millis(ms);
        }
        let run_for =
            parse_optional::<u64, _>("EVENTSYNC_RUN_SECS", &mut lookup)?.map(Duration::from_secs);

        Ok(Self {
            server,
            queue_id,
            last_event_id,
            email,
            api_key,
            csrf_token,
            reload_fragment,
            run_for,
            sync,
        })
    }

    /// Server and queue, when both are configured for a live run.
    pub fn live_target(&self) -> Option<(&Url, &str)> {
        Some((self.server.as_ref()?, self.queue_id.as_deref()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "scheme must be http or https".to_owned(),
        });
    }
    Ok(url)
}
