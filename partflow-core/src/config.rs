//! Runtime settings, loaded once from the environment at startup and passed
//! by reference to the components that need them.

use std::collections::HashMap;
use std::time::Duration;

use crate::Error;
use crate::source::jetstream::NatsAuth;

const ENV_STORE_URL: &str = "PARTFLOW_STORE_URL";
const ENV_CHECKPOINT_BUCKET: &str = "PARTFLOW_CHECKPOINT_BUCKET";
const ENV_STREAM_URL: &str = "PARTFLOW_STREAM_URL";
const ENV_STREAM: &str = "PARTFLOW_STREAM";
const ENV_CONSUMER_GROUP: &str = "PARTFLOW_CONSUMER_GROUP";
const ENV_SINK_URL: &str = "PARTFLOW_SINK_URL";
const ENV_SINK_DATABASE: &str = "PARTFLOW_SINK_DATABASE";
const ENV_SINK_CONTAINER: &str = "PARTFLOW_SINK_CONTAINER";
const ENV_PARTITIONS: &str = "PARTFLOW_PARTITIONS";
const ENV_CHECKPOINT_THRESHOLD: &str = "PARTFLOW_CHECKPOINT_THRESHOLD";
const ENV_FLUSH_INTERVAL_MS: &str = "PARTFLOW_FLUSH_INTERVAL_MS";
const ENV_LEASE_TTL_SECS: &str = "PARTFLOW_LEASE_TTL_SECS";
const ENV_REBALANCE_INTERVAL_SECS: &str = "PARTFLOW_REBALANCE_INTERVAL_SECS";
const ENV_DRAIN_TIMEOUT_SECS: &str = "PARTFLOW_DRAIN_TIMEOUT_SECS";
const ENV_READ_TIMEOUT_MS: &str = "PARTFLOW_READ_TIMEOUT_MS";
const ENV_SINK_TIMEOUT_SECS: &str = "PARTFLOW_SINK_TIMEOUT_SECS";
const ENV_COMMIT_TIMEOUT_SECS: &str = "PARTFLOW_COMMIT_TIMEOUT_SECS";
const ENV_INSTANCE_ID: &str = "PARTFLOW_INSTANCE_ID";
const ENV_NATS_USER: &str = "PARTFLOW_NATS_USER";
const ENV_NATS_PASSWORD: &str = "PARTFLOW_NATS_PASSWORD";
const ENV_HOSTNAME: &str = "HOSTNAME";

pub const DEFAULT_PARTITIONS: u16 = 4;
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 50;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store_url: String,
    pub checkpoint_bucket: String,
    pub stream_url: String,
    pub stream: String,
    pub consumer_group: String,
    pub sink_url: String,
    pub sink_database: String,
    pub sink_container: String,
    pub partitions: u16,
    pub checkpoint_threshold: u64,
    /// When set, uncommitted progress is also flushed on this wall-clock
    /// interval. Off by default; the count threshold alone drives commits.
    pub flush_interval: Option<Duration>,
    pub lease_ttl: Duration,
    pub rebalance_interval: Duration,
    pub drain_timeout: Duration,
    pub read_timeout: Duration,
    pub sink_timeout: Duration,
    pub commit_timeout: Duration,
    pub instance_id: String,
    pub nats_auth: Option<NatsAuth>,
}

impl Settings {
    /// Reads the process environment. Errors on a missing required variable
    /// or an unparsable value.
    pub fn load() -> crate::Result<Self> {
        Self::try_from(std::env::vars().collect::<HashMap<String, String>>())
    }
}

/// This implementation is to load settings from env variables
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let required = |name: &str| -> std::result::Result<String, Error> {
            env_vars
                .get(name)
                .map(|v| v.to_owned())
                .ok_or_else(|| Error::Config(format!("Environment variable {name} is not set")))
        };

        let instance_id = match env_vars.get(ENV_INSTANCE_ID) {
            Some(id) => id.to_owned(),
            None => {
                let host = env_vars
                    .get(ENV_HOSTNAME)
                    .map(String::as_str)
                    .unwrap_or("partflow");
                format!("{host}-{}", uuid::Uuid::new_v4())
            }
        };

        let nats_auth = match (env_vars.get(ENV_NATS_USER), env_vars.get(ENV_NATS_PASSWORD)) {
            (Some(username), Some(password)) => Some(NatsAuth {
                username: username.to_owned(),
                password: password.to_owned(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_NATS_USER} and {ENV_NATS_PASSWORD} must be set together"
                )));
            }
        };

        Ok(Settings {
            store_url: required(ENV_STORE_URL)?,
            checkpoint_bucket: required(ENV_CHECKPOINT_BUCKET)?,
            stream_url: required(ENV_STREAM_URL)?,
            stream: required(ENV_STREAM)?,
            consumer_group: required(ENV_CONSUMER_GROUP)?,
            sink_url: required(ENV_SINK_URL)?,
            sink_database: required(ENV_SINK_DATABASE)?,
            sink_container: required(ENV_SINK_CONTAINER)?,
            partitions: parse_or(&env_vars, ENV_PARTITIONS, DEFAULT_PARTITIONS)?,
            checkpoint_threshold: parse_or(
                &env_vars,
                ENV_CHECKPOINT_THRESHOLD,
                DEFAULT_CHECKPOINT_THRESHOLD,
            )?,
            flush_interval: parse_optional::<u64>(&env_vars, ENV_FLUSH_INTERVAL_MS)?
                .map(Duration::from_millis),
            lease_ttl: secs_or(&env_vars, ENV_LEASE_TTL_SECS, DEFAULT_LEASE_TTL)?,
            rebalance_interval: secs_or(
                &env_vars,
                ENV_REBALANCE_INTERVAL_SECS,
                DEFAULT_REBALANCE_INTERVAL,
            )?,
            drain_timeout: secs_or(&env_vars, ENV_DRAIN_TIMEOUT_SECS, DEFAULT_DRAIN_TIMEOUT)?,
            read_timeout: parse_optional::<u64>(&env_vars, ENV_READ_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_READ_TIMEOUT),
            sink_timeout: secs_or(&env_vars, ENV_SINK_TIMEOUT_SECS, DEFAULT_SINK_TIMEOUT)?,
            commit_timeout: secs_or(&env_vars, ENV_COMMIT_TIMEOUT_SECS, DEFAULT_COMMIT_TIMEOUT)?,
            instance_id,
            nats_auth,
        })
    }
}

fn parse_optional<T>(
    env_vars: &HashMap<String, String>,
    name: &str,
) -> std::result::Result<Option<T>, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_vars
        .get(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("Parsing {name}={raw}: {e}")))
        })
        .transpose()
}

fn parse_or<T>(
    env_vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> std::result::Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(env_vars, name)?.unwrap_or(default))
}

fn secs_or(
    env_vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> std::result::Result<Duration, Error> {
    Ok(parse_optional::<u64>(env_vars, name)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        [
            (ENV_STORE_URL, "nats://localhost:4222"),
            (ENV_CHECKPOINT_BUCKET, "checkpoints"),
            (ENV_STREAM_URL, "nats://localhost:4222"),
            (ENV_STREAM, "orders"),
            (ENV_CONSUMER_GROUP, "order-indexer"),
            (ENV_SINK_URL, "http://localhost:8080"),
            (ENV_SINK_DATABASE, "telemetry"),
            (ENV_SINK_CONTAINER, "events"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn load_with_defaults() {
        let settings = Settings::try_from(base_env()).unwrap();
        assert_eq!(settings.stream, "orders");
        assert_eq!(settings.partitions, DEFAULT_PARTITIONS);
        assert_eq!(settings.checkpoint_threshold, DEFAULT_CHECKPOINT_THRESHOLD);
        assert_eq!(settings.flush_interval, None);
        assert_eq!(settings.lease_ttl, DEFAULT_LEASE_TTL);
        assert_eq!(settings.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(settings.read_timeout, DEFAULT_READ_TIMEOUT);
        assert!(settings.nats_auth.is_none());
        assert!(!settings.instance_id.is_empty());
    }

    #[test]
    fn load_with_overrides() {
        let mut env = base_env();
        env.insert(ENV_PARTITIONS.to_string(), "16".to_string());
        env.insert(ENV_CHECKPOINT_THRESHOLD.to_string(), "100".to_string());
        env.insert(ENV_FLUSH_INTERVAL_MS.to_string(), "2500".to_string());
        env.insert(ENV_LEASE_TTL_SECS.to_string(), "5".to_string());
        env.insert(ENV_INSTANCE_ID.to_string(), "worker-a".to_string());
        env.insert(ENV_NATS_USER.to_string(), "svc".to_string());
        env.insert(ENV_NATS_PASSWORD.to_string(), "hunter2".to_string());

        let settings = Settings::try_from(env).unwrap();
        assert_eq!(settings.partitions, 16);
        assert_eq!(settings.checkpoint_threshold, 100);
        assert_eq!(settings.flush_interval, Some(Duration::from_millis(2500)));
        assert_eq!(settings.lease_ttl, Duration::from_secs(5));
        assert_eq!(settings.instance_id, "worker-a");
        assert_eq!(settings.nats_auth.unwrap().username, "svc");
    }

    #[test]
    fn missing_required_variable_is_fatal() {
        let mut env = base_env();
        env.remove(ENV_CONSUMER_GROUP);
        let err = Settings::try_from(env).unwrap_err();
        assert!(err.to_string().contains(ENV_CONSUMER_GROUP));
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let mut env = base_env();
        env.insert(ENV_PARTITIONS.to_string(), "lots".to_string());
        assert!(Settings::try_from(env).is_err());
    }

    #[test]
    fn auth_variables_must_be_paired() {
        let mut env = base_env();
        env.insert(ENV_NATS_USER.to_string(), "svc".to_string());
        assert!(Settings::try_from(env).is_err());
    }
}
