//! Configuration for an Angler node.
//!
//! Configuration is read from a properties file and completed by the
//! `ANGLER_CFG` environment variable. Values present in the file take
//! precedence; the environment only fills keys the file leaves unset.
//!
//! Keys are grouped by prefix:
//!
//! - `cluster.`: controller/broker coordination
//! - `db.`: retention windows for terminal messages
//! - `log.`: event filtering
//! - `msgproc.`: the delivery worker pool
//! - `net.`: client-facing transports
//! - `retryPolicy.`: server defaults and hard limits for retry policies

mod properties;

use std::{collections::BTreeSet, path::Path, str::FromStr, time::Duration};

pub use properties::Properties;
use tracing::level_filters::LevelFilter;

use crate::{
    error::ConfigError,
    time::{DurationSequence, parse_duration, parse_duration_sequence},
};

/// Name of the environment variable holding inline overrides.
pub const ENV_CONFIG: &str = "ANGLER_CFG";

mod keys {
    pub const AUTH_KEY: &str = "cluster.authKey";
    pub const CONTROLLER_HOST: &str = "cluster.controller.host";
    pub const LOCAL_DELIVERY: &str = "cluster.controller.localDelivery";
    pub const REQUEST_TIMEOUT: &str = "cluster.requestTimeout";
    pub const DEAD_RETENTION: &str = "db.deadMessages.retention";
    pub const DELIVERED_RETENTION: &str = "db.deliveredMessages.retention";
    pub const LOG_LEVEL: &str = "log.level";
    pub const LOG_TARGETS: &str = "log.targets";
    pub const DELIVERY_TIMEOUT: &str = "msgproc.message_delivery_timeout";
    pub const WORKERS: &str = "msgproc.workers";
    pub const CLIENT_PROTOCOLS: &str = "net.client.protocols";
    pub const RESTFUL_PORT: &str = "net.client.restful.port";
    pub const DEFAULT_INTERVAL: &str = "retryPolicy.defaults.interval";
    pub const DEFAULT_MAX_ATTEMPTS: &str = "retryPolicy.defaults.maxAttempts";
    pub const MIN_INTERVAL: &str = "retryPolicy.limit.minInterval";
    pub const MAX_INTERVAL: &str = "retryPolicy.limit.maxInterval";
    pub const MAX_ATTEMPTS: &str = "retryPolicy.limit.maxAttempts";
}

mod defaults {
    use std::time::Duration;

    pub const CONTROLLER_HOST: &str = "127.0.0.1:7600";

    pub const fn request_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub const fn delivery_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn workers() -> usize {
        num_cpus::get().max(1)
    }

    pub const CLIENT_PROTOCOL: &str = "json";

    pub const fn min_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub const fn max_interval() -> Duration {
        Duration::from_secs(30 * 24 * 60 * 60)
    }

    pub const fn max_attempts() -> u16 {
        20
    }
}

/// Cluster settings (`cluster.` prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfiguration {
    /// Shared key brokers present to join the cluster
    pub auth_key: Option<String>,

    /// Address of the controller, used by brokers to connect and by the
    /// controller to bind its listener.
    ///
    /// Default: `127.0.0.1:7600`
    pub controller_host: String,

    /// How long a request may take, and how long a broker may stay silent,
    /// before it is considered unreachable.
    ///
    /// Default: 10 seconds
    pub request_timeout: Duration,

    /// Whether the controller also runs its own worker pool.
    ///
    /// Default: `false`
    pub local_delivery: bool,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            auth_key: None,
            controller_host: defaults::CONTROLLER_HOST.to_string(),
            request_timeout: defaults::request_timeout(),
            local_delivery: false,
        }
    }
}

/// Retention windows for terminal messages (`db.` prefix)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionConfiguration {
    /// How long DEAD messages are kept before the purge may remove them
    pub dead_messages: Option<Duration>,
    /// How long DELIVERED messages are kept before the purge may remove them
    pub delivered_messages: Option<Duration>,
}

/// Event filtering (`log.` prefix)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfiguration {
    /// Level for every Angler crate. Falls back to `LOG_LEVEL`, then to
    /// `TRACE` in debug builds and `INFO` otherwise.
    pub level: Option<LevelFilter>,

    /// Per-target overrides, e.g. `angler_cluster=debug, angler_delivery::pool=trace`
    pub targets: Vec<(String, LevelFilter)>,
}

/// Delivery worker pool settings (`msgproc.` prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProcessorConfiguration {
    /// Upper bound for a single delivery attempt
    ///
    /// Default: 10 seconds
    pub message_delivery_timeout: Duration,

    /// Number of concurrent delivery workers, always at least one
    ///
    /// Default: number of CPUs
    pub workers: usize,
}

impl Default for MessageProcessorConfiguration {
    fn default() -> Self {
        Self {
            message_delivery_timeout: defaults::delivery_timeout(),
            workers: defaults::workers(),
        }
    }
}

/// Client-facing transport settings (`net.` prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkingConfiguration {
    /// Transports opened to clients
    ///
    /// Default: `json`
    pub client_protocols: BTreeSet<String>,

    /// Port for the RESTful transport, when enabled
    pub restful_port: Option<u16>,
}

impl Default for NetworkingConfiguration {
    fn default() -> Self {
        Self {
            client_protocols: BTreeSet::from([defaults::CLIENT_PROTOCOL.to_string()]),
            restful_port: None,
        }
    }
}

/// Server retry defaults and hard limits (`retryPolicy.` prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyConfiguration {
    /// Interval applied to messages that do not request one
    pub default_interval: Option<DurationSequence>,

    /// Attempt count applied to messages that do not request one
    pub default_max_attempts: Option<u16>,

    /// Shortest interval any policy may use
    ///
    /// Default: 1 second
    pub min_interval: Duration,

    /// Longest interval any policy may use
    ///
    /// Default: 30 days
    pub max_interval: Duration,

    /// Most attempts any policy may use
    ///
    /// Default: 20
    pub max_attempts: u16,
}

impl Default for RetryPolicyConfiguration {
    fn default() -> Self {
        Self {
            default_interval: None,
            default_max_attempts: None,
            min_interval: defaults::min_interval(),
            max_interval: defaults::max_interval(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

/// Fully resolved node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub cluster: ClusterConfiguration,
    pub retention: RetentionConfiguration,
    pub logging: LoggingConfiguration,
    pub messages_processor: MessageProcessorConfiguration,
    pub networking: NetworkingConfiguration,
    pub retry_policy: RetryPolicyConfiguration,
}

impl Configuration {
    /// Load configuration from `path`, completed by the inline overrides in
    /// `env_overrides` (usually the content of [`ENV_CONFIG`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any value is malformed.
    pub fn load(path: impl AsRef<Path>, env_overrides: Option<&str>) -> Result<Self, ConfigError> {
        let mut properties = Properties::from_file(path)?;
        if let Some(overrides) = env_overrides {
            properties.merge_missing(&Properties::parse_inline(overrides));
        }

        Self::from_properties(&properties)
    }

    /// Interpret a set of raw properties, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first key whose value is malformed.
    pub fn from_properties(properties: &Properties) -> Result<Self, ConfigError> {
        let cluster = ClusterConfiguration {
            auth_key: properties
                .get(keys::AUTH_KEY)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string),
            controller_host: properties
                .get(keys::CONTROLLER_HOST)
                .map_or_else(|| defaults::CONTROLLER_HOST.to_string(), ToString::to_string),
            request_timeout: millis(properties, keys::REQUEST_TIMEOUT)?
                .unwrap_or_else(defaults::request_timeout),
            local_delivery: parse(properties, keys::LOCAL_DELIVERY)?.unwrap_or(false),
        };

        let retention = RetentionConfiguration {
            dead_messages: duration(properties, keys::DEAD_RETENTION)?,
            delivered_messages: duration(properties, keys::DELIVERED_RETENTION)?,
        };

        let logging = LoggingConfiguration {
            level: parse(properties, keys::LOG_LEVEL)?,
            targets: properties
                .get(keys::LOG_TARGETS)
                .map(log_targets)
                .transpose()?
                .unwrap_or_default(),
        };

        let workers = parse::<usize>(properties, keys::WORKERS)?.unwrap_or_else(defaults::workers);
        if workers == 0 {
            return Err(ConfigError::invalid(keys::WORKERS, "must be at least 1"));
        }

        let messages_processor = MessageProcessorConfiguration {
            message_delivery_timeout: millis(properties, keys::DELIVERY_TIMEOUT)?
                .unwrap_or_else(defaults::delivery_timeout),
            workers,
        };

        let networking = NetworkingConfiguration {
            client_protocols: properties.get(keys::CLIENT_PROTOCOLS).map_or_else(
                || NetworkingConfiguration::default().client_protocols,
                |protocols| {
                    protocols
                        .split(',')
                        .map(str::trim)
                        .filter(|protocol| !protocol.is_empty())
                        .map(ToString::to_string)
                        .collect()
                },
            ),
            restful_port: parse(properties, keys::RESTFUL_PORT)?,
        };

        let default_interval = properties
            .get(keys::DEFAULT_INTERVAL)
            .map(parse_duration_sequence)
            .transpose()
            .map_err(|source| ConfigError::Duration {
                key: keys::DEFAULT_INTERVAL,
                source,
            })?;

        let max_attempts =
            parse::<u16>(properties, keys::MAX_ATTEMPTS)?.unwrap_or_else(defaults::max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::invalid(keys::MAX_ATTEMPTS, "must be at least 1"));
        }

        let retry_policy = RetryPolicyConfiguration {
            default_interval,
            default_max_attempts: parse(properties, keys::DEFAULT_MAX_ATTEMPTS)?,
            min_interval: duration(properties, keys::MIN_INTERVAL)?
                .unwrap_or_else(defaults::min_interval),
            max_interval: duration(properties, keys::MAX_INTERVAL)?
                .unwrap_or_else(defaults::max_interval),
            max_attempts,
        };

        if retry_policy.min_interval > retry_policy.max_interval {
            return Err(ConfigError::invalid(
                keys::MIN_INTERVAL,
                "must not exceed retryPolicy.limit.maxInterval",
            ));
        }

        Ok(Self {
            cluster,
            retention,
            logging,
            messages_processor,
            networking,
            retry_policy,
        })
    }
}

fn parse<T>(properties: &Properties, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    properties
        .get(key)
        .map(|value| {
            value
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, format!("{value:?}: {e}")))
        })
        .transpose()
}

fn log_targets(value: &str) -> Result<Vec<(String, LevelFilter)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| {
            let (target, level) = directive.split_once('=').ok_or_else(|| {
                ConfigError::invalid(keys::LOG_TARGETS, format!("{directive:?} is not target=level"))
            })?;
            let level = level
                .trim()
                .parse::<LevelFilter>()
                .map_err(|e| ConfigError::invalid(keys::LOG_TARGETS, format!("{directive:?}: {e}")))?;
            Ok((target.trim().to_string(), level))
        })
        .collect()
}

fn millis(properties: &Properties, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    parse::<u64>(properties, key).map(|value| value.map(Duration::from_millis))
}

fn duration(properties: &Properties, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    properties
        .get(key)
        .map(parse_duration)
        .transpose()
        .map_err(|source| ConfigError::Duration { key, source })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    const FULL_CONFIG: &str = r"
# Cluster configurations
cluster.authKey=abcd1234
cluster.controller.host=webhooks.example.com:7600
cluster.requestTimeout=10000

# Database properties
db.deadMessages.retention=30d
db.deliveredMessages.retention=7d

# Message Processor configurations
msgproc.message_delivery_timeout=2500
msgproc.workers=500

net.client.protocols=json, restful
net.client.restful.port=80

retryPolicy.defaults.interval=[1m, 5m, 1h]
retryPolicy.defaults.maxAttempts=7

retryPolicy.limit.minInterval=30s
retryPolicy.limit.maxInterval=30d
retryPolicy.limit.maxAttempts=20
";

    #[test]
    fn test_full_configuration() {
        let config = Configuration::from_properties(&Properties::parse(FULL_CONFIG)).unwrap();

        assert_eq!(config.cluster.auth_key.as_deref(), Some("abcd1234"));
        assert_eq!(config.cluster.controller_host, "webhooks.example.com:7600");
        assert_eq!(config.cluster.request_timeout, Duration::from_secs(10));
        assert!(!config.cluster.local_delivery);

        assert_eq!(
            config.retention.dead_messages,
            Some(Duration::from_secs(30 * 86_400))
        );
        assert_eq!(
            config.retention.delivered_messages,
            Some(Duration::from_secs(7 * 86_400))
        );

        assert_eq!(
            config.messages_processor.message_delivery_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.messages_processor.workers, 500);

        assert!(config.networking.client_protocols.contains("restful"));
        assert!(config.networking.client_protocols.contains("json"));
        assert_eq!(config.networking.restful_port, Some(80));

        let interval = config.retry_policy.default_interval.unwrap();
        assert_eq!(interval.len(), 3);
        assert_eq!(config.retry_policy.default_max_attempts, Some(7));
        assert_eq!(config.retry_policy.min_interval, Duration::from_secs(30));
        assert_eq!(
            config.retry_policy.max_interval,
            Duration::from_secs(30 * 86_400)
        );
        assert_eq!(config.retry_policy.max_attempts, 20);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Configuration::from_properties(&Properties::new()).unwrap();

        assert_eq!(config.cluster, ClusterConfiguration::default());
        assert_eq!(config.retry_policy, RetryPolicyConfiguration::default());
        assert!(config.messages_processor.workers >= 1);
        assert!(config.networking.client_protocols.contains("json"));
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = Configuration::from_properties(&Properties::parse("msgproc.workers=many"))
            .unwrap_err();
        assert!(err.to_string().contains("msgproc.workers"));

        let err = Configuration::from_properties(&Properties::parse("msgproc.workers=0"))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "msgproc.workers",
                ..
            }
        ));

        let err = Configuration::from_properties(&Properties::parse(
            "retryPolicy.defaults.maxAttempts=-1",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("retryPolicy.defaults.maxAttempts"));

        let err = Configuration::from_properties(&Properties::parse(
            "retryPolicy.limit.maxInterval=5x",
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duration {
                key: "retryPolicy.limit.maxInterval",
                ..
            }
        ));
    }

    #[test]
    fn test_logging_targets() {
        let config = Configuration::from_properties(&Properties::parse(
            "log.level=warn\nlog.targets=angler_cluster=debug, angler_delivery::pool = trace\n",
        ))
        .unwrap();

        assert_eq!(config.logging.level, Some(LevelFilter::WARN));
        assert_eq!(
            config.logging.targets,
            vec![
                ("angler_cluster".to_string(), LevelFilter::DEBUG),
                ("angler_delivery::pool".to_string(), LevelFilter::TRACE),
            ]
        );

        let err = Configuration::from_properties(&Properties::parse("log.targets=angler_cluster"))
            .unwrap_err();
        assert!(err.to_string().contains("log.targets"));

        let err =
            Configuration::from_properties(&Properties::parse("log.level=loud")).unwrap_err();
        assert!(err.to_string().contains("log.level"));
    }

    #[test]
    fn test_inverted_interval_limits_rejected() {
        let err = Configuration::from_properties(&Properties::parse(
            "retryPolicy.limit.minInterval=1h\nretryPolicy.limit.maxInterval=1m",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("retryPolicy.limit.minInterval"));
    }

    #[test]
    fn test_load_merges_environment_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "msgproc.workers=8").unwrap();

        let config = Configuration::load(
            file.path(),
            Some("msgproc.workers=2; cluster.authKey=from-env; cluster.controller.localDelivery=true"),
        )
        .unwrap();

        assert_eq!(config.messages_processor.workers, 8);
        assert_eq!(config.cluster.auth_key.as_deref(), Some("from-env"));
        assert!(config.cluster.local_delivery);
    }
}
