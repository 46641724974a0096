//! This module contains the configuration of the source and its parsing from string pairs.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::{
    broker::{ClientOptions, SubscribeOptions, SubscriptionType},
    error::ConfigError,
};

pub const KEY_URL: &str = "url";
pub const KEY_TOPIC: &str = "topic";
pub const KEY_SUBSCRIPTION_NAME: &str = "subscriptionName";
pub const KEY_SUBSCRIPTION_TYPE: &str = "subscriptionType";
pub const KEY_CONNECTION_TIMEOUT: &str = "connectionTimeout";
pub const KEY_OPERATION_TIMEOUT: &str = "operationTimeout";
pub const KEY_MAX_CONNECTIONS_PER_BROKER: &str = "maxConnectionsPerBroker";
pub const KEY_MEMORY_LIMIT_BYTES: &str = "memoryLimitBytes";
pub const KEY_ENABLE_TRANSACTION: &str = "enableTransaction";
pub const KEY_TLS_CERTIFICATE_FILE: &str = "tlsCertificateFile";
pub const KEY_TLS_KEY_FILE_PATH: &str = "tlsKeyFilePath";
pub const KEY_TLS_TRUST_CERTS_FILE_PATH: &str = "tlsTrustCertsFilePath";
pub const KEY_TLS_ALLOW_INSECURE_CONNECTION: &str = "tlsAllowInsecureConnection";
pub const KEY_TLS_VALIDATE_HOSTNAME: &str = "tlsValidateHostname";
pub const KEY_DISABLE_LOGGING: &str = "disableLogging";

/// Value type of a configuration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Int,
    Bool,
    Duration,
}

/// Description of one configuration parameter, for the pipeline's parameter listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub name: &'static str,
    pub kind: ParameterType,
    pub required: bool,
    pub description: &'static str,
}

const PARAMETERS: &[Parameter] = &[
    Parameter {
        name: KEY_URL,
        kind: ParameterType::String,
        required: true,
        description: "url of the Pulsar instance to connect to.",
    },
    Parameter {
        name: KEY_TOPIC,
        kind: ParameterType::String,
        required: true,
        description: "topic specifies the Pulsar topic from which the source will consume messages.",
    },
    Parameter {
        name: KEY_SUBSCRIPTION_NAME,
        kind: ParameterType::String,
        required: true,
        description: "subscriptionName is the name of the subscription to be used for consuming \
                      messages. Leave it empty to generate a new subscription on the first run.",
    },
    Parameter {
        name: KEY_SUBSCRIPTION_TYPE,
        kind: ParameterType::String,
        required: false,
        description: "subscriptionType is one of exclusive, shared, failover or key_shared \
                      (default: exclusive).",
    },
    Parameter {
        name: KEY_CONNECTION_TIMEOUT,
        kind: ParameterType::Duration,
        required: false,
        description: "connectionTimeout specifies the duration for which the client will attempt \
                      to establish a connection before timing out.",
    },
    Parameter {
        name: KEY_OPERATION_TIMEOUT,
        kind: ParameterType::Duration,
        required: false,
        description: "operationTimeout is the duration after which an operation is considered to \
                      have timed out.",
    },
    Parameter {
        name: KEY_MAX_CONNECTIONS_PER_BROKER,
        kind: ParameterType::Int,
        required: false,
        description: "maxConnectionsPerBroker limits the number of connections to each broker.",
    },
    Parameter {
        name: KEY_MEMORY_LIMIT_BYTES,
        kind: ParameterType::Int,
        required: false,
        description: "memoryLimitBytes sets the memory limit for the client in bytes. If the \
                      limit is exceeded, the client may start to block or fail operations.",
    },
    Parameter {
        name: KEY_ENABLE_TRANSACTION,
        kind: ParameterType::Bool,
        required: false,
        description: "enableTransaction determines if the client should support transactions.",
    },
    Parameter {
        name: KEY_TLS_CERTIFICATE_FILE,
        kind: ParameterType::String,
        required: false,
        description: "tlsCertificateFile sets the path to the TLS certificate file",
    },
    Parameter {
        name: KEY_TLS_KEY_FILE_PATH,
        kind: ParameterType::String,
        required: false,
        description: "tlsKeyFilePath sets the path to the TLS key file",
    },
    Parameter {
        name: KEY_TLS_TRUST_CERTS_FILE_PATH,
        kind: ParameterType::String,
        required: false,
        description: "tlsTrustCertsFilePath sets the path to the trusted TLS certificate file",
    },
    Parameter {
        name: KEY_TLS_ALLOW_INSECURE_CONNECTION,
        kind: ParameterType::Bool,
        required: false,
        description: "tlsAllowInsecureConnection configures whether the client accepts an \
                      untrusted TLS certificate from the broker (default: false)",
    },
    Parameter {
        name: KEY_TLS_VALIDATE_HOSTNAME,
        kind: ParameterType::Bool,
        required: false,
        description: "tlsValidateHostname configures whether the client verifies the validity \
                      of the host name from the broker (default: false)",
    },
    Parameter {
        name: KEY_DISABLE_LOGGING,
        kind: ParameterType::Bool,
        required: false,
        description: "disableLogging silences the broker client's own logging for this source.",
    },
];

/// Every parameter the source understands.
pub fn parameters() -> &'static [Parameter] {
    PARAMETERS
}

/// Configuration for the source
///
/// Built from the string pairs supplied by the pipeline with [`SourceConfig::from_map`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// Broker service URL, e.g. `pulsar://localhost:6650`
    pub url: String,
    /// Topic to consume from
    pub topic: String,
    /// Subscription to consume under
    ///
    /// `None` means the first `open` generates a fresh name.
    pub subscription_name: Option<String>,
    /// Default: [`SubscriptionType::Exclusive`]
    pub subscription_type: SubscriptionType,
    pub connection_timeout: Option<Duration>,
    pub operation_timeout: Option<Duration>,
    pub max_connections_per_broker: Option<u32>,
    pub memory_limit_bytes: Option<u64>,
    pub enable_transaction: bool,
    pub tls_certificate_file: Option<PathBuf>,
    pub tls_key_file_path: Option<PathBuf>,
    pub tls_trust_certs_file_path: Option<PathBuf>,
    pub tls_allow_insecure_connection: bool,
    pub tls_validate_hostname: bool,
    pub disable_logging: bool,
}

impl SourceConfig {
    /// Minimal configuration with every optional knob left at its default.
    pub fn new(url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: topic.into(),
            subscription_name: None,
            subscription_type: SubscriptionType::default(),
            connection_timeout: None,
            operation_timeout: None,
            max_connections_per_broker: None,
            memory_limit_bytes: None,
            enable_transaction: false,
            tls_certificate_file: None,
            tls_key_file_path: None,
            tls_trust_certs_file_path: None,
            tls_allow_insecure_connection: false,
            tls_validate_hostname: false,
            disable_logging: false,
        }
    }

    /// Set the subscription name (builder pattern)
    pub fn with_subscription_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.subscription_name = (!name.is_empty()).then_some(name);
        self
    }

    /// Set the subscription type (builder pattern)
    pub fn with_subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.subscription_type = subscription_type;
        self
    }

    /// Parse a configuration from the key/value pairs supplied by the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `url`, `topic` or `subscriptionName` is absent (or
    /// `url`/`topic` is empty), and [`ConfigError::Invalid`] when a typed value does not parse.
    pub fn from_map(config: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let url = required(config, KEY_URL)?;
        let topic = required(config, KEY_TOPIC)?;
        let subscription_name = config
            .get(KEY_SUBSCRIPTION_NAME)
            .ok_or(ConfigError::Missing {
                key: KEY_SUBSCRIPTION_NAME,
            })?;

        let mut cfg = Self::new(url, topic).with_subscription_name(subscription_name.as_str());

        if let Some(v) = non_empty(config, KEY_SUBSCRIPTION_TYPE) {
            cfg.subscription_type = v.parse()?;
        }

        cfg.connection_timeout = parse_opt(config, KEY_CONNECTION_TIMEOUT, parse_duration)?;
        cfg.operation_timeout = parse_opt(config, KEY_OPERATION_TIMEOUT, parse_duration)?;

        cfg.max_connections_per_broker =
            parse_opt(config, KEY_MAX_CONNECTIONS_PER_BROKER, |v| {
                match v.parse::<u32>() {
                    Ok(0) => Err("must be greater than zero".to_string()),
                    Ok(n) => Ok(n),
                    Err(e) => Err(e.to_string()),
                }
            })?;
        cfg.memory_limit_bytes = parse_opt(config, KEY_MEMORY_LIMIT_BYTES, |v| {
            v.parse::<u64>().map_err(|e| e.to_string())
        })?;

        cfg.enable_transaction = parse_flag(config, KEY_ENABLE_TRANSACTION)?;

        cfg.tls_certificate_file = non_empty(config, KEY_TLS_CERTIFICATE_FILE).map(PathBuf::from);
        cfg.tls_key_file_path = non_empty(config, KEY_TLS_KEY_FILE_PATH).map(PathBuf::from);
        cfg.tls_trust_certs_file_path =
            non_empty(config, KEY_TLS_TRUST_CERTS_FILE_PATH).map(PathBuf::from);
        cfg.tls_allow_insecure_connection =
            parse_flag(config, KEY_TLS_ALLOW_INSECURE_CONNECTION)?;
        cfg.tls_validate_hostname = parse_flag(config, KEY_TLS_VALIDATE_HOSTNAME)?;
        cfg.disable_logging = parse_flag(config, KEY_DISABLE_LOGGING)?;

        for key in config.keys() {
            if !PARAMETERS.iter().any(|p| p.name == key) {
                tracing::debug!(key = %key, "ignoring unknown configuration key");
            }
        }

        Ok(cfg)
    }

    /// Options forwarded to [`Connector::connect`](crate::Connector::connect).
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            url: self.url.clone(),
            connection_timeout: self.connection_timeout,
            operation_timeout: self.operation_timeout,
            max_connections_per_broker: self.max_connections_per_broker,
            memory_limit_bytes: self.memory_limit_bytes,
            enable_transaction: self.enable_transaction,
            tls_certificate_file: self.tls_certificate_file.clone(),
            tls_key_file_path: self.tls_key_file_path.clone(),
            tls_trust_certs_file_path: self.tls_trust_certs_file_path.clone(),
            tls_allow_insecure_connection: self.tls_allow_insecure_connection,
            tls_validate_hostname: self.tls_validate_hostname,
            disable_logging: self.disable_logging,
        }
    }

    /// Options forwarded to [`Client::subscribe`](crate::Client::subscribe).
    pub fn subscribe_options(&self, subscription_name: &str) -> SubscribeOptions {
        SubscribeOptions {
            topic: self.topic.clone(),
            subscription_name: subscription_name.to_string(),
            subscription_type: self.subscription_type,
        }
    }
}

fn required(config: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    non_empty(config, key)
        .map(String::from)
        .ok_or(ConfigError::Missing { key })
}

fn non_empty<'a>(config: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_opt<T>(
    config: &HashMap<String, String>,
    key: &'static str,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    non_empty(config, key)
        .map(|v| {
            parse(v).map_err(|reason| ConfigError::Invalid {
                key,
                value: v.to_string(),
                reason,
            })
        })
        .transpose()
}

fn parse_flag(config: &HashMap<String, String>, key: &'static str) -> Result<bool, ConfigError> {
    Ok(parse_opt(config, key, parse_bool)?.unwrap_or(false))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "t" | "T" => Ok(true),
        "0" | "f" | "F" => Ok(false),
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}

/// Parse a duration such as `300ms`, `1m30s` or `1.5h`.
///
/// The string is a sequence of decimal numbers, each with an optional fraction and a unit
/// (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`). A lone `0` needs no unit.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    if value.starts_with('-') {
        return Err("duration must not be negative".to_string());
    }
    let mut rest = value.strip_prefix('+').unwrap_or(value);
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if number_len == 0 {
            return Err(format!("expected a number in duration {value:?}"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {value:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("unknown unit {unit:?} in duration {value:?}")),
        };
        rest = &rest[unit_len..];

        total_nanos += number * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("duration {value:?} is out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
