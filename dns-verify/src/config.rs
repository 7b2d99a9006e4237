// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files

use crate::backoff::BackoffPolicy;
use crate::logging::LogConfig;
use crate::trigger::ReconciliationRequest;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DeserializeFromStr;
use serde_with::DurationMilliSeconds;
use serde_with::DurationSeconds;
use serde_with::SerializeDisplay;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Port used when a nameserver is given without one
pub const DNS_PORT: u16 = 53;

const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(5) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_TIMEOUT_PER_ATTEMPT: Duration = Duration::from_secs(2);

/// Configuration for the `dns-verify` tool
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// How to ask the DNS provider to publish pending records
    pub dns_api: DnsApiConfig,
    /// Where and how persistently to look the records up
    pub resolver: ResolverConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config = Config::from_toml(&file_contents)
            .map_err(|err| err.with_path(path))?;
        Ok(config)
    }

    /// Parse and validate a `Config` from TOML text.
    pub fn from_toml(contents: &str) -> Result<Config, LoadError> {
        let config: Config =
            toml::from_str(contents).map_err(|err| LoadError::Parse {
                path: Utf8PathBuf::from("<string>"),
                err,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadError> {
        self.resolver.validate()?;
        self.dns_api.to_request()?;
        Ok(())
    }
}

/// The provider's export/reload endpoint
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DnsApiConfig {
    /// Base URL of the provider, e.g. `http://dnsapi.example.com:8000`
    pub endpoint: String,
    /// Path appended to `endpoint` for the export request
    pub export_path: String,
    /// Request body, sent as-is
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Overall timeout for the export request
    #[serde(
        rename = "request_timeout_secs",
        default = "default_request_timeout"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl DnsApiConfig {
    /// Build the reconciliation request this configuration describes.
    pub fn to_request(&self) -> Result<ReconciliationRequest, LoadError> {
        let endpoint = Url::parse(&self.endpoint).map_err(|err| {
            LoadError::Invalid(format!(
                "dns_api.endpoint {:?} is not a URL: {}",
                self.endpoint, err
            ))
        })?;
        ReconciliationRequest::new(
            endpoint,
            &self.export_path,
            self.payload.clone(),
            &self.headers,
        )
        .map_err(|err| LoadError::Invalid(format!("dns_api: {}", err)))
    }
}

/// Resolution settings shared, read-only, by every verification in a run
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResolverConfig {
    /// Nameservers to query, in order of preference
    pub nameservers: Vec<Nameserver>,
    /// Upper bound on a single resolution attempt
    #[serde(rename = "timeout_per_attempt_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout_per_attempt: Duration,
    /// Attempts made before giving up on a binding
    pub max_attempts: NonZeroU32,
    /// Delay between attempts
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl ResolverConfig {
    /// A configuration querying `nameservers` with the default policy: five
    /// attempts, two seconds apart, each bounded by two seconds.
    pub fn new(nameservers: Vec<SocketAddr>) -> ResolverConfig {
        ResolverConfig {
            nameservers: nameservers.into_iter().map(Nameserver).collect(),
            timeout_per_attempt: DEFAULT_TIMEOUT_PER_ATTEMPT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.nameservers.is_empty() {
            return Err(LoadError::Invalid(
                "resolver.nameservers must name at least one nameserver"
                    .to_string(),
            ));
        }
        if self.timeout_per_attempt.is_zero() {
            return Err(LoadError::Invalid(
                "resolver.timeout_per_attempt_ms must be non-zero".to_string(),
            ));
        }
        self.backoff.validate().map_err(|msg| {
            LoadError::Invalid(format!("resolver.backoff: {}", msg))
        })
    }
}

/// A nameserver address
///
/// Parses from `ip` (port 53 implied), `ip:port`, or `[ipv6]:port`.
#[derive(
    Clone, Copy, Debug, DeserializeFromStr, Eq, PartialEq, SerializeDisplay,
)]
pub struct Nameserver(pub SocketAddr);

impl FromStr for Nameserver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Nameserver(addr));
        }
        s.parse::<IpAddr>()
            .map(|ip| Nameserver(SocketAddr::new(ip, DNS_PORT)))
            .map_err(|_| format!("invalid nameserver address: {:?}", s))
    }
}

impl fmt::Display for Nameserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Nameserver> for SocketAddr {
    fn from(nameserver: Nameserver) -> SocketAddr {
        nameserver.0
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl LoadError {
    fn with_path(self, path: &Utf8Path) -> LoadError {
        match self {
            LoadError::Parse { err, .. } => {
                LoadError::Parse { path: path.into(), err }
            }
            LoadError::Io { err, .. } => {
                LoadError::Io { path: path.into(), err }
            }
            other => other,
        }
    }
}
