// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forward and reverse DNS lookups against specific nameservers

use crate::config::ResolverConfig;
use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfig, Protocol, ResolverConfig as HickoryConfig,
    ResolverOpts, ServerOrderingStrategy,
};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::error::ProtoErrorKind;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use slog::{debug, info};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Why a single resolution attempt did not confirm the expected binding
///
/// Every variant is recoverable by retrying: the verifier records the most
/// recent one and keeps polling until it runs out of attempts.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionError {
    /// NXDOMAIN, or the name exists without records of the requested type.
    #[error("no {family} records found for {name:?}")]
    NameNotFound { name: String, family: AddressFamily },

    #[error("timed out resolving {name:?}")]
    Timeout { name: String },

    /// SERVFAIL or REFUSED from every configured nameserver.
    #[error("nameserver failed to resolve {name:?}: {response_code}")]
    ServerFailure { name: String, response_code: String },

    #[error("error talking to nameserver while resolving {name:?}: {message}")]
    TransportError { name: String, message: String },

    /// The lookup succeeded but the expected address was not in the answer.
    #[error("{name:?} resolved to {observed:?}, not {expected}")]
    AddressMismatch {
        name: String,
        expected: IpAddr,
        observed: BTreeSet<IpAddr>,
    },

    /// No PTR records exist for the address.
    #[error("no PTR records found for {address}")]
    ReverseNotFound { address: IpAddr },

    /// The reverse lookup succeeded but did not name the expected host.
    #[error("{address} points back to {observed:?}, not {expected:?}")]
    NameMismatch {
        address: IpAddr,
        expected: String,
        observed: BTreeSet<String>,
    },

    #[error("verification of {name:?} was cancelled")]
    Cancelled { name: String },
}

/// Which kind of address record to look up
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum AddressFamily {
    /// A records
    V4,
    /// AAAA records
    V6,
}

impl AddressFamily {
    pub fn of(address: IpAddr) -> AddressFamily {
        match address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("A"),
            AddressFamily::V6 => f.write_str("AAAA"),
        }
    }
}

/// Something that can look up the addresses a name currently resolves to,
/// and the names an address points back to
///
/// Implementations must issue a fresh query on every call: answers served
/// from a cache would hide propagation from the verifier.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup(
        &self,
        name: &str,
        family: AddressFamily,
    ) -> Result<BTreeSet<IpAddr>, ResolutionError>;

    /// Look up the PTR records for `address`.  Names come back lowercase and
    /// without the trailing dot.
    async fn reverse_lookup(
        &self,
        address: IpAddr,
    ) -> Result<BTreeSet<String>, ResolutionError>;
}

/// A [`NameResolver`] that queries specific nameservers over UDP
#[derive(Clone)]
pub struct DnsResolver {
    log: slog::Logger,
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Construct a resolver that only talks to the configured nameservers,
    /// in the order given.
    ///
    /// Each lookup makes a single attempt bounded by the configured
    /// per-attempt timeout; retrying is left to the caller.  That budget is
    /// split evenly across the nameservers so a silent server still leaves
    /// time to ask the next one.
    pub fn new(log: slog::Logger, config: &ResolverConfig) -> DnsResolver {
        info!(log, "new DNS resolver";
            "nameservers" => ?config.nameservers,
            "timeout_per_attempt" => ?config.timeout_per_attempt,
        );

        let mut rc = HickoryConfig::new();
        for nameserver in &config.nameservers {
            rc.add_name_server(NameServerConfig {
                socket_addr: SocketAddr::from(*nameserver),
                protocol: Protocol::Udp,
                tls_dns_name: None,
                trust_negative_responses: true,
                bind_addr: None,
            });
        }
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.timeout = per_server_timeout(config);
        opts.attempts = 1;
        opts.num_concurrent_reqs = 1;
        opts.server_ordering_strategy =
            ServerOrderingStrategy::UserProvidedOrder;
        let resolver = TokioAsyncResolver::tokio(rc, opts);

        DnsResolver { log, resolver }
    }

    /// Wrap an already-configured hickory resolver.
    pub fn new_with_resolver(
        log: slog::Logger,
        resolver: TokioAsyncResolver,
    ) -> DnsResolver {
        DnsResolver { log, resolver }
    }
}

#[async_trait]
impl NameResolver for DnsResolver {
    async fn lookup(
        &self,
        name: &str,
        family: AddressFamily,
    ) -> Result<BTreeSet<IpAddr>, ResolutionError> {
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.", name)
        };
        debug!(self.log, "lookup"; "dns_name" => &fqdn, "family" => %family);

        // Polling only works if every attempt reaches a nameserver.
        self.resolver.clear_cache();

        let result: Result<BTreeSet<IpAddr>, ResolveError> = match family {
            AddressFamily::V4 => {
                self.resolver.ipv4_lookup(fqdn.as_str()).await.map(|response| {
                    response.iter().map(|a| IpAddr::V4(a.0)).collect()
                })
            }
            AddressFamily::V6 => {
                self.resolver.ipv6_lookup(fqdn.as_str()).await.map(|response| {
                    response.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect()
                })
            }
        };

        match result {
            Ok(addresses) if addresses.is_empty() => {
                Err(ResolutionError::NameNotFound {
                    name: name.to_string(),
                    family,
                })
            }
            Ok(addresses) => {
                debug!(self.log, "lookup succeeded";
                    "dns_name" => &fqdn,
                    "addresses" => ?addresses,
                );
                Ok(addresses)
            }
            Err(error) => {
                let error = classify(name, family, &error);
                debug!(self.log, "lookup failed";
                    "dns_name" => &fqdn,
                    "error" => %error,
                );
                Err(error)
            }
        }
    }

    async fn reverse_lookup(
        &self,
        address: IpAddr,
    ) -> Result<BTreeSet<String>, ResolutionError> {
        debug!(self.log, "reverse lookup"; "address" => %address);
        self.resolver.clear_cache();

        match self.resolver.reverse_lookup(address).await {
            Ok(response) => {
                let names: BTreeSet<String> = response
                    .iter()
                    .map(|ptr| normalize_name(&ptr.0.to_utf8()))
                    .collect();
                if names.is_empty() {
                    return Err(ResolutionError::ReverseNotFound { address });
                }
                debug!(self.log, "reverse lookup succeeded";
                    "address" => %address,
                    "names" => ?names,
                );
                Ok(names)
            }
            Err(error) => {
                let error = classify_with(&address.to_string(), &error, || {
                    ResolutionError::ReverseNotFound { address }
                });
                debug!(self.log, "reverse lookup failed";
                    "address" => %address,
                    "error" => %error,
                );
                Err(error)
            }
        }
    }
}

/// Names compare without the trailing root label and case-insensitively.
fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// How long to wait on each nameserver before moving on to the next
fn per_server_timeout(config: &ResolverConfig) -> Duration {
    let servers =
        u32::try_from(config.nameservers.len()).unwrap_or(u32::MAX).max(1);
    config.timeout_per_attempt / servers
}

fn classify(
    name: &str,
    family: AddressFamily,
    error: &ResolveError,
) -> ResolutionError {
    classify_with(name, error, || ResolutionError::NameNotFound {
        name: name.to_string(),
        family,
    })
}

/// Map a hickory error onto [`ResolutionError`], using `not_found` for an
/// answer with no records.
fn classify_with<F>(
    name: &str,
    error: &ResolveError,
    not_found: F,
) -> ResolutionError
where
    F: FnOnce() -> ResolutionError,
{
    let name = name.to_string();
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            match *response_code {
                ResponseCode::ServFail | ResponseCode::Refused => {
                    ResolutionError::ServerFailure {
                        name,
                        response_code: response_code.to_string(),
                    }
                }
                _ => not_found(),
            }
        }
        ResolveErrorKind::Timeout => ResolutionError::Timeout { name },
        ResolveErrorKind::Proto(proto)
            if matches!(proto.kind(), ProtoErrorKind::Timeout) =>
        {
            ResolutionError::Timeout { name }
        }
        _ => ResolutionError::TransportError {
            name,
            message: error.to_string(),
        },
    }
}
