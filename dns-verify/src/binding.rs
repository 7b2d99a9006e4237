// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The association between a DNS name and the address it must resolve to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// What a provisioned VM's DNS name is expected to resolve to
///
/// Immutable once built.  The name is stored lowercase without a trailing
/// dot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExpectedBinding {
    dns_name: String,
    expected_address: IpAddr,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("invalid DNS name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("VM {vm:?} is {state}, not running")]
    VmNotRunning { vm: String, state: VmState },

    #[error("VM {vm:?} has no network interfaces")]
    NoNic { vm: String },

    #[error("network {network:?} has no network domain")]
    NoNetworkDomain { network: String },
}

impl ExpectedBinding {
    pub fn new(
        dns_name: &str,
        expected_address: IpAddr,
    ) -> Result<ExpectedBinding, BindingError> {
        let dns_name = normalize_name(dns_name)?;
        Ok(ExpectedBinding { dns_name, expected_address })
    }

    /// Derives the binding for a VM attached to a network whose DNS is
    /// managed by the provider under test.
    ///
    /// The VM's name under the network domain must resolve to the address of
    /// its first NIC.
    pub fn for_vm(
        vm: &ProvisionedVm,
        network: &ProvisionedNetwork,
    ) -> Result<ExpectedBinding, BindingError> {
        if vm.state != VmState::Running {
            return Err(BindingError::VmNotRunning {
                vm: vm.name.clone(),
                state: vm.state,
            });
        }
        let nic = vm
            .nics
            .first()
            .ok_or_else(|| BindingError::NoNic { vm: vm.name.clone() })?;
        let domain = network
            .network_domain
            .as_deref()
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| BindingError::NoNetworkDomain {
                network: network.name.clone(),
            })?;
        let domain = domain.trim_start_matches('.');
        ExpectedBinding::new(&format!("{}.{}", vm.name, domain), nic.address)
    }

    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    /// The DNS name with a trailing dot, so resolvers never apply search
    /// domains to it.
    pub fn fqdn(&self) -> String {
        format!("{}.", self.dns_name)
    }

    pub fn expected_address(&self) -> IpAddr {
        self.expected_address
    }
}

impl fmt::Display for ExpectedBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.dns_name, self.expected_address)
    }
}

fn normalize_name(name: &str) -> Result<String, BindingError> {
    let invalid = |reason| BindingError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(invalid("name is empty"));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 253 bytes"));
    }
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(invalid("name contains an empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label is longer than 63 bytes"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid("label contains an invalid character"));
        }
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Lifecycle state of a VM as reported by the orchestrator
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Error => "in an error state",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Nic {
    pub address: IpAddr,
}

/// A VM as returned by the orchestrator after provisioning
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProvisionedVm {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub nics: Vec<Nic>,
}

/// A guest network as returned by the orchestrator after provisioning
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProvisionedNetwork {
    pub id: String,
    pub name: String,
    pub network_domain: Option<String>,
}
