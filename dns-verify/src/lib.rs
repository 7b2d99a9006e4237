// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end DNS consistency verification
//!
//! This crate checks that a DNS provider wired into a virtual network
//! publishes the records that the orchestrator believes it created.  The
//! pieces are:
//!
//! 1. An [`binding::ExpectedBinding`]: the DNS name of a provisioned VM and
//!    the address it is supposed to resolve to.
//! 2. A [`trigger::Trigger`] that asks the provider to export and reload its
//!    zone data so pending records become visible.  It fires exactly once and
//!    never retries.
//! 3. The [`verifier`], which polls a [`resolver::NameResolver`] until the
//!    expected address shows up, the attempts run out, or the caller cancels.
//!    It can also check that the address points back to the name (PTR).
//!
//! DNS publication is asynchronous with respect to VM creation, so a single
//! lookup right after provisioning races the provider.  The verifier absorbs
//! that race with a bounded number of attempts separated by a
//! [`backoff::BackoffPolicy`].
//!
//! [`scenario::run_scenario`] composes all of this with an externally
//! supplied [`scenario::Provisioner`] and a [`cleanup::CleanupStack`] that
//! always tears down whatever was created.

pub mod backoff;
pub mod binding;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod logging;
pub mod resolver;
pub mod scenario;
pub mod trigger;
pub mod verifier;

pub use binding::ExpectedBinding;
pub use cancel::{cancel_pair, CancelSignal, Canceller};
pub use config::ResolverConfig;
pub use resolver::{DnsResolver, NameResolver, ResolutionError};
pub use trigger::{ReconciliationRequest, Trigger, TriggerError};
pub use verifier::{
    verify, verify_all, verify_all_checks, verify_reverse_with_cancel,
    verify_with_cancel, RecordCheck, VerificationResult,
};
