// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling a resolver until a binding is published
//!
//! Records show up in DNS some time after the resource they describe is
//! created, so the verifier makes up to `max_attempts` queries separated by
//! the configured backoff.  A forward check succeeds as soon as one answer
//! contains the expected address (other addresses in the same answer are
//! fine) and otherwise reports the last answer and last error it saw.
//!
//! A reverse check runs the same loop against the PTR records of the
//! expected address and succeeds once they include the binding's name.

use crate::binding::ExpectedBinding;
use crate::cancel::CancelSignal;
use crate::config::ResolverConfig;
use crate::resolver::{AddressFamily, NameResolver, ResolutionError};
use futures::StreamExt;
use serde::Serialize;
use slog::{debug, info, o, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;

/// Which direction of a binding a verification checks
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCheck {
    /// The name resolves (A or AAAA) to the expected address.
    #[default]
    Forward,
    /// The expected address resolves (PTR) back to the name.
    Reverse,
}

impl fmt::Display for RecordCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordCheck::Forward => f.write_str("forward"),
            RecordCheck::Reverse => f.write_str("reverse"),
        }
    }
}

/// Outcome of verifying one binding
///
/// `success` is true if and only if some attempt observed the expected
/// answer.  When `success` is false, `last_error` is always populated.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VerificationResult {
    pub check: RecordCheck,
    pub success: bool,
    pub dns_name: String,
    pub expected_address: IpAddr,
    /// Addresses from the most recent successful forward lookup (possibly
    /// empty)
    pub observed_addresses: BTreeSet<IpAddr>,
    /// Names from the most recent successful reverse lookup
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub observed_names: BTreeSet<String>,
    pub attempts: u32,
    pub last_error: Option<ResolutionError>,
}

/// Coarse classification of a verification result for reporting
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    Verified,
    /// The name (or, for a reverse check, the address) never resolved to
    /// anything.
    NeverResolved,
    /// The name resolved, but never to the expected address.
    WrongAddress,
    /// The address resolved back, but never to the expected name.
    WrongName,
    /// Lookups timed out or could not reach a nameserver.
    TransportProblem,
    /// The caller gave up before the verification finished.
    Cancelled,
}

impl VerificationResult {
    pub fn diagnosis(&self) -> Diagnosis {
        if self.success {
            return Diagnosis::Verified;
        }
        if matches!(self.last_error, Some(ResolutionError::Cancelled { .. })) {
            return Diagnosis::Cancelled;
        }
        if !self.observed_addresses.is_empty() {
            return Diagnosis::WrongAddress;
        }
        if !self.observed_names.is_empty() {
            return Diagnosis::WrongName;
        }
        match self.last_error {
            Some(ResolutionError::Timeout { .. })
            | Some(ResolutionError::TransportError { .. }) => {
                Diagnosis::TransportProblem
            }
            _ => Diagnosis::NeverResolved,
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Diagnosis::Verified => "verified",
            Diagnosis::NeverResolved => "never resolved",
            Diagnosis::WrongAddress => "resolved to the wrong address",
            Diagnosis::WrongName => "resolved to the wrong name",
            Diagnosis::TransportProblem => "could not talk to DNS",
            Diagnosis::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success { "PASS" } else { "FAIL" };
        match self.check {
            RecordCheck::Forward => write!(
                f,
                "{} {} -> {}",
                verdict, self.dns_name, self.expected_address
            )?,
            RecordCheck::Reverse => write!(
                f,
                "{} {} -> {} (PTR)",
                verdict, self.expected_address, self.dns_name
            )?,
        }
        write!(
            f,
            " ({}, {} attempt{})",
            self.diagnosis(),
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
        )?;
        if !self.observed_addresses.is_empty() {
            let observed: Vec<String> =
                self.observed_addresses.iter().map(|a| a.to_string()).collect();
            write!(f, "; observed [{}]", observed.join(", "))?;
        }
        if !self.observed_names.is_empty() {
            let observed: Vec<&str> =
                self.observed_names.iter().map(String::as_str).collect();
            write!(f, "; observed [{}]", observed.join(", "))?;
        }
        if let Some(error) = &self.last_error {
            write!(f, "; last error: {}", error)?;
        }
        Ok(())
    }
}

/// Verify `binding` without any external cancellation.
pub async fn verify<R>(
    log: &slog::Logger,
    resolver: &R,
    binding: &ExpectedBinding,
    cfg: &ResolverConfig,
) -> VerificationResult
where
    R: NameResolver + ?Sized,
{
    verify_with_cancel(log, resolver, binding, cfg, CancelSignal::never()).await
}

/// Verify `binding`, giving up early if `cancel` fires.
///
/// Cancellation interrupts both an in-flight lookup and a backoff sleep, so
/// this returns promptly once the signal fires.  A cancelled run reports
/// `success: false` with [`ResolutionError::Cancelled`].
pub async fn verify_with_cancel<R>(
    log: &slog::Logger,
    resolver: &R,
    binding: &ExpectedBinding,
    cfg: &ResolverConfig,
    mut cancel: CancelSignal,
) -> VerificationResult
where
    R: NameResolver + ?Sized,
{
    let log = log.new(o!(
        "check" => "forward",
        "dns_name" => binding.dns_name().to_string(),
        "expected_address" => binding.expected_address().to_string(),
    ));
    let name = binding.dns_name();
    let expected = binding.expected_address();
    let family = AddressFamily::of(expected);

    let polled = poll_until_published(
        &log,
        cfg,
        &mut cancel,
        name,
        || resolver.lookup(name, family),
        |observed: &BTreeSet<IpAddr>| {
            (!observed.contains(&expected)).then(|| {
                ResolutionError::AddressMismatch {
                    name: name.to_string(),
                    expected,
                    observed: observed.clone(),
                }
            })
        },
    )
    .await;

    finish(
        &log,
        VerificationResult {
            check: RecordCheck::Forward,
            success: polled.success,
            dns_name: name.to_string(),
            expected_address: expected,
            observed_addresses: polled.observed,
            observed_names: BTreeSet::new(),
            attempts: polled.attempts,
            last_error: polled.last_error,
        },
    )
}

/// Verify that the expected address of `binding` points back to its name,
/// giving up early if `cancel` fires.
///
/// Retries, timeouts and cancellation behave exactly as in
/// [`verify_with_cancel`].
pub async fn verify_reverse_with_cancel<R>(
    log: &slog::Logger,
    resolver: &R,
    binding: &ExpectedBinding,
    cfg: &ResolverConfig,
    mut cancel: CancelSignal,
) -> VerificationResult
where
    R: NameResolver + ?Sized,
{
    let log = log.new(o!(
        "check" => "reverse",
        "dns_name" => binding.dns_name().to_string(),
        "expected_address" => binding.expected_address().to_string(),
    ));
    let name = binding.dns_name();
    let expected = binding.expected_address();
    let subject = expected.to_string();

    let polled = poll_until_published(
        &log,
        cfg,
        &mut cancel,
        &subject,
        || resolver.reverse_lookup(expected),
        |observed: &BTreeSet<String>| {
            (!observed.contains(name)).then(|| ResolutionError::NameMismatch {
                address: expected,
                expected: name.to_string(),
                observed: observed.clone(),
            })
        },
    )
    .await;

    finish(
        &log,
        VerificationResult {
            check: RecordCheck::Reverse,
            success: polled.success,
            dns_name: name.to_string(),
            expected_address: expected,
            observed_addresses: BTreeSet::new(),
            observed_names: polled.observed,
            attempts: polled.attempts,
            last_error: polled.last_error,
        },
    )
}

/// Run one kind of check against `binding`.
pub async fn verify_check_with_cancel<R>(
    log: &slog::Logger,
    resolver: &R,
    binding: &ExpectedBinding,
    check: RecordCheck,
    cfg: &ResolverConfig,
    cancel: CancelSignal,
) -> VerificationResult
where
    R: NameResolver + ?Sized,
{
    match check {
        RecordCheck::Forward => {
            verify_with_cancel(log, resolver, binding, cfg, cancel).await
        }
        RecordCheck::Reverse => {
            verify_reverse_with_cancel(log, resolver, binding, cfg, cancel)
                .await
        }
    }
}

fn finish(log: &slog::Logger, result: VerificationResult) -> VerificationResult {
    if !result.success {
        warn!(log, "binding not verified";
            "attempts" => result.attempts,
            "diagnosis" => %result.diagnosis(),
        );
    }
    result
}

/// What the polling loop saw
struct Polled<T> {
    success: bool,
    attempts: u32,
    /// The most recent successful answer
    observed: T,
    last_error: Option<ResolutionError>,
}

/// Query until an answer satisfies `mismatch` (returns `None`), attempts run
/// out, or `cancel` fires.
///
/// `subject` names what is being looked up in timeout and cancellation
/// errors.
async fn poll_until_published<T, Q, Fut, M>(
    log: &slog::Logger,
    cfg: &ResolverConfig,
    cancel: &mut CancelSignal,
    subject: &str,
    mut query: Q,
    mismatch: M,
) -> Polled<T>
where
    T: Default + fmt::Debug,
    Q: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ResolutionError>>,
    M: Fn(&T) -> Option<ResolutionError>,
{
    let max_attempts = cfg.max_attempts.get();
    let mut backoff = cfg.backoff.build();

    let mut attempts = 0;
    let mut observed = T::default();
    let mut last_error = None;

    let cancelled = |attempts: u32, observed: T| {
        debug!(log, "verification cancelled"; "attempts" => attempts);
        Polled {
            success: false,
            attempts,
            observed,
            last_error: Some(ResolutionError::Cancelled {
                name: subject.to_string(),
            }),
        }
    };

    while attempts < max_attempts {
        if cancel.is_cancelled() {
            return cancelled(attempts, observed);
        }
        attempts += 1;

        let lookup = tokio::time::timeout(cfg.timeout_per_attempt, query());
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return cancelled(attempts, observed);
            }
            outcome = lookup => outcome,
        };

        match outcome {
            Ok(Ok(answer)) => match mismatch(&answer) {
                None => {
                    info!(log, "binding verified"; "attempts" => attempts);
                    return Polled {
                        success: true,
                        attempts,
                        observed: answer,
                        last_error: None,
                    };
                }
                Some(error) => {
                    debug!(log, "expected answer not yet published";
                        "attempt" => attempts,
                        "observed" => ?answer,
                    );
                    observed = answer;
                    last_error = Some(error);
                }
            },
            Ok(Err(error)) => {
                debug!(log, "lookup failed";
                    "attempt" => attempts,
                    "error" => %error,
                );
                last_error = Some(error);
            }
            Err(_) => {
                debug!(log, "lookup timed out"; "attempt" => attempts);
                last_error = Some(ResolutionError::Timeout {
                    name: subject.to_string(),
                });
            }
        }

        if attempts == max_attempts {
            break;
        }

        let delay = backoff.next_backoff().unwrap_or(cfg.timeout_per_attempt);
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return cancelled(attempts, observed);
            }
            () = tokio::time::sleep(delay) => {}
        }
    }

    Polled { success: false, attempts, observed, last_error }
}

/// Verify several bindings, at most `max_concurrency` at a time.
///
/// Each binding gets its own sequential verification; they share only the
/// read-only configuration and resolver.  Results come back in the order of
/// `bindings`.
pub async fn verify_all<R>(
    log: &slog::Logger,
    resolver: &R,
    bindings: &[ExpectedBinding],
    cfg: &ResolverConfig,
    max_concurrency: usize,
    cancel: CancelSignal,
) -> Vec<VerificationResult>
where
    R: NameResolver + ?Sized,
{
    verify_all_checks(
        log,
        resolver,
        bindings,
        &[RecordCheck::Forward],
        cfg,
        max_concurrency,
        cancel,
    )
    .await
}

/// Run every check in `checks` against every binding, at most
/// `max_concurrency` verifications at a time.
///
/// Results come back grouped by binding, in the order of `bindings` and
/// then of `checks`.
pub async fn verify_all_checks<R>(
    log: &slog::Logger,
    resolver: &R,
    bindings: &[ExpectedBinding],
    checks: &[RecordCheck],
    cfg: &ResolverConfig,
    max_concurrency: usize,
    cancel: CancelSignal,
) -> Vec<VerificationResult>
where
    R: NameResolver + ?Sized,
{
    let work = bindings
        .iter()
        .flat_map(|binding| checks.iter().map(move |check| (binding, *check)));
    futures::stream::iter(work)
        .map(|(binding, check)| {
            let cancel = cancel.clone();
            async move {
                verify_check_with_cancel(
                    log, resolver, binding, check, cfg, cancel,
                )
                .await
            }
        })
        .buffered(max_concurrency.max(1))
        .collect()
        .await
}
