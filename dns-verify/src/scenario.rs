// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision, publish, verify, tear down
//!
//! A scenario deploys a VM onto a network whose DNS is handled by the
//! provider under test, forces the provider to publish, and checks that the
//! VM's name resolves to its address.  Provisioning itself belongs to the
//! orchestrator and is supplied through [`Provisioner`].

use crate::binding::{
    BindingError, ExpectedBinding, ProvisionedNetwork, ProvisionedVm,
};
use crate::cancel::CancelSignal;
use crate::cleanup::{CleanupError, CleanupStack};
use crate::config::ResolverConfig;
use crate::resolver::NameResolver;
use crate::trigger::{ReconciliationRequest, Trigger, TriggerError};
use crate::verifier::{verify_with_cancel, VerificationResult};
use async_trait::async_trait;
use slog::{info, o, warn};
use thiserror::Error;

/// What provisioning produced
#[derive(Clone, Debug)]
pub struct Topology {
    pub network: ProvisionedNetwork,
    pub vm: ProvisionedVm,
}

/// Creates the resources a scenario verifies
///
/// Implementations register a teardown step on `cleanup` for everything
/// they create, as soon as it exists, so a failure partway through still
/// leaves nothing behind.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        log: &slog::Logger,
        cleanup: &mut CleanupStack,
    ) -> anyhow::Result<Topology>;
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("provisioning failed")]
    Provision(#[source] anyhow::Error),

    #[error("provisioned topology cannot be verified")]
    Binding(#[from] BindingError),

    #[error("reconciliation request failed")]
    Trigger(#[from] TriggerError),

    #[error("DNS verification failed: {0}")]
    Verification(VerificationResult),

    /// Cancelled while provisioning or waiting on the provider, before
    /// verification could report its own result.
    #[error("scenario was cancelled")]
    Cancelled,
}

/// Everything a scenario run produced
#[derive(Debug)]
pub struct ScenarioReport {
    pub outcome: Result<VerificationResult, ScenarioError>,
    pub cleanup: Result<(), CleanupError>,
}

impl ScenarioReport {
    /// Collapse the report into a single result.  A successful verification
    /// whose teardown failed is still an error.
    pub fn into_result(self) -> anyhow::Result<VerificationResult> {
        match (self.outcome, self.cleanup) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(cleanup)) => Err(anyhow::Error::new(cleanup)
                .context("scenario passed, but cleanup failed")),
            (Err(error), Ok(())) => Err(error.into()),
            (Err(error), Err(cleanup)) => Err(anyhow::Error::new(error)
                .context(format!("additionally, {}", cleanup))),
        }
    }
}

/// Inputs shared by every scenario run
pub struct ScenarioContext<'a> {
    pub log: &'a slog::Logger,
    pub trigger: &'a Trigger,
    pub request: &'a ReconciliationRequest,
    pub resolver: &'a dyn NameResolver,
    pub resolver_config: &'a ResolverConfig,
}

/// Provision a topology, publish its DNS records, verify the VM's binding,
/// and tear everything down.
///
/// Teardown always runs, whether the scenario passed, failed, or was
/// cancelled.  Cancellation interrupts whichever step is in progress;
/// teardown then covers whatever had been registered so far.
pub async fn run_scenario(
    ctx: &ScenarioContext<'_>,
    provisioner: &dyn Provisioner,
    cancel: CancelSignal,
) -> ScenarioReport {
    let log = ctx.log.new(o!("component" => "scenario"));
    let mut cleanup = CleanupStack::new();

    let mut interrupted = cancel.clone();
    let outcome = tokio::select! {
        biased;
        () = interrupted.cancelled() => Err(ScenarioError::Cancelled),
        outcome = run_steps(ctx, &log, provisioner, &mut cleanup, cancel) => {
            outcome
        }
    };
    match &outcome {
        Ok(result) => info!(log, "scenario passed"; "result" => %result),
        Err(error) => {
            warn!(log, "scenario failed"; "error" => format!("{:#}", error))
        }
    }

    info!(log, "tearing down"; "steps" => cleanup.len());
    let cleanup = cleanup.run(&log).await;
    ScenarioReport { outcome, cleanup }
}

async fn run_steps(
    ctx: &ScenarioContext<'_>,
    log: &slog::Logger,
    provisioner: &dyn Provisioner,
    cleanup: &mut CleanupStack,
    cancel: CancelSignal,
) -> Result<VerificationResult, ScenarioError> {
    let topology = provisioner
        .provision(log, cleanup)
        .await
        .map_err(ScenarioError::Provision)?;
    info!(log, "provisioned";
        "vm" => &topology.vm.name,
        "vm_id" => &topology.vm.id,
        "network" => &topology.network.name,
    );

    let binding = ExpectedBinding::for_vm(&topology.vm, &topology.network)?;
    ctx.trigger.trigger(ctx.request).await?;

    let result = verify_with_cancel(
        log,
        ctx.resolver,
        &binding,
        ctx.resolver_config,
        cancel,
    )
    .await;
    if result.success {
        Ok(result)
    } else {
        Err(ScenarioError::Verification(result))
    }
}
