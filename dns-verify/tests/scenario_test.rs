// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenario runs with a fake orchestrator, a mock provider API,
//! and a fake resolver

use assert_matches::assert_matches;
use async_trait::async_trait;
use dns_verify::backoff::BackoffPolicy;
use dns_verify::binding::{
    BindingError, Nic, ProvisionedNetwork, ProvisionedVm, VmState,
};
use dns_verify::cleanup::CleanupStack;
use dns_verify::logging::test_setup_log;
use dns_verify::resolver::AddressFamily;
use dns_verify::scenario::{
    run_scenario, Provisioner, ScenarioContext, ScenarioError, Topology,
};
use dns_verify::verifier::Diagnosis;
use dns_verify::{
    CancelSignal, NameResolver, ReconciliationRequest, ResolutionError,
    ResolverConfig, Trigger, TriggerError,
};
use httptest::matchers::request;
use httptest::responders::status_code;
use httptest::{Expectation, Server};
use reqwest::Url;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const VM_ADDRESS: &str = "10.1.1.23";

/// Answers from a fixed table; names not in it do not exist
struct StaticResolver {
    records: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl StaticResolver {
    fn new(records: &[(&str, &str)]) -> StaticResolver {
        let mut table: BTreeMap<String, BTreeSet<IpAddr>> = BTreeMap::new();
        for (name, addr) in records {
            table
                .entry(name.to_string())
                .or_default()
                .insert(addr.parse().unwrap());
        }
        StaticResolver { records: table }
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup(
        &self,
        name: &str,
        family: AddressFamily,
    ) -> Result<BTreeSet<IpAddr>, ResolutionError> {
        self.records.get(name).cloned().ok_or_else(|| {
            ResolutionError::NameNotFound { name: name.to_string(), family }
        })
    }

    async fn reverse_lookup(
        &self,
        address: IpAddr,
    ) -> Result<BTreeSet<String>, ResolutionError> {
        let names: BTreeSet<String> = self
            .records
            .iter()
            .filter(|(_, addrs)| addrs.contains(&address))
            .map(|(name, _)| name.clone())
            .collect();
        if names.is_empty() {
            return Err(ResolutionError::ReverseNotFound { address });
        }
        Ok(names)
    }
}

/// Stands in for the orchestrator: creates a network and a VM, and records
/// every teardown in `torn_down`
struct FakeProvisioner {
    vm_state: VmState,
    fail_after_network: bool,
    stall_after_network: bool,
    failing_cleanup: Option<&'static str>,
    torn_down: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeProvisioner {
    fn new() -> FakeProvisioner {
        FakeProvisioner {
            vm_state: VmState::Running,
            fail_after_network: false,
            stall_after_network: false,
            failing_cleanup: None,
            torn_down: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn torn_down(&self) -> Vec<&'static str> {
        self.torn_down.lock().unwrap().clone()
    }

    fn register(&self, cleanup: &mut CleanupStack, resource: &'static str) {
        let torn_down = Arc::clone(&self.torn_down);
        let fail = self.failing_cleanup == Some(resource);
        cleanup.push(format!("delete {}", resource), move || async move {
            torn_down.lock().unwrap().push(resource);
            if fail {
                anyhow::bail!("{} is still in use", resource);
            }
            Ok(())
        });
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(
        &self,
        _log: &slog::Logger,
        cleanup: &mut CleanupStack,
    ) -> anyhow::Result<Topology> {
        let network = ProvisionedNetwork {
            id: "net-0001".to_string(),
            name: "dns-test-net".to_string(),
            network_domain: Some("test.example.com".to_string()),
        };
        self.register(cleanup, "network");
        if self.fail_after_network {
            anyhow::bail!("no capacity for VM");
        }
        if self.stall_after_network {
            std::future::pending::<()>().await;
        }

        let vm = ProvisionedVm {
            id: "vm-0001".to_string(),
            name: "testdnsapi".to_string(),
            state: self.vm_state,
            nics: vec![Nic { address: VM_ADDRESS.parse().unwrap() }],
        };
        self.register(cleanup, "vm");
        Ok(Topology { network, vm })
    }
}

struct Harness {
    log: slog::Logger,
    server: Server,
    trigger: Trigger,
    request: ReconciliationRequest,
    resolver_config: ResolverConfig,
}

impl Harness {
    fn new(test_name: &str) -> Harness {
        let log = test_setup_log(test_name);
        let server = Server::run();
        let trigger =
            Trigger::new(log.clone(), Duration::from_secs(5)).unwrap();
        let request = ReconciliationRequest::new(
            Url::parse(&server.url_str("/")).unwrap(),
            "/api/bind/export",
            String::from(r#"{"export": true}"#),
            &BTreeMap::new(),
        )
        .unwrap();

        // The fake resolver answers instantly, so keep the retry loop short.
        let unused: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let mut resolver_config = ResolverConfig::new(vec![unused]);
        resolver_config.max_attempts = NonZeroU32::new(2).unwrap();
        resolver_config.backoff =
            BackoffPolicy::Fixed { interval: Duration::from_millis(10) };

        Harness { log, server, trigger, request, resolver_config }
    }

    fn expect_export(&self, status: u16) {
        self.server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/api/bind/export",
            ))
            .times(1)
            .respond_with(status_code(status)),
        );
    }

    fn context<'a>(
        &'a self,
        resolver: &'a dyn NameResolver,
    ) -> ScenarioContext<'a> {
        ScenarioContext {
            log: &self.log,
            trigger: &self.trigger,
            request: &self.request,
            resolver,
            resolver_config: &self.resolver_config,
        }
    }
}

#[tokio::test]
async fn scenario_passes_and_tears_down_in_reverse() {
    let harness = Harness::new("scenario_passes_and_tears_down_in_reverse");
    harness.expect_export(204);
    let resolver =
        StaticResolver::new(&[("testdnsapi.test.example.com", VM_ADDRESS)]);
    let provisioner = FakeProvisioner::new();

    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never(),
    )
    .await;

    assert_eq!(provisioner.torn_down(), vec!["vm", "network"]);
    let result = report.into_result().unwrap();
    assert!(result.success);
    assert_eq!(result.dns_name, "testdnsapi.test.example.com");
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn rejected_trigger_fails_scenario_but_still_cleans_up() {
    let harness =
        Harness::new("rejected_trigger_fails_scenario_but_still_cleans_up");
    harness.expect_export(500);
    let resolver =
        StaticResolver::new(&[("testdnsapi.test.example.com", VM_ADDRESS)]);
    let provisioner = FakeProvisioner::new();

    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never(),
    )
    .await;

    assert_matches!(
        report.outcome,
        Err(ScenarioError::Trigger(TriggerError::RejectedByProvider { .. }))
    );
    assert_matches!(report.cleanup, Ok(()));
    assert_eq!(provisioner.torn_down(), vec!["vm", "network"]);
}

#[tokio::test]
async fn unpublished_record_and_failed_cleanup_are_both_reported() {
    let harness = Harness::new(
        "unpublished_record_and_failed_cleanup_are_both_reported",
    );
    harness.expect_export(200);
    let resolver = StaticResolver::new(&[]);
    let mut provisioner = FakeProvisioner::new();
    provisioner.failing_cleanup = Some("vm");

    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never(),
    )
    .await;

    assert_matches!(
        &report.outcome,
        Err(ScenarioError::Verification(result)) => {
            assert!(!result.success);
            assert_eq!(result.attempts, 2);
            assert_eq!(result.diagnosis(), Diagnosis::NeverResolved);
        }
    );
    assert_matches!(&report.cleanup, Err(error) => {
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].step, "delete vm");
    });
    // The failed VM teardown did not stop the network teardown.
    assert_eq!(provisioner.torn_down(), vec!["vm", "network"]);

    let error = report.into_result().unwrap_err();
    let message = format!("{:#}", error);
    assert!(message.contains("1 cleanup step(s) failed"), "{}", message);
    assert!(message.contains("DNS verification failed"), "{}", message);
}

#[tokio::test]
async fn provisioning_failure_skips_trigger() {
    // No expectations: any request to the mock provider fails the test.
    let harness = Harness::new("provisioning_failure_skips_trigger");
    let resolver = StaticResolver::new(&[]);
    let mut provisioner = FakeProvisioner::new();
    provisioner.fail_after_network = true;

    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never(),
    )
    .await;

    assert_matches!(report.outcome, Err(ScenarioError::Provision(_)));
    assert_matches!(report.cleanup, Ok(()));
    assert_eq!(provisioner.torn_down(), vec!["network"]);
}

#[tokio::test]
async fn stopped_vm_cannot_be_verified() {
    let harness = Harness::new("stopped_vm_cannot_be_verified");
    let resolver = StaticResolver::new(&[]);
    let mut provisioner = FakeProvisioner::new();
    provisioner.vm_state = VmState::Stopped;

    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never(),
    )
    .await;

    assert_matches!(
        report.outcome,
        Err(ScenarioError::Binding(BindingError::VmNotRunning {
            state: VmState::Stopped,
            ..
        }))
    );
    assert_eq!(provisioner.torn_down(), vec!["vm", "network"]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_provisioning_still_tears_down() {
    // No expectations: the trigger must never be sent.
    let harness =
        Harness::new("cancel_during_provisioning_still_tears_down");
    let resolver = StaticResolver::new(&[]);
    let mut provisioner = FakeProvisioner::new();
    provisioner.stall_after_network = true;

    let start = tokio::time::Instant::now();
    let report = run_scenario(
        &harness.context(&resolver),
        &provisioner,
        CancelSignal::never().with_timeout(Duration::from_secs(30)),
    )
    .await;

    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_matches!(report.outcome, Err(ScenarioError::Cancelled));
    assert_matches!(report.cleanup, Ok(()));
    assert_eq!(provisioner.torn_down(), vec!["network"]);
}
