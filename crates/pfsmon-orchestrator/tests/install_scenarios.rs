//! End-to-end install runs against the scripted executor

use pfsmon_agent::{AgentHealth, AgentManager};
use pfsmon_core::catalog::DEFAULT_CATALOG_TOML;
use pfsmon_core::registry::DEFAULT_HOSTS_TOML;
use pfsmon_core::{AgentConfig, Catalog, HostRegistry, HostState, RetryPolicies, RetryPolicy, StepState};
use pfsmon_orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
use pfsmon_planning::PlanBuilder;
use pfsmon_remote::{MockOutcome, MockRemoteExecutor, MockRule, RemoteExecutor};
use std::sync::Arc;
use std::time::Duration;

fn config(workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        workers,
        command_timeout: Duration::from_secs(30),
        retry: RetryPolicies::uniform(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(10)),
        ),
    }
}

fn registry(catalog: &Catalog, hosts: &str) -> HostRegistry {
    HostRegistry::from_toml_str(hosts, catalog).unwrap()
}

const THREE_HOSTS: &str = r#"
[[hosts]]
address = "mgs01"
roles = ["management"]

[[hosts]]
address = "oss01"
roles = ["object_storage"]

[[hosts]]
address = "oss02"
roles = ["object_storage"]
"#;

#[tokio::test]
async fn test_push_failure_isolated_to_one_host() {
    let catalog = Catalog::example().unwrap();
    let registry = registry(&catalog, THREE_HOSTS);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    let mock = Arc::new(MockRemoteExecutor::new().with_rule(
        MockRule::new(
            "push /etc/lustre/ost.conf",
            MockOutcome::Exit {
                code: 1,
                stderr: "No space left on device".to_string(),
            },
        )
        .host("oss02"),
    ));

    let report = Orchestrator::new(plan, &registry, mock.clone(), config(4))
        .run()
        .await;

    assert_eq!(report.host("mgs01").unwrap().state, HostState::Succeeded);
    assert_eq!(report.host("oss01").unwrap().state, HostState::Succeeded);

    let oss02 = report.host("oss02").unwrap();
    assert_eq!(oss02.state, HostState::Failed);
    assert_eq!(oss02.failed_step.as_deref(), Some("push config"));
    assert!(oss02
        .last_error
        .as_deref()
        .unwrap()
        .contains("No space left on device"));

    let push = report.step("oss02", "push config").unwrap();
    assert_eq!(push.attempts, 3);
    assert_eq!(
        report.step("oss02", "service started").unwrap().state,
        StepState::Skipped
    );

    assert_eq!(report.outcome(), RunOutcome::Partial);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_failed_verify_skips_cross_host_dependents() {
    let catalog = Catalog::from_toml_str(DEFAULT_CATALOG_TOML).unwrap();
    let registry = registry(&catalog, DEFAULT_HOSTS_TOML);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    let mock = Arc::new(MockRemoteExecutor::new().with_rule(
        MockRule::new(
            "lctl dl | grep -q mdt",
            MockOutcome::Exit {
                code: 1,
                stderr: String::new(),
            },
        )
        .host("mds01"),
    ));

    let report = Orchestrator::new(plan, &registry, mock.clone(), config(4))
        .run()
        .await;

    let verify = report.step("mds01", "verify service").unwrap();
    assert_eq!(verify.state, StepState::Failed);
    assert_eq!(verify.attempts, 1);

    let mount = report.step("client01", "mount filesystem").unwrap();
    assert_eq!(mount.state, StepState::Skipped);
    assert!(mount
        .skipped_because
        .as_deref()
        .unwrap()
        .contains("mds01/metadata/verify service"));
    assert_eq!(mock.count_matching("client01", "mount -t lustre"), 0);

    // The client's own install still ran
    assert_eq!(
        report.step("client01", "install packages").unwrap().state,
        StepState::Succeeded
    );
    assert_eq!(report.host("client01").unwrap().state, HostState::Skipped);
    assert_eq!(report.host("oss01").unwrap().state, HostState::Succeeded);
}

#[tokio::test]
async fn test_transient_connect_failure_is_retried() {
    let catalog = Catalog::example().unwrap();
    let registry = registry(&catalog, THREE_HOSTS);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    // Commands are not retryable on exec errors, but connection failures are
    let mock = Arc::new(
        MockRemoteExecutor::new()
            .with_rule(
                MockRule::new(
                    "rpm -q lustre",
                    MockOutcome::Exit {
                        code: 1,
                        stderr: "package lustre is not installed".to_string(),
                    },
                )
                .host("oss01"),
            )
            .with_rule(
                MockRule::new("yum install", MockOutcome::ConnectFailure)
                    .host("oss01")
                    .times(1),
            ),
    );

    let report = Orchestrator::new(plan, &registry, mock.clone(), config(4))
        .run()
        .await;

    let install = report.step("oss01", "install packages").unwrap();
    assert_eq!(install.state, StepState::Succeeded);
    assert_eq!(install.attempts, 2);
    assert!(!install.already_satisfied);
    assert_eq!(install.error, None);
    assert_eq!(mock.count_matching("oss01", "yum install"), 2);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_skips_unstarted_steps() {
    let catalog = Catalog::from_toml_str(
        r#"
[[roles.client.steps]]
name = "mount filesystem"
kind = "command"
command = "mount -t lustre mgs01@tcp:/pfs /mnt/pfs"
"#,
    )
    .unwrap();
    let hosts: String = (1..=5)
        .map(|i| format!("[[hosts]]\naddress = \"client0{}\"\nroles = [\"client\"]\n\n", i))
        .collect();
    let registry = registry(&catalog, &hosts);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    let mock = Arc::new(MockRemoteExecutor::new().with_delay(Duration::from_millis(300)));
    let orchestrator = Orchestrator::new(plan, &registry, mock.clone(), config(2));
    let cancel = orchestrator.cancel_handle();

    let run = tokio::spawn(orchestrator.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let report = run.await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.outcome(), RunOutcome::Cancelled);
    assert_eq!(report.count_steps(StepState::Succeeded), 2);
    assert_eq!(report.count_steps(StepState::Skipped), 3);
    assert_eq!(report.count_steps(StepState::InProgress), 0);
    assert_eq!(report.count_steps(StepState::Pending), 0);
    assert_eq!(mock.calls().len(), 2);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_agents_start_on_installed_hosts() {
    let catalog = Catalog::example().unwrap();
    let registry = registry(&catalog, THREE_HOSTS);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    // oss02's agent never reports healthy
    let mock = Arc::new(MockRemoteExecutor::new().with_rule(
        MockRule::new(
            "pgrep",
            MockOutcome::Exit {
                code: 1,
                stderr: String::new(),
            },
        )
        .host("oss02"),
    ));
    let executor: Arc<dyn RemoteExecutor> = mock.clone();

    let agent_config = AgentConfig {
        start_timeout_secs: 5,
        ..AgentConfig::default()
    };
    let agents = Arc::new(AgentManager::new(
        Arc::clone(&executor),
        agent_config,
        "http://metrics:8086/write?db=pfsmon",
    ));

    let report = Orchestrator::new(plan, &registry, executor, config(4))
        .with_agent_manager(agents.clone())
        .run()
        .await;

    // Every host installed, but monitoring on oss02 is degraded
    assert!(report.hosts.iter().all(|h| h.state == HostState::Succeeded));
    assert_eq!(
        report.host("mgs01").unwrap().agent_health,
        Some(AgentHealth::Healthy)
    );
    let oss02 = report.host("oss02").unwrap();
    assert!(oss02.monitoring_degraded);
    assert_eq!(oss02.agent_health, Some(AgentHealth::Unhealthy));
    assert_eq!(report.outcome(), RunOutcome::Partial);
    assert_eq!(report.exit_code(), 2);

    assert_eq!(mock.count_matching("mgs01", "pfsmon agent run"), 2);
    assert!(agents.agent("oss01").await.unwrap().is_healthy());
}

#[tokio::test]
async fn test_hosts_without_steps_still_get_agents() {
    let catalog = Catalog::from_toml_str(
        r#"
[roles.monitor]
steps = []
"#,
    )
    .unwrap();
    let registry = registry(
        &catalog,
        r#"
[[hosts]]
address = "mon01"
roles = ["monitor"]
"#,
    );
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();
    assert!(plan.is_empty());

    let mock = Arc::new(MockRemoteExecutor::new());
    let executor: Arc<dyn RemoteExecutor> = mock.clone();
    let agents = Arc::new(AgentManager::new(
        Arc::clone(&executor),
        AgentConfig::default(),
        "http://metrics:8086/write",
    ));

    let report = Orchestrator::new(plan, &registry, executor, config(1))
        .with_agent_manager(agents)
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.host("mon01").unwrap().agent_health,
        Some(AgentHealth::Healthy)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_agent_starts() {
    let catalog = Catalog::example().unwrap();
    let registry = registry(&catalog, THREE_HOSTS);
    let plan = PlanBuilder::build(&registry, &catalog).unwrap();

    // No agent ever reports healthy
    let mock = Arc::new(MockRemoteExecutor::new().with_rule(MockRule::new(
        "pgrep",
        MockOutcome::Exit {
            code: 1,
            stderr: String::new(),
        },
    )));
    let executor: Arc<dyn RemoteExecutor> = mock.clone();
    let agents = Arc::new(AgentManager::new(
        Arc::clone(&executor),
        AgentConfig {
            start_timeout_secs: 300,
            ..AgentConfig::default()
        },
        "http://metrics:8086/write",
    ));

    let orchestrator = Orchestrator::new(plan, &registry, executor, config(4))
        .with_agent_manager(agents);
    let cancel = orchestrator.cancel_handle();
    let started = tokio::time::Instant::now();
    let run = tokio::spawn(orchestrator.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    let report = run.await.unwrap();

    // Returned at cancellation, not at the agents' start timeout
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.cancelled);
    assert!(report.hosts.iter().all(|h| h.state == HostState::Succeeded));
    for host in &report.hosts {
        assert_eq!(host.agent_health, Some(AgentHealth::Unknown), "{}", host.address);
        assert!(!host.monitoring_degraded);
    }
    assert_eq!(report.outcome(), RunOutcome::Cancelled);
}
