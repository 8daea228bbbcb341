//! Watch loop scenarios through the full dispatch pipeline: single fire
//! per incident, re-arm after recovery, scan-error isolation, and the
//! crash-loop auto-path into the executor.

mod common;

use async_trait::async_trait;
use common::{harness, wait_for_message, CollectingSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_engine::k8s::{
    ClusterObserver, ContainerObservation, DeploymentObservation, NodeObservation, ObserveError,
    PodObservation,
};
use vigil_engine::{EventKind, Pipeline, RuleEngine, WatchLoop};

/// Observer whose snapshots the test mutates between ticks.
#[derive(Default)]
struct ScriptedObserver {
    state: Mutex<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    pods: Vec<PodObservation>,
    nodes: Vec<NodeObservation>,
    deployments: Vec<DeploymentObservation>,
    pods_fail: bool,
}

impl ScriptedObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_pods(&self, pods: Vec<PodObservation>) {
        self.state.lock().unwrap().pods = pods;
    }

    fn set_pods_fail(&self, fail: bool) {
        self.state.lock().unwrap().pods_fail = fail;
    }

    fn set_deployments(&self, deployments: Vec<DeploymentObservation>) {
        self.state.lock().unwrap().deployments = deployments;
    }
}

#[async_trait]
impl ClusterObserver for ScriptedObserver {
    async fn pods(&self) -> Result<Vec<PodObservation>, ObserveError> {
        let state = self.state.lock().unwrap();
        if state.pods_fail {
            return Err(ObserveError("connection refused".to_string()));
        }
        Ok(state.pods.clone())
    }

    async fn nodes(&self) -> Result<Vec<NodeObservation>, ObserveError> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn deployments(&self) -> Result<Vec<DeploymentObservation>, ObserveError> {
        Ok(self.state.lock().unwrap().deployments.clone())
    }
}

fn crashing_pod(name: &str) -> PodObservation {
    PodObservation {
        name: name.to_string(),
        namespace: "prod".to_string(),
        phase: "Running".to_string(),
        containers: vec![ContainerObservation {
            name: "app".to_string(),
            ready: false,
            restart_count: 7,
            waiting_reason: Some("CrashLoopBackOff".to_string()),
            last_terminated_reason: None,
        }],
    }
}

fn healthy_pod(name: &str) -> PodObservation {
    PodObservation {
        name: name.to_string(),
        namespace: "prod".to_string(),
        phase: "Running".to_string(),
        containers: vec![ContainerObservation {
            name: "app".to_string(),
            ready: true,
            restart_count: 7,
            waiting_reason: None,
            last_terminated_reason: None,
        }],
    }
}

fn alert_count(sender: &CollectingSender) -> usize {
    sender.texts().iter().filter(|t| t.contains("🚨")).count()
}

/// Watch loop wired to the executor harness; auto-remediation toggleable.
fn watchloop_harness(
    auto_remediation: bool,
) -> (Arc<WatchLoop>, Arc<ScriptedObserver>, common::Harness) {
    let h = harness(Duration::from_secs(900));
    let observer = ScriptedObserver::new();
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(RuleEngine::with_builtins()),
        h.executor.clone(),
        Arc::clone(&h.router),
        h.target.clone(),
        auto_remediation,
    ));
    let watchloop = Arc::new(WatchLoop::new(
        observer.clone(),
        pipeline,
        Duration::from_secs(30),
    ));
    (watchloop, observer, h)
}

#[tokio::test]
async fn incident_fires_exactly_once_while_unresolved() {
    let (watchloop, observer, h) = watchloop_harness(false);
    observer.set_pods(vec![crashing_pod("nginx-abc")]);

    for _ in 0..4 {
        watchloop.tick().await;
    }

    assert_eq!(alert_count(&h.sender), 1);
    assert_eq!(watchloop.known_issues().len(), 1);
    let key = watchloop.known_issues().into_iter().next().unwrap();
    assert_eq!(key.kind, EventKind::CrashLoop);
    assert_eq!(key.resource_name, "nginx-abc");
}

#[tokio::test]
async fn recovery_rearms_future_alerts() {
    let (watchloop, observer, h) = watchloop_harness(false);

    observer.set_pods(vec![crashing_pod("nginx-abc")]);
    watchloop.tick().await;
    assert_eq!(alert_count(&h.sender), 1);

    // Healthy observation removes the key without alerting.
    observer.set_pods(vec![healthy_pod("nginx-abc")]);
    watchloop.tick().await;
    assert_eq!(alert_count(&h.sender), 1);
    assert!(watchloop.known_issues().is_empty());

    // The same resource failing again is a fresh incident.
    observer.set_pods(vec![crashing_pod("nginx-abc")]);
    watchloop.tick().await;
    assert_eq!(alert_count(&h.sender), 2);
}

#[tokio::test]
async fn failed_scan_infers_no_recovery() {
    let (watchloop, observer, h) = watchloop_harness(false);

    observer.set_pods(vec![crashing_pod("nginx-abc")]);
    watchloop.tick().await;
    assert_eq!(alert_count(&h.sender), 1);

    // The pod scan fails for a cycle; the known-issues set is untouched.
    observer.set_pods_fail(true);
    watchloop.tick().await;
    assert_eq!(watchloop.known_issues().len(), 1);

    // When the scan recovers and the pod is still broken, no duplicate
    // alert fires.
    observer.set_pods_fail(false);
    watchloop.tick().await;
    assert_eq!(alert_count(&h.sender), 1);
}

#[tokio::test]
async fn deployment_failure_flows_through_pipeline() {
    let (watchloop, observer, h) = watchloop_harness(false);
    observer.set_deployments(vec![DeploymentObservation {
        name: "api".to_string(),
        namespace: "prod".to_string(),
        replicas: 3,
        available_replicas: 0,
    }]);

    watchloop.tick().await;

    assert_eq!(alert_count(&h.sender), 1);
    let alert = h
        .sender
        .texts()
        .into_iter()
        .find(|t| t.contains("🚨"))
        .unwrap();
    assert!(alert.contains("replication_failure"));
    assert!(alert.contains("deployment_rollback"));
    assert!(alert.contains("Auto-remediation is disabled"));
}

#[tokio::test]
async fn auto_remediation_launches_run_to_approval_gate() {
    let (watchloop, observer, h) = watchloop_harness(true);
    observer.set_pods(vec![crashing_pod("nginx-abc")]);

    watchloop.tick().await;

    // The crash-loop run proceeds through its LOW steps and parks at the
    // MEDIUM restart step's approval prompt.
    wait_for_message(&h.sender, |t| t.contains("Reply with `approve ")).await;
    assert_eq!(h.dispatcher.calls_for("k8s_describe_resource").len(), 1);
    assert!(h.dispatcher.calls_for("k8s_restart_pod").is_empty());

    // Approving lets the run finish end-to-end.
    let short_id = h.sender.latest_short_id().unwrap();
    h.approvals
        .handle_reply(&format!("approve {short_id}"), "user-7")
        .await
        .unwrap();
    wait_for_message(&h.sender, |t| t.contains("completed")).await;

    let restart = h.dispatcher.calls_for("k8s_restart_pod");
    assert_eq!(restart.len(), 1);
    assert_eq!(restart[0]["pod_name"], "nginx-abc");
    assert_eq!(restart[0]["namespace"], "prod");
}

#[tokio::test]
async fn watchloop_task_stops_on_cancel() {
    let (watchloop, observer, _h) = watchloop_harness(false);
    observer.set_pods(vec![]);

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let handle = watchloop.spawn(cancel_rx);

    // Let the first tick run, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop should stop promptly")
        .unwrap();
}
