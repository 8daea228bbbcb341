//! Read-side cluster observation.
//!
//! The watch loop consumes simplified snapshots of pods, nodes, and
//! deployments through the [`ClusterObserver`] trait; [`KubeObserver`]
//! implements it against the Kubernetes API. The anomaly-derivation
//! helpers are pure functions over the snapshots so the detection rules
//! are testable without a cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;

use crate::event::EventKind;

/// One cluster API call failed; the watch loop skips the affected
/// sub-scan for the cycle.
#[derive(Debug, Error)]
#[error("Cluster API error: {0}")]
pub struct ObserveError(pub String);

impl From<kube::Error> for ObserveError {
    fn from(e: kube::Error) -> Self {
        Self(e.to_string())
    }
}

/// Simplified pod snapshot.
#[derive(Debug, Clone, Default)]
pub struct PodObservation {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub containers: Vec<ContainerObservation>,
}

impl PodObservation {
    /// Total restarts across containers, for alert messages.
    #[must_use]
    pub fn restart_count(&self) -> i32 {
        self.containers.iter().map(|c| c.restart_count).sum()
    }
}

/// Simplified container status within a pod.
#[derive(Debug, Clone, Default)]
pub struct ContainerObservation {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
    /// Reason of the current waiting state, if waiting
    pub waiting_reason: Option<String>,
    /// Reason of the last terminated state, if any
    pub last_terminated_reason: Option<String>,
}

/// Simplified node snapshot.
#[derive(Debug, Clone, Default)]
pub struct NodeObservation {
    pub name: String,
    /// Whether the `Ready` condition is `True`
    pub ready: bool,
    /// `lastTransitionTime` of the `Ready` condition
    pub ready_transition: Option<DateTime<Utc>>,
}

/// Simplified deployment snapshot.
#[derive(Debug, Clone, Default)]
pub struct DeploymentObservation {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub available_replicas: i32,
}

impl DeploymentObservation {
    /// Desired replicas but none available.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.replicas > 0 && self.available_replicas == 0
    }
}

/// Incident kinds derivable from one pod snapshot.
#[must_use]
pub fn pod_issue_kinds(pod: &PodObservation) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    let crash = pod.containers.iter().any(|c| {
        matches!(
            c.waiting_reason.as_deref(),
            Some("CrashLoopBackOff" | "Error")
        )
    });
    if crash {
        kinds.push(EventKind::CrashLoop);
    }
    let oom = pod
        .containers
        .iter()
        .any(|c| c.last_terminated_reason.as_deref() == Some("OOMKilled"));
    if oom {
        kinds.push(EventKind::OomKilled);
    }
    kinds
}

/// Read operations the watch loop needs each cycle.
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    /// Snapshot pods cluster-wide.
    async fn pods(&self) -> Result<Vec<PodObservation>, ObserveError>;

    /// Snapshot nodes.
    async fn nodes(&self) -> Result<Vec<NodeObservation>, ObserveError>;

    /// Snapshot deployments cluster-wide.
    async fn deployments(&self) -> Result<Vec<DeploymentObservation>, ObserveError>;
}

/// [`ClusterObserver`] backed by the Kubernetes API.
///
/// Works with in-cluster config or a kubeconfig file, whichever
/// `kube::Client::try_default` infers.
pub struct KubeObserver {
    client: Client,
}

impl KubeObserver {
    /// Connect using the default client inference.
    ///
    /// # Errors
    ///
    /// Returns an error when neither in-cluster config nor a kubeconfig
    /// is available.
    pub async fn try_default() -> Result<Self, ObserveError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ObserveError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterObserver for KubeObserver {
    async fn pods(&self) -> Result<Vec<PodObservation>, ObserveError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(pod_observation).collect())
    }

    async fn nodes(&self) -> Result<Vec<NodeObservation>, ObserveError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(node_observation).collect())
    }

    async fn deployments(&self) -> Result<Vec<DeploymentObservation>, ObserveError> {
        let api: Api<Deployment> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(deployment_observation).collect())
    }
}

fn pod_observation(pod: &Pod) -> PodObservation {
    let status = pod.status.as_ref();
    let containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| ContainerObservation {
                    name: cs.name.clone(),
                    ready: cs.ready,
                    restart_count: cs.restart_count,
                    waiting_reason: cs
                        .state
                        .as_ref()
                        .and_then(|st| st.waiting.as_ref())
                        .and_then(|w| w.reason.clone()),
                    last_terminated_reason: cs
                        .last_state
                        .as_ref()
                        .and_then(|st| st.terminated.as_ref())
                        .and_then(|t| t.reason.clone()),
                })
                .collect()
        })
        .unwrap_or_default();

    PodObservation {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        containers,
    }
}

fn node_observation(node: &Node) -> NodeObservation {
    let ready_condition = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"));

    NodeObservation {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready: ready_condition.is_some_and(|c| c.status == "True"),
        ready_transition: ready_condition
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0),
    }
}

fn deployment_observation(deployment: &Deployment) -> DeploymentObservation {
    DeploymentObservation {
        name: deployment.metadata.name.clone().unwrap_or_default(),
        namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
        replicas: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        available_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crashing_pod() -> PodObservation {
        PodObservation {
            name: "nginx-abc".to_string(),
            namespace: "prod".to_string(),
            phase: "Running".to_string(),
            containers: vec![ContainerObservation {
                name: "nginx".to_string(),
                ready: false,
                restart_count: 7,
                waiting_reason: Some("CrashLoopBackOff".to_string()),
                last_terminated_reason: Some("Error".to_string()),
            }],
        }
    }

    #[test]
    fn test_crash_loop_detection() {
        assert_eq!(pod_issue_kinds(&crashing_pod()), vec![EventKind::CrashLoop]);
    }

    #[test]
    fn test_error_waiting_reason_counts_as_crash_loop() {
        let mut pod = crashing_pod();
        pod.containers[0].waiting_reason = Some("Error".to_string());
        assert_eq!(pod_issue_kinds(&pod), vec![EventKind::CrashLoop]);
    }

    #[test]
    fn test_oom_detection() {
        let mut pod = crashing_pod();
        pod.containers[0].waiting_reason = None;
        pod.containers[0].last_terminated_reason = Some("OOMKilled".to_string());
        assert_eq!(pod_issue_kinds(&pod), vec![EventKind::OomKilled]);
    }

    #[test]
    fn test_crash_loop_and_oom_both_fire() {
        let mut pod = crashing_pod();
        pod.containers[0].last_terminated_reason = Some("OOMKilled".to_string());
        assert_eq!(
            pod_issue_kinds(&pod),
            vec![EventKind::CrashLoop, EventKind::OomKilled]
        );
    }

    #[test]
    fn test_healthy_pod_has_no_issues() {
        let pod = PodObservation {
            name: "ok".to_string(),
            namespace: "prod".to_string(),
            phase: "Running".to_string(),
            containers: vec![ContainerObservation {
                name: "app".to_string(),
                ready: true,
                restart_count: 0,
                waiting_reason: None,
                last_terminated_reason: None,
            }],
        };
        assert!(pod_issue_kinds(&pod).is_empty());
    }

    #[test]
    fn test_completed_init_reason_is_not_a_crash() {
        let mut pod = crashing_pod();
        pod.containers[0].waiting_reason = Some("PodInitializing".to_string());
        pod.containers[0].last_terminated_reason = Some("Completed".to_string());
        assert!(pod_issue_kinds(&pod).is_empty());
    }

    #[test]
    fn test_deployment_failed_predicate() {
        let failed = DeploymentObservation {
            name: "api".to_string(),
            namespace: "prod".to_string(),
            replicas: 3,
            available_replicas: 0,
        };
        assert!(failed.is_failed());

        let scaled_to_zero = DeploymentObservation {
            replicas: 0,
            ..failed.clone()
        };
        assert!(!scaled_to_zero.is_failed());

        let degraded = DeploymentObservation {
            available_replicas: 1,
            ..failed
        };
        assert!(!degraded.is_failed());
    }
}
