//! Background cluster watch loop.
//!
//! On a steady interval the loop snapshots pods, nodes, and deployments,
//! derives incidents, deduplicates them against a live known-issues set,
//! and dispatches genuinely new events into the rule → executor pipeline.
//! Recovered resources are removed from the set so future incidents
//! re-alert.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{ClusterEvent, EventKind, IssueKey, Severity};
use crate::k8s::{
    pod_issue_kinds, ClusterObserver, DeploymentObservation, NodeObservation, PodObservation,
};
use crate::pipeline::Pipeline;

/// Namespaces excluded from the deployment scan.
const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Mutable per-loop scan state. Single-writer: only the loop task (or a
/// test driving `tick`) touches it.
#[derive(Debug, Default)]
struct ScanState {
    /// One entry per unresolved incident; value is first-seen time.
    known: HashMap<IssueKey, DateTime<Utc>>,
    /// Nodes observed non-Ready exactly once, awaiting confirmation.
    pending_nodes: HashMap<String, DateTime<Utc>>,
}

/// Supervised background observer emitting one event per new incident.
pub struct WatchLoop {
    observer: Arc<dyn ClusterObserver>,
    pipeline: Arc<Pipeline>,
    interval: Duration,
    state: tokio::sync::Mutex<ScanState>,
    /// Read-only diagnostics copy of the known-issues set, refreshed each
    /// cycle.
    snapshot: std::sync::RwLock<HashSet<IssueKey>>,
}

impl WatchLoop {
    /// Create a loop polling `observer` every `interval`.
    #[must_use]
    pub fn new(observer: Arc<dyn ClusterObserver>, pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self {
            observer,
            pipeline,
            interval,
            state: tokio::sync::Mutex::new(ScanState::default()),
            snapshot: std::sync::RwLock::new(HashSet::new()),
        }
    }

    /// Immutable snapshot of the known-issues set, for diagnostics.
    #[must_use]
    pub fn known_issues(&self) -> HashSet<IssueKey> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    /// Spawn the supervised loop task. It exits when `cancel` turns true
    /// (or its sender drops); no overlapping cycles run.
    pub fn spawn(self: &Arc<Self>, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        let watchloop = Arc::clone(self);
        info!(interval_secs = watchloop.interval.as_secs(), "Watch loop started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchloop.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        watchloop.tick().await;
                    }
                }
            }
            info!("Watch loop stopped");
        })
    }

    /// Run one observation cycle: scan, dedup, recover, dispatch.
    ///
    /// Each sub-scan gets a budget of half the poll interval; a failed or
    /// timed-out sub-scan is skipped without touching the known-issues
    /// set, so no false recoveries are inferred.
    pub async fn tick(&self) {
        let mut state = self.state.lock().await;
        let budget = self.interval / 2;
        let mut events = Vec::new();

        match tokio::time::timeout(budget, self.observer.pods()).await {
            Ok(Ok(pods)) => scan_pods(&mut state, &pods, &mut events),
            Ok(Err(e)) => warn!(error = %e, "Pod scan failed; skipping"),
            Err(_) => warn!("Pod scan timed out; skipping"),
        }

        match tokio::time::timeout(budget, self.observer.nodes()).await {
            Ok(Ok(nodes)) => scan_nodes(&mut state, &nodes, self.interval, &mut events),
            Ok(Err(e)) => warn!(error = %e, "Node scan failed; skipping"),
            Err(_) => warn!("Node scan timed out; skipping"),
        }

        match tokio::time::timeout(budget, self.observer.deployments()).await {
            Ok(Ok(deployments)) => scan_deployments(&mut state, &deployments, &mut events),
            Ok(Err(e)) => warn!(error = %e, "Deployment scan failed; skipping"),
            Err(_) => warn!("Deployment scan timed out; skipping"),
        }

        *self.snapshot.write().expect("snapshot lock poisoned") =
            state.known.keys().cloned().collect();
        drop(state);

        if !events.is_empty() {
            info!(detected = events.len(), "Watch cycle detected new incidents");
        }
        for event in events {
            // A failing dispatch path must not stop the loop; dispatch
            // logs its own errors.
            self.pipeline.dispatch(event).await;
        }
    }
}

fn scan_pods(state: &mut ScanState, pods: &[PodObservation], events: &mut Vec<ClusterEvent>) {
    let now = Utc::now();
    let mut present: HashSet<IssueKey> = HashSet::new();

    for pod in pods {
        for kind in pod_issue_kinds(pod) {
            let key = IssueKey {
                resource_kind: "Pod".to_string(),
                namespace: pod.namespace.clone(),
                resource_name: pod.name.clone(),
                kind,
            };
            present.insert(key.clone());
            if state.known.contains_key(&key) {
                continue;
            }
            state.known.insert(key, now);
            let message = match kind {
                EventKind::OomKilled => format!(
                    "Pod {} in {} was OOMKilled (restarts: {})",
                    pod.name,
                    pod.namespace,
                    pod.restart_count()
                ),
                _ => format!(
                    "Pod {} in {} is CrashLoopBackOff (restarts: {})",
                    pod.name,
                    pod.namespace,
                    pod.restart_count()
                ),
            };
            events.push(ClusterEvent::new(
                kind,
                Severity::Critical,
                "Pod",
                pod.namespace.clone(),
                pod.name.clone(),
                message,
            ));
        }
    }

    state.known.retain(|key, _| {
        if key.resource_kind != "Pod" {
            return true;
        }
        let keep = present.contains(key);
        if !keep {
            info!(issue = %key, "Pod issue recovered");
        }
        keep
    });
}

fn scan_nodes(
    state: &mut ScanState,
    nodes: &[NodeObservation],
    interval: Duration,
    events: &mut Vec<ClusterEvent>,
) {
    let now = Utc::now();
    let one_cycle =
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(30));
    let mut present: HashSet<IssueKey> = HashSet::new();

    for node in nodes {
        if node.ready {
            state.pending_nodes.remove(&node.name);
            continue;
        }
        // Flap suppression: require two consecutive non-Ready cycles or a
        // transition older than one interval.
        let seen_last_cycle = state.pending_nodes.contains_key(&node.name);
        let old_transition = node.ready_transition.is_some_and(|t| now - t > one_cycle);
        if !(seen_last_cycle || old_transition) {
            debug!(node = %node.name, "Node non-Ready once; awaiting confirmation");
            state.pending_nodes.insert(node.name.clone(), now);
            continue;
        }
        state.pending_nodes.entry(node.name.clone()).or_insert(now);

        let key = IssueKey {
            resource_kind: "Node".to_string(),
            namespace: String::new(),
            resource_name: node.name.clone(),
            kind: EventKind::NotReadyNode,
        };
        present.insert(key.clone());
        if state.known.contains_key(&key) {
            continue;
        }
        state.known.insert(key, now);
        events.push(ClusterEvent::new(
            EventKind::NotReadyNode,
            Severity::Critical,
            "Node",
            "",
            node.name.clone(),
            format!("Node {} is NotReady", node.name),
        ));
    }

    state
        .pending_nodes
        .retain(|name, _| nodes.iter().any(|n| &n.name == name && !n.ready));

    state.known.retain(|key, _| {
        if key.kind != EventKind::NotReadyNode {
            return true;
        }
        let keep = present.contains(key);
        if !keep {
            info!(node = %key.resource_name, "Node recovered");
        }
        keep
    });
}

fn scan_deployments(
    state: &mut ScanState,
    deployments: &[DeploymentObservation],
    events: &mut Vec<ClusterEvent>,
) {
    let now = Utc::now();
    let mut present: HashSet<IssueKey> = HashSet::new();

    for deployment in deployments {
        if SYSTEM_NAMESPACES.contains(&deployment.namespace.as_str()) {
            continue;
        }
        if !deployment.is_failed() {
            continue;
        }
        let key = IssueKey {
            resource_kind: "Deployment".to_string(),
            namespace: deployment.namespace.clone(),
            resource_name: deployment.name.clone(),
            kind: EventKind::ReplicationFailure,
        };
        present.insert(key.clone());
        if state.known.contains_key(&key) {
            continue;
        }
        state.known.insert(key, now);
        events.push(ClusterEvent::new(
            EventKind::ReplicationFailure,
            Severity::Critical,
            "Deployment",
            deployment.namespace.clone(),
            deployment.name.clone(),
            format!(
                "Deployment {} in {} has 0/{} replicas available",
                deployment.name, deployment.namespace, deployment.replicas
            ),
        ));
    }

    state.known.retain(|key, _| {
        if key.kind != EventKind::ReplicationFailure {
            return true;
        }
        let keep = present.contains(key);
        if !keep {
            info!(
                deployment = %key.resource_name,
                namespace = %key.namespace,
                "Deployment recovered"
            );
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ContainerObservation;

    fn crashing_pod(name: &str) -> PodObservation {
        PodObservation {
            name: name.to_string(),
            namespace: "prod".to_string(),
            phase: "Running".to_string(),
            containers: vec![ContainerObservation {
                name: "app".to_string(),
                ready: false,
                restart_count: 4,
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
                restart_count: 4,
                waiting_reason: None,
                last_terminated_reason: None,
            }],
        }
    }

    #[test]
    fn test_pod_fires_once_across_cycles() {
        let mut state = ScanState::default();
        let pods = vec![crashing_pod("nginx-abc")];

        let mut events = Vec::new();
        scan_pods(&mut state, &pods, &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::CrashLoop);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].resource_name, "nginx-abc");

        for _ in 0..5 {
            let mut events = Vec::new();
            scan_pods(&mut state, &pods, &mut events);
            assert!(events.is_empty(), "suppressed while unresolved");
        }
    }

    #[test]
    fn test_pod_rearms_after_recovery() {
        let mut state = ScanState::default();

        let mut events = Vec::new();
        scan_pods(&mut state, &[crashing_pod("nginx-abc")], &mut events);
        assert_eq!(events.len(), 1);

        // Healthy observation removes the known-issue key.
        let mut events = Vec::new();
        scan_pods(&mut state, &[healthy_pod("nginx-abc")], &mut events);
        assert!(events.is_empty());
        assert!(state.known.is_empty());

        // A fresh incident fires again.
        let mut events = Vec::new();
        scan_pods(&mut state, &[crashing_pod("nginx-abc")], &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_pod_disappearance_counts_as_recovery() {
        let mut state = ScanState::default();
        let mut events = Vec::new();
        scan_pods(&mut state, &[crashing_pod("nginx-abc")], &mut events);
        assert_eq!(state.known.len(), 1);

        let mut events = Vec::new();
        scan_pods(&mut state, &[], &mut events);
        assert!(state.known.is_empty());
    }

    #[test]
    fn test_node_flap_is_suppressed_for_one_cycle() {
        let mut state = ScanState::default();
        let interval = Duration::from_secs(30);
        let fresh = NodeObservation {
            name: "node-1".to_string(),
            ready: false,
            ready_transition: Some(Utc::now()),
        };

        let mut events = Vec::new();
        scan_nodes(&mut state, &[fresh.clone()], interval, &mut events);
        assert!(events.is_empty(), "first sighting is pending");

        let mut events = Vec::new();
        scan_nodes(&mut state, &[fresh], interval, &mut events);
        assert_eq!(events.len(), 1, "second consecutive sighting fires");
        assert_eq!(events[0].kind, EventKind::NotReadyNode);
        assert_eq!(events[0].namespace, "");
    }

    #[test]
    fn test_node_with_old_transition_fires_immediately() {
        let mut state = ScanState::default();
        let node = NodeObservation {
            name: "node-1".to_string(),
            ready: false,
            ready_transition: Some(Utc::now() - chrono::Duration::minutes(10)),
        };
        let mut events = Vec::new();
        scan_nodes(&mut state, &[node], Duration::from_secs(30), &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_node_recovery_rearms() {
        let mut state = ScanState::default();
        let interval = Duration::from_secs(30);
        let down = NodeObservation {
            name: "node-1".to_string(),
            ready: false,
            ready_transition: Some(Utc::now() - chrono::Duration::minutes(10)),
        };
        let up = NodeObservation {
            name: "node-1".to_string(),
            ready: true,
            ready_transition: Some(Utc::now()),
        };

        let mut events = Vec::new();
        scan_nodes(&mut state, &[down.clone()], interval, &mut events);
        assert_eq!(events.len(), 1);

        let mut events = Vec::new();
        scan_nodes(&mut state, &[up], interval, &mut events);
        assert!(state.known.is_empty());

        let mut events = Vec::new();
        scan_nodes(&mut state, &[down.clone()], interval, &mut events);
        let mut events2 = Vec::new();
        scan_nodes(&mut state, &[down], interval, &mut events2);
        assert_eq!(events.len() + events2.len(), 1, "re-fires once after recovery");
    }

    #[test]
    fn test_deployment_failure_and_recovery() {
        let mut state = ScanState::default();
        let failed = DeploymentObservation {
            name: "api".to_string(),
            namespace: "prod".to_string(),
            replicas: 3,
            available_replicas: 0,
        };

        let mut events = Vec::new();
        scan_deployments(&mut state, &[failed.clone()], &mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ReplicationFailure);
        assert!(events[0].message.contains("0/3 replicas"));

        let mut events = Vec::new();
        scan_deployments(&mut state, &[failed.clone()], &mut events);
        assert!(events.is_empty());

        let recovered = DeploymentObservation {
            available_replicas: 2,
            ..failed.clone()
        };
        let mut events = Vec::new();
        scan_deployments(&mut state, &[recovered], &mut events);
        assert!(state.known.is_empty());

        let mut events = Vec::new();
        scan_deployments(&mut state, &[failed], &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_system_namespaces_are_skipped() {
        let mut state = ScanState::default();
        let failed = DeploymentObservation {
            name: "coredns".to_string(),
            namespace: "kube-system".to_string(),
            replicas: 2,
            available_replicas: 0,
        };
        let mut events = Vec::new();
        scan_deployments(&mut state, &[failed], &mut events);
        assert!(events.is_empty());
        assert!(state.known.is_empty());
    }

    #[test]
    fn test_scans_do_not_disturb_other_kinds() {
        let mut state = ScanState::default();
        let mut events = Vec::new();
        scan_pods(&mut state, &[crashing_pod("nginx-abc")], &mut events);
        let node = NodeObservation {
            name: "node-1".to_string(),
            ready: false,
            ready_transition: Some(Utc::now() - chrono::Duration::minutes(10)),
        };
        let mut events = Vec::new();
        scan_nodes(&mut state, &[node], Duration::from_secs(30), &mut events);
        assert_eq!(state.known.len(), 2);

        // An empty node scan clears only node keys.
        let mut events = Vec::new();
        scan_nodes(&mut state, &[], Duration::from_secs(30), &mut events);
        assert_eq!(state.known.len(), 1);
        assert!(state.known.keys().all(|k| k.kind == EventKind::CrashLoop));
    }
}
