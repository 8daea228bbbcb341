//! Cluster anomaly events and their deduplication keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotations beyond this count are silently dropped.
pub const MAX_ANNOTATIONS: usize = 16;

/// The finite set of incident categories the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A container stuck in `CrashLoopBackOff` (or repeated `Error`)
    CrashLoop,
    /// A container whose last termination reason was `OOMKilled`
    OomKilled,
    /// A node whose `Ready` condition is not `True`
    NotReadyNode,
    /// A deployment with desired replicas but zero available
    ReplicationFailure,
    /// A firing alert delivered by Alertmanager
    AlertmanagerFiring,
}

impl EventKind {
    /// Stable snake_case name, as used in rules and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CrashLoop => "crash_loop",
            Self::OomKilled => "oom_killed",
            Self::NotReadyNode => "not_ready_node",
            Self::ReplicationFailure => "replication_failure",
            Self::AlertmanagerFiring => "alertmanager_firing",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity, ordered so that `Critical > Warning > Info`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Display name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected cluster anomaly.
///
/// `(kind, resource_kind, namespace, resource_name)` is the event's stable
/// identity; see [`IssueKey`]. Events are transient: consumed by the rule
/// engine and embedded in run records, never stored long-term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub severity: Severity,
    /// Kubernetes kind of the affected resource (`Pod`, `Node`, ...)
    pub resource_kind: String,
    /// Empty for cluster-scoped resources
    pub namespace: String,
    pub resource_name: String,
    /// Human-readable description used in alert messages
    pub message: String,
    /// Free-form context, capped at [`MAX_ANNOTATIONS`] pairs
    pub annotations: BTreeMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

impl ClusterEvent {
    /// Create an event observed now, with no annotations.
    #[must_use]
    pub fn new(
        kind: EventKind,
        severity: Severity,
        resource_kind: impl Into<String>,
        namespace: impl Into<String>,
        resource_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            resource_kind: resource_kind.into(),
            namespace: namespace.into(),
            resource_name: resource_name.into(),
            message: message.into(),
            annotations: BTreeMap::new(),
            observed_at: Utc::now(),
        }
    }

    /// Attach annotations, keeping at most [`MAX_ANNOTATIONS`] pairs.
    #[must_use]
    pub fn with_annotations<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in pairs {
            if self.annotations.len() >= MAX_ANNOTATIONS {
                break;
            }
            self.annotations.insert(k.into(), v.into());
        }
        self
    }

    /// The dedup key identifying this incident on this resource.
    #[must_use]
    pub fn issue_key(&self) -> IssueKey {
        IssueKey {
            resource_kind: self.resource_kind.clone(),
            namespace: self.namespace.clone(),
            resource_name: self.resource_name.clone(),
            kind: self.kind,
        }
    }

    /// Flatten the event into the string map consumed by playbook
    /// parameter templates.
    ///
    /// Annotations appear both as `annotations.<key>` and, when the bare
    /// key does not collide with an event field, as `<key>` itself.
    #[must_use]
    pub fn context(&self) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("kind".to_string(), self.kind.as_str().to_string());
        ctx.insert("severity".to_string(), self.severity.as_str().to_string());
        ctx.insert("resource_kind".to_string(), self.resource_kind.clone());
        ctx.insert("namespace".to_string(), self.namespace.clone());
        ctx.insert("resource_name".to_string(), self.resource_name.clone());
        ctx.insert("message".to_string(), self.message.clone());
        for (k, v) in &self.annotations {
            ctx.insert(format!("annotations.{k}"), v.clone());
            ctx.entry(k.clone()).or_insert_with(|| v.clone());
        }
        ctx
    }
}

/// Dedup key for the watch loop's known-issues set: one entry per
/// unresolved incident kind on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueKey {
    pub resource_kind: String,
    pub namespace: String,
    pub resource_name: String,
    pub kind: EventKind,
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}/{}", self.resource_kind, self.resource_name, self.kind)
        } else {
            write!(
                f,
                "{}/{}/{}/{}",
                self.resource_kind, self.namespace, self.resource_name, self.kind
            )
        }
    }
}
