//! Rule engine: maps cluster events to remediation playbooks.
//!
//! Rules are evaluated in registration order and every match is returned,
//! so one event may fan out to several playbooks.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::event::{ClusterEvent, EventKind, Severity};

/// A condition → playbook binding.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Exact match on the event kind
    pub kind: EventKind,
    /// Optional namespace filter; `None` behaves as `.*`. Cluster-scoped
    /// events (empty namespace) match iff the regex matches the empty
    /// string.
    pub namespace_filter: Option<Regex>,
    /// Minimum severity; `None` accepts everything
    pub severity_floor: Option<Severity>,
    pub playbook_id: String,
    pub enabled: bool,
    /// Extra parameters merged into the playbook context (reserved)
    pub params: BTreeMap<String, String>,
}

impl Rule {
    /// A rule matching `kind` with a Critical severity floor.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EventKind,
        playbook_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            namespace_filter: None,
            severity_floor: Some(Severity::Critical),
            playbook_id: playbook_id.into(),
            enabled: true,
            params: BTreeMap::new(),
        }
    }

    /// Restrict the rule to namespaces matching `pattern`.
    #[must_use]
    pub fn with_namespace_filter(mut self, pattern: Regex) -> Self {
        self.namespace_filter = Some(pattern);
        self
    }

    /// Set the minimum severity (`None` accepts all).
    #[must_use]
    pub fn with_severity_floor(mut self, floor: Option<Severity>) -> Self {
        self.severity_floor = floor;
        self
    }

    /// Test whether an event satisfies this rule's condition.
    #[must_use]
    pub fn matches(&self, event: &ClusterEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if event.kind != self.kind {
            return false;
        }
        if let Some(filter) = &self.namespace_filter {
            if !filter.is_match(&event.namespace) {
                return false;
            }
        }
        if let Some(floor) = self.severity_floor {
            if event.severity < floor {
                return false;
            }
        }
        true
    }
}

/// One matching rule for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub playbook_id: String,
}

/// Evaluates events against registered rules in registration order.
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
}

impl RuleEngine {
    /// An engine with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// An engine pre-loaded with the built-in kind-to-playbook bindings.
    #[must_use]
    pub fn with_builtins() -> Self {
        let engine = Self::new();
        engine.add_rule(Rule::new(
            "rule-001",
            "CrashLoop Auto-Restart",
            EventKind::CrashLoop,
            "crash_loop_remediation",
        ));
        engine.add_rule(Rule::new(
            "rule-002",
            "OOMKill Memory Increase",
            EventKind::OomKilled,
            "oom_kill_remediation",
        ));
        engine.add_rule(Rule::new(
            "rule-003",
            "NotReady Node Evacuation",
            EventKind::NotReadyNode,
            "node_not_ready_remediation",
        ));
        engine.add_rule(Rule::new(
            "rule-004",
            "Replication Failure Rollback",
            EventKind::ReplicationFailure,
            "deployment_rollback",
        ));
        engine.add_rule(Rule::new(
            "rule-005",
            "Scale Up On Load Alert",
            EventKind::AlertmanagerFiring,
            "scale_up_on_load",
        ));
        engine
    }

    /// Register a rule at the end of the evaluation order.
    pub fn add_rule(&self, rule: Rule) {
        info!(rule_id = %rule.id, name = %rule.name, playbook = %rule.playbook_id, "Rule registered");
        self.rules.write().expect("rules lock poisoned").push(rule);
    }

    /// Remove a rule by id; returns whether it existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().expect("rules lock poisoned");
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    /// Snapshot of the registered rules, in evaluation order.
    #[must_use]
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().expect("rules lock poisoned").clone()
    }

    /// Every matching `(rule_id, playbook_id)` for the event, in
    /// registration order.
    #[must_use]
    pub fn match_event(&self, event: &ClusterEvent) -> Vec<RuleMatch> {
        let rules = self.rules.read().expect("rules lock poisoned");
        let mut matches = Vec::new();
        for rule in rules.iter() {
            if rule.matches(event) {
                debug!(
                    rule_id = %rule.id,
                    event_kind = %event.kind,
                    resource = %event.resource_name,
                    "Rule matched"
                );
                matches.push(RuleMatch {
                    rule_id: rule.id.clone(),
                    playbook_id: rule.playbook_id.clone(),
                });
            }
        }
        matches
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_builtins()
    }
}
