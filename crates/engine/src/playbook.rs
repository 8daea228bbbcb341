//! Remediation playbooks: ordered step recipes with declared risk.
//!
//! Each step names one MCP tool and a parameter template keyed to the
//! triggering event's context. LOW steps run unattended; MEDIUM and HIGH
//! steps are gated behind a human approval.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

use crate::error::EngineError;

/// Blast-radius classification of one step.
///
/// LOW is read-only or self-healing, MEDIUM is state-mutating but
/// reversible, HIGH is destructive or widely scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Display name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Icon used in chat messages.
    #[must_use]
    pub const fn icon(&self) -> &'static str {
        match self {
            Self::Low => "🟡",
            Self::Medium => "🟠",
            Self::High => "🔴",
        }
    }

    /// Whether the step may run without human confirmation.
    #[must_use]
    pub const fn auto_executes(&self) -> bool {
        matches!(self, Self::Low)
    }
}

/// What the executor does when a step ends not-Success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run (default)
    #[default]
    Abort,
    /// Record the failure and move to the next step
    Continue,
}

/// A single step in a remediation playbook.
#[derive(Debug, Clone)]
pub struct PlaybookStep {
    pub name: String,
    pub description: String,
    pub risk: RiskLevel,
    /// MCP tool invoked by this step
    pub tool_name: String,
    /// Parameter templates; `{dotted.path}` tokens resolve from the event
    /// context
    pub params: BTreeMap<String, String>,
    pub on_failure: FailurePolicy,
}

impl PlaybookStep {
    /// Build a step with the default abort-on-failure policy.
    #[must_use]
    pub fn new(
        name: &str,
        description: &str,
        risk: RiskLevel,
        tool_name: &str,
        params: &[(&str, &str)],
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            risk,
            tool_name: tool_name.to_string(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            on_failure: FailurePolicy::Abort,
        }
    }
}

/// A named, ordered recipe of remediation steps.
#[derive(Debug, Clone)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<PlaybookStep>,
}

impl Playbook {
    /// Whether any step needs a human approval.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        self.steps.iter().any(|s| !s.risk.auto_executes())
    }
}

/// One-line playbook description for listings.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybookSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: usize,
    pub requires_approval: bool,
}

/// A parameter template could not be resolved from the event context.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Missing required parameter '{param}' (no value for {{{token}}})")]
pub struct TemplateError {
    pub param: String,
    pub token: String,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}")
            .expect("token pattern is valid")
    })
}

/// Resolve one template against the context.
///
/// Only `{identifier}` / `{dotted.path}` tokens are substituted; other
/// brace text (JSON patches, for instance) passes through untouched.
/// Absent tokens render as the empty string, and the first missing token
/// is reported so callers can fail the step when the parameter came out
/// required-but-empty.
fn render_template(template: &str, ctx: &BTreeMap<String, String>) -> (String, Option<String>) {
    let mut missing = None;
    let rendered = token_pattern().replace_all(template, |caps: &regex::Captures<'_>| {
        let token = &caps[1];
        match ctx.get(token) {
            Some(value) => value.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(token.to_string());
                }
                String::new()
            }
        }
    });
    (rendered.into_owned(), missing)
}

/// Resolve a step's parameter templates against the event context.
///
/// # Errors
///
/// A parameter whose template was non-empty but rendered fully empty
/// because of an absent token is a missing required parameter.
pub fn render_params(
    templates: &BTreeMap<String, String>,
    ctx: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, TemplateError> {
    let mut resolved = BTreeMap::new();
    for (param, template) in templates {
        let (value, missing) = render_template(template, ctx);
        if let Some(token) = missing {
            if value.is_empty() && !template.is_empty() {
                return Err(TemplateError {
                    param: param.clone(),
                    token,
                });
            }
        }
        resolved.insert(param.clone(), value);
    }
    Ok(resolved)
}

/// In-memory catalog of playbooks, keyed by id.
pub struct PlaybookRegistry {
    playbooks: HashMap<String, Arc<Playbook>>,
}

impl PlaybookRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            playbooks: HashMap::new(),
        }
    }

    /// A registry pre-loaded with the built-in remediation playbooks.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for playbook in builtin_playbooks() {
            registry.register(playbook);
        }
        registry
    }

    /// Register a playbook; a duplicate id replaces the earlier entry.
    pub fn register(&mut self, playbook: Playbook) {
        debug!(playbook_id = %playbook.id, name = %playbook.name, "Playbook registered");
        self.playbooks.insert(playbook.id.clone(), Arc::new(playbook));
    }

    /// Look a playbook up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Playbook>> {
        self.playbooks.get(id).cloned()
    }

    /// One-line summaries, sorted by id.
    #[must_use]
    pub fn summaries(&self) -> Vec<PlaybookSummary> {
        let mut out: Vec<PlaybookSummary> = self
            .playbooks
            .values()
            .map(|p| PlaybookSummary {
                id: p.id.clone(),
                name: p.name.clone(),
                description: p.description.clone(),
                steps: p.steps.len(),
                requires_approval: p.requires_approval(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Verify every step's tool resolves in the current tool registry.
    ///
    /// # Errors
    ///
    /// Returns the first unknown tool; the engine treats this as fatal at
    /// startup.
    pub fn validate_tools<F>(&self, has_tool: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> bool,
    {
        for playbook in self.playbooks.values() {
            for step in &playbook.steps {
                if !has_tool(&step.tool_name) {
                    return Err(EngineError::UnknownTool {
                        playbook: playbook.id.clone(),
                        step: step.name.clone(),
                        tool: step.tool_name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for PlaybookRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtin_playbooks() -> Vec<Playbook> {
    vec![
        Playbook {
            id: "crash_loop_remediation".to_string(),
            name: "CrashLoop Remediation".to_string(),
            description: "Diagnose and remediate a CrashLoopBackOff pod".to_string(),
            steps: vec![
                PlaybookStep::new(
                    "Describe Pod",
                    "Gather pod conditions and events",
                    RiskLevel::Low,
                    "k8s_describe_resource",
                    &[
                        ("resource_type", "pod"),
                        ("resource_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                    ],
                ),
                PlaybookStep::new(
                    "Fetch Recent Logs",
                    "Get last 100 lines of logs for error analysis",
                    RiskLevel::Low,
                    "k8s_analyze_logs",
                    &[
                        ("pod_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                        ("tail_lines", "100"),
                    ],
                ),
                PlaybookStep::new(
                    "Restart Pod",
                    "Delete pod to trigger fresh restart (controller will recreate)",
                    RiskLevel::Medium,
                    "k8s_restart_pod",
                    &[("pod_name", "{resource_name}"), ("namespace", "{namespace}")],
                ),
                PlaybookStep::new(
                    "Verify Recovery",
                    "Check pod status after restart",
                    RiskLevel::Low,
                    "k8s_get_pods",
                    &[("namespace", "{namespace}"), ("label_selector", "")],
                ),
            ],
        },
        Playbook {
            id: "oom_kill_remediation".to_string(),
            name: "OOMKill Remediation".to_string(),
            description: "Increase memory limits for OOM-killed pods".to_string(),
            steps: vec![
                PlaybookStep::new(
                    "Get Current Limits",
                    "Describe deployment to see current memory limits",
                    RiskLevel::Low,
                    "k8s_describe_resource",
                    &[
                        ("resource_type", "deployment"),
                        ("resource_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                    ],
                ),
                PlaybookStep::new(
                    "Increase Memory Limit",
                    "Patch deployment to increase memory limit",
                    RiskLevel::High,
                    "k8s_patch_resource",
                    &[
                        ("resource_type", "deployment"),
                        ("resource_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                        (
                            "patch",
                            r#"{"spec":{"template":{"spec":{"containers":[{"name":"{resource_name}","resources":{"limits":{"memory":"1Gi"}}}]}}}}"#,
                        ),
                    ],
                ),
            ],
        },
        Playbook {
            id: "deployment_rollback".to_string(),
            name: "Deployment Rollback".to_string(),
            description: "Roll back a failing deployment to the previous stable revision"
                .to_string(),
            steps: vec![
                PlaybookStep::new(
                    "Get Rollout History",
                    "Show deployment revisions available for rollback",
                    RiskLevel::Low,
                    "k8s_get_rollout_history",
                    &[
                        ("deployment_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                    ],
                ),
                PlaybookStep::new(
                    "Rollback Deployment",
                    "Undo to previous stable revision",
                    RiskLevel::High,
                    "k8s_rollback_deployment",
                    &[
                        ("deployment_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                    ],
                ),
                PlaybookStep::new(
                    "Check Rollout Status",
                    "Verify rollback completed successfully",
                    RiskLevel::Low,
                    "k8s_rollout_status",
                    &[
                        ("deployment_name", "{resource_name}"),
                        ("namespace", "{namespace}"),
                    ],
                ),
            ],
        },
        Playbook {
            id: "node_not_ready_remediation".to_string(),
            name: "Node NotReady Remediation".to_string(),
            description: "Cordon and drain a NotReady node".to_string(),
            steps: vec![
                PlaybookStep::new(
                    "Describe Node",
                    "Gather node conditions and events",
                    RiskLevel::Low,
                    "k8s_describe_resource",
                    &[
                        ("resource_type", "node"),
                        ("resource_name", "{resource_name}"),
                        ("namespace", ""),
                    ],
                ),
                PlaybookStep::new(
                    "Cordon Node",
                    "Prevent new pods from scheduling on this node",
                    RiskLevel::Medium,
                    "k8s_cordon_node",
                    &[("node_name", "{resource_name}")],
                ),
                PlaybookStep::new(
                    "Drain Node",
                    "Evict all pods from the node",
                    RiskLevel::High,
                    "k8s_drain_node",
                    &[("node_name", "{resource_name}")],
                ),
            ],
        },
        Playbook {
            id: "scale_up_on_load".to_string(),
            name: "Scale Up Under Load".to_string(),
            description: "Increase replica count when load saturates the deployment".to_string(),
            steps: vec![PlaybookStep::new(
                "Scale Deployment",
                "Add replicas to handle increased load",
                RiskLevel::Medium,
                "k8s_scale_deployment",
                &[
                    ("deployment", "{resource_name}"),
                    ("namespace", "{namespace}"),
                    ("replicas", "{target_replicas}"),
                ],
            )],
        },
    ]
}
