//! Human-in-the-loop approval handshake.
//!
//! MEDIUM and HIGH risk steps park here: the manager stores a pending
//! record with a TTL, posts a prompt naming an 8-character short id, and
//! suspends the requesting run until a chat reply, the tool's completion,
//! or expiry resolves the handshake. Replies arrive through the single
//! chat-router hook as `approve <id>` / `reject <id>` style messages.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_mcp::ToolDispatcher;
use vigil_notify::{ChannelRouter, ChannelTarget};

use crate::error::EngineError;
use crate::playbook::RiskLevel;
use crate::store::{CasOutcome, PendingStore};

/// Output shown in approval confirmations is elided past this length.
const CONFIRMATION_OUTPUT_LIMIT: usize = 800;

/// Lifecycle of one pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Executed,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    /// Display name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

/// A gated action waiting for a human decision.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: Uuid,
    /// First 8 hex chars of the approval id; unique across live pendings
    pub short_id: String,
    pub tool_name: String,
    /// Fully resolved tool parameters
    pub params: BTreeMap<String, String>,
    pub risk: RiskLevel,
    /// Step description shown in the prompt
    pub description: String,
    pub run_id: Uuid,
    pub target: ChannelTarget,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl PendingApproval {
    /// The user-facing approval prompt.
    #[must_use]
    pub fn prompt(&self) -> String {
        let minutes = (self.expires_at - self.requested_at).num_minutes().max(1);
        let mut text = String::new();
        if self.risk == RiskLevel::High {
            text.push_str("⚠️ **HIGH RISK ACTION — Review carefully before approving**\n\n");
        }
        let _ = writeln!(
            text,
            "{} **Approval Required** [{}]",
            self.risk.icon(),
            self.risk.as_str().to_uppercase()
        );
        text.push('\n');
        let _ = writeln!(text, "**Action:** {}", self.description);
        let _ = writeln!(text, "**Tool:** `{}`", self.tool_name);
        text.push_str("**Parameters:**\n");
        for (key, value) in &self.params {
            let _ = writeln!(text, "  • {key}: {value}");
        }
        text.push('\n');
        let _ = writeln!(
            text,
            "Reply with `approve {0}` to proceed or `reject {0}` to cancel.",
            self.short_id
        );
        let _ = write!(text, "This request expires in {minutes} minutes.");
        text
    }
}

/// How a suspended step resumes.
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// The user approved; the tool ran. `is_error` is true when the tool
    /// reported failure or the call itself failed, which is an
    /// operational failure, distinct from a rejection.
    Executed { output: String, is_error: bool },
    /// The user rejected the action
    Rejected { user_id: String },
    /// The TTL elapsed with no decision
    Expired,
}

/// Which side of the grammar a reply fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerb {
    Approve,
    Reject,
}

fn reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(approve|yes|confirm|reject|no|cancel)\s+([0-9a-f]{8})\s*$")
            .expect("reply pattern is valid")
    })
}

/// Parse an inbound chat message against the approval reply grammar.
/// Anything that is not exactly `verb <8-hex>` is not an approval reply.
#[must_use]
pub fn parse_reply(text: &str) -> Option<(ReplyVerb, String)> {
    let caps = reply_pattern().captures(text)?;
    let verb = match caps[1].to_ascii_lowercase().as_str() {
        "approve" | "yes" | "confirm" => ReplyVerb::Approve,
        _ => ReplyVerb::Reject,
    };
    Some((verb, caps[2].to_ascii_lowercase()))
}

/// Brokers pending approvals between suspended runs and chat replies.
pub struct ApprovalManager {
    store: Arc<PendingStore>,
    tools: Arc<dyn ToolDispatcher>,
    sender: Arc<ChannelRouter>,
    timeout: Duration,
    /// Completion handles for suspended callers, keyed by short id
    waiters: DashMap<String, oneshot::Sender<ApprovalOutcome>>,
}

impl ApprovalManager {
    /// Create a manager over the shared store, tool dispatcher, and
    /// channel router.
    #[must_use]
    pub fn new(
        store: Arc<PendingStore>,
        tools: Arc<dyn ToolDispatcher>,
        sender: Arc<ChannelRouter>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            tools,
            sender,
            timeout,
            waiters: DashMap::new(),
        }
    }

    /// The configured approval TTL.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Currently pending approvals.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.store.pending()
    }

    /// Request a human decision for a gated step and suspend until it
    /// resolves.
    ///
    /// # Errors
    ///
    /// Returns an error only when the pending record cannot be stored;
    /// every decision path (approve, reject, expiry, tool failure)
    /// resolves to an [`ApprovalOutcome`].
    pub async fn request(
        &self,
        tool_name: &str,
        params: BTreeMap<String, String>,
        risk: RiskLevel,
        description: &str,
        target: &ChannelTarget,
        run_id: Uuid,
    ) -> Result<ApprovalOutcome, EngineError> {
        let (approval_id, short_id) = self.allocate_ids();
        let requested_at = Utc::now();
        let approval = PendingApproval {
            approval_id,
            short_id: short_id.clone(),
            tool_name: tool_name.to_string(),
            params,
            risk,
            description: description.to_string(),
            run_id,
            target: target.clone(),
            requested_at,
            expires_at: requested_at
                + ChronoDuration::from_std(self.timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(900)),
            status: ApprovalStatus::Pending,
        };
        let prompt = approval.prompt();
        self.store.insert(approval)?;

        let (tx, mut rx) = oneshot::channel();
        self.waiters.insert(short_id.clone(), tx);

        info!(
            approval_id = %approval_id,
            short_id = %short_id,
            tool = tool_name,
            risk = risk.as_str(),
            run_id = %run_id,
            "Approval requested"
        );
        if let Err(e) = self.sender.send(target, &prompt).await {
            warn!(short_id = %short_id, error = %e, "Failed to post approval prompt");
        }

        let sleep = tokio::time::sleep(self.timeout);
        tokio::pin!(sleep);
        let mut timer_armed = true;
        let outcome = loop {
            tokio::select! {
                resolved = &mut rx => {
                    break resolved.unwrap_or(ApprovalOutcome::Expired);
                }
                () = &mut sleep, if timer_armed => {
                    timer_armed = false;
                    match self.store.compare_and_set(
                        &approval_id.to_string(),
                        ApprovalStatus::Pending,
                        ApprovalStatus::Expired,
                    ) {
                        CasOutcome::Updated | CasOutcome::Missing => {
                            self.waiters.remove(&short_id);
                            info!(short_id = %short_id, "Approval expired");
                            break ApprovalOutcome::Expired;
                        }
                        // A reply won the race; keep waiting for its
                        // outcome on the completion handle.
                        CasOutcome::Conflict(_) => {}
                    }
                }
            }
        };
        Ok(outcome)
    }

    /// Feed one inbound chat message through the reply grammar.
    ///
    /// Returns the confirmation text to post back to the channel, or
    /// `None` when the message is not an approval reply or references an
    /// unknown / already-settled short id (ignored silently).
    pub async fn handle_reply(&self, text: &str, user_id: &str) -> Option<String> {
        let (verb, short_id) = parse_reply(text)?;
        let approval = self.store.find_by_short_id(&short_id)?;
        if approval.status != ApprovalStatus::Pending {
            return None;
        }
        let approval_key = approval.approval_id.to_string();

        match verb {
            ReplyVerb::Reject => {
                match self.store.compare_and_set(
                    &approval_key,
                    ApprovalStatus::Pending,
                    ApprovalStatus::Rejected,
                ) {
                    CasOutcome::Updated => {}
                    _ => return None,
                }
                info!(short_id = %short_id, user_id, "Approval rejected");
                self.resolve(
                    &short_id,
                    ApprovalOutcome::Rejected {
                        user_id: user_id.to_string(),
                    },
                );
                Some(format!(
                    "❌ Action **{}** rejected by {user_id}.",
                    approval.description
                ))
            }
            ReplyVerb::Approve => {
                match self.store.compare_and_set(
                    &approval_key,
                    ApprovalStatus::Pending,
                    ApprovalStatus::Executed,
                ) {
                    CasOutcome::Updated => {}
                    _ => return None,
                }
                info!(
                    short_id = %short_id,
                    user_id,
                    tool = %approval.tool_name,
                    "Approval granted; executing tool"
                );

                let args = params_to_args(&approval.params);
                let (outcome, confirmation) =
                    match self.tools.call_tool(&approval.tool_name, args).await {
                        Ok(result) => {
                            let output = result.text();
                            let confirmation = if result.is_error {
                                format!(
                                    "⚠️ **{}** approved by {user_id}, but the tool reported failure:\n```\n{}\n```",
                                    approval.description,
                                    elide(&output, CONFIRMATION_OUTPUT_LIMIT)
                                )
                            } else {
                                format!(
                                    "✅ **{}** executed successfully.\n```\n{}\n```",
                                    approval.description,
                                    elide(&output, CONFIRMATION_OUTPUT_LIMIT)
                                )
                            };
                            (
                                ApprovalOutcome::Executed {
                                    output,
                                    is_error: result.is_error,
                                },
                                confirmation,
                            )
                        }
                        Err(e) => {
                            warn!(short_id = %short_id, error = %e, "Approved tool call failed");
                            (
                                ApprovalOutcome::Executed {
                                    output: e.to_string(),
                                    is_error: true,
                                },
                                format!("❌ Execution of **{}** failed: {e}", approval.description),
                            )
                        }
                    };
                self.resolve(&short_id, outcome);
                Some(confirmation)
            }
        }
    }

    fn resolve(&self, short_id: &str, outcome: ApprovalOutcome) {
        if let Some((_, tx)) = self.waiters.remove(short_id) {
            // The waiter may have gone away (cancelled run); the store
            // already holds the terminal status.
            let _ = tx.send(outcome);
        }
    }

    /// Generate an approval id whose short form is unique across live
    /// pendings, regenerating on collision.
    fn allocate_ids(&self) -> (Uuid, String) {
        loop {
            let id = Uuid::new_v4();
            let short: String = id.simple().to_string().chars().take(8).collect();
            if !self.store.short_id_in_use(&short) && !self.waiters.contains_key(&short) {
                return (id, short);
            }
        }
    }
}

/// Convert resolved step parameters into JSON-RPC tool arguments.
pub(crate) fn params_to_args(params: &BTreeMap<String, String>) -> Value {
    let mut object = serde_json::Map::new();
    for (k, v) in params {
        object.insert(k.clone(), json!(v));
    }
    Value::Object(object)
}

/// Truncate `text` for chat display, marking the elision.
#[must_use]
pub fn elide(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}\n… (truncated)")
}
