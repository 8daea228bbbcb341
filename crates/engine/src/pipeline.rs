//! Event dispatch pipeline shared by the watch loop and the webhook.
//!
//! One entry point: match the event against the rule engine, alert the
//! configured SRE channel, and, when auto-remediation is on, launch a
//! run for every matched playbook.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use vigil_notify::{ChannelRouter, ChannelTarget};

use crate::event::ClusterEvent;
use crate::executor::PlaybookExecutor;
use crate::rules::RuleEngine;

/// Routes detected events through rules, alerting, and the executor.
pub struct Pipeline {
    rules: Arc<RuleEngine>,
    executor: PlaybookExecutor,
    sender: Arc<ChannelRouter>,
    notification_target: ChannelTarget,
    auto_remediation: bool,
}

impl Pipeline {
    /// Create a pipeline posting alerts and run progress to
    /// `notification_target`.
    #[must_use]
    pub fn new(
        rules: Arc<RuleEngine>,
        executor: PlaybookExecutor,
        sender: Arc<ChannelRouter>,
        notification_target: ChannelTarget,
        auto_remediation: bool,
    ) -> Self {
        Self {
            rules,
            executor,
            sender,
            notification_target,
            auto_remediation,
        }
    }

    /// Dispatch one event: alert, then launch matched playbooks.
    /// Returns the ids of the runs launched.
    pub async fn dispatch(&self, event: ClusterEvent) -> Vec<Uuid> {
        let matches = self.rules.match_event(&event);
        info!(
            kind = %event.kind,
            resource = %event.resource_name,
            namespace = %event.namespace,
            matched = matches.len(),
            "Dispatching cluster event"
        );

        let mut alert = format!(
            "🚨 **{}** `{}`: {}",
            event.severity.as_str().to_uppercase(),
            event.kind,
            event.message
        );
        if matches.is_empty() {
            alert.push_str("\nNo remediation rule matched.");
        } else {
            let playbooks: Vec<&str> =
                matches.iter().map(|m| m.playbook_id.as_str()).collect();
            let _ = write!(alert, "\nMatched playbooks: {}", playbooks.join(", "));
            if !self.auto_remediation {
                alert.push_str("\nAuto-remediation is disabled; no run launched.");
            }
        }
        if let Err(e) = self.sender.send(&self.notification_target, &alert).await {
            warn!(error = %e, "Failed to post incident alert");
        }

        if !self.auto_remediation {
            return Vec::new();
        }

        let mut launched = Vec::new();
        for matched in matches {
            match self.executor.execute(
                &matched.playbook_id,
                event.clone(),
                self.notification_target.clone(),
            ) {
                Ok(handle) => {
                    info!(
                        rule_id = %matched.rule_id,
                        playbook = %matched.playbook_id,
                        run_id = %handle.run_id,
                        "Remediation run launched"
                    );
                    launched.push(handle.run_id);
                }
                Err(e) => {
                    // One broken binding must not stop the other matches.
                    error!(
                        rule_id = %matched.rule_id,
                        playbook = %matched.playbook_id,
                        error = %e,
                        "Failed to launch remediation run"
                    );
                }
            }
        }
        launched
    }

    /// The target alerts and run progress are posted to.
    #[must_use]
    pub fn notification_target(&self) -> &ChannelTarget {
        &self.notification_target
    }
}
