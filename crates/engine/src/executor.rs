//! Playbook executor: one supervised task per remediation run.
//!
//! Steps execute strictly in order. LOW-risk steps call the tool layer
//! directly; MEDIUM/HIGH steps suspend on the approval manager and resume
//! with its outcome. Every step start, step end, and the terminal state is
//! posted to the run's notification target.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_mcp::ToolDispatcher;
use vigil_notify::{ChannelRouter, ChannelTarget};

use crate::approval::{elide, params_to_args, ApprovalManager, ApprovalOutcome};
use crate::error::EngineError;
use crate::event::ClusterEvent;
use crate::playbook::{render_params, FailurePolicy, Playbook, PlaybookRegistry};

/// Chat posts elide step output beyond this many characters; the run
/// record keeps the full output.
const POST_OUTPUT_LIMIT: usize = 800;

/// How long a finished run stays queryable before it is pruned.
pub const DEFAULT_RUN_RETENTION: Duration = Duration::from_secs(300);

/// Lifecycle of one run. Transitions are monotone; terminal states are
/// sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    /// Whether the run has reached a sink state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

/// How one step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Rejected,
    Expired,
    Cancelled,
}

/// One entry in a run's output list.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub outcome: StepOutcome,
    /// Serialized tool output, or the failure reason
    pub output: String,
}

/// One instance of a playbook executing against one triggering event.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybookRun {
    pub run_id: Uuid,
    pub playbook_id: String,
    /// Snapshot of the event that triggered the run
    pub event: ClusterEvent,
    pub status: RunStatus,
    /// Index of the step currently executing (or last executed)
    pub cursor: usize,
    pub outputs: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handle to an in-flight (or recently finished) run.
#[derive(Clone, Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    run: Arc<RwLock<PlaybookRun>>,
}

impl RunHandle {
    /// Copy of the run's current state.
    #[must_use]
    pub fn snapshot(&self) -> PlaybookRun {
        self.run.read().expect("run lock poisoned").clone()
    }
}

struct RunEntry {
    run: Arc<RwLock<PlaybookRun>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ExecutorInner {
    registry: Arc<PlaybookRegistry>,
    tools: Arc<dyn ToolDispatcher>,
    approvals: Arc<ApprovalManager>,
    sender: Arc<ChannelRouter>,
    runs: DashMap<Uuid, RunEntry>,
    cancel_tx: watch::Sender<bool>,
    retention: Duration,
}

/// Schedules playbook runs and enforces the risk gate on their steps.
#[derive(Clone)]
pub struct PlaybookExecutor {
    inner: Arc<ExecutorInner>,
}

impl PlaybookExecutor {
    /// Create an executor over the shared registry, tool dispatcher,
    /// approval manager, and channel router.
    #[must_use]
    pub fn new(
        registry: Arc<PlaybookRegistry>,
        tools: Arc<dyn ToolDispatcher>,
        approvals: Arc<ApprovalManager>,
        sender: Arc<ChannelRouter>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                tools,
                approvals,
                sender,
                runs: DashMap::new(),
                cancel_tx,
                retention: DEFAULT_RUN_RETENTION,
            }),
        }
    }

    /// Start a run for `playbook_id` with the event as template context.
    /// Returns immediately; the run proceeds on its own task.
    ///
    /// # Errors
    ///
    /// Fails only when the playbook id is not registered.
    pub fn execute(
        &self,
        playbook_id: &str,
        event: ClusterEvent,
        target: ChannelTarget,
    ) -> Result<RunHandle, EngineError> {
        let playbook = self
            .inner
            .registry
            .get(playbook_id)
            .ok_or_else(|| EngineError::UnknownPlaybook(playbook_id.to_string()))?;

        let run_id = Uuid::new_v4();
        let run = Arc::new(RwLock::new(PlaybookRun {
            run_id,
            playbook_id: playbook_id.to_string(),
            event: event.clone(),
            status: RunStatus::Running,
            cursor: 0,
            outputs: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }));

        info!(
            run_id = %run_id,
            playbook = playbook_id,
            resource = %event.resource_name,
            "Playbook run started"
        );

        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(&run);
        let cancel = self.inner.cancel_tx.subscribe();
        let task = tokio::spawn(async move {
            drive(inner, playbook, shared, event, target, cancel).await;
        });

        self.inner.runs.insert(
            run_id,
            RunEntry {
                run: Arc::clone(&run),
                task: Mutex::new(Some(task)),
            },
        );

        Ok(RunHandle { run_id, run })
    }

    /// Snapshot of one run, while it is live or within the retention
    /// window.
    #[must_use]
    pub fn run(&self, run_id: Uuid) -> Option<PlaybookRun> {
        self.inner
            .runs
            .get(&run_id)
            .map(|e| e.run.read().expect("run lock poisoned").clone())
    }

    /// Number of runs not yet in a terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .runs
            .iter()
            .filter(|e| !e.run.read().expect("run lock poisoned").status.is_terminal())
            .count()
    }

    /// Await a run's task and return its final state. Intended for tests
    /// and diagnostics; runs complete on their own regardless.
    pub async fn wait(&self, run_id: Uuid) -> Option<PlaybookRun> {
        let handle = self
            .inner
            .runs
            .get(&run_id)
            .and_then(|e| e.task.lock().expect("task lock poisoned").take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.run(run_id)
    }

    /// Drain in-flight runs: wait up to `grace` for natural completion,
    /// then signal cancellation, and finally abort and force-mark
    /// stragglers as `Cancelled`.
    pub async fn drain(&self, grace: Duration) {
        if self.active_count() == 0 {
            return;
        }
        info!(active = self.active_count(), "Draining playbook runs");

        if !self.await_idle(grace).await {
            warn!(
                active = self.active_count(),
                "Grace period elapsed; cancelling remaining runs"
            );
            let _ = self.inner.cancel_tx.send(true);
            // Give tasks a moment to observe the signal at their next
            // suspension point.
            self.await_idle(Duration::from_secs(2)).await;
        }

        for entry in self.inner.runs.iter() {
            let handle = entry.task.lock().expect("task lock poisoned").take();
            if let Some(handle) = handle {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
            let mut run = entry.run.write().expect("run lock poisoned");
            if !run.status.is_terminal() {
                let cursor = run.cursor;
                if !run.outputs.iter().any(|r| r.index == cursor) {
                    run.outputs.push(StepRecord {
                        index: cursor,
                        name: format!("step {}", cursor + 1),
                        outcome: StepOutcome::Cancelled,
                        output: "engine shutdown".to_string(),
                    });
                }
                run.status = RunStatus::Cancelled;
                run.finished_at = Some(Utc::now());
                warn!(run_id = %run.run_id, "Run cancelled at shutdown");
            }
        }
    }

    async fn await_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn drive(
    inner: Arc<ExecutorInner>,
    playbook: Arc<Playbook>,
    shared: Arc<RwLock<PlaybookRun>>,
    event: ClusterEvent,
    target: ChannelTarget,
    mut cancel: watch::Receiver<bool>,
) {
    let run_id = shared.read().expect("run lock poisoned").run_id;
    let short_run: String = run_id.simple().to_string().chars().take(8).collect();
    let ctx = event.context();
    let total = playbook.steps.len();

    let resource = if event.namespace.is_empty() {
        format!("{}/{}", event.resource_kind, event.resource_name)
    } else {
        format!(
            "{}/{}/{}",
            event.resource_kind, event.namespace, event.resource_name
        )
    };
    notify(
        &inner,
        &target,
        &format!(
            "▶️ Playbook **{}** started for {resource} ({total} steps), run `{short_run}`",
            playbook.name
        ),
    )
    .await;

    let mut terminal = RunStatus::Completed;
    for (index, step) in playbook.steps.iter().enumerate() {
        if *cancel.borrow() {
            record_step(&shared, index, &step.name, StepOutcome::Cancelled, "engine shutdown");
            terminal = RunStatus::Cancelled;
            break;
        }
        shared.write().expect("run lock poisoned").cursor = index;

        notify(
            &inner,
            &target,
            &format!(
                "{} Step {}/{total}: **{}**: {}",
                step.risk.icon(),
                index + 1,
                step.name,
                step.description
            ),
        )
        .await;

        let params = match render_params(&step.params, &ctx) {
            Ok(params) => params,
            Err(e) => {
                let reason = e.to_string();
                record_step(&shared, index, &step.name, StepOutcome::Failure, &reason);
                notify(
                    &inner,
                    &target,
                    &format!("❌ Step {}/{total} **{}** failed: {reason}", index + 1, step.name),
                )
                .await;
                if step.on_failure == FailurePolicy::Continue {
                    continue;
                }
                terminal = RunStatus::Failed;
                break;
            }
        };

        let (outcome, output) = if step.risk.auto_executes() {
            let call = inner.tools.call_tool(&step.tool_name, params_to_args(&params));
            tokio::select! {
                () = wait_cancelled(&mut cancel) => (StepOutcome::Cancelled, "engine shutdown".to_string()),
                result = call => match result {
                    Ok(r) if !r.is_error => (StepOutcome::Success, r.text()),
                    Ok(r) => (StepOutcome::Failure, r.text()),
                    Err(e) => (StepOutcome::Failure, e.to_string()),
                },
            }
        } else {
            shared.write().expect("run lock poisoned").status = RunStatus::AwaitingApproval;
            let request = inner.approvals.request(
                &step.tool_name,
                params.clone(),
                step.risk,
                &step.description,
                &target,
                run_id,
            );
            let resolved = tokio::select! {
                () = wait_cancelled(&mut cancel) => None,
                result = request => Some(result),
            };
            {
                let mut run = shared.write().expect("run lock poisoned");
                if run.status == RunStatus::AwaitingApproval {
                    run.status = RunStatus::Running;
                }
            }
            match resolved {
                None => (StepOutcome::Cancelled, "engine shutdown".to_string()),
                Some(Ok(ApprovalOutcome::Executed { output, is_error: false })) => {
                    (StepOutcome::Success, output)
                }
                // An approved tool that failed is an operational failure,
                // never a rejection.
                Some(Ok(ApprovalOutcome::Executed { output, is_error: true })) => {
                    (StepOutcome::Failure, format!("tool failed after approval: {output}"))
                }
                Some(Ok(ApprovalOutcome::Rejected { user_id })) => {
                    (StepOutcome::Rejected, format!("rejected by {user_id}"))
                }
                Some(Ok(ApprovalOutcome::Expired)) => (
                    StepOutcome::Expired,
                    "approval expired without a decision".to_string(),
                ),
                Some(Err(e)) => (StepOutcome::Failure, e.to_string()),
            }
        };

        record_step(&shared, index, &step.name, outcome, &output);
        let step_line = match outcome {
            StepOutcome::Success => format!(
                "✅ Step {}/{total} **{}** succeeded\n```\n{}\n```",
                index + 1,
                step.name,
                elide(&output, POST_OUTPUT_LIMIT)
            ),
            StepOutcome::Failure => format!(
                "❌ Step {}/{total} **{}** failed: {}",
                index + 1,
                step.name,
                elide(&output, POST_OUTPUT_LIMIT)
            ),
            StepOutcome::Rejected => {
                format!("🚫 Step {}/{total} **{}** {}", index + 1, step.name, output)
            }
            StepOutcome::Expired => {
                format!("⏰ Step {}/{total} **{}**: {}", index + 1, step.name, output)
            }
            StepOutcome::Cancelled => {
                format!("🚫 Step {}/{total} **{}** cancelled", index + 1, step.name)
            }
        };
        notify(&inner, &target, &step_line).await;

        match outcome {
            StepOutcome::Success => {}
            StepOutcome::Cancelled => {
                terminal = RunStatus::Cancelled;
                break;
            }
            StepOutcome::Expired => {
                if step.on_failure == FailurePolicy::Continue {
                    continue;
                }
                terminal = RunStatus::Expired;
                break;
            }
            StepOutcome::Failure | StepOutcome::Rejected => {
                if step.on_failure == FailurePolicy::Continue {
                    continue;
                }
                terminal = RunStatus::Failed;
                break;
            }
        }
    }

    {
        let mut run = shared.write().expect("run lock poisoned");
        run.status = terminal;
        run.finished_at = Some(Utc::now());
    }
    info!(run_id = %run_id, status = ?terminal, "Playbook run finished");

    let terminal_line = match terminal {
        RunStatus::Completed => {
            format!("✅ Playbook **{}** completed (run `{short_run}`)", playbook.name)
        }
        RunStatus::Failed => {
            format!("❌ Playbook **{}** failed (run `{short_run}`)", playbook.name)
        }
        RunStatus::Expired => format!(
            "⏰ Playbook **{}** stopped: approval expired (run `{short_run}`)",
            playbook.name
        ),
        RunStatus::Cancelled => {
            format!("🚫 Playbook **{}** cancelled (run `{short_run}`)", playbook.name)
        }
        RunStatus::Running | RunStatus::AwaitingApproval => unreachable!("terminal state"),
    };
    notify(&inner, &target, &terminal_line).await;

    // Keep the record queryable for a short window, then prune.
    let retention = inner.retention;
    let runs = Arc::clone(&inner);
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        runs.runs.remove(&run_id);
    });
}

fn record_step(
    shared: &Arc<RwLock<PlaybookRun>>,
    index: usize,
    name: &str,
    outcome: StepOutcome,
    output: &str,
) {
    let mut run = shared.write().expect("run lock poisoned");
    run.outputs.push(StepRecord {
        index,
        name: name.to_string(),
        outcome,
        output: output.to_string(),
    });
}

async fn notify(inner: &ExecutorInner, target: &ChannelTarget, text: &str) {
    if let Err(e) = inner.sender.send(target, text).await {
        warn!(target = %target, error = %e, "Failed to post run notification");
    }
}
