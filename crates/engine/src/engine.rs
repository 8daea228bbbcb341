//! Engine lifecycle coordinator.
//!
//! Owns startup ordering (connect MCP servers, validate the playbook
//! registry against the tool registry, start the watch loop) and shutdown
//! ordering (quiesce event intake first, drain in-flight runs within the
//! grace period, then tear down transports). All long-lived tasks hang off
//! this coordinator; there is no module-level mutable state.

use axum::Router;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use vigil_mcp::{McpManager, ToolDispatcher};
use vigil_notify::{ChannelRouter, ChannelTarget};

use crate::approval::{ApprovalManager, PendingApproval};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::IssueKey;
use crate::executor::{PlaybookExecutor, PlaybookRun};
use crate::k8s::{ClusterObserver, KubeObserver};
use crate::pipeline::Pipeline;
use crate::playbook::{PlaybookRegistry, PlaybookSummary};
use crate::rules::{Rule, RuleEngine};
use crate::store::PendingStore;
use crate::watchloop::WatchLoop;
use crate::webhook;

/// Capacity of the pending-approval store.
const APPROVAL_STORE_CAPACITY: usize = 1024;

/// How often the store sweeper purges expired approval records.
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled AIOps engine.
pub struct Engine {
    config: EngineConfig,
    mcp: Arc<McpManager>,
    rules: Arc<RuleEngine>,
    registry: Arc<PlaybookRegistry>,
    approvals: Arc<ApprovalManager>,
    executor: PlaybookExecutor,
    pipeline: Arc<Pipeline>,
    watchloop: Option<Arc<WatchLoop>>,
    watch_cancel: watch::Sender<bool>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start the engine: connect MCP servers, validate configuration,
    /// and launch the watch loop.
    ///
    /// # Errors
    ///
    /// Startup is all-or-nothing: a duplicate tool across servers, a
    /// playbook step referencing an unknown tool, or a malformed
    /// notification target refuses to start the engine.
    pub async fn start(
        config: EngineConfig,
        sender: Arc<ChannelRouter>,
    ) -> Result<Self, EngineError> {
        let notification_target: ChannelTarget = config
            .aiops
            .notification_channel
            .parse()
            .map_err(|_| {
                EngineError::Config(format!(
                    "aiops.notification_channel '{}' is not '<type>:<id>'",
                    config.aiops.notification_channel
                ))
            })?;

        let mcp = Arc::new(McpManager::connect(&config.mcp, config.tool_call_timeout()).await?);
        let tools: Arc<dyn ToolDispatcher> = Arc::clone(&mcp) as Arc<dyn ToolDispatcher>;

        let registry = Arc::new(PlaybookRegistry::with_builtins());
        registry.validate_tools(|tool| tools.has_tool(tool))?;
        info!("Playbook registry validated against tool registry");

        let rules = Arc::new(RuleEngine::with_builtins());

        let store = Arc::new(PendingStore::new(APPROVAL_STORE_CAPACITY));
        let approvals = Arc::new(ApprovalManager::new(
            Arc::clone(&store),
            Arc::clone(&tools),
            Arc::clone(&sender),
            config.approval_timeout(),
        ));

        let executor = PlaybookExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&tools),
            Arc::clone(&approvals),
            Arc::clone(&sender),
        );

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&rules),
            executor.clone(),
            Arc::clone(&sender),
            notification_target,
            config.aiops.auto_remediation,
        ));

        let (watch_cancel, watch_cancel_rx) = watch::channel(false);
        let mut watchloop = None;
        let mut watch_handle = None;
        if config.watchloop.enabled {
            match KubeObserver::try_default().await {
                Ok(observer) => {
                    let observer: Arc<dyn ClusterObserver> = Arc::new(observer);
                    let watch = Arc::new(WatchLoop::new(
                        observer,
                        Arc::clone(&pipeline),
                        config.watch_interval(),
                    ));
                    watch_handle = Some(watch.spawn(watch_cancel_rx));
                    watchloop = Some(watch);
                }
                Err(e) => {
                    // Degrade to webhook-only operation rather than
                    // refusing to start off-cluster.
                    warn!(error = %e, "Kubernetes client unavailable; watch loop disabled");
                }
            }
        } else {
            info!("Watch loop disabled by configuration");
        }

        let sweeper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STORE_SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    store.sweep();
                }
            })
        };

        info!("Engine started");
        Ok(Self {
            config,
            mcp,
            rules,
            registry,
            approvals,
            executor,
            pipeline,
            watchloop,
            watch_cancel,
            watch_handle: Mutex::new(watch_handle),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// HTTP router for the inbound webhook endpoints.
    #[must_use]
    pub fn webhook_router(&self) -> Router {
        webhook::webhook_router(Arc::clone(&self.pipeline))
    }

    /// Single chat-router hook: feed every inbound chat message through
    /// the approval reply grammar. Returns the confirmation to post back,
    /// or `None` when the message is not an approval reply.
    pub async fn handle_chat_reply(&self, text: &str, user_id: &str) -> Option<String> {
        self.approvals.handle_reply(text, user_id).await
    }

    /// Diagnostics: the watch loop's known-issues snapshot.
    #[must_use]
    pub fn known_issues(&self) -> HashSet<IssueKey> {
        self.watchloop
            .as_ref()
            .map(|w| w.known_issues())
            .unwrap_or_default()
    }

    /// Diagnostics: snapshot of one run, live or recently finished.
    #[must_use]
    pub fn run_status(&self, run_id: Uuid) -> Option<PlaybookRun> {
        self.executor.run(run_id)
    }

    /// Diagnostics: registered rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.rules()
    }

    /// Diagnostics: registered playbooks.
    #[must_use]
    pub fn playbooks(&self) -> Vec<PlaybookSummary> {
        self.registry.summaries()
    }

    /// Diagnostics: approvals currently awaiting a decision.
    #[must_use]
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.approvals.pending()
    }

    /// Shut the engine down: quiesce event intake, drain runs within the
    /// grace period, then tear down the tool transports.
    pub async fn shutdown(self) {
        info!("Engine shutting down");

        let _ = self.watch_cancel.send(true);
        let watch_handle = self.watch_handle.lock().expect("watch handle lock").take();
        if let Some(handle) = watch_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Watch loop task panicked");
            }
        }

        self.executor.drain(self.config.shutdown_grace()).await;

        if let Some(sweeper) = self.sweeper.lock().expect("sweeper lock").take() {
            sweeper.abort();
        }

        self.mcp.shutdown().await;
        info!("Engine stopped");
    }
}
