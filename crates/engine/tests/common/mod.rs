//! Shared fakes for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_engine::approval::ApprovalManager;
use vigil_engine::playbook::PlaybookRegistry;
use vigil_engine::store::PendingStore;
use vigil_engine::{ClusterEvent, EventKind, PlaybookExecutor, Severity};
use vigil_mcp::{McpError, ToolDispatcher, ToolResult};
use vigil_notify::{ChannelError, ChannelRouter, ChannelSender, ChannelTarget};

/// Dispatcher that records calls and answers from a script.
pub struct FakeDispatcher {
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Tools that return an `isError` result
    pub failing_tools: HashSet<String>,
}

impl FakeDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing_tools: HashSet::new(),
        })
    }

    pub fn failing(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing_tools: tools.iter().map(|t| (*t).to_string()).collect(),
        })
    }

    pub fn calls_for(&self, tool: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl ToolDispatcher for FakeDispatcher {
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, McpError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), args));
        if self.failing_tools.contains(name) {
            Ok(ToolResult::error_text(format!("{name} failed")))
        } else {
            Ok(ToolResult::ok_text(format!("{name} ok")))
        }
    }

    fn has_tool(&self, _name: &str) -> bool {
        true
    }
}

/// Channel sender that records every delivered message.
pub struct CollectingSender {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl CollectingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Find the short id named in the most recent approval prompt.
    pub fn latest_short_id(&self) -> Option<String> {
        let pattern = Regex::new(r"approve ([0-9a-f]{8})").unwrap();
        self.texts()
            .iter()
            .rev()
            .find_map(|text| pattern.captures(text).map(|c| c[1].to_string()))
    }
}

#[async_trait]
impl ChannelSender for CollectingSender {
    fn channel_type(&self) -> &'static str {
        "test"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        self.messages
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Executor + approval manager wired to the fakes.
pub struct Harness {
    pub executor: PlaybookExecutor,
    pub approvals: Arc<ApprovalManager>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub sender: Arc<CollectingSender>,
    pub router: Arc<ChannelRouter>,
    pub target: ChannelTarget,
}

pub fn harness_with(dispatcher: Arc<FakeDispatcher>, approval_timeout: Duration) -> Harness {
    let sender = CollectingSender::new();
    let mut router = ChannelRouter::new();
    router.register(sender.clone());
    let router = Arc::new(router);

    let store = Arc::new(PendingStore::new(64));
    let tools: Arc<dyn ToolDispatcher> = dispatcher.clone();
    let approvals = Arc::new(ApprovalManager::new(
        store,
        Arc::clone(&tools),
        Arc::clone(&router),
        approval_timeout,
    ));
    let executor = PlaybookExecutor::new(
        Arc::new(PlaybookRegistry::with_builtins()),
        tools,
        Arc::clone(&approvals),
        Arc::clone(&router),
    );

    Harness {
        executor,
        approvals,
        dispatcher,
        sender,
        router,
        target: ChannelTarget::new("test", "sre-channel"),
    }
}

pub fn harness(approval_timeout: Duration) -> Harness {
    harness_with(FakeDispatcher::new(), approval_timeout)
}

/// The S1 scenario event: pod `nginx-abc` in `prod` crash looping.
pub fn crash_event() -> ClusterEvent {
    ClusterEvent::new(
        EventKind::CrashLoop,
        Severity::Critical,
        "Pod",
        "prod",
        "nginx-abc",
        "Pod nginx-abc in prod is CrashLoopBackOff (restarts: 7)",
    )
}

/// Poll until `predicate` holds over the collected messages.
pub async fn wait_for_message<F>(sender: &CollectingSender, predicate: F)
where
    F: Fn(&str) -> bool,
{
    for _ in 0..500 {
        if sender.texts().iter().any(|t| predicate(t)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected message never arrived; saw: {:#?}",
        sender.texts()
    );
}
