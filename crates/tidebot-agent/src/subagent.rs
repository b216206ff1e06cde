//! Subagent manager: background child agents for delegated tasks.
//!
//! A subagent runs the same [`Runner`] as the main loop, with its own
//! session key (`"{parent}/subagent:{id}"`), a tool subset that never
//! includes `spawn`, and its own iteration budget. When it finishes it
//! publishes exactly one outbound message to the chat that spawned it,
//! carrying the parent's correlation id. Failures stay inside that message.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tidebot_core::bus::queue::MessageBus;
use tidebot_core::bus::types::OutboundMessage;
use tidebot_core::config::schema::SubagentConfig;
use tidebot_core::types::Message;
use tidebot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::runner::{Run, RunOutcome, Runner};
use crate::tools::{ToolContext, ToolRegistry};

/// Reported when a subagent finishes without any text.
pub const NO_RESPONSE: &str = "Task completed but no final response generated.";

const LABEL_CHARS: usize = 30;

// ─────────────────────────────────────────────
// Task and status types
// ─────────────────────────────────────────────

/// What to run, and where to report back.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub parent_session_key: String,
    pub parent_correlation_id: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub task: String,
    pub label: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Tool names to enable; `None` means every delegable tool.
    pub tools: Option<Vec<String>>,
    pub max_iterations: Option<u32>,
    pub spawned_at: DateTime<Utc>,
}

impl SubagentTask {
    pub fn new(
        parent_session_key: impl Into<String>,
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            parent_session_key: parent_session_key.into(),
            parent_correlation_id: None,
            channel: channel.into(),
            chat_id: chat_id.into(),
            task: task.into(),
            label: None,
            model: None,
            system_prompt: None,
            tools: None,
            max_iterations: None,
            spawned_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.parent_correlation_id = id;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// The explicit label, or the first 30 characters of the task.
    pub fn display_label(&self) -> String {
        if let Some(label) = self.label.as_deref().filter(|l| !l.trim().is_empty()) {
            return label.to_string();
        }
        if self.task.chars().count() > LABEL_CHARS {
            let head: String = self.task.chars().take(LABEL_CHARS).collect();
            format!("{head}...")
        } else {
            self.task.clone()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("too many subagents running (limit {limit})")]
    LimitReached { limit: usize },

    #[error("tools not available to subagents: {}", .0.join(", "))]
    UnknownTools(Vec<String>),

    #[error("subagent manager is shutting down")]
    ShuttingDown,
}

/// A spawned subagent.
#[derive(Debug)]
pub struct SubagentHandle {
    pub id: String,
    pub label: String,
    pub session_key: String,
    task: JoinHandle<()>,
}

impl SubagentHandle {
    /// Wait for the subagent to publish its report and be torn down.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(subagent = %self.id, error = %e, "subagent task panicked or was aborted");
        }
    }
}

/// A subagent that is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSubagent {
    pub id: String,
    pub label: String,
    pub parent_session_key: String,
    pub started_at: DateTime<Utc>,
}

/// How a subagent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Completed,
    StoppedEarly,
    Failed,
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::StoppedEarly => write!(f, "stopped early"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A finished subagent, kept for `/tools`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSubagent {
    pub id: String,
    pub label: String,
    pub status: SubagentStatus,
    pub iterations: u32,
    pub finished_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────

/// Spawns, bounds and reaps subagents.
pub struct SubagentManager {
    provider: Arc<dyn LlmProvider>,
    /// Tools subagents may use. Never contains `spawn`.
    tools: Arc<ToolRegistry>,
    bus: Arc<MessageBus>,
    model: String,
    request: LlmRequestConfig,
    limits: SubagentConfig,
    model_timeout: Duration,
    workspace: PathBuf,
    running: Mutex<HashMap<String, RunningSubagent>>,
    recent: Mutex<VecDeque<CompletedSubagent>>,
    shutdown: CancellationToken,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        bus: Arc<MessageBus>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            workspace: tools.sandbox().workspace().to_path_buf(),
            tools,
            bus,
            model: model.into(),
            request: LlmRequestConfig::default(),
            limits: SubagentConfig::default(),
            model_timeout: Duration::from_secs(120),
            running: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_request_config(mut self, request: LlmRequestConfig) -> Self {
        self.request = request;
        self
    }

    pub fn with_limits(mut self, limits: SubagentConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Cancelled on shutdown; running subagents observe it.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Upper bound on any subagent's model calls. Larger task budgets are cut to it.
    pub fn max_iterations(&self) -> u32 {
        self.limits.max_iterations
    }

    /// Names subagents can be given.
    pub fn available_tools(&self) -> Vec<String> {
        self.tools.tool_names()
    }

    /// Start a subagent in the background.
    pub fn spawn(self: &Arc<Self>, task: SubagentTask) -> Result<SubagentHandle, SpawnError> {
        if self.shutdown.is_cancelled() {
            return Err(SpawnError::ShuttingDown);
        }

        let tools = match &task.tools {
            Some(names) => {
                let unknown: Vec<String> =
                    names.iter().filter(|n| !self.tools.has(n)).cloned().collect();
                if !unknown.is_empty() {
                    return Err(SpawnError::UnknownTools(unknown));
                }
                self.tools
                    .subset(names)
                    .map_err(|_| SpawnError::UnknownTools(names.clone()))?
            }
            None => self.tools.fork(),
        };

        let id = new_task_id();
        let label = task.display_label();
        let session_key = format!("{}/subagent:{id}", task.parent_session_key);

        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.len() >= self.limits.max_concurrent {
                return Err(SpawnError::LimitReached {
                    limit: self.limits.max_concurrent,
                });
            }
            running.insert(
                id.clone(),
                RunningSubagent {
                    id: id.clone(),
                    label: label.clone(),
                    parent_session_key: task.parent_session_key.clone(),
                    started_at: task.spawned_at,
                },
            );
        }

        info!(subagent = %id, label = %label, parent = %task.parent_session_key, "spawning subagent");

        let manager = Arc::clone(self);
        let (tid, tkey) = (id.clone(), session_key.clone());
        let join = tokio::spawn(async move {
            manager.run_to_completion(tid, tkey, task, tools).await;
        });

        Ok(SubagentHandle {
            id,
            label,
            session_key,
            task: join,
        })
    }

    async fn run_to_completion(
        &self,
        id: String,
        session_key: String,
        task: SubagentTask,
        tools: ToolRegistry,
    ) {
        let label = task.display_label();
        let model = task.model.clone().unwrap_or_else(|| self.model.clone());
        let limit = self.limits.max_iterations;
        let budget = task.max_iterations.map_or(limit, |n| n.min(limit));
        let system = task
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.default_prompt(&task.task));

        let mut ctx = ToolContext::new(&session_key, 1)
            .with_origin(&task.channel, &task.chat_id)
            .with_cancel(self.shutdown.child_token());
        if let Some(correlation) = &task.parent_correlation_id {
            ctx = ctx.with_correlation_id(correlation);
        }

        let run = Runner::new(self.provider.as_ref(), &tools, &model, &self.request)
            .with_max_iterations(budget)
            .with_model_timeout(self.model_timeout)
            .run(vec![Message::system(system), Message::user(&task.task)], &ctx)
            .await;

        let (status, report) = report(&label, &task.task, &run);
        info!(subagent = %id, status = %status, iterations = run.iterations, "subagent finished");

        let mut outbound = OutboundMessage::new(&task.channel, &task.chat_id, report)
            .with_partial(status != SubagentStatus::Completed);
        outbound.session_key = task.parent_session_key.clone();
        outbound.correlation_id = task.parent_correlation_id.clone();
        if let Err(e) = self.bus.publish_outbound(outbound) {
            error!(subagent = %id, error = %e, "failed to publish subagent report");
        }

        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.push_back(CompletedSubagent {
            id,
            label,
            status,
            iterations: run.iterations,
            finished_at: Utc::now(),
        });
        while recent.len() > self.limits.recent_completions {
            recent.pop_front();
        }
    }

    fn default_prompt(&self, task: &str) -> String {
        format!(
            "# Subagent\n\n\
             You were spawned by the main agent to complete one task.\n\n\
             ## Task\n\
             {task}\n\n\
             ## Rules\n\
             1. Stay focused on the assigned task.\n\
             2. Your final answer is reported back to the user who asked for it.\n\
             3. You cannot spawn other subagents or see the main conversation.\n\
             4. Be concise but informative.\n\n\
             ## Workspace\n\
             {}",
            self.workspace.display()
        )
    }

    /// Subagents still running, oldest first.
    pub fn running(&self) -> Vec<RunningSubagent> {
        let mut running: Vec<RunningSubagent> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        running
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Most recent completions, oldest first.
    pub fn recent(&self) -> Vec<CompletedSubagent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Status and report text for a finished run.
fn report(label: &str, task: &str, run: &Run) -> (SubagentStatus, String) {
    let (status, result) = match &run.outcome {
        RunOutcome::Final(text) if text.trim().is_empty() => {
            (SubagentStatus::Completed, NO_RESPONSE.to_string())
        }
        RunOutcome::Final(text) => (SubagentStatus::Completed, text.clone()),
        RunOutcome::Truncated { partial } => (
            SubagentStatus::StoppedEarly,
            Run::truncated_reply(Some(partial.as_deref().unwrap_or(NO_RESPONSE)), run.iterations),
        ),
        RunOutcome::Failed(e) => (SubagentStatus::Failed, e.user_message().to_string()),
    };
    (
        status,
        format!("[Subagent '{label}' {status}]\n\nTask: {task}\n\nResult:\n{result}"),
    )
}

/// Short task id: 8 hex chars.
fn new_task_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tidebot_core::error::ProviderError;
    use tidebot_core::types::LlmResponse;

    use crate::runner::tests::{tool_call, MockProvider};
    use crate::sandbox::Sandbox;
    use crate::tools::filesystem::{ListDirTool, ReadFileTool};

    fn manager(dir: &TempDir, provider: Arc<MockProvider>) -> (Arc<SubagentManager>, Arc<MessageBus>) {
        let tools = ToolRegistry::new(Arc::new(Sandbox::restricted(dir.path())));
        tools.register(Arc::new(ReadFileTool));
        tools.register(Arc::new(ListDirTool));
        let bus = Arc::new(MessageBus::new());
        let manager = SubagentManager::new(provider, Arc::new(tools), bus.clone(), "mock-model");
        (Arc::new(manager), bus)
    }

    fn task() -> SubagentTask {
        SubagentTask::new("telegram:42", "telegram", "42", "Summarise the notes folder")
            .with_correlation_id(Some("msg-7".into()))
    }

    #[test]
    fn test_task_id_is_8_hex() {
        let id = new_task_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_task_id(), id);
    }

    #[test]
    fn test_display_label() {
        let short = SubagentTask::new("k", "c", "1", "short task");
        assert_eq!(short.display_label(), "short task");

        let long = SubagentTask::new("k", "c", "1", "a".repeat(40));
        assert_eq!(long.display_label(), format!("{}...", "a".repeat(30)));

        assert_eq!(short.with_label("nightly").display_label(), "nightly");
    }

    #[tokio::test]
    async fn test_completed_report() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::new(vec![Ok(LlmResponse::text("Three notes found."))]);
        let (manager, bus) = manager(&dir, provider.clone());

        let handle = manager.spawn(task().with_label("notes")).unwrap();
        assert!(handle.session_key.starts_with("telegram:42/subagent:"));
        assert_eq!(handle.session_key.len(), "telegram:42/subagent:".len() + 8);
        handle.join().await;

        let out = bus.consume_outbound().await.unwrap();
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.correlation_id.as_deref(), Some("msg-7"));
        assert!(!out.partial);
        assert!(out.content.starts_with("[Subagent 'notes' completed]"));
        assert!(out.content.contains("Task: Summarise the notes folder"));
        assert!(out.content.contains("Three notes found."));
        assert_eq!(bus.outbound_len(), 0);

        assert_eq!(manager.running_count(), 0);
        let recent = manager.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, SubagentStatus::Completed);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_partial() {
        for budget in [1u32, 2, 15] {
            let dir = TempDir::new().unwrap();
            let provider = MockProvider::endless_tools();
            let (manager, bus) = manager(&dir, provider.clone());

            manager
                .spawn(task().with_max_iterations(budget))
                .unwrap()
                .join()
                .await;

            let out = bus.consume_outbound().await.unwrap();
            assert!(out.partial);
            assert_eq!(out.correlation_id.as_deref(), Some("msg-7"));
            assert!(out.content.contains("stopped early"));
            assert!(out.content.contains(NO_RESPONSE));
            assert_eq!(bus.outbound_len(), 0, "exactly one report");
            assert_eq!(provider.calls(), budget as usize);
        }
    }

    #[tokio::test]
    async fn test_budget_is_capped_by_limit() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::endless_tools();
        let (manager, bus) = manager(&dir, provider.clone());
        let limit = manager.max_iterations();

        manager
            .spawn(task().with_max_iterations(u32::MAX))
            .unwrap()
            .join()
            .await;

        assert!(bus.consume_outbound().await.unwrap().partial);
        assert_eq!(provider.calls(), limit as usize);
    }

    #[tokio::test]
    async fn test_provider_failure_is_contained() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::new(vec![Err(ProviderError::Transport("connection reset".into()))]);
        let (manager, bus) = manager(&dir, provider);

        manager.spawn(task()).unwrap().join().await;
        let out = bus.consume_outbound().await.unwrap();
        assert!(out.partial);
        assert!(out.content.contains("failed]"));
        assert!(!out.content.contains("connection reset"));
        assert_eq!(manager.recent()[0].status, SubagentStatus::Failed);
    }

    #[tokio::test]
    async fn test_tool_subset_and_spawn_not_delegable() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::new(vec![
            Ok(tool_call("c1", "list_dir", json!({}))),
            Ok(LlmResponse::text("ok")),
        ]);
        let (manager, bus) = manager(&dir, provider.clone());

        let err = manager
            .spawn(task().with_tools(vec!["read_file".into(), "spawn".into(), "exec".into()]))
            .unwrap_err();
        assert_eq!(err, SpawnError::UnknownTools(vec!["spawn".into(), "exec".into()]));

        // list_dir is not in the subset, so the call is an unknown-tool observation.
        manager
            .spawn(task().with_tools(vec!["read_file".into()]))
            .unwrap()
            .join()
            .await;
        let out = bus.consume_outbound().await.unwrap();
        assert!(!out.partial);
        let seen = provider.seen.lock().unwrap();
        assert!(seen[1].last().unwrap().text().contains("unknown tool 'list_dir'"));
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let dir = TempDir::new().unwrap();
        let tools = ToolRegistry::new(Arc::new(Sandbox::restricted(dir.path())));
        let manager = Arc::new(
            SubagentManager::new(MockProvider::new(Vec::new()), Arc::new(tools), Arc::new(MessageBus::new()), "m")
                .with_limits(SubagentConfig {
                    max_iterations: 15,
                    max_concurrent: 0,
                    recent_completions: 16,
                }),
        );
        assert_eq!(
            manager.spawn(task()).unwrap_err(),
            SpawnError::LimitReached { limit: 0 }
        );
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        let script = (0..3).map(|i| Ok(LlmResponse::text(format!("r{i}")))).collect();
        let tools = ToolRegistry::new(Arc::new(Sandbox::restricted(dir.path())));
        let bus = Arc::new(MessageBus::new());
        let manager = Arc::new(
            SubagentManager::new(MockProvider::new(script), Arc::new(tools), bus, "m").with_limits(
                SubagentConfig {
                    max_iterations: 15,
                    max_concurrent: 8,
                    recent_completions: 2,
                },
            ),
        );
        for _ in 0..3 {
            manager.spawn(task()).unwrap().join().await;
        }
        assert_eq!(manager.recent().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_spawn() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let tools = ToolRegistry::new(Arc::new(Sandbox::restricted(dir.path())));
        let manager = Arc::new(
            SubagentManager::new(MockProvider::new(Vec::new()), Arc::new(tools), Arc::new(MessageBus::new()), "m")
                .with_shutdown(token.clone()),
        );
        token.cancel();
        assert_eq!(manager.spawn(task()).unwrap_err(), SpawnError::ShuttingDown);
    }
}
