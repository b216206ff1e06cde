//! Agent loop: consumes inbound messages, runs one turn per message and
//! publishes the reply.
//!
//! Each turn holds the session lock for its whole duration. Slash commands
//! are answered straight from the [`CommandTable`]; everything else goes
//! through context building and the [`Runner`]. Whatever happens, the turn
//! is persisted in one `commit_turn` call, so history never holds half a
//! turn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tidebot_core::audit::AuditLog;
use tidebot_core::bus::queue::MessageBus;
use tidebot_core::bus::types::{InboundMessage, OutboundMessage};
use tidebot_core::config::Config;
use tidebot_core::error::TurnError;
use tidebot_core::session::SessionManager;
use tidebot_core::types::{Message, TurnMarker};
use tidebot_providers::retry::{RetryPolicy, RetryProvider};
use tidebot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::commands::{CommandContext, CommandTable};
use crate::context::ContextBuilder;
use crate::runner::{Run, RunOutcome, Runner};
use crate::sandbox::Sandbox;
use crate::skills::SkillSource;
use crate::subagent::SubagentManager;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::secrets::SecretsTool;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::{ToolContext, ToolRegistry};

/// Name the agent introduces itself with.
pub const AGENT_NAME: &str = "Tidebot";

/// Where tool audit logs live, relative to the workspace.
const AUDIT_DIR: &str = ".tidebot/audit";

/// How long a session worker waits for its next message before exiting.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(300);

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The top-level consumer of the message bus.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmProvider>,
    workspace: PathBuf,
    /// Model used when the session has no override.
    model: String,
    request: LlmRequestConfig,
    max_iterations: u32,
    model_timeout: Duration,
    tools: Arc<ToolRegistry>,
    subagents: Arc<SubagentManager>,
    context: ContextBuilder,
    sessions: Arc<SessionManager>,
    commands: CommandTable,
    shutdown: CancellationToken,
    worker_idle: Duration,
    active_workers: AtomicUsize,
}

impl AgentLoop {
    /// Wire up the loop from `config`.
    ///
    /// `provider` is wrapped in a [`RetryProvider`] using the configured
    /// retry policy. Fails if the workspace or audit directory cannot be
    /// created.
    pub fn new(
        config: &Config,
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self> {
        let defaults = &config.agents.defaults;
        let workspace = defaults.workspace_path();
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("cannot create workspace {}", workspace.display()))?;

        let provider: Arc<dyn LlmProvider> = Arc::new(RetryProvider::new(
            provider,
            RetryPolicy::from(&config.provider.retry),
        ));
        let model = if defaults.model.is_empty() {
            provider.default_model().to_string()
        } else {
            defaults.model.clone()
        };
        let request = LlmRequestConfig {
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
        };
        let model_timeout = Duration::from_secs(defaults.model_timeout_secs);
        let shutdown = CancellationToken::new();

        let audit = AuditLog::new(workspace.join(AUDIT_DIR), config.tools.audit_result_max_chars)
            .context("cannot create audit log directory")?;
        let secrets_file = config.tools.secrets_file();
        let sandbox = Sandbox::new(&workspace, config.tools.restrict_to_workspace)
            .with_protected(audit.dir())
            .with_protected(&secrets_file)
            .with_protected(sessions.sessions_dir());
        let base = ToolRegistry::new(Arc::new(sandbox))
        .with_audit(Arc::new(audit))
        .with_timeout(Duration::from_secs(config.tools.timeout_secs));
        base.register(Arc::new(ReadFileTool));
        base.register(Arc::new(WriteFileTool));
        base.register(Arc::new(EditFileTool));
        base.register(Arc::new(ListDirTool));
        base.register(Arc::new(ExecTool::new(Some(config.tools.exec.timeout))));
        base.register(Arc::new(SecretsTool::new(secrets_file)));

        let subagents = Arc::new(
            SubagentManager::new(provider.clone(), Arc::new(base.fork()), bus.clone(), &model)
                .with_request_config(request.clone())
                .with_limits(defaults.subagent.clone())
                .with_model_timeout(model_timeout)
                .with_shutdown(shutdown.child_token()),
        );
        base.register(Arc::new(SpawnTool::new(subagents.clone())));
        let tools = Arc::new(base);

        let context = ContextBuilder::new(&workspace, AGENT_NAME)
            .with_bootstrap_files(defaults.bootstrap_files.clone())
            .with_history_turns(defaults.history_turns)
            .with_char_budget(defaults.context_char_budget);

        let commands = CommandTable::builtin()?;

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = defaults.max_tool_iterations,
            restricted = config.tools.restrict_to_workspace,
            "agent loop initialized"
        );

        Ok(Self {
            bus,
            provider,
            workspace,
            model,
            request,
            max_iterations: defaults.max_tool_iterations,
            model_timeout,
            tools,
            subagents,
            context,
            sessions,
            commands,
            shutdown,
            worker_idle: DEFAULT_WORKER_IDLE,
            active_workers: AtomicUsize::new(0),
        })
    }

    /// Let session workers exit after `idle` without messages.
    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    /// Session workers currently alive in [`run`](Self::run).
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Replace the skill source (defaults to `skills/` in the workspace).
    pub fn with_skills(mut self, skills: Arc<dyn SkillSource>) -> Self {
        self.context = self.context.with_skills(skills);
        self
    }

    /// Consume the inbound queue until the bus closes.
    ///
    /// Messages are routed to one worker per session key: turns of a session
    /// run in arrival order, different sessions run concurrently. A worker
    /// idle for longer than the idle timeout exits and is dropped from the
    /// table; the next message for its session starts a fresh one. On close,
    /// in-flight tools and subagents are cancelled and workers are drained.
    pub async fn run(self: Arc<Self>) {
        info!("agent loop started, waiting for messages");
        let mut workers: HashMap<String, mpsc::UnboundedSender<InboundMessage>> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                inbound = self.bus.consume_inbound() => {
                    let Ok(msg) = inbound else { break };
                    self.dispatch(msg, &mut workers, &mut tasks);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(key) => debug!(session = %key, "session worker exited"),
                        Err(e) => error!(error = %e, "session worker panicked"),
                    }
                    workers.retain(|_, queue| !queue.is_closed());
                }
            }
            self.active_workers.store(workers.len(), Ordering::Relaxed);
        }

        info!("inbound closed, agent loop exiting");
        self.shutdown.cancel();
        drop(workers);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "session worker panicked");
            }
        }
        self.active_workers.store(0, Ordering::Relaxed);
    }

    /// Hand `msg` to its session's worker, starting one if there is none or
    /// the old one has exited.
    fn dispatch(
        self: &Arc<Self>,
        msg: InboundMessage,
        workers: &mut HashMap<String, mpsc::UnboundedSender<InboundMessage>>,
        tasks: &mut JoinSet<String>,
    ) {
        let key = msg.session_key();
        debug!(session = %key, id = %msg.id, "received message");

        let msg = match workers.get(&key) {
            Some(queue) => match queue.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };

        let (queue, rx) = mpsc::unbounded_channel();
        if queue.send(msg).is_ok() {
            workers.insert(key.clone(), queue);
            tasks.spawn(Arc::clone(self).session_worker(key, rx));
        }
    }

    /// Process `queue` in order until it closes or stays empty for the idle
    /// timeout. Returns the session key.
    async fn session_worker(
        self: Arc<Self>,
        key: String,
        mut queue: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> String {
        loop {
            let msg = match tokio::time::timeout(self.worker_idle, queue.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    // Refuse new sends, then finish what already arrived.
                    queue.close();
                    while let Some(msg) = queue.recv().await {
                        self.handle(&key, &msg).await;
                    }
                    debug!(session = %key, "session worker idle, exiting");
                    break;
                }
            };
            self.handle(&key, &msg).await;
        }
        key
    }

    async fn handle(&self, key: &str, msg: &InboundMessage) {
        let reply = self.process_message(msg).await;
        if self.bus.publish_outbound(reply).is_err() {
            warn!(session = %key, "bus closed, reply dropped");
        }
    }

    /// Run one turn for `msg` and return the reply without publishing it.
    pub async fn process_message(&self, msg: &InboundMessage) -> OutboundMessage {
        let base_key = msg.session_key();
        let key = self.sessions.active_key(&base_key);
        let _lock = self.sessions.lock(&key).await;

        if let Some((command, args)) = self.commands.parse(&msg.content) {
            info!(session = %key, command = command.name, "slash command");
            let ctx = CommandContext {
                base_key: &base_key,
                args,
                sessions: &self.sessions,
                tools: &self.tools,
                subagents: &self.subagents,
                default_model: &self.model,
                table: &self.commands,
            };
            return self.reply(msg, &key, (command.handler)(&ctx));
        }

        let session = match self.sessions.load(&key) {
            Ok(session) => session,
            Err(e) => {
                // The stored session stays untouched so it can be inspected.
                let err = TurnError::Context(e.to_string());
                error!(session = %key, error = %e, class = err.class(), "session unreadable");
                return self.reply(msg, &key, err.user_message());
            }
        };
        let turn = session.turns + 1;
        info!(session = %key, turn, channel = %msg.channel, "turn started");

        let user = Message::user(&msg.content);
        let payload = match self.context.build(&session, msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!(session = %key, turn, error = %e, class = e.class(), "context build failed");
                let marker = Message::assistant_marked(
                    e.user_message(),
                    TurnMarker::Failed {
                        class: e.class().to_string(),
                    },
                );
                self.commit(&key, vec![user, marker]);
                return self.reply(msg, &key, e.user_message());
            }
        };
        if payload.truncated {
            warn!(session = %key, turn, "context truncated to fit the character budget");
        }

        let model = session.model_override.as_deref().unwrap_or(&self.model);
        let tool_ctx = ToolContext::new(&key, turn)
            .with_origin(&msg.channel, &msg.chat_id)
            .with_correlation_id(&msg.id)
            .with_cancel(self.shutdown.child_token());
        let run = Runner::new(self.provider.as_ref(), &self.tools, model, &self.request)
            .with_max_iterations(self.max_iterations)
            .with_model_timeout(self.model_timeout)
            .run(payload.messages, &tool_ctx)
            .await;

        let (text, transcript) = Self::finish(user, run);
        self.commit(&key, transcript);
        info!(session = %key, turn, "turn finished");
        self.reply(msg, &key, text)
    }

    /// Reply text and the messages to persist for a finished run.
    fn finish(user: Message, run: Run) -> (String, Vec<Message>) {
        let Run {
            outcome,
            messages,
            iterations,
        } = run;
        let mut transcript = vec![user];
        match outcome {
            RunOutcome::Final(text) => {
                transcript.extend(messages);
                (text, transcript)
            }
            RunOutcome::Truncated { partial } => {
                let text = Run::truncated_reply(partial.as_deref(), iterations);
                transcript.extend(messages);
                transcript.push(Message::assistant_marked(&text, TurnMarker::Truncated));
                (text, transcript)
            }
            RunOutcome::Failed(e @ (TurnError::Timeout(_) | TurnError::Cancelled)) => {
                warn!(error = %e, iterations, "turn cancelled");
                transcript.extend(messages);
                transcript.push(Message::assistant_marked(
                    e.user_message(),
                    TurnMarker::Cancelled,
                ));
                (e.user_message().to_string(), transcript)
            }
            RunOutcome::Failed(e) => {
                error!(error = %e, class = e.class(), iterations, "turn failed");
                transcript.push(Message::assistant_marked(
                    e.user_message(),
                    TurnMarker::Failed {
                        class: e.class().to_string(),
                    },
                ));
                (e.user_message().to_string(), transcript)
            }
        }
    }

    fn commit(&self, key: &str, transcript: Vec<Message>) {
        if let Err(e) = self.sessions.commit_turn(key, transcript) {
            error!(session = key, error = %e, "failed to persist turn");
        }
    }

    fn reply(&self, msg: &InboundMessage, key: &str, text: impl Into<String>) -> OutboundMessage {
        let mut reply = OutboundMessage::reply_to(msg, text);
        reply.session_key = key.to_string();
        reply
    }

    /// Run one turn outside the bus, for hosts that embed the loop.
    pub async fn process_direct(&self, text: &str, session_key: &str) -> String {
        let msg = InboundMessage::new("cli", "user", "direct", text).with_session_key(session_key);
        self.process_message(&msg).await.content
    }

    /// Cancel in-flight tools and subagents.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn workspace(&self) -> &std::path::Path {
        &self.workspace
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
