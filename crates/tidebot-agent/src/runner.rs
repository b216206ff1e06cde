//! The request-act-observe loop shared by the agent loop and subagents.
//!
//! One run alternates between calling the model and executing the tool
//! calls it asks for, until the model answers in plain text or the
//! iteration budget is spent. With a budget of N the provider is called at
//! most N times.

use std::time::Duration;

use tracing::{debug, error, info};

use tidebot_core::error::TurnError;
use tidebot_core::types::{Message, ToolOutcome};
use tidebot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::tools::{ToolContext, ToolRegistry};

/// Reply used when the model finishes without saying anything.
pub const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The model answered without asking for tools.
    Final(String),
    /// The budget ran out. Carries the last text the model emitted, if any.
    Truncated { partial: Option<String> },
    /// The run could not continue.
    Failed(TurnError),
}

/// Everything a run produced.
#[derive(Debug)]
pub struct Run {
    pub outcome: RunOutcome,
    /// Messages added during the run, in order: assistant tool-call
    /// requests, tool results and the final assistant answer.
    pub messages: Vec<Message>,
    /// Number of provider calls made.
    pub iterations: u32,
}

impl Run {
    /// Text to show for a truncated run.
    pub fn truncated_reply(partial: Option<&str>, iterations: u32) -> String {
        let notice = format!(
            "[Stopped after {iterations} tool-call round{}; the answer may be incomplete.]",
            if iterations == 1 { "" } else { "s" }
        );
        match partial {
            Some(text) => format!("{text}\n\n{notice}"),
            None => notice,
        }
    }
}

/// Drives one request-act-observe loop.
pub struct Runner<'a> {
    provider: &'a dyn LlmProvider,
    tools: &'a ToolRegistry,
    model: &'a str,
    request: &'a LlmRequestConfig,
    max_iterations: u32,
    model_timeout: Duration,
}

impl<'a> Runner<'a> {
    pub fn new(
        provider: &'a dyn LlmProvider,
        tools: &'a ToolRegistry,
        model: &'a str,
        request: &'a LlmRequestConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            model,
            request,
            max_iterations: 20,
            model_timeout: Duration::from_secs(120),
        }
    }

    /// Budget of model calls; at least one.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Run until a final answer, budget exhaustion or failure.
    ///
    /// `context` is the assembled conversation ending with the user message.
    pub async fn run(&self, mut context: Vec<Message>, ctx: &ToolContext) -> Run {
        let definitions = self.tools.definitions();
        let mut added = Vec::new();
        let mut last_text: Option<String> = None;
        let mut iterations = 0;

        let outcome = loop {
            if iterations >= self.max_iterations {
                info!(
                    session = %ctx.session_key,
                    iterations,
                    "iteration budget exhausted, truncating"
                );
                break RunOutcome::Truncated { partial: last_text };
            }
            iterations += 1;

            debug!(
                session = %ctx.session_key,
                iteration = iterations,
                model = self.model,
                messages = context.len(),
                "calling model"
            );
            let call = self.provider.chat(&context, &definitions, self.model, self.request);
            let response = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break RunOutcome::Failed(TurnError::Cancelled),
                res = tokio::time::timeout(self.model_timeout, call) => match res {
                    Err(_) => break RunOutcome::Failed(TurnError::Timeout(self.model_timeout.as_secs())),
                    Ok(Err(e)) => {
                        error!(session = %ctx.session_key, error = %e, "provider call failed");
                        break RunOutcome::Failed(TurnError::Provider(e));
                    }
                    Ok(Ok(response)) => response,
                },
            };

            if !response.has_tool_calls() {
                let text = response
                    .content
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| EMPTY_REPLY.to_string());
                added.push(Message::assistant(text.clone()));
                break RunOutcome::Final(text);
            }

            if let Some(text) = response.content.as_ref().filter(|t| !t.trim().is_empty()) {
                last_text = Some(text.clone());
            }
            let request = Message::assistant_tool_calls(response.content, response.tool_calls.clone());
            context.push(request.clone());
            added.push(request);

            for call in &response.tool_calls {
                info!(
                    session = %ctx.session_key,
                    tool = %call.name,
                    iteration = iterations,
                    "executing tool call"
                );
                let result = match self.tools.execute(&call.name, &call.arguments, ctx).await {
                    Ok(output) => Message::tool_result(&call.id, &call.name, output, ToolOutcome::Success),
                    Err(e) => Message::tool_result(&call.id, &call.name, e.observation(), ToolOutcome::Error),
                };
                context.push(result.clone());
                added.push(result);
            }
        };

        Run {
            outcome,
            messages: added,
            iterations,
        }
    }
}
