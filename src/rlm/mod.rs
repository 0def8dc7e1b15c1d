pub mod bridge;
pub mod exec;
pub mod parser;
pub mod prompts;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::RlmConfig;
use crate::error::{Result, RlmError};
use crate::llm::{LlmClient, Message, ModelClient, ModelParams, ModelRequest};

use bridge::RecursiveBridge;
use exec::{PersistentSession, SessionSetup};
use parser::Terminal;

/// Read-only snapshot of the current (or most recent) completion's progress.
/// Counters restart with every completion on the same engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub model_calls: u32,
    pub iterations: u32,
    pub depth: u32,
}

#[derive(Debug, Default)]
struct StatsCell {
    model_calls: AtomicU32,
    iterations: AtomicU32,
}

/// Per-call overrides on top of the configured model and parameters.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: Option<String>,
    pub params: ModelParams,
}

/// Recursive language model engine.
///
/// Each completion runs one session: the document is bound to `context`
/// inside a Python sandbox, and the model is asked for code until it emits
/// a terminal statement or a limit trips. Clones share configuration,
/// client and statistics.
#[derive(Clone)]
pub struct Rlm {
    config: Arc<RlmConfig>,
    client: Arc<dyn ModelClient>,
    depth: u32,
    stats: Arc<StatsCell>,
}

impl Rlm {
    pub fn new(config: RlmConfig, client: Arc<dyn ModelClient>) -> Self {
        Self {
            config: Arc::new(config),
            client,
            depth: 0,
            stats: Arc::new(StatsCell::default()),
        }
    }

    /// Engine backed by the OpenAI-compatible HTTP client.
    pub fn with_http_client(config: RlmConfig) -> anyhow::Result<Self> {
        let client = LlmClient::from_env()?;
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Start sessions at `depth` instead of 0.
    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn config(&self) -> &RlmConfig {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        Stats {
            model_calls: self.stats.model_calls.load(Ordering::SeqCst),
            iterations: self.stats.iterations.load(Ordering::SeqCst),
            depth: self.depth,
        }
    }

    /// Independent engine one level deeper: same configuration and client,
    /// fresh statistics.
    pub(crate) fn spawn_child(&self) -> Rlm {
        Rlm {
            config: self.config.clone(),
            client: self.client.clone(),
            depth: self.depth + 1,
            stats: Arc::new(StatsCell::default()),
        }
    }

    pub async fn completion(&self, query: &str, context: &str) -> Result<String> {
        self.completion_with(query, context, &CallOptions::default())
            .await
    }

    /// Blocking variant for synchronous callers. Inside an async runtime the
    /// completion runs on a separate thread with its own runtime, so this
    /// never nests runtimes; prefer [`completion`](Self::completion) there.
    pub fn completion_blocking(&self, query: &str, context: &str) -> Result<String> {
        let run = || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(RlmError::Runtime)?;
            runtime.block_on(self.completion(query, context))
        };

        if Handle::try_current().is_err() {
            return run();
        }
        std::thread::scope(|scope| match scope.spawn(run).join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        })
    }

    /// Run one session to completion.
    ///
    /// When only one of `query` / `context` is given it is treated as the
    /// document and the model is left to infer the task.
    pub async fn completion_with(
        &self,
        query: &str,
        context: &str,
        options: &CallOptions,
    ) -> Result<String> {
        let (query, context) = if !query.is_empty() && context.is_empty() {
            ("", query)
        } else {
            (query, context)
        };

        self.stats.model_calls.store(0, Ordering::SeqCst);
        self.stats.iterations.store(0, Ordering::SeqCst);

        let max_depth = self.config.max_depth;
        if self.depth >= max_depth {
            warn!(depth = self.depth, max_depth, "Refusing to start session");
            return Err(RlmError::MaxDepth(max_depth));
        }

        let context_chars = context.chars().count();
        info!(
            depth = self.depth,
            context_chars,
            query_len = query.len(),
            "Starting RLM session"
        );

        let setup = SessionSetup::new(context, query)
            .with_bridge(RecursiveBridge::new(self.clone(), Handle::current()))
            .with_max_output_chars(self.config.max_output_chars);
        let session = PersistentSession::spawn(setup).await?;

        let mut messages = vec![
            Message::system(prompts::build_system_prompt(
                context_chars,
                self.depth,
                self.config.language,
            )),
            Message::user(prompts::build_user_prompt(query)),
        ];

        for i in 0..self.config.max_iterations {
            let iteration = i + 1;
            self.stats.iterations.store(iteration, Ordering::SeqCst);

            let response = self.call_model(&messages, options).await?;

            debug!(
                depth = self.depth,
                iteration,
                response_len = response.len(),
                "─── LLM Response ───"
            );
            for line in response.lines().take(30) {
                debug!("  │ {}", line);
            }

            if parser::is_terminal(&response) {
                match self.resolve(&response, &session).await {
                    Some(answer) => {
                        info!(
                            depth = self.depth,
                            iteration,
                            answer_len = answer.len(),
                            "RLM complete"
                        );
                        return Ok(answer);
                    }
                    None => debug!(iteration, "Terminal marker did not resolve, continuing"),
                }
            }

            let observation = session.observe(&response).await;

            debug!(
                iteration,
                output_len = observation.len(),
                "─── Code Output ───"
            );
            for line in observation.lines().take(30) {
                debug!("  │ {}", line);
            }

            messages.push(Message::assistant(response));
            messages.push(Message::user(observation));
        }

        warn!(
            depth = self.depth,
            max_iterations = self.config.max_iterations,
            "RLM hit max iterations"
        );
        Err(RlmError::MaxIterations(self.config.max_iterations))
    }

    async fn resolve(&self, response: &str, session: &PersistentSession) -> Option<String> {
        match parser::parse(response)? {
            Terminal::Literal(answer) => Some(answer),
            Terminal::Variable(name) => {
                let value = session.lookup(&name).await;
                if value.is_none() {
                    debug!(variable = %name, "FINAL_VAR names an undefined variable");
                }
                value
            }
        }
    }

    async fn call_model(&self, messages: &[Message], options: &CallOptions) -> Result<String> {
        self.stats.model_calls.fetch_add(1, Ordering::SeqCst);

        let model = options
            .model
            .as_deref()
            .unwrap_or_else(|| self.config.model_for_depth(self.depth));
        let params = self.config.params.merged(&options.params);

        self.client
            .complete(ModelRequest {
                model,
                messages,
                params: &params,
            })
            .await
            .map_err(RlmError::Model)
    }
}
