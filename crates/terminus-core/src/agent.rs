//! Agent capability and the Claude-backed implementation.
//!
//! [`Agent`] is the contract the orchestrator needs: a `setup` step against
//! a started environment, then a single `run` that reports telemetry through
//! a [`RunContext`]. [`ClaudeAgent`] fulfils it with `claude-agent-sdk-rs`.
//! The model gets no host tools; its only tool is the in-process `exec`
//! tool from [`crate::sandbox_tool`], answered through
//! [`Environment::exec`].

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use claude_agent_sdk_rs::{
    ClaudeAgentOptions, ContentBlock, McpServerConfig, McpServers, McpToolResultContent, Message,
    PermissionMode, ResultMessage, SystemPrompt, ToolResult, create_sdk_mcp_server, tool,
};
use futures::StreamExt as _;
use serde_json::json;
use terminus_pm::PromptManager;
use tracing::{debug, error, info, instrument};

use crate::config::{ApiKey, ParserKind, SessionConfig};
use crate::context::{EPISODES_KEY, RunContext};
use crate::environment::{Environment, SANDBOX_WORKDIR};
use crate::error::AgentError;
use crate::sandbox_tool::{self, ExecClient};

/// A stateful task executor attached to one environment.
#[async_trait]
pub trait Agent: Send {
    /// Prepare to act inside a started environment.
    async fn setup(&mut self, env: &dyn Environment) -> Result<(), AgentError>;

    /// Work on `instruction` until done, recording cost and turn telemetry
    /// in `ctx`.
    async fn run(
        &mut self,
        instruction: &str,
        env: &dyn Environment,
        ctx: &mut RunContext,
    ) -> Result<(), AgentError>;
}

/// Built-in Claude Code tools that act on the host.
const HOST_TOOLS: &[&str] = &[
    "Bash",
    "BashOutput",
    "KillShell",
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "Task",
];

/// SDK process variable overriding the model API endpoint.
const SDK_BASE_URL_VAR: &str = "ANTHROPIC_BASE_URL";

/// SDK process variable carrying the model API key.
const SDK_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Agent driving Claude through the Claude Agent SDK.
#[derive(Debug)]
pub struct ClaudeAgent {
    prompt_manager: PromptManager,
    model: String,
    parser: ParserKind,
    temperature: f32,
    max_turns: u32,
    api_base: Option<String>,
    api_key: Option<ApiKey>,
    /// Host directory the SDK runs in; kept apart from the mounted workdir.
    scratch_dir: PathBuf,
    /// Rendered system prompt, set by `setup`.
    system_prompt: Option<String>,
}

impl ClaudeAgent {
    /// Create an agent for a session.
    ///
    /// Templates in `<logs_dir>/prompts`, when present, override the
    /// built-in ones.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Prompt` if templates cannot be loaded.
    pub fn new(config: &SessionConfig) -> Result<Self, AgentError> {
        let mut prompt_manager = PromptManager::new()?;
        let overrides = config.logs_dir().join("prompts");
        if overrides.is_dir() {
            prompt_manager.load_dir(&overrides)?;
            debug!(dir = %overrides.display(), "loaded prompt overrides");
        }

        Ok(Self {
            prompt_manager,
            model: config.model().to_owned(),
            parser: config.parser(),
            temperature: config.temperature(),
            max_turns: config.max_turns(),
            api_base: config.api_base().map(str::to_owned),
            api_key: config.api_key().cloned(),
            scratch_dir: config.logs_dir().to_path_buf(),
            system_prompt: None,
        })
    }

    fn render_system_prompt(&self) -> Result<String, AgentError> {
        let ctx = json!({
            "parser": self.parser.as_str(),
            "sandbox_workdir": SANDBOX_WORKDIR,
            "exec_tool": sandbox_tool::qualified_tool_name(),
        });
        Ok(self.prompt_manager.render("terminus/system", &ctx)?)
    }

    fn render_task_prompt(&self, instruction: &str) -> Result<String, AgentError> {
        let ctx = json!({
            "instruction": instruction,
            "sandbox_workdir": SANDBOX_WORKDIR,
            "max_turns": self.max_turns,
        });
        Ok(self.prompt_manager.render("terminus/task", &ctx)?)
    }

    /// Variables for the SDK process, pointing it at the configured API.
    fn sdk_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(base) = &self.api_base {
            env.insert(SDK_BASE_URL_VAR.to_owned(), base.clone());
        }
        if let Some(key) = &self.api_key {
            env.insert(SDK_API_KEY_VAR.to_owned(), key.expose().to_owned());
        }
        env
    }

    /// SDK options exposing only the sandbox `exec` tool.
    ///
    /// Host tools are disallowed, and the default permission mode denies any
    /// tool outside `allowed_tools` in a non-interactive session.
    fn build_options(&self, system_prompt: String, client: ExecClient) -> ClaudeAgentOptions {
        let mcp_servers = HashMap::from([(
            sandbox_tool::SERVER_NAME.to_owned(),
            sandbox_server(client),
        )]);
        ClaudeAgentOptions {
            system_prompt: Some(SystemPrompt::Text(system_prompt)),
            permission_mode: Some(PermissionMode::Default),
            allowed_tools: vec![sandbox_tool::qualified_tool_name()],
            disallowed_tools: HOST_TOOLS.iter().map(|t| (*t).to_owned()).collect(),
            mcp_servers: McpServers::Dict(mcp_servers),
            model: Some(self.model.clone()),
            max_turns: Some(self.max_turns),
            cwd: Some(self.scratch_dir.clone()),
            env: self.sdk_env(),
            ..Default::default()
        }
    }

    /// Copy run metadata that does not depend on the SDK result.
    fn record_settings(&self, ctx: &mut RunContext) {
        ctx.insert_metadata("model", self.model.clone());
        ctx.insert_metadata("parser", self.parser.as_str());
        ctx.insert_metadata("temperature", f64::from(self.temperature));
    }
}

/// In-process tool server whose `exec` tool forwards to `client`.
fn sandbox_server(client: ExecClient) -> McpServerConfig {
    let handler = move |args: serde_json::Value| {
        let client = client.clone();
        async move {
            let reply = client.call(&args).await;
            Ok::<_, anyhow::Error>(ToolResult {
                content: vec![McpToolResultContent::Text { text: reply.text }],
                is_error: reply.is_error,
            })
        }
    };
    let exec = tool!(
        sandbox_tool::TOOL_NAME,
        sandbox_tool::TOOL_DESCRIPTION,
        sandbox_tool::input_schema(),
        handler
    );
    McpServerConfig::Sdk(create_sdk_mcp_server(
        sandbox_tool::SERVER_NAME,
        env!("CARGO_PKG_VERSION"),
        vec![exec],
    ))
}

/// Write the SDK's final accounting into the run context.
fn record_result(ctx: &mut RunContext, cost_usd: Option<f64>, num_turns: u32) {
    if let Some(cost) = cost_usd {
        ctx.set_cost_usd(cost);
    }
    ctx.insert_metadata(EPISODES_KEY, num_turns);
}

#[async_trait]
impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(env = env.name()))]
    async fn setup(&mut self, env: &dyn Environment) -> Result<(), AgentError> {
        let probe = env.exec("pwd").await?;
        if !probe.success() {
            return Err(AgentError::Failed(format!(
                "sandbox shell probe failed: {}",
                probe.stderr.trim()
            )));
        }
        info!(
            cwd = probe.stdout.trim(),
            shell = %env.shell_command(),
            "sandbox shell reachable"
        );

        self.system_prompt = Some(self.render_system_prompt()?);
        Ok(())
    }

    #[instrument(skip_all, fields(model = %self.model, parser = %self.parser))]
    async fn run(
        &mut self,
        instruction: &str,
        env: &dyn Environment,
        ctx: &mut RunContext,
    ) -> Result<(), AgentError> {
        let system_prompt = match self.system_prompt.clone() {
            Some(prompt) => prompt,
            None => self.render_system_prompt()?,
        };
        let task_prompt = self.render_task_prompt(instruction)?;
        let (client, mut requests) = sandbox_tool::exec_channel();
        let options = self.build_options(system_prompt, client);
        self.record_settings(ctx);

        let mut stream = claude_agent_sdk_rs::query_stream(&task_prompt, Some(options))
            .await
            .map_err(|e| {
                error!(error = %e, "agent stream failed");
                AgentError::Sdk(format!(
                    "{e}. Check your network connection and API credentials."
                ))
            })?;

        // Tool calls are answered here, where the environment is borrowed.
        let mut result: Option<ResultMessage> = None;
        loop {
            tokio::select! {
                Some(request) = requests.recv() => sandbox_tool::serve(env, request).await,
                msg = stream.next() => {
                    let Some(msg) = msg else { break };
                    let msg = msg.map_err(|e| AgentError::Sdk(format!("stream error: {e}")))?;
                    match msg {
                        Message::Result(r) => result = Some(r),
                        Message::Assistant(assistant) => {
                            for block in &assistant.message.content {
                                if let ContentBlock::Text(text) = block {
                                    debug!(text = %text.text, "agent output");
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let result = result.ok_or_else(|| AgentError::Sdk("stream ended without result".to_owned()))?;
        record_result(ctx, result.total_cost_usd, result.num_turns);
        info!(turns = result.num_turns, "agent finished");

        if result.is_error {
            return Err(AgentError::Failed(
                result
                    .result
                    .unwrap_or_else(|| "agent reported an error result".to_owned()),
            ));
        }
        Ok(())
    }
}
