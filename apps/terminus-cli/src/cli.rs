use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use terminus_core::{
    ApiKey, CancelHandle, CancelSignal, ClaudeAgent, DEFAULT_MAX_TURNS, DEFAULT_MODEL,
    DEFAULT_TEMPERATURE, DockerEnvironment, EventSink, Orchestrator, SessionEvent, SessionEvents,
    SessionInput,
};
use tokio::task::JoinError;
use tracing::{info, warn};

use crate::logging;

const RULE: &str = "==================================================";

#[derive(Debug, Parser)]
#[command(
    name = "terminus",
    about = "Terminal-based AI agent for task execution"
)]
pub struct Cli {
    /// Task instruction to execute
    pub instruction: String,

    /// Model name to use
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Directory for logs and the generated sandbox definition
    #[arg(short, long, default_value = "./terminus_logs")]
    pub logs_dir: PathBuf,

    /// Response format for the agent (json or xml)
    #[arg(short, long, default_value = "json")]
    pub parser: String,

    /// Sampling temperature
    #[arg(short, long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Maximum number of agent turns
    #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
    pub max_turns: u32,

    /// Model API base URL, used by the agent and injected into the sandbox
    #[arg(long)]
    pub api_base: Option<String>,

    /// Model API key, used by the agent and injected into the sandbox
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Working directory to mount in the sandbox
    #[arg(short, long, default_value = ".")]
    pub working_dir: PathBuf,

    /// Pull the sandbox image before starting
    #[arg(long)]
    pub force_build: bool,

    /// Abort the session after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl Cli {
    /// Convert the parsed arguments into an unvalidated session request.
    pub fn session_input(&self) -> SessionInput {
        SessionInput {
            instruction: self.instruction.clone(),
            model: self.model.clone(),
            parser: self.parser.clone(),
            temperature: self.temperature,
            max_turns: self.max_turns,
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone().map(ApiKey::new),
            logs_dir: self.logs_dir.clone(),
            working_dir: self.working_dir.clone(),
            force_build: self.force_build,
            timeout: self.timeout.map(Duration::from_secs),
        }
    }

    /// Validate the request, run the session and print its progress.
    ///
    /// Session failures are returned as [`terminus_core::SessionFailure`]
    /// inside the `anyhow` error so the caller can report teardown notes.
    pub async fn run(self) -> Result<()> {
        let orchestrator = Orchestrator::from_input(self.session_input())?;
        let config = orchestrator.config();

        let _guard = logging::init_tracing(config.logs_dir())?;
        info!(logs_dir = %config.logs_dir().display(), "logging initialized");

        println!("Starting Terminus agent...");
        println!("Model: {}", config.model());
        println!("Parser: {}", config.parser());
        println!("Logs directory: {}", config.logs_dir().display());
        println!("Working directory: {}", config.working_dir().display());
        println!("Instruction: {}", config.instruction());

        let mut agent = ClaudeAgent::new(config)?;

        let (sink, events) = EventSink::channel();
        let orchestrator = orchestrator.with_events(sink);
        let printer = tokio::spawn(print_events(events));

        let (handle, mut cancel) = CancelSignal::channel();
        tokio::spawn(forward_interrupts(handle));

        let result = orchestrator
            .run(DockerEnvironment::new, &mut agent, &mut cancel)
            .await;

        // Closes the event channel so the printer drains and exits.
        drop(orchestrator);
        let printed = printer.await;

        settle(result, printed)?;
        Ok(())
    }
}

/// Combine the session result with the printer task's outcome. The session
/// error wins; a printer failure is only logged.
fn settle<T, E>(result: Result<T, E>, printed: Result<(), JoinError>) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Err(err) = printed {
        warn!(error = %err, "progress printer stopped unexpectedly");
    }
    Ok(result?)
}

/// Turn each Ctrl-C into a cancellation signal for the session.
async fn forward_interrupts(handle: CancelHandle) {
    while tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling session");
        handle.cancel();
    }
}

async fn print_events(mut events: SessionEvents) {
    while let Some(event) = events.next().await {
        if let Some(text) = format_event(&event) {
            println!("{text}");
        }
    }
}

/// Human-readable progress line(s) for an event.
fn format_event(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::ProvisioningStarted => "\nStarting Docker environment...".to_owned(),
        SessionEvent::ProvisioningFinished => "Docker environment started".to_owned(),
        SessionEvent::SetupStarted => "\nSetting up agent...".to_owned(),
        SessionEvent::SetupFinished => "Agent ready".to_owned(),
        SessionEvent::RunStarted { instruction } => {
            format!("\nRunning agent on task: {instruction}\n")
        }
        SessionEvent::Completed(report) => {
            let mut lines = vec![format!("\n{RULE}"), "✓ Task completed!".to_owned()];
            if let Some(cost) = report.cost_usd() {
                lines.push(format!("Total cost: ${cost:.4}"));
            }
            if let Some(turns) = report.turns() {
                lines.push(format!("Turns: {turns}"));
            }
            lines.push(RULE.to_owned());
            lines.join("\n")
        }
        // The primary error is printed once, on exit.
        SessionEvent::Failed(_) => return None,
        SessionEvent::CleanupStarted => "\nCleaning up Docker environment...".to_owned(),
        SessionEvent::CleanupFinished => "Docker environment removed".to_owned(),
        SessionEvent::CleanupFailed(_) => "Cleanup failed".to_owned(),
    };
    Some(text)
}
