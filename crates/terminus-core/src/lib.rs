//! Session orchestration for Terminus.
//!
//! Provisions a sandbox [`Environment`], attaches an [`Agent`] to it, runs a
//! single instruction and always tears the sandbox down. See
//! [`Orchestrator`] for the lifecycle and its error and cancellation rules.

mod agent;
mod config;
mod context;
mod docker;
mod environment;
mod error;
mod events;
mod orchestrator;
mod sandbox_tool;

pub use agent::{Agent, ClaudeAgent};
pub use config::{
    ApiKey, DEFAULT_MAX_TURNS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, ParserKind, SessionConfig,
    SessionInput,
};
pub use context::{EPISODES_KEY, RunContext};
pub use docker::{DOCKER_PROGRAM, DockerEnvironment};
pub use environment::{
    EnvState, Environment, EnvironmentSpec, ExecOutput, Mount, ResourceLimits, SANDBOX_WORKDIR,
};
pub use error::{AgentError, ConfigError, EnvError, SessionError, SessionFailure};
pub use events::{CancelHandle, CancelSignal, EventSink, SessionEvent, SessionEvents};
pub use orchestrator::{Orchestrator, SessionReport, SessionState};
