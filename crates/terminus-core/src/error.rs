use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Invalid or unresolvable session input. Raised before any sandbox exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("instruction must not be empty")]
    EmptyInstruction,

    #[error("model name must not be empty")]
    EmptyModel,

    #[error("unknown parser {0:?}, expected one of: json, xml")]
    UnknownParser(String),

    #[error("temperature {0} is outside the range [0, 2]")]
    TemperatureOutOfRange(f32),

    #[error("max turns must be positive")]
    ZeroMaxTurns,

    #[error("invalid api base {0:?}, expected an http(s) URL")]
    InvalidApiBase(String),

    #[error("working directory {} does not exist or is not a directory", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("failed to resolve path {}: {source}", path.display())]
    ResolvePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a sandbox environment.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("environment is not running (state: {0})")]
    NotRunning(crate::environment::EnvState),

    #[error("failed to render environment definition: {0}")]
    Definition(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure reported by an agent during setup or run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("prompt error: {0}")]
    Prompt(#[from] terminus_pm::PmError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] EnvError),

    #[error("agent sdk error: {0}")]
    Sdk(String),

    #[error("agent finished with an error: {0}")]
    Failed(String),
}

/// Session-level outcome error, tagged with the lifecycle step that failed.
///
/// The wrapped error is part of the message, not a source.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(ConfigError),

    #[error("failed to provision environment: {0}")]
    Provisioning(EnvError),

    #[error("agent setup failed: {0}")]
    AgentSetup(AgentError),

    #[error("agent run failed: {0}")]
    AgentRun(AgentError),

    #[error("failed to report results: {0}")]
    Reporting(String),

    #[error("failed to tear down environment: {0}")]
    Teardown(EnvError),

    #[error("session cancelled")]
    Cancelled,

    #[error("session timed out after {0:?}")]
    TimedOut(Duration),
}

/// A failed session: the primary error, plus a teardown error when cleanup
/// also failed after it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SessionFailure {
    error: SessionError,
    teardown_error: Option<EnvError>,
}

impl SessionFailure {
    pub(crate) fn new(error: SessionError, teardown_error: Option<EnvError>) -> Self {
        Self {
            error,
            teardown_error,
        }
    }

    /// The error that ended the session.
    pub fn error(&self) -> &SessionError {
        &self.error
    }

    /// Secondary teardown failure, if cleanup failed after the primary error.
    pub fn teardown_error(&self) -> Option<&EnvError> {
        self.teardown_error.as_ref()
    }

    /// Consume the failure, returning the primary error.
    pub fn into_error(self) -> SessionError {
        self.error
    }
}

impl From<ConfigError> for SessionFailure {
    fn from(err: ConfigError) -> Self {
        Self::new(SessionError::Config(err), None)
    }
}
