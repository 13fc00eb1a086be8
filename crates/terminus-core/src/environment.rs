//! Sandbox environment capability.
//!
//! The orchestrator drives any [`Environment`] implementation through
//! `start` and `stop`; agents use [`Environment::exec`] to act inside it.
//! [`EnvironmentSpec`] is the sandbox description derived from a
//! [`SessionConfig`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ApiKey, SessionConfig};
use crate::error::EnvError;

/// Path inside the sandbox where the working directory is mounted.
pub const SANDBOX_WORKDIR: &str = "/workspace";

/// Base image for the sandbox.
pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";

/// Variable carrying the model API key inside the sandbox.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Variable carrying the model API base URL inside the sandbox.
pub const API_BASE_VAR: &str = "OPENAI_API_BASE";

// ── Lifecycle state ──────────────────────────────────────────

/// Lifecycle of an environment handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvState {
    Unprovisioned,
    /// `start` was invoked but has not completed; resources may be partial.
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl EnvState {
    /// Whether the handle may own sandbox resources that `stop` must release.
    pub fn holds_resources(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ── Sandbox description ──────────────────────────────────

/// Resource quotas for the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub cpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 4096,
            storage_mb: 10240,
        }
    }
}

/// A host directory bound into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: PathBuf,
    pub sandbox: String,
}

/// Concrete sandbox description, derived from a [`SessionConfig`] right
/// before provisioning.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Directory where the sandbox definition is written.
    pub environment_dir: PathBuf,
    pub image: String,
    pub limits: ResourceLimits,
    pub mount: Mount,
    /// Variables injected into the sandbox. Values are credentials and are
    /// never written to disk.
    pub secrets: BTreeMap<String, ApiKey>,
    /// Non-secret variables injected into the sandbox.
    pub variables: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    /// Derive the sandbox description for a session.
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut secrets = BTreeMap::new();
        if let Some(key) = config.api_key() {
            secrets.insert(API_KEY_VAR.to_owned(), key.clone());
        }

        let mut variables = BTreeMap::new();
        if let Some(base) = config.api_base() {
            variables.insert(API_BASE_VAR.to_owned(), base.to_owned());
        }

        Self {
            environment_dir: config.environment_dir(),
            image: DEFAULT_IMAGE.to_owned(),
            limits: ResourceLimits::default(),
            mount: Mount {
                host: config.working_dir().to_path_buf(),
                sandbox: SANDBOX_WORKDIR.to_owned(),
            },
            secrets,
            variables,
        }
    }
}

// ── Capability ───────────────────────────────────────────────

/// Result of a command executed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An isolated execution sandbox.
///
/// Each handle is started at most once and stopped at most once by the
/// orchestrator. `stop` must succeed as a no-op on a handle that never
/// created anything, and must release partial resources after a failed
/// `start`.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    fn state(&self) -> EnvState;

    /// Host command prefix that runs a shell command inside the sandbox
    /// when the command string is appended as one argument.
    fn shell_command(&self) -> String;

    async fn start(&mut self, force_build: bool) -> Result<(), EnvError>;

    async fn stop(&mut self, delete: bool) -> Result<(), EnvError>;

    async fn exec(&self, command: &str) -> Result<ExecOutput, EnvError>;
}
