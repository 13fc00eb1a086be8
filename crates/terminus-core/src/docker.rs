//! Docker compose backed sandbox.
//!
//! [`DockerEnvironment`] writes a single-service compose file into the
//! environment directory and drives it with the `docker compose` CLI via
//! `tokio::process::Command`. Credentials are passed to the compose process
//! through its environment; the file only lists their names.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::environment::{EnvState, Environment, EnvironmentSpec, ExecOutput};
use crate::error::EnvError;

/// Default `docker` executable, resolved through `PATH`.
pub const DOCKER_PROGRAM: &str = "docker";

/// Compose project name for CLI sessions.
pub const PROJECT_NAME: &str = "terminus-cli";

/// Name of the single compose service.
pub const SERVICE_NAME: &str = "main";

/// File name of the generated compose definition.
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yaml";

// ── Compose definition ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    command: String,
    working_dir: String,
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment: Vec<String>,
    cpus: u32,
    mem_limit: String,
}

/// Render the compose definition for a spec.
///
/// Secrets appear by name only, so compose takes their values from the
/// environment of the `docker compose` process.
fn render_compose(spec: &EnvironmentSpec) -> Result<String, EnvError> {
    let environment = spec
        .secrets
        .keys()
        .cloned()
        .chain(spec.variables.iter().map(|(k, v)| format!("{k}={v}")))
        .collect();

    let service = ComposeService {
        image: spec.image.clone(),
        command: "sleep infinity".to_owned(),
        working_dir: spec.mount.sandbox.clone(),
        volumes: vec![format!(
            "{}:{}",
            spec.mount.host.display(),
            spec.mount.sandbox
        )],
        environment,
        cpus: spec.limits.cpus,
        mem_limit: format!("{}m", spec.limits.memory_mb),
    };

    let file = ComposeFile {
        services: BTreeMap::from([(SERVICE_NAME.to_owned(), service)]),
    };
    Ok(serde_yaml::to_string(&file)?)
}

// ── Environment ──────────────────────────────────────────────

/// A sandbox provisioned with `docker compose`.
#[derive(Debug)]
pub struct DockerEnvironment {
    spec: EnvironmentSpec,
    project: String,
    program: PathBuf,
    state: EnvState,
    /// Lifecycle command left running by a dropped `start` or `stop`.
    in_flight: Option<Child>,
}

impl DockerEnvironment {
    pub fn new(spec: EnvironmentSpec) -> Self {
        Self {
            spec,
            project: PROJECT_NAME.to_owned(),
            program: PathBuf::from(DOCKER_PROGRAM),
            state: EnvState::Unprovisioned,
            in_flight: None,
        }
    }

    /// Use another `docker` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Path of the generated compose file.
    pub fn compose_path(&self) -> PathBuf {
        self.spec.environment_dir.join(COMPOSE_FILE_NAME)
    }

    /// Arguments shared by every `docker` invocation for this project.
    fn base_args(&self) -> Vec<String> {
        vec![
            "compose".to_owned(),
            "-p".to_owned(),
            self.project.clone(),
            "-f".to_owned(),
            self.compose_path().display().to_string(),
        ]
    }

    fn write_definition(&self) -> Result<(), EnvError> {
        let content = render_compose(&self.spec)?;
        std::fs::create_dir_all(&self.spec.environment_dir)?;
        std::fs::write(self.compose_path(), content)?;
        debug!(path = %self.compose_path().display(), "wrote environment definition");
        Ok(())
    }

    /// `docker compose <args>` with credentials in the child environment.
    /// The child is killed if its future is dropped.
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.base_args()).args(args).kill_on_drop(true);
        for (name, value) in &self.spec.secrets {
            cmd.env(name, value.expose());
        }
        debug!(project = %self.project, ?args, "running docker compose");
        cmd
    }

    /// Run a lifecycle command, keeping the child on `self` until it exits.
    ///
    /// If the future is dropped the child stays in `in_flight`, and the next
    /// lifecycle command kills and reaps it first.
    async fn run_tracked(&mut self, args: &[&str]) -> Result<(), EnvError> {
        self.reap_in_flight().await;

        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = self.in_flight.insert(cmd.spawn()?);

        let mut stderr_pipe = child.stderr.take();
        let mut stderr = Vec::new();
        let (status, _) = tokio::join!(child.wait(), async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
        });
        self.in_flight = None;

        let status = status?;
        if status.success() {
            return Ok(());
        }
        Err(EnvError::Command {
            command: format!("docker compose {}", args.join(" ")),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
        })
    }

    /// Kill and wait for a lifecycle command interrupted by cancellation.
    async fn reap_in_flight(&mut self) {
        if let Some(mut child) = self.in_flight.take() {
            warn!("killing interrupted docker compose command");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill interrupted docker compose command");
            }
        }
    }
}

/// Arguments for `docker compose down`.
fn down_args(delete: bool) -> Vec<&'static str> {
    let mut args = vec!["down", "--remove-orphans"];
    if delete {
        args.extend(["--volumes", "--rmi", "local"]);
    }
    args
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn name(&self) -> &str {
        &self.project
    }

    fn state(&self) -> EnvState {
        self.state
    }

    fn shell_command(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.base_args());
        parts.extend(["exec", "-T", SERVICE_NAME, "sh", "-c"].map(String::from));
        shell_words::join(parts)
    }

    #[instrument(skip(self), fields(project = %self.project))]
    async fn start(&mut self, force_build: bool) -> Result<(), EnvError> {
        self.state = EnvState::Starting;
        self.write_definition()?;

        if force_build {
            self.run_tracked(&["pull"]).await?;
        }
        self.run_tracked(&["up", "--detach", "--wait"]).await?;

        self.state = EnvState::Running;
        info!("sandbox running");
        Ok(())
    }

    #[instrument(skip(self), fields(project = %self.project, state = %self.state))]
    async fn stop(&mut self, delete: bool) -> Result<(), EnvError> {
        if !self.state.holds_resources() {
            debug!("nothing to stop");
            return Ok(());
        }

        // A failed start may not have written the definition; nothing was
        // created through compose in that case.
        if !self.compose_path().exists() {
            warn!("environment definition missing, skipping compose down");
            self.state = EnvState::Stopped;
            return Ok(());
        }

        // An interrupted `up` is reaped by `run_tracked` before `down` runs.
        self.state = EnvState::Stopping;
        self.run_tracked(&down_args(delete)).await?;
        self.state = EnvState::Stopped;
        info!("sandbox stopped");
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, EnvError> {
        if self.state != EnvState::Running {
            return Err(EnvError::NotRunning(self.state));
        }
        let output = self
            .command(&["exec", "-T", SERVICE_NAME, "sh", "-c", command])
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
