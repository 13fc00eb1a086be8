//! Session configuration.
//!
//! [`SessionInput`] is the raw, unvalidated request built by the CLI layer.
//! [`SessionConfig::from_input`] turns it into an immutable [`SessionConfig`]:
//! every field is validated first, then paths are made absolute and the
//! logs and environment-definition directories are created.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

/// Default model used when none is given.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default turn cap. Effectively unbounded; see `timeout` for a hard deadline.
pub const DEFAULT_MAX_TURNS: u32 = 1_000_000;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Name of the environment-definition directory inside the logs directory.
pub const ENVIRONMENT_DIR_NAME: &str = "environment";

const MAX_TEMPERATURE: f32 = 2.0;

// ── Parser kind ──────────────────────────────────────────────

/// Response format the agent is asked to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    #[default]
    Json,
    Xml,
}

impl ParserKind {
    /// Lowercase name, as accepted on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            other => Err(ConfigError::UnknownParser(other.to_owned())),
        }
    }
}

// ── API key ──────────────────────────────────────────────────

/// Model API credential. Never printed by `Debug` and never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Plaintext value, for injection into the sandbox only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED, {} bytes])", self.0.len())
    }
}

// ── Raw input ────────────────────────────────────────────────

/// Unvalidated session request, as collected from the user.
///
/// # Examples
///
/// ```
/// use terminus_core::SessionInput;
///
/// let input = SessionInput::builder()
///     .instruction("list files")
///     .parser("xml")
///     .build();
/// assert_eq!(input.parser, "xml");
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionInput {
    /// Task instruction for the agent.
    #[builder(setter(into))]
    pub instruction: String,

    #[builder(default = DEFAULT_MODEL.to_owned(), setter(into))]
    pub model: String,

    /// Parser name; validated against [`ParserKind`].
    #[builder(default = ParserKind::Json.as_str().to_owned(), setter(into))]
    pub parser: String,

    #[builder(default = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[builder(default = DEFAULT_MAX_TURNS)]
    pub max_turns: u32,

    #[builder(default, setter(strip_option, into))]
    pub api_base: Option<String>,

    #[builder(default, setter(strip_option))]
    pub api_key: Option<ApiKey>,

    #[builder(default = PathBuf::from("./terminus_logs"), setter(into))]
    pub logs_dir: PathBuf,

    #[builder(default = PathBuf::from("."), setter(into))]
    pub working_dir: PathBuf,

    /// Force the sandbox image to be refreshed before starting.
    #[builder(default)]
    pub force_build: bool,

    /// Hard deadline for the whole session.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

// ── Validated configuration ──────────────────────────────────

/// Immutable description of one session, produced by
/// [`SessionConfig::from_input`]. Paths are absolute and the logs directory
/// exists.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    instruction: String,
    model: String,
    parser: ParserKind,
    temperature: f32,
    max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_base: Option<String>,
    #[serde(skip)]
    api_key: Option<ApiKey>,
    logs_dir: PathBuf,
    working_dir: PathBuf,
    force_build: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
}

impl SessionConfig {
    /// Validate and normalize raw input.
    ///
    /// All checks run before the filesystem is touched. Afterwards the logs
    /// directory and its `environment/` subdirectory are created, including
    /// missing parents.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found. No sandbox resources exist
    /// at this point, so nothing needs cleaning up.
    #[instrument(skip_all)]
    pub fn from_input(input: SessionInput) -> Result<Self, ConfigError> {
        let instruction = input.instruction.trim();
        if instruction.is_empty() {
            return Err(ConfigError::EmptyInstruction);
        }
        if input.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        let parser: ParserKind = input.parser.parse()?;
        if !(0.0..=MAX_TEMPERATURE).contains(&input.temperature) {
            return Err(ConfigError::TemperatureOutOfRange(input.temperature));
        }
        if input.max_turns == 0 {
            return Err(ConfigError::ZeroMaxTurns);
        }
        if let Some(api_base) = &input.api_base {
            validate_api_base(api_base)?;
        }

        let logs_dir = absolute(&input.logs_dir)?;
        let working_dir = absolute(&input.working_dir)?;
        if !working_dir.is_dir() {
            return Err(ConfigError::WorkingDirMissing(working_dir));
        }

        let environment_dir = logs_dir.join(ENVIRONMENT_DIR_NAME);
        std::fs::create_dir_all(&environment_dir).map_err(|source| ConfigError::CreateDir {
            path: environment_dir.clone(),
            source,
        })?;
        debug!(logs_dir = %logs_dir.display(), "created logs directory");

        Ok(Self {
            instruction: instruction.to_owned(),
            model: input.model,
            parser,
            temperature: input.temperature,
            max_turns: input.max_turns,
            api_base: input.api_base,
            api_key: input.api_key,
            logs_dir,
            working_dir,
            force_build: input.force_build,
            timeout: input.timeout,
        })
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn parser(&self) -> ParserKind {
        self.parser
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn api_base(&self) -> Option<&str> {
        self.api_base.as_deref()
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        self.api_key.as_ref()
    }

    /// Absolute logs directory.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Absolute host directory mounted into the sandbox.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn force_build(&self) -> bool {
        self.force_build
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Directory holding the generated sandbox definition.
    pub fn environment_dir(&self) -> PathBuf {
        self.logs_dir.join(ENVIRONMENT_DIR_NAME)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::ResolvePath {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_api_base(api_base: &str) -> Result<(), ConfigError> {
    let host = api_base
        .strip_prefix("https://")
        .or_else(|| api_base.strip_prefix("http://"));
    match host {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(()),
        _ => Err(ConfigError::InvalidApiBase(api_base.to_owned())),
    }
}
