use std::fs;
use std::path::Path;

use minijinja::{Environment, ErrorKind};
use tracing::debug;

use crate::error::PmError;
use crate::template::PromptTemplate;

/// Templates compiled into the binary, keyed by lookup name.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "terminus/system",
        include_str!("../templates/terminus/system.j2"),
    ),
    ("terminus/task", include_str!("../templates/terminus/task.j2")),
];

/// File extensions picked up by [`PromptManager::load_dir`].
const TEMPLATE_EXTENSIONS: &[&str] = &["j2", "jinja"];

/// Manages prompt templates and renders them with context variables.
///
/// A new manager already contains the built-in templates. Templates added
/// later with the same name replace the built-in ones.
#[derive(Debug)]
pub struct PromptManager {
    env: Environment<'static>,
}

impl PromptManager {
    /// Create a manager holding the built-in templates.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if a built-in template fails to parse.
    pub fn new() -> Result<Self, PmError> {
        let mut env = Environment::new();
        for &(name, source) in BUILTIN_TEMPLATES {
            env.add_template(name, source)
                .map_err(|source| PmError::InvalidTemplate {
                    name: name.to_owned(),
                    source,
                })?;
        }
        Ok(Self { env })
    }

    /// Load all `.j2` / `.jinja` templates from a directory, recursively.
    ///
    /// Template names are the path relative to `dir` without extension,
    /// using `/` as separator (`terminus/system.j2` → `terminus/system`).
    ///
    /// # Errors
    ///
    /// Returns `PmError::Io` if the directory cannot be read and
    /// `PmError::InvalidTemplate` if a file fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<(), PmError> {
        self.load_dir_with_prefix(dir, "")
    }

    fn load_dir_with_prefix(&mut self, dir: &Path, prefix: &str) -> Result<(), PmError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.is_dir() {
                let Some(dir_name) = path.file_name().and_then(|s| s.to_str()) else {
                    continue;
                };
                let nested = format!("{prefix}{dir_name}/");
                self.load_dir_with_prefix(&path, &nested)?;
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext));
            if !is_template {
                continue;
            }

            let source = fs::read_to_string(&path)?;
            debug!(path = %path.display(), "loading prompt template");
            self.add_template(PromptTemplate::new(format!("{prefix}{stem}"), source))?;
        }
        Ok(())
    }

    /// Register a single template, replacing any template with the same name.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if the source fails to parse.
    pub fn add_template(&mut self, template: PromptTemplate) -> Result<(), PmError> {
        let name = template.name.clone();
        self.env
            .add_template_owned(template.name, template.source)
            .map_err(|source| PmError::InvalidTemplate { name, source })
    }

    /// Render a template by name with the given context.
    ///
    /// # Errors
    ///
    /// Returns `PmError::TemplateNotFound` for unknown names and
    /// `PmError::RenderError` when rendering fails.
    pub fn render(&self, name: &str, ctx: &serde_json::Value) -> Result<String, PmError> {
        let template = self.env.get_template(name).map_err(|e| match e.kind() {
            ErrorKind::TemplateNotFound => PmError::TemplateNotFound(name.to_owned()),
            _ => PmError::RenderError {
                name: name.to_owned(),
                source: e,
            },
        })?;

        template.render(ctx).map_err(|source| PmError::RenderError {
            name: name.to_owned(),
            source,
        })
    }
}
