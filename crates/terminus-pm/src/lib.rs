//! Prompt templates for the Terminus agent.
//!
//! [`PromptManager`] ships the built-in `terminus/*` templates and lets
//! callers override them from a directory or register extra ones.

mod error;
mod manager;
mod template;

pub use error::PmError;
pub use manager::PromptManager;
pub use template::PromptTemplate;
