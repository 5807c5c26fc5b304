//! CLI errors.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliError {
    /// Configuration could not be loaded.
    Config { reason: String },
    /// A definition file could not be read.
    Read { path: PathBuf, reason: String },
    /// A definition file is not a valid definition document.
    Parse { path: PathBuf, reason: String },
    /// `--context` is not valid JSON.
    Context { reason: String },
    /// A definition failed validation or activation.
    Definition { name: String, reason: String },
    /// The store, trigger manager or engine refused a request.
    Runtime { reason: String },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "failed to load configuration: {reason}"),
            Self::Read { path, reason } => {
                write!(f, "failed to read {}: {reason}", path.display())
            }
            Self::Parse { path, reason } => {
                write!(f, "failed to parse {}: {reason}", path.display())
            }
            Self::Context { reason } => write!(f, "invalid --context JSON: {reason}"),
            Self::Definition { name, reason } => {
                write!(f, "workflow '{name}' cannot run: {reason}")
            }
            Self::Runtime { reason } => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for CliError {}
