//! Error types.
//!
//! Errors are split by the phase that produces them:
//!
//! - [`SyntaxError`]: malformed source text, reported with file and line.
//! - [`CompileError`]: well-formed source that cannot be turned into a brain.
//! - [`LoadError`]: everything that can stop a load (wraps the two above plus I/O).
//! - [`MacroError`]: object macro failures. Never escapes a reply; the tag
//!   evaluator turns it into an inline marker.
//! - [`SessionError`]: session store failures. This is the only error a
//!   `reply` call propagates.
//!
//! Warnings are not errors: they are [`Diagnostic`]s, logged and handed to the
//! caller's callback, and parsing continues.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A non-fatal parser/compiler observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: String,
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn new(file: &str, line: usize, message: impl Into<String>) -> Self {
        Self { file: file.to_string(), line, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} line {}", self.message, self.file, self.line)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Syntax error in {file} line {line}: {message}")]
pub struct SyntaxError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    pub(crate) fn new(file: &str, line: usize, message: impl Into<String>) -> Self {
        Self { file: file.to_string(), line, message: message.into() }
    }
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("array '{name}' refers back to itself via {path}")]
    ArrayCycle { name: String, path: String },

    #[error("object macro '{name}' is defined twice for language '{language}'")]
    DuplicateObject { name: String, language: String },

    #[error("trigger '{trigger}' in topic '{topic}' does not compile: {source}")]
    Pattern {
        topic: String,
        trigger: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

#[derive(Error, Debug)]
pub enum MacroError {
    #[error("object macro '{0}' not found")]
    NotFound(String),

    #[error("no handler registered for language '{0}'")]
    NoHandler(String),

    #[error("object macro '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("macro process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("macro process protocol error: {0}")]
    Protocol(String),
}

pub type MacroResult<T> = Result<T, MacroError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session backend error: {0}")]
    Backend(String),

    #[error("session serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_names_file_and_line() {
        let err = SyntaxError::new("brain.rive", 12, "Unmatched right bracket");
        assert_eq!(err.to_string(), "Syntax error in brain.rive line 12: Unmatched right bracket");
    }

    #[test]
    fn load_error_is_transparent_over_syntax() {
        let err: LoadError = SyntaxError::new("a", 1, "x").into();
        assert_eq!(err.to_string(), "Syntax error in a line 1: x");
    }
}
