//! Error types shared by every orbiter component.

use thiserror::Error;

/// Errors that can occur while adapting, querying, ensuring or destroying kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// The desired state is invalid or incomplete (e.g. missing credentials).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The kind discriminator is not registered.
    #[error("unknown kind {0}")]
    UnknownKind(String),

    /// The kind is known but the version is not supported.
    #[error("unknown version {version} for kind {kind}")]
    UnknownVersion { kind: String, version: String },

    /// A document could not be decoded or encoded.
    #[error("decoding document failed: {0}")]
    Decode(#[from] serde_yaml::Error),

    /// A remote API or transport failed.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// A command executed on a machine exited unsuccessfully.
    #[error("command `{cmd}` failed with status {status}: {stderr}")]
    Command {
        cmd: String,
        status: i32,
        stderr: String,
    },

    /// The document store moved on since it was read (push rejected).
    #[error("conflict: store is at revision {actual}, expected {expected}")]
    Conflict { expected: u64, actual: u64 },

    /// Local IO failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A resource was about to be destroyed while still referenced.
    #[error("refusing to destroy {resource}: still referenced by {referenced_by}")]
    DestroyOrder {
        resource: String,
        referenced_by: String,
    },

    /// The tick was cancelled before all phases ran.
    #[error("cancelled")]
    Cancelled,

    /// Several concurrent operations failed.
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),

    /// An error wrapped with what was being done.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type for orbiter operations.
pub type Result<T> = std::result::Result<T, Error>;

fn join_messages(errs: &[Error]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the next tick may succeed without the desired state changing.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Remote(_)
            | Error::Command { .. }
            | Error::Conflict { .. }
            | Error::Io(_)
            | Error::Cancelled => true,
            Error::Validation(_)
            | Error::UnknownKind(_)
            | Error::UnknownVersion { .. }
            | Error::Decode(_)
            | Error::DestroyOrder { .. } => false,
            Error::Aggregate(errs) => errs.iter().all(Error::is_transient),
            Error::Context { source, .. } => source.is_transient(),
        }
    }

    /// Innermost error beneath any context wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn remote(msg: impl std::fmt::Display) -> Self {
        Error::Remote(msg.to_string())
    }
}

/// Concatenates errors, dropping `None`s. Returns `None` if nothing failed.
///
/// Nested aggregates are flattened so the final message lists every failure once.
pub fn concat(errs: impl IntoIterator<Item = Option<Error>>) -> Option<Error> {
    let mut all = Vec::new();
    for err in errs.into_iter().flatten() {
        match err {
            Error::Aggregate(inner) => all.extend(inner),
            other => all.push(other),
        }
    }
    match all.len() {
        0 => None,
        1 => all.pop(),
        _ => Some(Error::Aggregate(all)),
    }
}

/// Adds operation context to errors.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> Context<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: context.into(),
            source: Box::new(source),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Context {
            context: f().into(),
            source: Box::new(source),
        })
    }
}
