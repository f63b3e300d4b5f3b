//! Error types for deployment, audit and control operations.
//!
//! Remote failures come in two flavours: a missing path, which is expected
//! while a file is deployed for the first time, and everything else, which is
//! always an error. Verification errors cover rendering, lookups and the
//! aggregate failure raised at the end of a pass.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for deploykit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by a [`RemoteHost`](crate::remote::RemoteHost).
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The path does not exist on the remote host.
    #[error("path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// IO error while accessing a remote path.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        /// Operation that failed (`read`, `write`, `stat`, ...).
        op: &'static str,
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A transport command failed (ssh, scp, shell).
    #[error("command failed: {command}: {message}")]
    Command {
        /// Command line that was run.
        command: String,
        /// Error output or description.
        message: String,
    },

    /// Access method not supported for a node.
    #[error("node {node}: unsupported access method {method:?}")]
    Unsupported {
        /// Node name.
        node: String,
        /// Requested access method.
        method: String,
    },

    /// Any other remote failure.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Map a local IO error, turning `NotFound` into [`RemoteError::NotFound`].
    pub fn from_io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { op, path, source }
        }
    }

    /// Whether the error means the path is simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Short name of the error kind, used in log lines and error markers.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "RemoteFileDoesNotExist",
            Self::Io { .. } => "RemoteIoError",
            Self::Command { .. } => "RemoteCommandError",
            Self::Unsupported { .. } => "UnsupportedAccessMethod",
            Self::Other(_) => "RemoteError",
        }
    }
}

/// Errors raised while rendering, resolving or verifying file entries.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Template rendering failed.
    #[error("{source_path}: {message}")]
    Render {
        /// Template source identity (path or `<inline>`).
        source_path: String,
        /// Renderer error message.
        message: String,
    },

    /// Local source could not be read.
    #[error("cannot read '{}': {source}", .path.display())]
    Source {
        /// Local source path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// No override file found in either config directory.
    #[error("no {file:?} found for config {config:?}")]
    NoOverride {
        /// Requested file name.
        file: String,
        /// Top config name.
        config: String,
    },

    /// Lookup did not match anything.
    #[error("did not find {kind} {pattern:?}")]
    NotFound {
        /// What was searched for (`node`, `system`, `config`).
        kind: &'static str,
        /// Search pattern.
        pattern: String,
    },

    /// Lookup matched more than one item.
    #[error("found more than one ({}) {kind} {pattern:?}: {}", .names.len(), .names.join(", "))]
    Ambiguous {
        /// What was searched for.
        kind: &'static str,
        /// Search pattern.
        pattern: String,
        /// Names of all matches.
        names: Vec<String>,
    },

    /// Invalid node or config search pattern.
    #[error("invalid pattern {pattern:?}: {message}")]
    Pattern {
        /// Offending pattern.
        pattern: String,
        /// Reason.
        message: String,
    },

    /// One or more entries failed during a verify pass.
    #[error("failed: there were [{error_count}/{file_count}] errors")]
    Aggregate {
        /// Number of errors counted during the pass.
        error_count: usize,
        /// Number of file entries considered.
        file_count: usize,
    },
}

impl VerifyError {
    /// Short name of the error kind, used in log lines and error markers.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Render { .. } => "RenderError",
            Self::Source { .. } => "SourceError",
            Self::NoOverride { .. } => "NoOverride",
            Self::NotFound { .. } => "NotFound",
            Self::Ambiguous { .. } => "Ambiguous",
            Self::Pattern { .. } => "PatternError",
            Self::Aggregate { .. } => "VerifyError",
        }
    }
}

/// Errors raised by control operations.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The remote script exited with a non-zero code.
    #[error("{command:?} failed with exit code {exit_code}")]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit code reported by the remote host.
        exit_code: i32,
    },

    /// No control with the given name is registered.
    #[error("no control {name:?} registered for {config}")]
    UnknownControl {
        /// Requested control name.
        name: String,
        /// Full config name (`node/config`).
        config: String,
    },

    /// Remote transport failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Script rendering failure.
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Umbrella error for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Remote transport failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Rendering, lookup or verification failure.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Control operation failure.
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Format an error as the marker text shown in place of rendered output.
pub fn format_error(kind: &str, error: &dyn std::fmt::Display) -> String {
    format!("ERROR: {kind}: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_maps_not_found() {
        let err = RemoteError::from_io(
            "read",
            "/etc/app.conf",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "path does not exist: /etc/app.conf");
    }

    #[test]
    fn test_from_io_keeps_other_kinds() {
        let err = RemoteError::from_io(
            "write",
            "/etc/app.conf",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_not_found());
        assert_eq!(err.kind_name(), "RemoteIoError");
    }

    #[test]
    fn test_aggregate_message() {
        let err = VerifyError::Aggregate {
            error_count: 2,
            file_count: 5,
        };
        assert_eq!(err.to_string(), "failed: there were [2/5] errors");
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = VerifyError::Ambiguous {
            kind: "node",
            pattern: "web".into(),
            names: vec!["web/a".into(), "web/b".into()],
        };
        assert_eq!(
            err.to_string(),
            "found more than one (2) node \"web\": web/a, web/b"
        );
    }

    #[test]
    fn test_format_error_marker() {
        let err = VerifyError::NotFound {
            kind: "config",
            pattern: "db".into(),
        };
        assert_eq!(
            format_error(err.kind_name(), &err),
            "ERROR: NotFound: did not find config \"db\""
        );
    }
}
