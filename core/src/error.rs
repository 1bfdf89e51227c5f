//! Error taxonomy shared by every request path.
//!
//! Each variant carries a stable kebab-case tag (see [`ConfigError::kind`])
//! that prefixes the status string sent back to clients, so automated
//! callers can branch on the kind without parsing prose.

use std::fmt;

use thiserror::Error;


/// Stable identifier for an error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedPath,
    UnknownNode,
    KeyMismatch,
    NoSuchEntry,
    DuplicateKey,
    TypeMismatch,
    SchemaMismatch,
    InstanceTransitionFailed,
    ProtocolError,
    InvalidOperation,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedPath => "malformed-path",
            ErrorKind::UnknownNode => "unknown-node",
            ErrorKind::KeyMismatch => "key-mismatch",
            ErrorKind::NoSuchEntry => "no-such-entry",
            ErrorKind::DuplicateKey => "duplicate-key",
            ErrorKind::TypeMismatch => "type-mismatch",
            ErrorKind::SchemaMismatch => "schema-mismatch",
            ErrorKind::InstanceTransitionFailed => "instance-transition-failed",
            ErrorKind::ProtocolError => "protocol-error",
            ErrorKind::InvalidOperation => "invalid-operation",
            ErrorKind::Io => "io-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Errors produced while parsing, resolving or applying a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("unknown node '{name}' under '{parent}'")]
    UnknownNode { parent: String, name: String },

    #[error("list '{list}' is keyed by [{expected}], got [{got}]")]
    KeyMismatch {
        list: String,
        expected: String,
        got: String,
    },

    #[error("no such entry: {path}")]
    NoSuchEntry { path: String },

    #[error("duplicate key {key} in list '{list}'")]
    DuplicateKey { list: String, key: String },

    #[error("cannot parse '{literal}' as {expected} for '{leaf}'")]
    TypeMismatch {
        leaf: String,
        expected: String,
        literal: String,
    },

    #[error("{0}")]
    SchemaMismatch(String),

    #[error("instance {instance}: {reason}")]
    InstanceTransitionFailed { instance: String, reason: String },

    #[error("{0}")]
    ProtocolError(String),

    #[error("cannot {verb} '{path}': {reason}")]
    InvalidOperation {
        verb: String,
        path: String,
        reason: String,
    },

    #[error("{0}")]
    Io(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::MalformedPath { .. } => ErrorKind::MalformedPath,
            ConfigError::UnknownNode { .. } => ErrorKind::UnknownNode,
            ConfigError::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            ConfigError::NoSuchEntry { .. } => ErrorKind::NoSuchEntry,
            ConfigError::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            ConfigError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            ConfigError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            ConfigError::InstanceTransitionFailed { .. } => ErrorKind::InstanceTransitionFailed,
            ConfigError::ProtocolError(_) => ErrorKind::ProtocolError,
            ConfigError::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            ConfigError::Io(_) => ErrorKind::Io,
        }
    }

    /// The status string sent on the wire: `"<kind>: <message>"`.
    pub fn status(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    pub fn malformed(path: &str, reason: impl Into<String>) -> Self {
        ConfigError::MalformedPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid(verb: &str, path: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOperation {
            verb: verb.to_string(),
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}


pub type Result<T> = std::result::Result<T, ConfigError>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_prefixed_with_kind() {
        let err = ConfigError::NoSuchEntry {
            path: "/softwire-config/binding-table/softwire[ipv4=1.2.3.4][psid=1]".into(),
        };
        assert!(err.status().starts_with("no-such-entry: "));
        assert!(err.status().contains("ipv4=1.2.3.4"));
    }

    #[test]
    fn schema_mismatch_message_is_verbatim() {
        let err = ConfigError::SchemaMismatch("br-instance name does not match 'lwaftr'".into());
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert_eq!(
            err.status(),
            "schema-mismatch: br-instance name does not match 'lwaftr'"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ConfigError = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
