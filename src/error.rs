use std::path::PathBuf;

use thiserror::Error;

/// Failure to learn about the runtime's containers.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Encapsulate a Docker API error.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("container {name}: {source}")]
    Label {
        name: String,
        #[source]
        source: LabelError,
    },
}

/// A routing label that could not be turned into a typed value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("label `{label}`: `{value}` is not a boolean")]
    InvalidBool { label: String, value: String },

    #[error("label `{label}`: `{value}` is not a valid port")]
    InvalidPort { label: String, value: String },

    #[error("label `{label}` is empty")]
    Empty { label: String },

    #[error("label `{label}`: `{value}` contains characters not allowed in proxy configuration")]
    Unsafe { label: String, value: String },

    #[error("no `port` label and no exposed TCP port to infer one from")]
    NoPort,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("location `{0}` rendered twice")]
    DuplicateLocation(String),

    #[error("upstream `{0}` rendered twice")]
    DuplicateUpstream(String),
}

/// The validator could not produce a verdict at all.
#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("validate command is empty")]
    EmptyCommand,

    #[error("unable to stage candidate at {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read validation template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("unable to install {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reload failed: {0}")]
    Reload(String),

    #[error("reload did not finish before the cycle deadline")]
    ReloadTimedOut,

    #[error("reload failed ({reload}) and previous artifact could not be restored: {restore}")]
    Restore { reload: String, restore: String },
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Two or more containers claim the same location.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("path `{path}` claimed by {}", .claimants.join(", "))]
pub struct PathCollision {
    pub path: String,
    /// Sorted by name.
    pub claimants: Vec<String>,
}
