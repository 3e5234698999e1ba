use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KasaneError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("Task graph error:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("Node '{node}' failed and the run cannot continue:\n{source}")]
    Fatal {
        node: String,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed or incomplete specification. Always raised before any node runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Missing required key '{0}'")]
    MissingKey(String),

    #[error("Key '{key}' has the wrong shape, expected {expected}")]
    WrongShape { key: String, expected: &'static str },

    #[error("Package '{name}' is declared more than once (in '{first}' and '{second}')")]
    DuplicatePackage {
        name: String,
        first: String,
        second: String,
    },

    #[error("Profile '{0}' is not declared in the specification")]
    UnknownProfile(String),

    #[error("Invalid rebuild filter '{pattern}'.\n{source}")]
    Filter {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Couldn't write the snapshot '{path}'.\n{source}")]
    Snapshot {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't serialize the snapshot.\n{0}")]
    Serialize(serde_yaml::Error),
}

/// Errors raised by the version-control gateway.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error(
        "The folder '{0}' is not empty and is not a checkout. Remove it or run with --wipe."
    )]
    AmbiguousFolder(Utf8PathBuf),

    #[error("Couldn't remove '{path}'.\n{source}")]
    Wipe {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("git {operation} failed for '{folder}'.\n{source}")]
    Command {
        operation: &'static str,
        folder: Utf8PathBuf,
        source: ProcessError,
    },
}

/// Errors raised by the package backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend client version {found} is older than the required {required}")]
    Version { found: String, required: String },

    #[error("Couldn't determine the backend client version from '{0}'")]
    UnknownVersion(String),

    #[error("Backend {operation} failed for '{target}'.\n{source}")]
    Operation {
        operation: &'static str,
        target: String,
        source: anyhow::Error,
    },

    #[error("Package '{0}' has no version in its recipe")]
    MissingVersion(String),
}

impl BackendError {
    pub(crate) fn operation(
        operation: &'static str,
        target: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        BackendError::Operation {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }
}

/// External process failures, shared by both gateways.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Couldn't start '{program}'.\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("'{command}' exited with {status}:\n{stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Builder bugs. These fail fast and name the offending node.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node '{node}' reads input #{input} which is never produced in this graph")]
    Wiring { node: String, input: usize },

    #[error("Node '{node}' expected input #{input} of type {expected}")]
    WrongType {
        node: String,
        input: usize,
        expected: &'static str,
    },

    #[error("Node key '{0}' is used twice")]
    DuplicateKey(String),

    #[error("Cycle detected in the task graph at node '{0}'")]
    Cycle(String),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Couldn't write the journal '{path}'.\n{source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't encode the result of node '{node}'.\n{message}")]
    Encode { node: String, message: String },

    #[error("Couldn't decode the journal.\n{0}")]
    Decode(String),
}
