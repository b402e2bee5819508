//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, remote sessions, Docker, archives, jobs) that are then
//! wrapped in the main `RiggerError` enum for unified error handling.
//!
//! Pipeline layers below the stage orchestrator report success as a plain
//! `bool` and attach failure detail to the event log; these types cover the
//! setup paths (settings, job loading, archive I/O) and the session layer.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Platform name with no registered implementation
    #[error("Unknown platform '{name}'. Valid platforms: {}", valid.join(", "))]
    UnknownPlatform { name: String, valid: Vec<String> },

    /// Manually configured DNS entry that is not `name=ip`
    #[error("Invalid DNS host entry '{entry}': expected name=ip")]
    InvalidHostEntry { entry: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Remote session errors
///
/// `Connection` failures are cached per (user, host) by the session manager so
/// repeated calls fail fast without repeating the handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Could not establish or authenticate the session
    #[error("Could not connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// Command exceeded its timeout
    #[error("Command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    /// Command exited non-zero
    #[error("Command failed with exit code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: i32 },
}

/// Docker CLI errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// Docker is not installed or not accessible
    #[error("Docker is not installed or not accessible")]
    NotInstalled,

    /// Docker CLI command error
    #[error("Docker CLI error: {0}")]
    CLIError(String),
}

/// Archive packing/unpacking errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Source directory missing
    #[error("Archive source not found: {path}")]
    SourceNotFound { path: String },

    /// Underlying I/O failure
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job repository errors
#[derive(Error, Debug)]
pub enum JobError {
    /// No job with this id
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// Job exists but cannot be run in its current state
    #[error("Job {id} cannot be started from status {status}")]
    InvalidStatus { id: String, status: String },

    /// Job kind does not match the requested command
    #[error("Job {id} is a {actual} job, expected {expected}")]
    WrongKind {
        id: String,
        actual: String,
        expected: String,
    },

    /// Stored job document is unreadable
    #[error("Failed to read job {id}: {message}")]
    Corrupt { id: String, message: String },

    /// Job store I/O error
    #[error("Job store I/O error")]
    Io(#[from] std::io::Error),
}

/// Source download errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// git clone failed
    #[error("Failed to clone repository: {0}")]
    CloneFailed(String),

    /// Local source path missing
    #[error("Source path not found: {0}")]
    NotFound(String),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum RiggerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Docker-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    /// Archive errors
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Job repository errors
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Source download errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results with RiggerError
pub type Result<T> = std::result::Result<T, RiggerError>;
