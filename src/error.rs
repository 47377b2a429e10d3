//! Error taxonomy for the supervision engine.
//!
//! Library code returns these typed errors directly; the binaries match on
//! them and report a message plus an exit code rather than propagating
//! further.

use std::io;

/// Failures encountered while parsing or validating a program configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("[{section}]: missing required key '{key}'")]
    MissingKey { section: String, key: String },

    #[error("[{section}]: unknown key '{key}'")]
    UnknownKey { section: String, key: String },

    #[error("[{section}]: invalid value for '{key}': {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: String,
    },
}

/// Failures while turning a descriptor into a live child process.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("failed to open output sink {path}: {source}")]
    Sink {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("working directory {0} does not exist")]
    MissingWorkingDir(String),

    #[error("exec failed: {0}")]
    Exec(#[source] io::Error),
}

/// An operator referenced a program name the registry doesn't know about.
#[derive(thiserror::Error, Debug)]
#[error("unknown program: {0}")]
pub struct UnknownProgram(pub String);

/// A control-layer command couldn't be parsed or applied.
#[derive(thiserror::Error, Debug)]
pub enum InvalidCommand {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} expects a program name or 'all'")]
    MissingTarget(&'static str),

    #[error("the registry is shutting down")]
    RegistryClosed,
}
