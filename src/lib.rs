//! thinknode - a graph of thinking nodes with persistent chat and diagnostic logs.
//!
//! This library provides the core functionality for the `tn` CLI tool:
//! the node store, the node graph service, the inference adapter, the REST
//! gateway and the process supervisor for the inference backend.

pub mod cli;
pub mod commands;
pub mod config;
pub mod gateway;
pub mod inference;
pub mod logging;
pub mod models;
pub mod service;
pub mod storage;
pub mod supervisor;


/// Library-level error type for thinknode operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Supervisor(#[from] supervisor::SupervisorError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for thinknode operations.
pub type Result<T> = std::result::Result<T, Error>;
