//! Error types for the dispatch engine.

use mesh_core::{EnvelopeError, SchemaError};

/// Failure returned by a handler.
///
/// The dispatcher converts it into a status and message through
/// [`classify`](crate::service::classify::classify).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Explicit status and message chosen by handler logic.
    #[error("{message}")]
    Application { status: u16, message: String },
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),
    /// A deadline was exceeded.
    #[error("{0}")]
    Timeout(String),
    /// A value had an unexpected type.
    #[error("{0}")]
    Cast(String),
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        AppError::Application {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        AppError::Timeout(message.into())
    }
}

impl From<SchemaError> for AppError {
    fn from(err: SchemaError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { .. } => AppError::Timeout(err.to_string()),
            RpcError::Failed { status, message } => AppError::Application { status, message },
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Failure to hand an event to the local bus.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Route {0} not found")]
    NoRoute(String),
    #[error("Route {0} is closed")]
    Closed(String),
    #[error("Missing destination route")]
    MissingRoute,
    #[error("Platform is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

/// Service registration failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Route {route} already has {existing} instances, cannot change to {requested} while running")]
    Conflict {
        route: String,
        existing: usize,
        requested: usize,
    },
    #[error("Invalid route {0}")]
    InvalidRoute(String),
    #[error("Route {0} not found")]
    NotFound(String),
    #[error("Route {0} is reserved")]
    Reserved(String),
}

/// Outcome of a request that did not produce a successful reply.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Timeout for {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("{message}")]
    Failed { status: u16, message: String },
    #[error("Request cancelled")]
    Cancelled,
    #[error(transparent)]
    Send(#[from] SendError),
}

impl RpcError {
    /// Status code carried to the caller.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            RpcError::Timeout { .. } => 408,
            RpcError::Failed { status, .. } => *status,
            RpcError::Send(SendError::NoRoute(_)) => 404,
            RpcError::Send(SendError::ShuttingDown) => 503,
            RpcError::Cancelled | RpcError::Send(_) => 500,
        }
    }
}

/// Invalid route substitution or multicast table.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Invalid route {0}")]
    InvalidRoute(String),
    #[error("Route substitution {0} points to itself")]
    SelfSubstitution(String),
    #[error("Nested route substitution not supported - {from} -> {to}")]
    Nested { from: String, to: String },
    #[error("Multicast route {0} has no members")]
    NoMembers(String),
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: {value}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
}

/// Failure while starting the platform.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform must be started inside a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("unable to start worker thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}
