//! Error classification: converts a handler failure into a status and a
//! client-safe message.

use crate::error::AppError;

/// Status and message derived from a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub status: u16,
    pub message: String,
}

impl Classified {
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Whether the failure should be logged at error severity.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Maps a failure to its status, in priority order: explicit application
/// status, timeout (408), validation (400), anything else (500).
#[must_use]
pub fn classify(err: &AppError) -> Classified {
    match err {
        AppError::Application { status, message } => Classified::new(*status, message.clone()),
        AppError::Timeout(message) => Classified::new(408, message.clone()),
        AppError::Validation(message) => Classified::new(400, message.clone()),
        AppError::Cast(message) => Classified::new(500, simplify_cast_message(message)),
        AppError::Internal(e) => Classified::new(500, e.root_cause().to_string()),
    }
}

/// Drops the trailing parenthesised diagnostic of a cast failure, e.g.
/// `"string cannot be cast to int (in module x)"` becomes
/// `"string cannot be cast to int"`. Cuts at the last `" ("`.
#[must_use]
pub fn simplify_cast_message(message: &str) -> String {
    match message.rfind(" (") {
        Some(pos) if pos > 0 => message[..pos].to_string(),
        _ => message.to_string(),
    }
}

/// Converts a caught panic payload into an uncaught failure.
#[must_use]
pub fn panic_error(payload: &(dyn std::any::Any + Send)) -> AppError {
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    AppError::Internal(anyhow::anyhow!(message))
}

/// Logs a classified failure: 5xx at error level, everything else at warn.
pub fn log_failure(route: &str, instance: usize, classified: &Classified) {
    if classified.is_server_error() {
        tracing::error!(
            route,
            instance,
            status = classified.status,
            "Unhandled exception - {}",
            classified.message
        );
    } else {
        tracing::warn!(
            route,
            instance,
            status = classified.status,
            "Exception - {}",
            classified.message
        );
    }
}
