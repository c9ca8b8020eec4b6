use crate::executor::result::{ErrorType, ExecutionError};
use crate::provider::service::service_error;

/// Message fragments per failure type, checked in order.
const PATTERNS: &[(ErrorType, &[&str])] = &[
    (ErrorType::Dependency, &["depends on failed", "dependency"]),
    (ErrorType::Timeout, &["timeout", "timed out", "deadline exceeded"]),
    (
        ErrorType::Authentication,
        &["unauthorized", "unauthenticated", "forbidden", "permission denied", "401", "403"],
    ),
    (ErrorType::Quota, &["quota", "limit exceeded", "insufficient capacity"]),
    (ErrorType::Conflict, &["already exists", "conflict", "duplicate", "409"]),
    (
        ErrorType::ResourceState,
        &["not found", "404", "not ready", "in progress", "is busy", "resource state"],
    ),
    (ErrorType::Validation, &["invalid", "validation", "bad request", "400", "unsupported"]),
    (
        ErrorType::Network,
        &[
            "connection refused",
            "connection reset",
            "network",
            "unavailable",
            "throttl",
            "too many requests",
            "502",
            "503",
            "504",
        ],
    ),
];

/// Classify an error, preferring the typed service error anywhere in the
/// chain and falling back to the message text.
pub fn classify_error(err: &anyhow::Error) -> ErrorType {
    match service_error(err) {
        Some(typed) => ErrorType::from(typed),
        None => classify_message(&format!("{:#}", err)),
    }
}

/// Classify a failure by message text alone.
pub fn classify_message(message: &str) -> ErrorType {
    let message = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| message.contains(needle)))
        .map(|(error_type, _)| *error_type)
        .unwrap_or(ErrorType::Internal)
}

/// Failure type of a recorded execution error. The executor already typed
/// it from the backend error; only the catch-all is re-read from the text.
pub fn classify_execution_error(err: &ExecutionError) -> ErrorType {
    match err.error_type {
        ErrorType::Internal => classify_message(&err.message),
        typed => typed,
    }
}
