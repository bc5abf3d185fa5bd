// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

/// Error taxonomy for control-plane operations.
///
/// `NotFound` is not treated as a failure by callers that can initialize
/// empty state; everything else maps onto retry-or-fail policy at the call
/// site.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RPC failure, DNS failure, or 5xx from the control plane.
    #[error("transport error during {operation}: {message}")]
    Transport { operation: String, message: String },

    /// Unexpected HTTP status from the control plane.
    #[error("{operation} returned status {code}: {message}")]
    Status {
        operation: String,
        code: u16,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    /// 401/403 from the control plane.
    #[error("unauthorized during {operation}: {message}")]
    Unauthorized { operation: String, message: String },

    /// A check-and-set write lost the race within the attempt budget.
    #[error("CAS operation failed for {0}")]
    CasFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The surrounding operation was cancelled. Propagates upward without
    /// being logged as an error.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn transport(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Map an HTTP status onto the taxonomy.
    pub fn from_status(operation: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        let operation = operation.into();
        let message = message.into();
        match code {
            404 => Error::NotFound(operation),
            401 | 403 => Error::Unauthorized { operation, message },
            500..=599 => Error::Transport {
                operation,
                message: format!("status {code}: {message}"),
            },
            _ => Error::Status {
                operation,
                code,
                message,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether a bounded retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Status { code: 429, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn status_mapping() {
        assert!(Error::from_status("read intention", 404, "").is_not_found());
        assert!(matches!(
            Error::from_status("login", 403, "denied"),
            Error::Unauthorized { .. }
        ));
        assert!(Error::from_status("read roots", 503, "").is_retryable());
        assert!(!Error::from_status("write entry", 400, "bad").is_retryable());
    }
}
