// =============================================================================
// Gateway error taxonomy
// =============================================================================
//
// Every failure the execution path can produce, typed so the HTTP boundary can
// pick a status code and echo a stable `type` string. Nothing here is retried
// internally.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Typed failure returned by the gateway and the metadata registry.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing request fields. Detected before any spawn.
    #[error("{0}")]
    Validation(String),

    /// No script is installed under the requested name.
    #[error("indicator '{0}' does not exist")]
    NotFound(String),

    /// Interpreter or script could not be started.
    #[error("failed to start indicator '{name}' ({}): {source}", script.display())]
    Spawn {
        name: String,
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The script outlived its time budget and was killed.
    #[error("indicator '{name}' timed out after {}ms", timeout.as_millis())]
    Timeout { name: String, timeout: Duration },

    /// The script crashed, exited non-zero, or produced unusable output.
    #[error("indicator '{name}' failed: {reason}")]
    Script {
        name: String,
        reason: String,
        stderr: String,
    },

    /// The script ran and reported a failure document of its own.
    #[error("indicator '{name}' reported {error_type}: {message}")]
    Indicator {
        name: String,
        error_type: String,
        message: String,
        details: Option<String>,
    },

    /// Listing the script directory failed.
    #[error("cannot read script directory {}: {source}", dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Machine-readable discriminant echoed to HTTP clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFoundError",
            Self::Spawn { .. } => "SpawnError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Script { .. } => "ScriptError",
            Self::Indicator { .. } => "IndicatorError",
            Self::Io { .. } => "IoError",
        }
    }

    /// Diagnostic detail suitable for the `details` field of an error body.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::Script { stderr, .. } if !stderr.is_empty() => Some(stderr.clone()),
            Self::Indicator {
                error_type,
                details,
                ..
            } => Some(match details {
                Some(d) => format!("{error_type}: {d}"),
                None => error_type.clone(),
            }),
            Self::Spawn { source, .. } => Some(source.kind().to_string()),
            _ => None,
        }
    }

    /// True for caller mistakes (bad input, unknown indicator).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}
