// =============================================================================
// Execution Gateway - validate, resolve, launch, normalise
// =============================================================================
//
// The gateway is stateless between calls: no memoisation, no accumulated
// state. Shape validation happens before anything is spawned; scripts are
// resolved through the registry's catalog snapshot; launcher outcomes are
// folded into the `GatewayError` taxonomy while keeping "the script reported
// an error" distinct from "the script could not be run properly".
// =============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::GatewayError;
use crate::executor::launcher::{LaunchError, ScriptRunner};
use crate::executor::registry::MetadataRegistry;
use crate::types::{IndicatorRequest, IndicatorResponse, RequestMode};

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}… [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

/// Indicator names double as file stems, so they are restricted to a safe
/// character set.
pub fn validate_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() {
        return Err(GatewayError::validation("'name' must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GatewayError::validation(format!(
            "'name' contains illegal characters: '{name}'"
        )));
    }
    Ok(())
}

/// Fold a launcher failure into the gateway taxonomy.
pub fn map_launch_error(
    name: &str,
    script: &Path,
    err: LaunchError,
    stderr_chars: usize,
) -> GatewayError {
    match err {
        LaunchError::Spawn(source) => GatewayError::Spawn {
            name: name.to_string(),
            script: script.to_path_buf(),
            source,
        },
        LaunchError::Timeout(timeout) => GatewayError::Timeout {
            name: name.to_string(),
            timeout,
        },
        LaunchError::NonZeroExit {
            status,
            stdout,
            stderr,
        } => {
            // Scripts commonly print a failure document and then exit(1).
            let reported = serde_json::from_str::<Value>(stdout.trim())
                .ok()
                .and_then(|doc| IndicatorResponse::classify(doc).ok());
            match reported {
                Some(IndicatorResponse::Failure(f)) => GatewayError::Indicator {
                    name: name.to_string(),
                    error_type: f.error_type,
                    message: f.message,
                    details: f.details.or_else(|| {
                        (!stderr.trim().is_empty()).then(|| excerpt(&stderr, stderr_chars))
                    }),
                },
                _ => GatewayError::Script {
                    name: name.to_string(),
                    reason: format!("process ended with {status}"),
                    stderr: excerpt(&stderr, stderr_chars),
                },
            }
        }
        LaunchError::InvalidJson { source, stderr, .. } => GatewayError::Script {
            name: name.to_string(),
            reason: format!("output is not valid JSON ({source})"),
            stderr: excerpt(&stderr, stderr_chars),
        },
        LaunchError::Io(source) => GatewayError::Script {
            name: name.to_string(),
            reason: format!("I/O failure while running script ({source})"),
            stderr: String::new(),
        },
    }
}

/// Validates and routes single indicator executions.
pub struct ExecutionGateway<R: ScriptRunner> {
    runner: Arc<R>,
    registry: Arc<MetadataRegistry<R>>,
    timeout: Duration,
    stderr_chars: usize,
}

impl<R: ScriptRunner> ExecutionGateway<R> {
    pub fn new(
        runner: Arc<R>,
        registry: Arc<MetadataRegistry<R>>,
        timeout: Duration,
        stderr_chars: usize,
    ) -> Self {
        Self {
            runner,
            registry,
            timeout,
            stderr_chars,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check request shape without touching the filesystem or spawning.
    pub fn validate(request: &IndicatorRequest) -> Result<(), GatewayError> {
        validate_name(&request.name)?;
        if request.mode == RequestMode::Describe {
            return Err(GatewayError::validation(
                "describe requests go through the metadata endpoints",
            ));
        }
        if request.candle_data.is_empty() {
            return Err(GatewayError::validation("'candleData' must not be empty"));
        }
        Ok(())
    }

    /// Run one indicator and return its success document verbatim.
    #[instrument(
        skip(self, request),
        name = "gateway::execute",
        fields(indicator = %request.name, candles = request.candle_data.len())
    )]
    pub async fn execute(&self, request: &IndicatorRequest) -> Result<Value, GatewayError> {
        Self::validate(request)?;

        let script = self
            .registry
            .resolve(&request.name)
            .ok_or_else(|| GatewayError::NotFound(request.name.clone()))?;

        info!(
            params = ?request.params,
            symbol = ?request.metadata.as_ref().and_then(|m| m.symbol.as_deref()),
            "executing indicator script"
        );

        let doc = self
            .runner
            .run(&script, request, self.timeout)
            .await
            .map_err(|e| map_launch_error(&request.name, &script, e, self.stderr_chars))
            .inspect_err(|e| warn!(kind = e.kind(), error = %e, "indicator execution failed"))?;

        match IndicatorResponse::classify(doc) {
            Ok(IndicatorResponse::Success(doc)) => {
                info!("indicator completed");
                Ok(doc)
            }
            Ok(IndicatorResponse::Failure(f)) => {
                warn!(error_type = %f.error_type, message = %f.message, "indicator reported failure");
                Err(GatewayError::Indicator {
                    name: request.name.clone(),
                    error_type: f.error_type,
                    message: f.message,
                    details: f.details,
                })
            }
            Err(reason) => {
                warn!(%reason, "indicator response has an unexpected shape");
                Err(GatewayError::Script {
                    name: request.name.clone(),
                    reason,
                    stderr: String::new(),
                })
            }
        }
    }
}
