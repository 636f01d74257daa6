// =============================================================================
// Shared types for the indicator script protocol
// =============================================================================
//
// Everything here is transient: built per request, serialised onto a script's
// stdin or parsed from its stdout, and dropped when the round trip ends.
// Wire keys are camelCase to match what the charting client and the scripts
// already speak.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// One OHLCV bar with a unix-second timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Labelling context attached to a request. Never semantically required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Whether a script should compute or describe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    Execute,
    Describe,
}

impl Default for RequestMode {
    fn default() -> Self {
        Self::Execute
    }
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::Describe => write!(f, "describe"),
        }
    }
}

// =============================================================================
// IndicatorRequest
// =============================================================================

/// Value of the older `_mode` key that asks a script for its schema.
pub const LEGACY_DESCRIBE_MODE: &str = "metadata";

/// The document written to a script's standard input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorRequest {
    pub name: String,
    #[serde(default)]
    pub candle_data: Vec<Candle>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestContext>,
    #[serde(default)]
    pub mode: RequestMode,
    /// `"metadata"` on describe requests, for scripts that key on `_mode`.
    #[serde(rename = "_mode", default, skip_serializing_if = "Option::is_none")]
    pub legacy_mode: Option<String>,
}

impl IndicatorRequest {
    /// Build an execute-mode request.
    pub fn execute(
        name: impl Into<String>,
        candle_data: Vec<Candle>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            candle_data,
            params,
            metadata: None,
            mode: RequestMode::Execute,
            legacy_mode: None,
        }
    }

    /// Build a describe-mode request. Candles and params are left empty.
    pub fn describe(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            candle_data: Vec::new(),
            params: Map::new(),
            metadata: None,
            mode: RequestMode::Describe,
            legacy_mode: Some(LEGACY_DESCRIBE_MODE.to_string()),
        }
    }

    /// Parse an untyped body (e.g. an HTTP payload) into a request, reporting
    /// shape problems as `ValidationError`s that name the offending field.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(GatewayError::validation("request body must be a JSON object")),
        };

        let name = match obj.remove("name") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(GatewayError::validation("'name' must be a string")),
            None => return Err(GatewayError::validation("'name' is required")),
        };

        let candle_data = match obj.remove("candleData") {
            Some(v @ Value::Array(_)) => serde_json::from_value::<Vec<Candle>>(v)
                .map_err(|e| GatewayError::validation(format!("'candleData' is malformed: {e}")))?,
            Some(_) => return Err(GatewayError::validation("'candleData' must be an array")),
            None => return Err(GatewayError::validation("'candleData' is required")),
        };

        let params = match obj.remove("params") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(_) => return Err(GatewayError::validation("'params' must be an object")),
        };

        let metadata = match obj.remove("metadata") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value::<RequestContext>(v)
                    .map_err(|e| GatewayError::validation(format!("'metadata' is malformed: {e}")))?,
            ),
        };

        let legacy_mode = match obj.remove("_mode") {
            Some(Value::String(s)) => Some(s),
            None | Some(Value::Null) => None,
            Some(_) => return Err(GatewayError::validation("'_mode' must be a string")),
        };

        let mode = match obj.remove("mode") {
            None | Some(Value::Null) if legacy_mode.as_deref() == Some(LEGACY_DESCRIBE_MODE) => {
                RequestMode::Describe
            }
            None | Some(Value::Null) => RequestMode::Execute,
            Some(v) => serde_json::from_value::<RequestMode>(v).map_err(|_| {
                GatewayError::validation("'mode' must be \"execute\" or \"describe\"")
            })?,
        };

        Ok(Self {
            name,
            candle_data,
            params,
            metadata,
            mode,
            legacy_mode,
        })
    }
}

// =============================================================================
// IndicatorResponse
// =============================================================================

/// Error object reported by a script in a failure document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
    /// Free-form; structured details are kept as their JSON text.
    #[serde(
        default,
        deserialize_with = "details_as_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub details: Option<String>,
}

fn details_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Outcome of interpreting a script's stdout document.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorResponse {
    /// `success: true` with a `values` or `data` payload. Kept verbatim.
    Success(Value),
    /// `success: false` with an `error` payload.
    Failure(ScriptFailure),
}

impl IndicatorResponse {
    /// Classify a parsed stdout document. Returns a human-readable reason when
    /// the document satisfies neither shape.
    pub fn classify(doc: Value) -> Result<Self, String> {
        let obj = doc
            .as_object()
            .ok_or_else(|| "response is not a JSON object".to_string())?;

        match obj.get("success").and_then(Value::as_bool) {
            Some(true) => {
                let payload = obj.get("values").or_else(|| obj.get("data"));
                match payload {
                    Some(Value::Array(_)) | Some(Value::Object(_)) => Ok(Self::Success(doc)),
                    Some(_) => Err("'values' must be an array or an object of line groups".into()),
                    None => Err("success response carries neither 'values' nor 'data'".into()),
                }
            }
            Some(false) => match obj.get("error") {
                Some(Value::String(msg)) => Ok(Self::Failure(ScriptFailure {
                    error_type: "IndicatorError".to_string(),
                    message: msg.clone(),
                    details: None,
                })),
                Some(err @ Value::Object(_)) => {
                    let mut failure: ScriptFailure = serde_json::from_value(err.clone())
                        .map_err(|e| format!("malformed 'error' object: {e}"))?;
                    if failure.error_type.is_empty() {
                        failure.error_type = "IndicatorError".to_string();
                    }
                    if failure.message.is_empty() {
                        failure.message = format!("{} reported by script", failure.error_type);
                    }
                    Ok(Self::Failure(failure))
                }
                _ => Err("failure response carries no 'error'".into()),
            },
            None => Err("response has no boolean 'success' field".into()),
        }
    }
}

// =============================================================================
// IndicatorMetadata
// =============================================================================

/// Where the chart client should render an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Main,
    Sub,
    Readonly,
}

impl Default for ChartType {
    fn default() -> Self {
        Self::Main
    }
}

/// One input parameter a script declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, alias = "label")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema a script reports in describe mode. This drives the client's input
/// forms, so it is validated before it leaves the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorMetadata {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub version: String,
    #[serde(default)]
    pub chart_type: ChartType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
}

impl IndicatorMetadata {
    /// Parse and validate a describe-mode stdout document.
    pub fn from_document(doc: Value) -> Result<Self, String> {
        if !doc.is_object() {
            return Err("describe output is not a JSON object".into());
        }

        let mut meta: Self =
            serde_json::from_value(doc).map_err(|e| format!("malformed schema: {e}"))?;
        meta.validate()?;

        if meta.display_name.is_empty() {
            meta.display_name = meta.name.to_uppercase();
        }
        for p in &mut meta.parameters {
            if p.display_name.is_empty() {
                p.display_name = p.name.clone();
            }
        }
        Ok(meta)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("schema 'name' is empty".into());
        }
        if self.version.trim().is_empty() {
            return Err("schema 'version' is empty".into());
        }
        for (i, p) in self.parameters.iter().enumerate() {
            if p.name.trim().is_empty() {
                return Err(format!("parameter #{i} has an empty 'name'"));
            }
            if p.param_type.trim().is_empty() {
                return Err(format!("parameter '{}' has an empty 'type'", p.name));
            }
            if p.default.is_null() {
                return Err(format!("parameter '{}' has no 'default'", p.name));
            }
        }
        Ok(())
    }

    /// Parameter map populated with every declared default.
    pub fn default_params(&self) -> Map<String, Value> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }
}
