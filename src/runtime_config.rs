// =============================================================================
// Runtime Configuration - file defaults with environment overrides
// =============================================================================
//
// Startup order: `.env` (dotenv) -> JSON config file -> environment variables.
// Every field carries a serde default so a missing or partial file still
// yields a usable configuration; a missing file falls back to defaults.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_interpreter() -> Option<String> {
    Some("python3".to_string())
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("python-indicators/standard")
}

fn default_script_extension() -> String {
    "py".to_string()
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_describe_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent_scripts() -> usize {
    32
}

fn default_stderr_excerpt_chars() -> usize {
    1_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the indicator host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Script execution ----------------------------------------------------

    /// Program that runs each script (`<interpreter> <script>`). `None`
    /// executes the script file directly.
    #[serde(default = "default_interpreter")]
    pub interpreter: Option<String>,

    /// Directory listed for installed indicator scripts.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// File extension that marks a script (without the dot).
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    /// Wall-clock budget for one execute-mode invocation.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Wall-clock budget for one describe-mode invocation. Kept separate and
    /// shorter: a schema dump should be near-instant.
    #[serde(default = "default_describe_timeout_ms")]
    pub describe_timeout_ms: u64,

    /// Admission bound on simultaneously running scripts. 0 = unbounded.
    #[serde(default = "default_max_concurrent_scripts")]
    pub max_concurrent_scripts: usize,

    /// How much stderr is quoted back in error messages.
    #[serde(default = "default_stderr_excerpt_chars")]
    pub stderr_excerpt_chars: usize,

    // --- Caching --------------------------------------------------------------

    /// Memoise execution responses at the HTTP boundary.
    #[serde(default)]
    pub cache_enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    // --- HTTP ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token guarding the reload endpoint. Unset rejects every call.
    #[serde(default, skip_serializing)]
    pub admin_token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            scripts_dir: default_scripts_dir(),
            script_extension: default_script_extension(),
            execution_timeout_ms: default_execution_timeout_ms(),
            describe_timeout_ms: default_describe_timeout_ms(),
            max_concurrent_scripts: default_max_concurrent_scripts(),
            stderr_excerpt_chars: default_stderr_excerpt_chars(),
            cache_enabled: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            scripts_dir = %config.scripts_dir.display(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable numbers are ignored
    /// with a warning so a typo never takes the service down.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }

        if let Some(v) = lookup("INDICATOR_INTERPRETER") {
            let v = v.trim().to_string();
            self.interpreter = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("INDICATOR_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("INDICATOR_SCRIPT_EXTENSION") {
            self.script_extension = v.trim().trim_start_matches('.').to_string();
        }
        if let Some(v) = parsed("INDICATOR_TIMEOUT_MS", lookup("INDICATOR_TIMEOUT_MS")) {
            self.execution_timeout_ms = v;
        }
        if let Some(v) = parsed("INDICATOR_DESCRIBE_TIMEOUT_MS", lookup("INDICATOR_DESCRIBE_TIMEOUT_MS")) {
            self.describe_timeout_ms = v;
        }
        if let Some(v) = parsed("INDICATOR_MAX_CONCURRENCY", lookup("INDICATOR_MAX_CONCURRENCY")) {
            self.max_concurrent_scripts = v;
        }
        if let Some(v) = lookup("CACHE_ENABLED") {
            self.cache_enabled = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = parsed("CACHE_TTL", lookup("CACHE_TTL")) {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = lookup("INDICATOR_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("INDICATOR_ADMIN_TOKEN") {
            self.admin_token = (!v.is_empty()).then_some(v);
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_millis(self.describe_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
