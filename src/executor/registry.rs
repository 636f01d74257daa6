// =============================================================================
// Metadata Registry - script discovery and self-described schemas
// =============================================================================
//
// The catalog (indicator name -> script path) is a snapshot taken at startup
// and replaced atomically by `reload()`. Requests never rescan the directory,
// so additions and removals become visible only after an explicit reload.
//
// `describe_all` fans out one task per script and keeps only the successes:
// a script that hangs, crashes or lies about its schema is logged and left
// out, it never fails the batch.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::cache::{fingerprint, TtlCache};
use crate::error::GatewayError;
use crate::executor::gateway::{excerpt, map_launch_error, validate_name};
use crate::executor::launcher::ScriptRunner;
use crate::types::{IndicatorMetadata, IndicatorRequest, IndicatorResponse};

type Catalog = BTreeMap<String, PathBuf>;

const DESCRIBE_STDERR_CHARS: usize = 500;

/// List `dir` and map indicator names to script paths.
///
/// Keeps regular files carrying `extension`; skips names starting with `_` or
/// `.` (package markers, editor droppings) and stems that are not valid
/// indicator names.
pub fn scan_scripts(dir: &Path, extension: &str) -> Result<Catalog, GatewayError> {
    let io_err = |source| GatewayError::Io {
        dir: dir.to_path_buf(),
        source,
    };

    let mut catalog = Catalog::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();

        let is_file = std::fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('_') || stem.starts_with('.') || validate_name(stem).is_err() {
            continue;
        }
        catalog.insert(stem.to_string(), path);
    }
    Ok(catalog)
}

/// Discovers installed indicators and assembles their schemas.
pub struct MetadataRegistry<R: ScriptRunner> {
    runner: Arc<R>,
    scripts_dir: PathBuf,
    extension: String,
    describe_timeout: Duration,
    catalog: RwLock<Arc<Catalog>>,
    schemas: TtlCache<Vec<IndicatorMetadata>>,
}

impl<R: ScriptRunner> MetadataRegistry<R> {
    /// Build an empty registry. Call [`reload`](Self::reload) to populate it.
    pub fn new(
        runner: Arc<R>,
        scripts_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        describe_timeout: Duration,
        schemas: TtlCache<Vec<IndicatorMetadata>>,
    ) -> Self {
        Self {
            runner,
            scripts_dir: scripts_dir.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            describe_timeout,
            catalog: RwLock::new(Arc::new(Catalog::new())),
            schemas,
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Rescan the script directory and swap in the new catalog.
    ///
    /// On I/O failure the previous catalog stays in place.
    pub fn reload(&self) -> Result<Vec<String>, GatewayError> {
        let catalog = scan_scripts(&self.scripts_dir, &self.extension)?;
        let names: Vec<String> = catalog.keys().cloned().collect();
        *self.catalog.write() = Arc::new(catalog);
        self.schemas.clear();
        info!(
            dir = %self.scripts_dir.display(),
            count = names.len(),
            indicators = ?names,
            "indicator catalog loaded"
        );
        Ok(names)
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Sorted indicator names from the current snapshot.
    pub fn list_indicators(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.snapshot().get(name).cloned()
    }

    /// Invoke one script in describe mode.
    #[instrument(skip(self), name = "registry::describe_one")]
    pub async fn describe_one(&self, name: &str) -> Result<IndicatorMetadata, GatewayError> {
        validate_name(name)?;
        let script = self
            .resolve(name)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;
        describe_script(
            self.runner.as_ref(),
            name,
            &script,
            self.describe_timeout,
        )
        .await
    }

    /// Describe every catalogued script concurrently, keeping the successes
    /// sorted by name.
    #[instrument(skip(self), name = "registry::describe_all")]
    pub async fn describe_all(&self) -> Vec<IndicatorMetadata> {
        let catalog = self.snapshot();
        let key = fingerprint(catalog.as_ref()).map(|f| format!("describe_all:{f}"));
        if let Some(hit) = key.as_deref().and_then(|k| self.schemas.get(k)) {
            return hit;
        }

        let tasks = catalog.iter().map(|(name, script)| {
            let runner = self.runner.clone();
            let task_name = name.clone();
            let script = script.clone();
            let timeout = self.describe_timeout;
            // Spawned so a panicking script adapter only loses its own slot.
            let handle = tokio::spawn(async move {
                describe_script(runner.as_ref(), &task_name, &script, timeout).await
            });
            let name = name.clone();
            async move { (name, handle.await) }
        });

        let mut found = Vec::with_capacity(catalog.len());
        for (name, joined) in join_all(tasks).await {
            match joined {
                Ok(Ok(meta)) => found.push(meta),
                Ok(Err(e)) => {
                    warn!(indicator = %name, kind = e.kind(), error = %e, "describe failed, skipping")
                }
                Err(e) => warn!(indicator = %name, error = %e, "describe task aborted, skipping"),
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            described = found.len(),
            installed = catalog.len(),
            "indicator metadata collected"
        );
        if let Some(key) = key {
            self.schemas.insert(key, found.clone());
        }
        found
    }
}

async fn describe_script<R: ScriptRunner>(
    runner: &R,
    name: &str,
    script: &Path,
    timeout: Duration,
) -> Result<IndicatorMetadata, GatewayError> {
    let request = IndicatorRequest::describe(name);
    let doc = runner
        .run(script, &request, timeout)
        .await
        .map_err(|e| map_launch_error(name, script, e, DESCRIBE_STDERR_CHARS))?;

    if doc.get("success").and_then(Value::as_bool) == Some(false) {
        return match IndicatorResponse::classify(doc) {
            Ok(IndicatorResponse::Failure(f)) => Err(GatewayError::Indicator {
                name: name.to_string(),
                error_type: f.error_type,
                message: f.message,
                details: f.details,
            }),
            _ => Err(GatewayError::Script {
                name: name.to_string(),
                reason: "describe reported failure without an error object".into(),
                stderr: String::new(),
            }),
        };
    }

    let meta = IndicatorMetadata::from_document(doc).map_err(|reason| GatewayError::Script {
        name: name.to_string(),
        reason: excerpt(&reason, DESCRIBE_STDERR_CHARS),
        stderr: String::new(),
    })?;
    if meta.name != name {
        warn!(
            indicator = %name,
            reported = %meta.name,
            "script describes itself under a different name"
        );
    }
    Ok(meta)
}
