// =============================================================================
// Central Application State - Indicator Host
// =============================================================================
//
// Wires the launcher, registry and gateway together once at startup and hands
// the bundle to every HTTP handler via `Arc<AppState>`.
//
// Thread safety:
//   - The launcher keeps atomic counters and an optional semaphore.
//   - The registry swaps its catalog behind a parking_lot::RwLock.
//   - The response cache replaces entries whole under its own lock.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::cache::TtlCache;
use crate::executor::{ExecutionGateway, MetadataRegistry, ProcessLauncher};
use crate::runtime_config::RuntimeConfig;

/// Central application state shared across all handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub launcher: Arc<ProcessLauncher>,
    pub registry: Arc<MetadataRegistry<ProcessLauncher>>,
    pub gateway: ExecutionGateway<ProcessLauncher>,
    /// Caller-side memo of execution responses, keyed by request fingerprint.
    pub responses: TtlCache<Value>,
    pub start_time: Instant,
}

impl AppState {
    /// Build every subsystem from `config`. The registry starts empty; call
    /// `registry.reload()` before serving.
    pub fn new(config: RuntimeConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(
            config.interpreter.clone(),
            config.max_concurrent_scripts,
        ));

        // Schemas change only when scripts do, so the metadata cache is always
        // on and flushed by reload.
        let registry = Arc::new(MetadataRegistry::new(
            launcher.clone(),
            config.scripts_dir.clone(),
            config.script_extension.clone(),
            config.describe_timeout(),
            TtlCache::new(true, config.cache_ttl()),
        ));

        let gateway = ExecutionGateway::new(
            launcher.clone(),
            registry.clone(),
            config.execution_timeout(),
            config.stderr_excerpt_chars,
        );

        let responses = TtlCache::new(config.cache_enabled, config.cache_ttl());

        Self {
            config,
            launcher,
            registry,
            gateway,
            responses,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
