// =============================================================================
// Indicator Executor
// =============================================================================
//
// Out-of-process indicator plugins with a JSON-over-pipe ABI:
//   launcher  - one child process per invocation, bounded lifetime.
//   gateway   - request validation and result normalisation.
//   registry  - script discovery and describe-mode schemas.

pub mod gateway;
pub mod launcher;
pub mod registry;

#[cfg(test)]
pub mod testkit;

pub use gateway::ExecutionGateway;
pub use launcher::{LauncherStats, ProcessLauncher, ScriptRunner};
pub use registry::MetadataRegistry;
