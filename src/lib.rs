//! Callflow - Declarative Workflow Execution Engine
//!
//! Runs named pipelines such as "call a debtor" or "process an uploaded
//! file". Each pipeline is an ordered list of templated steps, and each step
//! invokes one external integration: a database, an HTTP service, a script,
//! or a conditional wait. Runs get retries, legal-calling-hours gating and
//! bounded per-pipeline concurrency.
//!
//! # Architecture
//!
//! - [`pipeline`]: definitions, templates, conditions, YAML loading and validation
//! - [`execution`]: the [`Engine`], governor, runner and step executors
//! - [`compliance`]: the calling-hours window and clocks
//! - [`monitoring`]: the run registry, archive and timelines
//! - [`run`] and [`scope`]: run snapshots and the values templates see
//! - [`config`], [`error`] and [`duration`]: configuration and shared types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use callflow::{load_pipeline, Engine, EngineConfig, Trigger};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connections, compliance window and defaults
//!     let engine = Engine::new(EngineConfig::load("callflow.yaml")?)?;
//!
//!     // Load and register a pipeline
//!     engine.register_pipeline(load_pipeline("call_debtor.yaml")?)?;
//!
//!     // Submit a run and wait for it
//!     let mut params = BTreeMap::new();
//!     params.insert("full_name".to_string(), "Ivan Petrov".into());
//!     params.insert("phone_number".to_string(), "+79001234567".into());
//!     let id = engine.submit_run("call_debtor", params, Trigger::manual())?;
//!     let run = engine.wait_for_run(id).await?;
//!     println!("{} finished: {}", run.id, run.status);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod compliance;
pub mod config;
pub mod duration;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;
pub mod run;
pub mod scope;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigError, EngineError, ExecutorError, ResolutionError, StepError, SubmitError};
pub use execution::engine::Engine;
pub use execution::RetryPolicy;
pub use monitoring::PipelineCounters;
pub use pipeline::{load_pipeline, parse_pipeline, quick_validate, PipelineDefinition};
pub use run::{RunId, RunSnapshot, RunStatus, RunSummary, Trigger};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Callflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Callflow");
    }

    #[test]
    fn test_module_exports_pipeline() {
        let pipeline = PipelineDefinition::new("call_debtor");
        assert!(pipeline.is_empty());
        assert_eq!(quick_validate(&pipeline).len(), 1);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
