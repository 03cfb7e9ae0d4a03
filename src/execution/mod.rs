//! Pipeline Execution Module
//!
//! Runs pipelines: admission, step sequencing, retries and the executors
//! that talk to external integrations.
//!
//! # Architecture
//!
//! - [`engine`]: the [`Engine`] facade (Trigger, Status and Control APIs)
//! - [`governor`]: per-pipeline concurrency limits with FIFO admission
//! - [`runner`]: the per-run state machine walking steps in order
//! - [`step`]: one attempt of one step under its deadline
//! - [`retry`]: bounded exponential backoff
//! - [`actions`]: the `db_query`, `script`, `http_request` and `wait_for`
//!   executors

pub mod actions;
pub mod engine;
pub mod governor;
pub mod retry;
pub mod runner;
pub mod step;

pub use actions::{Datastore, Integrations, QueryOutput, SqlDatastore, StepContext};
pub use engine::Engine;
pub use governor::{Admission, Governor, Permit};
pub use retry::RetryPolicy;
pub use runner::{RunOutcome, Runner};
