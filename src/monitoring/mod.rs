//! Run Monitoring Module
//!
//! Tracks what runs are doing and have done.
//!
//! # Components
//!
//! - [`RunRegistry`]: live run snapshots and per-pipeline counters
//! - [`RunArchive`]: terminal runs persisted as JSON
//! - [`RunTimeline`]: step timing for Gantt charts

pub mod archive;
pub mod registry;
pub mod timeline;

pub use archive::RunArchive;
pub use registry::{PipelineCounters, RunRegistry};
pub use timeline::{RunTimeline, TimelineEntry};
