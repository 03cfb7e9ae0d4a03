//! Pipeline Module
//!
//! Pipeline definitions: the data model, templates and conditions, loading
//! from YAML and validation.

pub mod condition;
pub mod loader;
pub mod model;
pub mod template;
pub mod validator;

pub use condition::Condition;
pub use loader::{load_pipeline, parse_pipeline};
pub use model::{Action, ParameterSpec, PipelineDefinition, Schedule, StepDefinition, StepKind};
pub use template::{Coercion, Template, TemplateError, TemplateValue, VarPath};
pub use validator::{quick_validate, validate_pipeline};
