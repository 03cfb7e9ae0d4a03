//! Expression Resolver
//!
//! Templates such as `"Hello {{ params.full_name }}"` are parsed once, when a
//! pipeline is loaded, into a [`Template`]: a sequence of literal text and
//! typed [`VarPath`] references. Resolving a template against a [`Scope`] is
//! pure; the same template and scope always produce the same value.
//!
//! # Paths
//!
//! - `params.X[.field…]` - an input parameter
//! - `actions.Y.result[.field…]` - the result of the step registered as `Y`
//! - `actions.Y.status` - the status of the step registered as `Y`
//! - `actions.Y.field` - shorthand for `actions.Y.result.field`
//!
//! Numeric segments index into arrays (`actions.rows.result.rows.0.id`).

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::error::ResolutionError;
use crate::scope::Scope;

/// Why a template or path could not be parsed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unclosed '{{{{'")]
    Unclosed,

    #[error("empty '{{{{ }}}}' expression")]
    EmptyExpression,

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{0}")]
    Syntax(String),
}

/// Which part of a registered step's output a path reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionField {
    Result,
    Status,
}

/// The first segments of a path: what it is rooted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRoot {
    Param(String),
    Action { register: String, field: ActionField },
}

/// A parsed, dot-separated reference into a run scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    root: VarRoot,
    tail: Vec<String>,
    raw: String,
}

impl VarPath {
    pub fn parse(path: &str) -> Result<Self, TemplateError> {
        let raw = path.trim().to_string();
        let invalid = |reason: &str| TemplateError::InvalidPath {
            path: raw.clone(),
            reason: reason.to_string(),
        };

        let segments: Vec<&str> = raw.split('.').map(str::trim).collect();
        if let Some(bad) = segments.iter().find(|s| !is_valid_segment(s)) {
            return Err(invalid(&format!("bad segment '{}'", bad)));
        }

        let (root, tail_start) = match segments[0] {
            "params" => {
                if segments.len() < 2 {
                    return Err(invalid("expected params.<name>"));
                }
                (VarRoot::Param(segments[1].to_string()), 2)
            }
            "actions" => {
                if segments.len() < 3 {
                    return Err(invalid("expected actions.<register>.result or .status"));
                }
                let register = segments[1].to_string();
                match segments[2] {
                    "result" => (
                        VarRoot::Action {
                            register,
                            field: ActionField::Result,
                        },
                        3,
                    ),
                    "status" => {
                        if segments.len() > 3 {
                            return Err(invalid("status has no fields"));
                        }
                        (
                            VarRoot::Action {
                                register,
                                field: ActionField::Status,
                            },
                            3,
                        )
                    }
                    _ => (
                        VarRoot::Action {
                            register,
                            field: ActionField::Result,
                        },
                        2,
                    ),
                }
            }
            other => {
                return Err(invalid(&format!(
                    "unknown root '{}' (expected 'params' or 'actions')",
                    other
                )))
            }
        };

        let tail = segments[tail_start..].iter().map(|s| s.to_string()).collect();
        Ok(Self {
            root,
            tail,
            raw: segments.join("."),
        })
    }

    pub fn root(&self) -> &VarRoot {
        &self.root
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parameter this path reads, if it is rooted at `params`.
    pub fn parameter(&self) -> Option<&str> {
        match &self.root {
            VarRoot::Param(name) => Some(name),
            VarRoot::Action { .. } => None,
        }
    }

    /// The register name this path reads, if it is rooted at `actions`.
    pub fn register(&self) -> Option<&str> {
        match &self.root {
            VarRoot::Action { register, .. } => Some(register),
            VarRoot::Param(_) => None,
        }
    }

    /// Looks the path up in a scope.
    pub fn lookup<'s>(&self, scope: &'s Scope) -> Result<&'s Value, ResolutionError> {
        let base = match &self.root {
            VarRoot::Param(name) => {
                scope
                    .param(name)
                    .ok_or_else(|| ResolutionError::UnknownParameter {
                        path: self.raw.clone(),
                    })?
            }
            VarRoot::Action { register, field } => {
                let output =
                    scope
                        .action(register)
                        .ok_or_else(|| ResolutionError::UnavailableAction {
                            path: self.raw.clone(),
                            register: register.clone(),
                        })?;
                match field {
                    ActionField::Result => &output.result,
                    ActionField::Status => &output.status,
                }
            }
        };

        self.tail.iter().try_fold(base, |current, segment| {
            navigate(current, segment).ok_or_else(|| ResolutionError::MissingField {
                path: self.raw.clone(),
                segment: segment.clone(),
            })
        })
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn navigate<'v>(value: &'v Value, segment: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// How resolved values are turned into text for a given target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Strings verbatim, null as empty, composites as compact JSON.
    Text,
    /// Like `Text`, with single quotes doubled for use inside SQL literals
    /// and null written as `NULL`.
    SqlLiteral,
}

/// Stringifies a value for the given target.
pub fn stringify(value: &Value, coercion: Coercion) -> String {
    let text = match value {
        Value::Null if coercion == Coercion::SqlLiteral => "NULL".to_string(),
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => composite.to_string(),
    };
    match coercion {
        Coercion::Text => text,
        Coercion::SqlLiteral => text.replace('\'', "''"),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Reference(VarPath),
}

/// A string with `{{ path }}` interpolations, parsed ahead of execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open.find("}}").ok_or(TemplateError::Unclosed)?;
            let inner = after_open[..end].trim();
            if inner.is_empty() {
                return Err(TemplateError::EmptyExpression);
            }
            segments.push(Segment::Reference(VarPath::parse(inner)?));
            rest = &after_open[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// A template with no interpolations.
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.clone())]
        };
        Self {
            source: text,
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn references(&self) -> impl Iterator<Item = &VarPath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Reference(path) => Some(path),
            Segment::Literal(_) => None,
        })
    }

    /// Resolves the template to a value.
    ///
    /// A template that is exactly one reference keeps the referenced value's
    /// JSON type; anything else becomes a string.
    pub fn resolve(&self, scope: &Scope) -> Result<Value, ResolutionError> {
        if let [Segment::Reference(path)] = self.segments.as_slice() {
            return path.lookup(scope).cloned();
        }
        self.render(scope, Coercion::Text).map(Value::String)
    }

    /// Resolves every reference and concatenates the pieces as text.
    pub fn render(&self, scope: &Scope, coercion: Coercion) -> Result<String, ResolutionError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Reference(path) => {
                    out.push_str(&stringify(path.lookup(scope)?, coercion));
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A structured value (e.g. an HTTP body) whose strings may be templates.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Template(Template),
    Array(Vec<TemplateValue>),
    Object(Vec<(String, TemplateValue)>),
    Literal(Value),
}

impl TemplateValue {
    pub fn parse(value: &Value) -> Result<Self, TemplateError> {
        Ok(match value {
            Value::String(s) => {
                let template = Template::parse(s)?;
                if template.is_literal() {
                    TemplateValue::Literal(value.clone())
                } else {
                    TemplateValue::Template(template)
                }
            }
            Value::Array(items) => TemplateValue::Array(
                items
                    .iter()
                    .map(TemplateValue::parse)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => TemplateValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), TemplateValue::parse(v)?)))
                    .collect::<Result<_, TemplateError>>()?,
            ),
            other => TemplateValue::Literal(other.clone()),
        })
    }

    pub fn resolve(&self, scope: &Scope) -> Result<Value, ResolutionError> {
        Ok(match self {
            TemplateValue::Template(t) => t.resolve(scope)?,
            TemplateValue::Literal(v) => v.clone(),
            TemplateValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve(scope))
                    .collect::<Result<_, _>>()?,
            ),
            TemplateValue::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (key, field) in fields {
                    map.insert(key.clone(), field.resolve(scope)?);
                }
                Value::Object(map)
            }
        })
    }

    pub fn references(&self) -> Vec<&VarPath> {
        match self {
            TemplateValue::Template(t) => t.references().collect(),
            TemplateValue::Literal(_) => Vec::new(),
            TemplateValue::Array(items) => items.iter().flat_map(|i| i.references()).collect(),
            TemplateValue::Object(fields) => {
                fields.iter().flat_map(|(_, f)| f.references()).collect()
            }
        }
    }
}
