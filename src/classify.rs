//! Components-file detection
//!
//! A project directory may hold a framework-style `serverless.yml` (with a
//! `provider` section) or a components template. Only the latter, or a script
//! exporting a component constructor, is run by this tool.

use serde_json::Value;

use crate::config_file::ServerlessFile;

/// What a resolved configuration turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Declarative components template
    Template,
    /// Script export that is itself a component constructor
    Script,
    NotAComponentsFile,
}

/// Classify a resolved configuration.
#[must_use]
pub fn classify(file: &ServerlessFile) -> Classification {
    match file {
        ServerlessFile::Constructor(_) => Classification::Script,
        ServerlessFile::Document(value) if is_components_template(value) => {
            Classification::Template
        }
        ServerlessFile::Document(_) => Classification::NotAComponentsFile,
    }
}

/// Whether `file` is something this tool runs.
#[must_use]
pub fn is_components_file(file: &ServerlessFile) -> bool {
    classify(file) != Classification::NotAComponentsFile
}

/// Whether `value` is a components template.
///
/// Framework files (truthy `provider.name`) are never templates, even when
/// some member also carries a `component` attribute.
#[must_use]
pub fn is_components_template(value: &Value) -> bool {
    let members: Vec<&Value> = match value {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => return false,
    };

    if attribute(value, "provider").is_some_and(|provider| {
        attribute(provider, "name").is_some_and(truthy)
    }) {
        return false;
    }

    members
        .into_iter()
        .any(|member| attribute(member, "component").is_some_and(truthy))
}

fn attribute<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value.as_object().and_then(|map| map.get(name))
}

/// Loose truthiness: null, false, 0, NaN and "" are false; everything else is true.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
