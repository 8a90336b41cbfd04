//! Backend signal definitions
//!
//! A [`SignalEvent`] describes one outbound notification: the HTTP method,
//! a URL template, an optional payload template, the condition under which
//! it fires and the response fields to harvest back into the build's
//! properties. Templates reference properties by wire name in braces, e.g.
//! `/analysis/{analysis_id}/extraction/started`.
//!
//! Rendering happens immediately before dispatch so that values produced by
//! earlier steps of the same build are visible.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::domain::property::{Property, PropertySet};

/// HTTP method of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
        }
    }
}

/// Guard evaluated against the build's properties before sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalCondition {
    Always,
    IfPresent(Property),
    IfAbsent(Property),
}

impl SignalCondition {
    pub fn holds(&self, props: &PropertySet) -> bool {
        match self {
            SignalCondition::Always => true,
            SignalCondition::IfPresent(key) => props.contains(*key),
            SignalCondition::IfAbsent(key) => !props.contains(*key),
        }
    }
}

/// Copies one field of the JSON response into a property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Harvest {
    pub field: String,
    pub property: String,
}

/// Errors raised while rendering templates
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template references missing property '{0}'")]
    MissingProperty(String),

    #[error("unterminated placeholder in template '{0}'")]
    Unterminated(String),
}

/// An outbound notification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub name: String,
    pub method: Method,
    pub url_template: String,
    pub payload: Option<JsonValue>,
    pub condition: SignalCondition,
    pub harvest: Vec<Harvest>,
    /// A failed delivery fails the enclosing step when set
    pub required: bool,
}

/// A signal with its templates resolved
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSignal {
    pub method: Method,
    pub path: String,
    pub body: Option<JsonValue>,
}

impl SignalEvent {
    pub fn new(name: impl Into<String>, method: Method, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            url_template: url_template.into(),
            payload: None,
            condition: SignalCondition::Always,
            harvest: Vec::new(),
            required: false,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn when(mut self, condition: SignalCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn harvest(mut self, field: impl Into<String>, property: impl Into<String>) -> Self {
        self.harvest.push(Harvest {
            field: field.into(),
            property: property.into(),
        });
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn render(&self, props: &PropertySet) -> Result<RenderedSignal, RenderError> {
        let path = render_template(&self.url_template, props)?;
        let body = self
            .payload
            .as_ref()
            .map(|payload| render_json(payload, props))
            .transpose()?;

        Ok(RenderedSignal {
            method: self.method,
            path,
            body,
        })
    }
}

/// Interpolates `{name}` placeholders as text
pub fn render_template(template: &str, props: &PropertySet) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| RenderError::Unterminated(template.to_string()))?;
        let name = &after[..end];
        out.push_str(&lookup_text(name, props)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Renders a payload template
///
/// A string that is exactly one placeholder is replaced by the property's
/// JSON value, so `"{task_count}"` renders as a number. Other strings are
/// interpolated as text.
pub fn render_json(template: &JsonValue, props: &PropertySet) -> Result<JsonValue, RenderError> {
    match template {
        JsonValue::String(s) => match whole_placeholder(s) {
            Some(name) => props
                .lookup(name)
                .ok_or_else(|| RenderError::MissingProperty(name.to_string())),
            None => render_template(s, props).map(JsonValue::String),
        },
        JsonValue::Array(items) => items
            .iter()
            .map(|item| render_json(item, props))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| render_json(v, props).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(JsonValue::Object),
        other => Ok(other.clone()),
    }
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    (!inner.contains(['{', '}'])).then_some(inner)
}

fn lookup_text(name: &str, props: &PropertySet) -> Result<String, RenderError> {
    match props.lookup(name) {
        Some(JsonValue::String(s)) => Ok(s),
        Some(other) => Ok(other.to_string()),
        None => Err(RenderError::MissingProperty(name.to_string())),
    }
}
