//! Property store
//!
//! Every build owns one [`PropertySet`]. Recognized keys are enumerated in
//! [`Property`] and schema-checked on insertion; anything else is kept as
//! opaque bytes so that newer producers can pass data through older runners.
//!
//! Properties are write-once: a key that is already set cannot be replaced.
//! Children receive a copy of selected parent keys at trigger time
//! ([`PropertySet::seed`]) and never share storage with the parent.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Recognized property keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    /// Repository URL to analyze
    Repo,
    /// Commit (or branch) to check out
    Commit,
    /// Webhook the backend notifies when vulnerabilities are found
    Notify,
    /// Backend analysis identifier
    AnalysisId,
    /// Identifier of one analyze execution
    ExecutionId,
    /// Path of the checked-out repository inside worker containers
    RepoPath,
    /// Project name from the manifest
    Project,
    /// Container image running the analysis task
    TaskImage,
    /// Strategy passed to the task entrypoint
    TaskStrategy,
    /// Option bag passed to the task
    TaskOptions,
    /// Marks a build whose failure must not fail its parent
    Unimportant,
    /// Number of tasks discovered by bootstrap
    TaskCount,
    /// Dependency report produced by a task
    Dependencies,
    /// Vulnerability report produced by a task
    Vulnerabilities,
    /// Number of analyze children that reported dependencies
    DependencyReports,
    /// Number of analyze children that reported vulnerabilities
    VulnerabilityReports,
    /// Terminal status of the whole analysis, as reported to the backend
    AnalysisStatus,
}

/// Shape a recognized key accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Flag,
    Document,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Text => write!(f, "text"),
            ValueKind::Integer => write!(f, "integer"),
            ValueKind::Flag => write!(f, "flag"),
            ValueKind::Document => write!(f, "document"),
        }
    }
}

impl Property {
    pub const ALL: [Property; 17] = [
        Property::Repo,
        Property::Commit,
        Property::Notify,
        Property::AnalysisId,
        Property::ExecutionId,
        Property::RepoPath,
        Property::Project,
        Property::TaskImage,
        Property::TaskStrategy,
        Property::TaskOptions,
        Property::Unimportant,
        Property::TaskCount,
        Property::Dependencies,
        Property::Vulnerabilities,
        Property::DependencyReports,
        Property::VulnerabilityReports,
        Property::AnalysisStatus,
    ];

    /// Wire name used in templates and harvested responses
    pub fn name(&self) -> &'static str {
        match self {
            Property::Repo => "repo",
            Property::Commit => "commit",
            Property::Notify => "notify",
            Property::AnalysisId => "analysis_id",
            Property::ExecutionId => "execution_id",
            Property::RepoPath => "repo_path",
            Property::Project => "project",
            Property::TaskImage => "task_image",
            Property::TaskStrategy => "task_strategy",
            Property::TaskOptions => "task_options",
            Property::Unimportant => "unimportant",
            Property::TaskCount => "task_count",
            Property::Dependencies => "dependencies",
            Property::Vulnerabilities => "vulnerabilities",
            Property::DependencyReports => "dependency_reports",
            Property::VulnerabilityReports => "vulnerability_reports",
            Property::AnalysisStatus => "analysis_status",
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Property::Unimportant => ValueKind::Flag,
            Property::TaskCount | Property::DependencyReports | Property::VulnerabilityReports => {
                ValueKind::Integer
            }
            Property::TaskOptions | Property::Dependencies | Property::Vulnerabilities => {
                ValueKind::Document
            }
            _ => ValueKind::Text,
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = PropertyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| PropertyError::Unknown(s.to_string()))
    }
}

/// Typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Flag(bool),
    Document(JsonValue),
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Text(_) => ValueKind::Text,
            PropertyValue::Integer(_) => ValueKind::Integer,
            PropertyValue::Flag(_) => ValueKind::Flag,
            PropertyValue::Document(_) => ValueKind::Document,
        }
    }

    /// Converts a JSON value into the shape expected by `kind`
    pub fn from_json(kind: ValueKind, value: JsonValue) -> Option<Self> {
        match (kind, value) {
            (ValueKind::Text, JsonValue::String(s)) => Some(PropertyValue::Text(s)),
            (ValueKind::Text, JsonValue::Number(n)) => Some(PropertyValue::Text(n.to_string())),
            (ValueKind::Integer, JsonValue::Number(n)) => n.as_i64().map(PropertyValue::Integer),
            (ValueKind::Flag, JsonValue::Bool(b)) => Some(PropertyValue::Flag(b)),
            (ValueKind::Document, value) => Some(PropertyValue::Document(value)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            PropertyValue::Text(s) => JsonValue::String(s.clone()),
            PropertyValue::Integer(i) => JsonValue::from(*i),
            PropertyValue::Flag(b) => JsonValue::Bool(*b),
            PropertyValue::Document(doc) => doc.clone(),
        }
    }

    /// Text form used when interpolating into URLs and strings
    pub fn to_text(&self) -> String {
        match self {
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Flag(b) => b.to_string(),
            PropertyValue::Document(doc) => doc.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Flag(value)
    }
}

impl From<JsonValue> for PropertyValue {
    fn from(value: JsonValue) -> Self {
        PropertyValue::Document(value)
    }
}

/// Errors raised by the property store
#[derive(Debug, Error, PartialEq)]
pub enum PropertyError {
    #[error("property '{0}' is already set")]
    AlreadySet(String),

    #[error("property '{key}' expects a {expected} value, got {actual}")]
    TypeMismatch {
        key: Property,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("value for '{key}' cannot be read as {expected}")]
    InvalidJson { key: Property, expected: ValueKind },

    #[error("unknown property '{0}'")]
    Unknown(String),
}

/// Key/value bag scoped to one build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    known: BTreeMap<Property, PropertyValue>,
    opaque: BTreeMap<String, Vec<u8>>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a recognized key, rejecting overwrites and wrongly-shaped values
    pub fn insert(
        &mut self,
        key: Property,
        value: impl Into<PropertyValue>,
    ) -> Result<(), PropertyError> {
        let value = value.into();
        if value.kind() != key.kind() {
            return Err(PropertyError::TypeMismatch {
                key,
                expected: key.kind(),
                actual: value.kind(),
            });
        }
        if self.known.contains_key(&key) {
            return Err(PropertyError::AlreadySet(key.name().to_string()));
        }
        self.known.insert(key, value);
        Ok(())
    }

    /// Builder form of [`PropertySet::insert`]
    pub fn with(
        mut self,
        key: Property,
        value: impl Into<PropertyValue>,
    ) -> Result<Self, PropertyError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Stores bytes under a name the schema does not recognize
    pub fn insert_opaque(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<(), PropertyError> {
        let name = name.into();
        if let Ok(key) = name.parse::<Property>() {
            return Err(PropertyError::TypeMismatch {
                key,
                expected: key.kind(),
                actual: ValueKind::Document,
            });
        }
        if self.opaque.contains_key(&name) {
            return Err(PropertyError::AlreadySet(name));
        }
        self.opaque.insert(name, bytes);
        Ok(())
    }

    /// Sets a property by wire name from a JSON value
    ///
    /// Recognized names are converted to their typed shape; unknown names are
    /// stored opaque as the JSON encoding of the value.
    pub fn insert_json(&mut self, name: &str, value: JsonValue) -> Result<(), PropertyError> {
        match name.parse::<Property>() {
            Ok(key) => {
                let typed = PropertyValue::from_json(key.kind(), value).ok_or(
                    PropertyError::InvalidJson {
                        key,
                        expected: key.kind(),
                    },
                )?;
                self.insert(key, typed)
            }
            Err(_) => self.insert_opaque(name, value.to_string().into_bytes()),
        }
    }

    pub fn get(&self, key: Property) -> Option<&PropertyValue> {
        self.known.get(&key)
    }

    pub fn contains(&self, key: Property) -> bool {
        self.known.contains_key(&key)
    }

    pub fn opaque(&self, name: &str) -> Option<&[u8]> {
        self.opaque.get(name).map(Vec::as_slice)
    }

    /// Resolves a wire name to JSON, looking at recognized keys first
    ///
    /// Opaque values are decoded as JSON when possible and as a UTF-8 string
    /// otherwise.
    pub fn lookup(&self, name: &str) -> Option<JsonValue> {
        if let Ok(key) = name.parse::<Property>() {
            return self.get(key).map(PropertyValue::to_json);
        }
        let bytes = self.opaque.get(name)?;
        serde_json::from_slice(bytes)
            .ok()
            .or_else(|| Some(JsonValue::String(String::from_utf8_lossy(bytes).into_owned())))
    }

    /// Copies the selected keys into a fresh set for a child build
    pub fn seed(&self, keys: &[Property]) -> PropertySet {
        let known = keys
            .iter()
            .filter_map(|k| self.known.get(k).map(|v| (*k, v.clone())))
            .collect();
        PropertySet {
            known,
            opaque: BTreeMap::new(),
        }
    }

    /// Moves every entry of `other` into this set
    pub fn merge(&mut self, other: PropertySet) -> Result<(), PropertyError> {
        for (key, value) in other.known {
            self.insert(key, value)?;
        }
        for (name, bytes) in other.opaque {
            self.insert_opaque(name, bytes)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.known.len() + self.opaque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.opaque.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Property, &PropertyValue)> {
        self.known.iter()
    }

    fn text(&self, key: Property) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    pub fn repo(&self) -> Option<&str> {
        self.text(Property::Repo)
    }

    pub fn commit(&self) -> Option<&str> {
        self.text(Property::Commit)
    }

    pub fn analysis_id(&self) -> Option<&str> {
        self.text(Property::AnalysisId)
    }

    pub fn repo_path(&self) -> Option<&str> {
        self.text(Property::RepoPath)
    }

    pub fn project(&self) -> Option<&str> {
        self.text(Property::Project)
    }

    pub fn task_image(&self) -> Option<&str> {
        self.text(Property::TaskImage)
    }

    pub fn task_strategy(&self) -> Option<&str> {
        self.text(Property::TaskStrategy)
    }

    pub fn task_options(&self) -> Option<&JsonValue> {
        match self.get(Property::TaskOptions) {
            Some(PropertyValue::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    pub fn task_count(&self) -> Option<i64> {
        match self.get(Property::TaskCount) {
            Some(PropertyValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn unimportant(&self) -> bool {
        matches!(self.get(Property::Unimportant), Some(PropertyValue::Flag(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_is_write_once() {
        let mut props = PropertySet::new();
        props.insert(Property::Repo, "git@example.com:a/b.git").unwrap();

        let err = props.insert(Property::Repo, "other").unwrap_err();
        assert_eq!(err, PropertyError::AlreadySet("repo".to_string()));
        assert_eq!(props.repo(), Some("git@example.com:a/b.git"));
    }

    #[test]
    fn test_insert_checks_schema() {
        let mut props = PropertySet::new();
        let err = props.insert(Property::TaskCount, "three").unwrap_err();
        assert!(matches!(err, PropertyError::TypeMismatch { .. }));

        props.insert(Property::TaskCount, 3_i64).unwrap();
        assert_eq!(props.task_count(), Some(3));
    }

    #[test]
    fn test_seed_is_one_way() {
        let parent = PropertySet::new()
            .with(Property::Repo, "https://example.com/r.git")
            .unwrap()
            .with(Property::AnalysisId, "a-1")
            .unwrap()
            .with(Property::TaskCount, 2_i64)
            .unwrap();

        let mut child = parent.seed(&[Property::Repo, Property::AnalysisId]);
        assert!(!child.contains(Property::TaskCount));

        child.insert(Property::ExecutionId, "e-1").unwrap();
        child.insert_opaque("scratch", b"x".to_vec()).unwrap();

        assert!(!parent.contains(Property::ExecutionId));
        assert!(parent.opaque("scratch").is_none());
        assert_eq!(parent.len(), 3);
    }

    #[test]
    fn test_insert_json_routes_unknown_keys_to_opaque() {
        let mut props = PropertySet::new();
        props.insert_json("analysis_id", json!("abc")).unwrap();
        props.insert_json("build_url", json!("http://ci/1")).unwrap();

        assert_eq!(props.analysis_id(), Some("abc"));
        assert_eq!(props.lookup("build_url"), Some(json!("http://ci/1")));
        assert!(props.insert_json("task_count", json!("nope")).is_err());
    }

    #[test]
    fn test_opaque_rejects_known_names() {
        let mut props = PropertySet::new();
        assert!(props.insert_opaque("repo", b"x".to_vec()).is_err());
    }

    #[test]
    fn test_lookup_falls_back_to_text_for_raw_bytes() {
        let mut props = PropertySet::new();
        props.insert_opaque("raw", b"not json".to_vec()).unwrap();
        assert_eq!(props.lookup("raw"), Some(json!("not json")));
        assert_eq!(props.lookup("missing"), None);
    }

    #[test]
    fn test_property_names_round_trip() {
        for key in Property::ALL {
            assert_eq!(key.name().parse::<Property>().unwrap(), key);
        }
    }
}
