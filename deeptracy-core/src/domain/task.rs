//! Task specs discovered from project manifests

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::domain::property::{Property, PropertyError, PropertySet};

/// Strategy used when a manifest entry does not name one
pub const DEFAULT_STRATEGY: &str = "main";

/// One analysis task declared by a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub project: String,
    pub image: String,
    pub strategy: String,
    pub unimportant: bool,
    pub options: Map<String, JsonValue>,
}

impl TaskSpec {
    /// Properties an analyze build is triggered with
    pub fn properties(&self) -> Result<PropertySet, PropertyError> {
        PropertySet::new()
            .with(Property::Project, self.project.as_str())?
            .with(Property::TaskImage, self.image.as_str())?
            .with(Property::TaskStrategy, self.strategy.as_str())?
            .with(Property::TaskOptions, JsonValue::Object(self.options.clone()))?
            .with(Property::Unimportant, self.unimportant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_carry_every_field() {
        let mut options = Map::new();
        options.insert("path".to_string(), JsonValue::from("/workspace/a/repo"));

        let spec = TaskSpec {
            project: "api".to_string(),
            image: "deeptracy/scan-npm".to_string(),
            strategy: DEFAULT_STRATEGY.to_string(),
            unimportant: true,
            options,
        };

        let props = spec.properties().unwrap();
        assert_eq!(props.project(), Some("api"));
        assert_eq!(props.task_image(), Some("deeptracy/scan-npm"));
        assert_eq!(props.task_strategy(), Some("main"));
        assert!(props.unimportant());
        assert_eq!(
            props.task_options().and_then(|o| o.get("path")),
            Some(&JsonValue::from("/workspace/a/repo"))
        );
    }
}
