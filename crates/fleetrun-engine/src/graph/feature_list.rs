//! Feature list documents.
//!
//! A feature list describes a project's planned features and the features
//! each one depends on. Keys are camelCase; snake_case spellings are
//! accepted as well.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::GraphError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureList {
    #[serde(default, alias = "project_name")]
    pub project_name: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub dependencies: FeatureDependencies,
    #[serde(default)]
    pub passes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureDependencies {
    #[serde(
        default,
        rename = "dependsOnIDs",
        alias = "dependsOnIds",
        alias = "depends_on_ids"
    )]
    pub depends_on_ids: Vec<String>,
}

impl Feature {
    /// Whether the feature needs no further work.
    pub fn is_complete(&self) -> bool {
        self.passes
            || matches!(
                self.status.trim().to_ascii_lowercase().as_str(),
                "done" | "implemented"
            )
    }
}

impl FeatureList {
    pub fn from_json(source: &str, json: &str) -> Result<Self, GraphError> {
        serde_json::from_str(json).map_err(|e| GraphError::FeatureList {
            location: source.to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, GraphError> {
        let json = std::fs::read_to_string(path).map_err(|e| GraphError::FeatureList {
            location: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&path.display().to_string(), &json)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_document() {
        let list = FeatureList::from_json(
            "inline",
            r#"{
                "projectName": "shop",
                "features": [
                    {"id": "F1", "description": "Login", "status": "pending",
                     "priority": "High", "dependencies": {"dependsOnIDs": []}, "passes": false},
                    {"id": "F2", "description": "Cart", "priority": "MVP",
                     "dependencies": {"dependsOnIDs": ["F1"]}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(list.project_name, "shop");
        assert_eq!(list.features.len(), 2);
        assert_eq!(list.features[1].dependencies.depends_on_ids, vec!["F1"]);
        assert!(!list.features[1].passes);
    }

    #[test]
    fn accepts_snake_case_keys() {
        let list = FeatureList::from_json(
            "inline",
            r#"{"project_name": "p", "features": [{"id": "a", "dependencies": {"depends_on_ids": ["b"]}}]}"#,
        )
        .unwrap();
        assert_eq!(list.project_name, "p");
        assert_eq!(list.features[0].dependencies.depends_on_ids, vec!["b"]);
    }

    #[test]
    fn completion_from_status_or_passes() {
        let done = Feature {
            status: "Implemented".to_string(),
            ..Feature::default()
        };
        let passing = Feature {
            passes: true,
            ..Feature::default()
        };
        let open = Feature {
            status: "in_progress".to_string(),
            ..Feature::default()
        };
        assert!(done.is_complete());
        assert!(passing.is_complete());
        assert!(!open.is_complete());
    }

    #[test]
    fn malformed_json_names_source() {
        let err = FeatureList::from_json("features.json", "[1, 2").unwrap_err();
        assert!(err.to_string().contains("features.json"));
    }
}
