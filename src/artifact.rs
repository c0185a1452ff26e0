use serde::{Deserialize, Serialize};

use crate::config::{ResourceLimits, ResourceLimitsOverride};

/// Copy of an artifact taken at enqueue time.
///
/// The queue consumer works only from this snapshot; it never goes back to
/// artifact storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub language: String,
    pub content: String,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimitsOverride>,
    /// Metadata this subsystem does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ArtifactSnapshot {
    pub fn new(
        artifact_type: impl Into<String>,
        language: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            artifact_type: artifact_type.into(),
            language: language.into(),
            content: content.into(),
            metadata: ArtifactMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimitsOverride) -> Self {
        self.metadata.resource_limits = Some(limits);
        self
    }

    /// Effective limits: this artifact's overrides applied to `defaults`.
    pub fn limits(&self, defaults: &ResourceLimits) -> ResourceLimits {
        defaults.merged(self.metadata.resource_limits.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_format_with_extra_metadata() {
        let snapshot: ArtifactSnapshot = serde_json::from_str(
            r#"{
                "type": "python-script",
                "language": "python",
                "content": "print(1)",
                "metadata": {"resourceLimits": {"maxExecutionTime": 5000}, "title": "demo"}
            }"#,
        )
        .unwrap();
        assert_eq!(snapshot.artifact_type, "python-script");
        assert_eq!(snapshot.id, None);
        assert_eq!(snapshot.metadata.extra["title"], "demo");

        let limits = snapshot.limits(&ResourceLimits::default());
        assert_eq!(limits.max_execution_time_ms, 5000);
        assert_eq!(limits.max_output_bytes, ResourceLimits::default().max_output_bytes);
    }

    #[test]
    fn metadata_is_optional() {
        let snapshot: ArtifactSnapshot =
            serde_json::from_str(r#"{"type": "html-page", "language": "html", "content": "<p>"}"#)
                .unwrap();
        assert_eq!(snapshot.limits(&ResourceLimits::default()), ResourceLimits::default());
    }
}
