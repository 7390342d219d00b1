//! Project file serialization

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::assembly::Assembly;
use crate::constants::PROJECT_VERSION;
use crate::controls::Controls;

/// Project file containing an assembly and its controls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// File format version
    pub version: u32,
    /// Project name
    pub name: String,
    /// Suspension assembly
    pub assembly: Assembly,
    /// Controls keyed by element ID
    #[serde(default)]
    pub controls: Controls,
}

impl Default for Project {
    fn default() -> Self {
        Self::new("New Project")
    }
}

impl Project {
    /// Create a new empty project
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: PROJECT_VERSION,
            name: name.into(),
            assembly: Assembly::default(),
            controls: Controls::default(),
        }
    }

    /// Create a project from an existing assembly
    pub fn with_assembly(name: impl Into<String>, assembly: Assembly, controls: Controls) -> Self {
        Self {
            version: PROJECT_VERSION,
            name: name.into(),
            assembly,
            controls,
        }
    }

    /// Save project to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let content = self.to_bytes()?;
        std::fs::write(path, content).map_err(|e| ProjectError::Io(e.to_string()))?;
        Ok(())
    }

    /// Serialize project to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProjectError> {
        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ProjectError::Serialize(e.to_string()))?;
        Ok(content.into_bytes())
    }

    /// Load project from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ProjectError::Io(e.to_string()))?;
        Self::load_from_str(&content)
    }

    /// Load project from a RON string
    pub fn load_from_str(content: &str) -> Result<Self, ProjectError> {
        let project: Project =
            ron::from_str(content).map_err(|e| ProjectError::Deserialize(e.to_string()))?;
        if project.version > PROJECT_VERSION {
            return Err(ProjectError::UnsupportedVersion(project.version));
        }
        Ok(project)
    }
}

/// Project-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Unsupported project version: {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Element;
    use crate::controls::Control;
    use glam::DVec3;

    #[test]
    fn test_save_and_load() {
        let mut project = Project::new("skidpad");
        let bar = Element::bar("tie rod", DVec3::ZERO, DVec3::new(0.0, 300.0, 0.0));
        let bar_id = project.assembly.add_element(bar);
        project.controls.add(bar_id, Control::offset(2.0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.ron");
        project.save(&path).unwrap();

        let loaded = Project::load(&path).unwrap();
        assert_eq!(loaded.name, "skidpad");
        assert_eq!(loaded.assembly.elements.len(), 1);
        assert_eq!(loaded.controls.offset_of(bar_id), Some(2.0));
        let node = loaded.assembly.elements[0].points[0].id;
        assert_eq!(loaded.assembly.node_owner(node), Some(0));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut project = Project::new("future");
        project.version = PROJECT_VERSION + 1;
        let text = String::from_utf8(project.to_bytes().unwrap()).unwrap();
        assert!(matches!(
            Project::load_from_str(&text),
            Err(ProjectError::UnsupportedVersion(_))
        ));
    }
}
