//! Assembly (element graph) of a suspension

mod element;
mod joint;

use std::collections::HashMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use element::{Element, ElementKind, NodePoint, SpringProperties};
pub use joint::Joint;

/// Raw assembly data for deserialization (used internally)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssemblyData {
    name: String,
    elements: Vec<Element>,
    joints: Vec<Joint>,
}

/// Suspension assembly: elements connected by joints
#[derive(Debug, Clone, Serialize)]
#[serde(into = "AssemblyData")]
pub struct Assembly {
    pub name: String,
    /// All elements, in insertion order
    pub elements: Vec<Element>,
    /// All joints, in insertion order
    pub joints: Vec<Joint>,
    /// Node ID to owning element index (O(1) lookup)
    node_index: HashMap<Uuid, usize>,
    /// Element ID to element index
    element_index: HashMap<Uuid, usize>,
}

impl From<Assembly> for AssemblyData {
    fn from(assembly: Assembly) -> Self {
        Self {
            name: assembly.name,
            elements: assembly.elements,
            joints: assembly.joints,
        }
    }
}

impl From<AssemblyData> for Assembly {
    fn from(data: AssemblyData) -> Self {
        let mut assembly = Self {
            name: data.name,
            elements: data.elements,
            joints: data.joints,
            node_index: HashMap::new(),
            element_index: HashMap::new(),
        };
        assembly.rebuild_indices();
        assembly
    }
}

impl<'de> Deserialize<'de> for Assembly {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = AssemblyData::deserialize(deserializer)?;
        Ok(Assembly::from(data))
    }
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new("suspension")
    }
}

impl Assembly {
    /// Create a new empty assembly
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
            joints: Vec::new(),
            node_index: HashMap::new(),
            element_index: HashMap::new(),
        }
    }

    /// Rebuild lookup indices (call after editing `elements` directly)
    pub fn rebuild_indices(&mut self) {
        self.node_index.clear();
        self.element_index.clear();
        for (index, element) in self.elements.iter().enumerate() {
            self.element_index.insert(element.id, index);
            for node in element.nodes() {
                self.node_index.insert(node.id, index);
            }
        }
    }

    /// Add an element, returns its ID
    pub fn add_element(&mut self, element: Element) -> Uuid {
        let id = element.id;
        let index = self.elements.len();
        self.element_index.insert(id, index);
        for node in element.nodes() {
            self.node_index.insert(node.id, index);
        }
        self.elements.push(element);
        id
    }

    /// Connect two nodes with a joint, returns the joint ID
    pub fn connect(&mut self, lhs: Uuid, rhs: Uuid) -> AssemblyResult<Uuid> {
        let lhs_owner = self.node_owner(lhs).ok_or(AssemblyError::NodeNotFound(lhs))?;
        let rhs_owner = self.node_owner(rhs).ok_or(AssemblyError::NodeNotFound(rhs))?;
        let joint = Joint::new(lhs, rhs);
        if lhs_owner == rhs_owner {
            return Err(AssemblyError::SelfJoint(joint.id));
        }
        self.joints.push(joint);
        Ok(joint.id)
    }

    /// Get an element by ID
    pub fn element(&self, id: Uuid) -> Option<&Element> {
        self.element_index.get(&id).map(|&i| &self.elements[i])
    }

    /// Get a mutable element by ID
    pub fn element_mut(&mut self, id: Uuid) -> Option<&mut Element> {
        self.element_index
            .get(&id)
            .copied()
            .map(move |i| &mut self.elements[i])
    }

    /// Get the index of an element by ID
    pub fn element_position(&self, id: Uuid) -> Option<usize> {
        self.element_index.get(&id).copied()
    }

    /// Index of the element owning a node
    pub fn node_owner(&self, node: Uuid) -> Option<usize> {
        self.node_index.get(&node).copied()
    }

    /// Get a node together with its owning element
    pub fn node(&self, node: Uuid) -> Option<(&Element, &NodePoint)> {
        let element = &self.elements[self.node_owner(node)?];
        element.node(node).map(|n| (element, n))
    }

    /// World position of a node
    pub fn node_world_position(&self, node: Uuid) -> Option<DVec3> {
        self.node(node)
            .map(|(element, n)| element.world_point(n.position))
    }

    /// Get a joint by ID
    pub fn joint(&self, id: Uuid) -> Option<&Joint> {
        self.joints.iter().find(|j| j.id == id)
    }

    /// All joints referencing a node
    pub fn joints_of_node(&self, node: Uuid) -> impl Iterator<Item = &Joint> {
        self.joints.iter().filter(move |j| j.references(node))
    }

    /// All joints touching an element
    pub fn joints_of(&self, element: Uuid) -> Vec<&Joint> {
        let Some(index) = self.element_position(element) else {
            return Vec::new();
        };
        self.joints
            .iter()
            .filter(|j| {
                self.node_owner(j.lhs) == Some(index) || self.node_owner(j.rhs) == Some(index)
            })
            .collect()
    }

    /// Node on the other side of the first joint referencing `node`
    pub fn partner_of(&self, node: Uuid) -> Option<Uuid> {
        self.joints_of_node(node).find_map(|j| j.partner_of(node))
    }

    /// Validate the assembly
    pub fn validate(&self) -> Result<(), Vec<AssemblyError>> {
        let mut errors = Vec::new();

        // Node IDs must be unique across elements
        let mut seen = HashMap::new();
        for element in &self.elements {
            for node in element.nodes() {
                if seen.insert(node.id, element.id).is_some() {
                    errors.push(AssemblyError::DuplicateNode(node.id));
                }
            }

            let (fixed_count, point_count) = element.kind.node_layout();
            let points_ok = match point_count {
                Some(n) => element.points.len() >= n,
                None => !element.points.is_empty(),
            };
            if element.fixed_points.len() < fixed_count || !points_ok {
                errors.push(AssemblyError::MalformedElement {
                    element: element.id,
                    reason: format!(
                        "{} requires {} fixed point(s) and {} point(s)",
                        element.kind.type_name(),
                        fixed_count,
                        point_count.map_or("at least one".to_string(), |n| n.to_string())
                    ),
                });
            }
        }

        // Check joint references
        for joint in &self.joints {
            for node in [joint.lhs, joint.rhs] {
                if self.node_owner(node).is_none() {
                    errors.push(AssemblyError::InvalidJointReference(joint.id, node));
                }
            }
            if self.node_owner(joint.lhs).is_some()
                && self.node_owner(joint.lhs) == self.node_owner(joint.rhs)
            {
                errors.push(AssemblyError::SelfJoint(joint.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Assembly-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssemblyError {
    #[error("Element not found: {0}")]
    ElementNotFound(Uuid),
    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),
    #[error("Joint not found: {0}")]
    JointNotFound(Uuid),
    #[error("Joint {0} connects an element to itself")]
    SelfJoint(Uuid),
    #[error("Node ID used more than once: {0}")]
    DuplicateNode(Uuid),
    #[error("Invalid joint reference: joint {0} references non-existent node {1}")]
    InvalidJointReference(Uuid, Uuid),
    #[error("Malformed element {element}: {reason}")]
    MalformedElement { element: Uuid, reason: String },
}

/// Result type for assembly operations
pub type AssemblyResult<T> = Result<T, AssemblyError>;
