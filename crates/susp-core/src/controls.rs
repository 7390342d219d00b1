//! Controls driving offsets and point-to-plane targets
//!
//! Controls are keyed by element ID. An `Offset` control drives the controlled
//! offset `dl` of a bar, spring or linear bushing. A `Plane` control pins a
//! node of the element onto a plane `normal · p = distance + value`.

use std::collections::HashMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single control attached to an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    /// Drive the element's controlled offset
    Offset {
        /// Offset from nominal length (mm)
        value: f64,
    },
    /// Keep a node of the element on a plane
    Plane {
        /// Node of the controlled element
        node: Uuid,
        /// Plane normal (normalized on use)
        normal: DVec3,
        /// Plane distance from the origin along the normal
        distance: f64,
        /// Lower bound of the plane offset
        dl_min: f64,
        /// Upper bound of the plane offset
        dl_max: f64,
        /// Current plane offset
        value: f64,
    },
}

impl Control {
    /// Create an offset control
    pub fn offset(value: f64) -> Self {
        Control::Offset { value }
    }

    /// Create a plane control with symmetric bounds
    pub fn plane(node: Uuid, normal: DVec3, distance: f64, range: f64) -> Self {
        Control::Plane {
            node,
            normal,
            distance,
            dl_min: -range,
            dl_max: range,
            value: 0.0,
        }
    }

    /// Current driven value
    pub fn value(&self) -> f64 {
        match self {
            Control::Offset { value } | Control::Plane { value, .. } => *value,
        }
    }

    /// Set the driven value
    pub fn set_value(&mut self, new_value: f64) {
        match self {
            Control::Offset { value } | Control::Plane { value, .. } => *value = new_value,
        }
    }
}

/// All controls of an assembly, keyed by element ID
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Controls {
    controls: HashMap<Uuid, Vec<Control>>,
}

impl Controls {
    /// Create an empty control map
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a control to an element
    pub fn add(&mut self, element: Uuid, control: Control) {
        self.controls.entry(element).or_default().push(control);
    }

    /// Controls attached to an element
    pub fn get(&self, element: Uuid) -> &[Control] {
        self.controls.get(&element).map_or(&[], Vec::as_slice)
    }

    /// Mutable controls attached to an element
    pub fn get_mut(&mut self, element: Uuid) -> Option<&mut Vec<Control>> {
        self.controls.get_mut(&element)
    }

    /// The offset control of an element, if any
    pub fn offset_of(&self, element: Uuid) -> Option<f64> {
        self.get(element).iter().find_map(|c| match c {
            Control::Offset { value } => Some(*value),
            Control::Plane { .. } => None,
        })
    }

    /// Whether an element has an offset control
    pub fn is_controlled(&self, element: Uuid) -> bool {
        self.offset_of(element).is_some()
    }

    /// Iterate over (element, control) pairs
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, &Control)> {
        self.controls
            .iter()
            .flat_map(|(id, list)| list.iter().map(move |c| (*id, c)))
    }

    /// Check if there are no controls
    pub fn is_empty(&self) -> bool {
        self.controls.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_lookup() {
        let mut controls = Controls::new();
        let rack = Uuid::new_v4();
        controls.add(rack, Control::offset(5.0));
        assert_eq!(controls.offset_of(rack), Some(5.0));
        assert!(controls.is_controlled(rack));
        assert!(!controls.is_controlled(Uuid::new_v4()));
        assert_eq!(controls.iter().count(), 1);
    }

    #[test]
    fn test_set_value() {
        let mut control = Control::plane(Uuid::new_v4(), DVec3::Z, 0.0, 50.0);
        control.set_value(12.5);
        assert_eq!(control.value(), 12.5);
    }
}
