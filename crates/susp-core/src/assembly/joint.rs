//! Joints pairing node points across elements

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A spherical connection between two node points on different elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joint {
    pub id: Uuid,
    /// Node on the "left-hand" element
    pub lhs: Uuid,
    /// Node on the "right-hand" element
    pub rhs: Uuid,
}

impl Joint {
    /// Create a new joint between two nodes
    pub fn new(lhs: Uuid, rhs: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            lhs,
            rhs,
        }
    }

    /// Check if this joint references a node
    pub fn references(&self, node: Uuid) -> bool {
        self.lhs == node || self.rhs == node
    }

    /// Get the node on the other side of the joint
    pub fn partner_of(&self, node: Uuid) -> Option<Uuid> {
        if self.lhs == node {
            Some(self.rhs)
        } else if self.rhs == node {
            Some(self.lhs)
        } else {
            None
        }
    }
}
