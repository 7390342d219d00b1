//! Element and node point types for the suspension assembly

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named anchor point on an element, in element-local coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePoint {
    pub id: Uuid,
    pub name: String,
    pub position: DVec3,
}

impl NodePoint {
    pub fn new(name: impl Into<String>, position: DVec3) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            position,
        }
    }
}

/// Spring/damper characteristics shared by linear and torsion springs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpringProperties {
    /// Lower bound of the controlled offset
    pub dl_min: f64,
    /// Upper bound of the controlled offset
    pub dl_max: f64,
    /// N/mm for linear springs, N·mm/rad for torsion springs
    pub spring_constant: f64,
    /// Unloaded length (or twist angle); derived from preload when None
    pub free_length: Option<f64>,
}

impl Default for SpringProperties {
    fn default() -> Self {
        Self {
            dl_min: -10.0,
            dl_max: 10.0,
            spring_constant: 30.0,
            free_length: None,
        }
    }
}

/// Kind of mechanical element
///
/// Node layout per kind:
/// - `Bar`, `SpringDamper`: `fixed_points[0]` and `points[0]` are the two ends
/// - `AArm`: `fixed_points[0..2]` are the chassis pivots, `points[0]` the outer
///   ball joint, further points make the arm a full rigid body
/// - `Tire`: `fixed_points[0..2]` are the bearing nodes
/// - `LinearBushing`: `fixed_points[0..2]` define the axis, `points` are rod ends
/// - `TorsionSpring`: `fixed_points[0..2]` define the axis, `points[0..2]` are
///   the arm ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    /// Generic rigid body (uprights, rockers, chassis)
    Body {
        /// Grounded: excluded from the unknowns
        fixed: bool,
    },
    /// Two-force member
    Bar,
    /// Spring/damper unit acting along its two ends
    SpringDamper { spring: SpringProperties },
    /// Triangular control arm
    AArm,
    /// Tire mounted on two bearing nodes
    Tire {
        radius: f64,
        /// Wheel center (local)
        center: DVec3,
        /// Spin axis (local), pointing to the vehicle's left
        axis: DVec3,
    },
    /// Rack or slider moving along an axis fixed to a frame
    LinearBushing { dl_min: f64, dl_max: f64 },
    /// Torsion bar with two arms
    TorsionSpring { spring: SpringProperties },
}

impl ElementKind {
    /// Get the type name of this kind
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Body { .. } => "Body",
            ElementKind::Bar => "Bar",
            ElementKind::SpringDamper { .. } => "Spring Damper",
            ElementKind::AArm => "A-Arm",
            ElementKind::Tire { .. } => "Tire",
            ElementKind::LinearBushing { .. } => "Linear Bushing",
            ElementKind::TorsionSpring { .. } => "Torsion Spring",
        }
    }

    /// Required (fixed_points, points) counts; `None` means "at least one"
    pub(crate) fn node_layout(&self) -> (usize, Option<usize>) {
        match self {
            ElementKind::Body { .. } => (0, Some(0)),
            ElementKind::Bar | ElementKind::SpringDamper { .. } => (1, Some(1)),
            ElementKind::AArm => (2, None),
            ElementKind::Tire { .. } => (2, Some(0)),
            ElementKind::LinearBushing { .. } => (2, None),
            ElementKind::TorsionSpring { .. } => (2, Some(2)),
        }
    }
}

/// A mechanical element of the suspension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: Uuid,
    pub name: String,
    pub kind: ElementKind,
    /// World position of the element origin
    pub position: DVec3,
    /// World orientation (unit quaternion)
    pub rotation: DQuat,
    /// Points attached to the "frame" side of the element
    pub fixed_points: Vec<NodePoint>,
    /// Remaining points
    pub points: Vec<NodePoint>,
    /// Mass in kg
    pub mass: f64,
    /// Center of gravity (local)
    pub center_of_gravity: DVec3,
    /// Current deflection for display, written by the solver
    #[serde(default)]
    pub dl_current: f64,
}

impl Element {
    /// Create a new element at the world origin with identity orientation
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            position: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            fixed_points: Vec::new(),
            points: Vec::new(),
            mass: 0.0,
            center_of_gravity: DVec3::ZERO,
            dl_current: 0.0,
        }
    }

    /// Create a rigid body
    pub fn body(name: impl Into<String>, fixed: bool) -> Self {
        Self::new(name, ElementKind::Body { fixed })
    }

    /// Create a bar between two points
    pub fn bar(name: impl Into<String>, end0: DVec3, end1: DVec3) -> Self {
        let mut element = Self::new(name, ElementKind::Bar);
        element.add_fixed_point("end0", end0);
        element.add_point("end1", end1);
        element
    }

    /// Create a spring/damper between two points
    pub fn spring_damper(
        name: impl Into<String>,
        end0: DVec3,
        end1: DVec3,
        spring: SpringProperties,
    ) -> Self {
        let mut element = Self::new(name, ElementKind::SpringDamper { spring });
        element.add_fixed_point("end0", end0);
        element.add_point("end1", end1);
        element
    }

    /// Create an A-arm from two pivots and an outer point
    pub fn a_arm(name: impl Into<String>, pivot0: DVec3, pivot1: DVec3, outer: DVec3) -> Self {
        let mut element = Self::new(name, ElementKind::AArm);
        element.add_fixed_point("pivot0", pivot0);
        element.add_fixed_point("pivot1", pivot1);
        element.add_point("outer", outer);
        element
    }

    /// Create a tire with two bearing nodes on its spin axis
    pub fn tire(name: impl Into<String>, center: DVec3, axis: DVec3, radius: f64) -> Self {
        let axis = axis.normalize();
        let mut element = Self::new(
            name,
            ElementKind::Tire {
                radius,
                center,
                axis,
            },
        );
        element.add_fixed_point("bearing0", center - axis * 20.0);
        element.add_fixed_point("bearing1", center + axis * 20.0);
        element.center_of_gravity = center;
        element
    }

    /// Create a linear bushing with its axis frame and rod ends
    pub fn linear_bushing(
        name: impl Into<String>,
        frame0: DVec3,
        frame1: DVec3,
        rod_ends: &[DVec3],
        dl_min: f64,
        dl_max: f64,
    ) -> Self {
        let mut element = Self::new(name, ElementKind::LinearBushing { dl_min, dl_max });
        element.add_fixed_point("frame0", frame0);
        element.add_fixed_point("frame1", frame1);
        for (i, rod_end) in rod_ends.iter().enumerate() {
            element.add_point(format!("rodEnd{i}"), *rod_end);
        }
        element
    }

    /// Create a torsion spring with its axis and two arm ends
    pub fn torsion_spring(
        name: impl Into<String>,
        axis0: DVec3,
        axis1: DVec3,
        arm0: DVec3,
        arm1: DVec3,
        spring: SpringProperties,
    ) -> Self {
        let mut element = Self::new(name, ElementKind::TorsionSpring { spring });
        element.add_fixed_point("axis0", axis0);
        element.add_fixed_point("axis1", axis1);
        element.add_point("arm0", arm0);
        element.add_point("arm1", arm1);
        element
    }

    /// Builder: set mass and local center of gravity
    pub fn with_mass(mut self, mass: f64, center_of_gravity: DVec3) -> Self {
        self.mass = mass;
        self.center_of_gravity = center_of_gravity;
        self
    }

    /// Add a fixed point, returns its node ID
    pub fn add_fixed_point(&mut self, name: impl Into<String>, position: DVec3) -> Uuid {
        let node = NodePoint::new(name, position);
        let id = node.id;
        self.fixed_points.push(node);
        id
    }

    /// Add a point, returns its node ID
    pub fn add_point(&mut self, name: impl Into<String>, position: DVec3) -> Uuid {
        let node = NodePoint::new(name, position);
        let id = node.id;
        self.points.push(node);
        id
    }

    /// Iterate over all nodes, fixed points first
    pub fn nodes(&self) -> impl Iterator<Item = &NodePoint> {
        self.fixed_points.iter().chain(self.points.iter())
    }

    /// Get a node by ID
    pub fn node(&self, id: Uuid) -> Option<&NodePoint> {
        self.nodes().find(|n| n.id == id)
    }

    /// Whether this element is a grounded rigid body
    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, ElementKind::Body { fixed: true })
    }

    /// Map a local point to world coordinates
    pub fn world_point(&self, local: DVec3) -> DVec3 {
        self.position + self.rotation * local
    }

    /// World position of a node, if it belongs to this element
    pub fn node_world_position(&self, id: Uuid) -> Option<DVec3> {
        self.node(id).map(|n| self.world_point(n.position))
    }

    /// World position of the center of gravity
    pub fn world_center_of_gravity(&self) -> DVec3 {
        self.world_point(self.center_of_gravity)
    }
}
