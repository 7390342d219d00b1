//! Closed-form pose reconstruction for elements that are not solved as full
//! rigid bodies
//!
//! Reduced elements only exist in the solve as anchor points; after a solve
//! their pose is refit from the solved node positions by shortest-arc
//! rotations, and their display deflection `dl_current` is derived.

use std::collections::HashMap;

use glam::{DQuat, DVec3};
use uuid::Uuid;

use susp_core::Assembly;
use susp_core::constants::COINCIDENT_EPSILON;

use crate::constraint::twist_angle_value;
use crate::variable::{RigidBodyVariable, VarId, Variable};

/// A node of the reduced element with its element-local position
#[derive(Debug, Clone, Copy)]
pub struct NodeRef {
    pub node: Uuid,
    pub local: DVec3,
}

/// Pose of an element rigidly attached to a solved body
#[derive(Debug, Clone, Copy)]
pub struct AttachedPose {
    pub element: Uuid,
    pub body: VarId,
    /// Element origin in the body frame
    pub position: DVec3,
    /// Element orientation relative to the body
    pub rotation: DQuat,
}

/// One variant per reduced element kind
#[derive(Debug, Clone)]
pub enum Restorer {
    /// Rigid body merged into another by a rigid union
    RigidUnion(AttachedPose),
    /// Tire riding on a single hub
    Tire(AttachedPose),
    Bar {
        element: Uuid,
        ends: [NodeRef; 2],
    },
    AArm {
        element: Uuid,
        pivots: [NodeRef; 2],
        outer: NodeRef,
        initial_rotation: DQuat,
    },
    LinearBushing {
        element: Uuid,
        frame: [NodeRef; 2],
        rod_end: NodeRef,
        /// Nominal axial position of the first rod end
        offset: f64,
    },
    TorsionSpring {
        element: Uuid,
        axis: [NodeRef; 2],
        arms: [NodeRef; 2],
        nominal_twist: f64,
    },
}

impl Restorer {
    pub fn element(&self) -> Uuid {
        match self {
            Restorer::RigidUnion(pose) | Restorer::Tire(pose) => pose.element,
            Restorer::Bar { element, .. }
            | Restorer::AArm { element, .. }
            | Restorer::LinearBushing { element, .. }
            | Restorer::TorsionSpring { element, .. } => *element,
        }
    }

    /// Write the reconstructed pose and deflection onto the element.
    /// `nodes` maps node IDs to solved world positions.
    pub fn restore(&self, assembly: &mut Assembly, variables: &[Variable], nodes: &HashMap<Uuid, DVec3>) {
        let Some(element) = assembly.element_mut(self.element()) else {
            return;
        };
        match self {
            Restorer::RigidUnion(pose) | Restorer::Tire(pose) => {
                let Some(body) = variables[pose.body.0].as_rigid_body() else {
                    return;
                };
                let (position, rotation) = RigidBodyVariable::attached_pose(
                    (body.position, body.quaternion),
                    pose.position,
                    pose.rotation,
                );
                element.position = position;
                element.rotation = rotation;
            }
            Restorer::Bar { ends, .. } => {
                let Some([w0, w1]) = resolve(nodes, ends) else {
                    return;
                };
                let rotation = align_axis(element.rotation, ends[1].local - ends[0].local, w1 - w0);
                element.rotation = rotation;
                element.position = w0 - rotation * ends[0].local;
                element.dl_current = (w1 - w0).length() - (ends[1].local - ends[0].local).length();
            }
            Restorer::AArm {
                pivots,
                outer,
                initial_rotation,
                ..
            } => {
                let Some([p0, p1, o]) = resolve(nodes, &[pivots[0], pivots[1], *outer]) else {
                    return;
                };
                let axis_local = pivots[1].local - pivots[0].local;
                let rotation = align_axis(element.rotation, axis_local, p1 - p0);
                // swing about the pivot axis onto the outer point
                let axis = (p1 - p0).normalize_or_zero();
                let current = reject(rotation * (outer.local - pivots[0].local), axis);
                let target = reject(o - p0, axis);
                let rotation = match (current.try_normalize(), target.try_normalize()) {
                    (Some(from), Some(to)) => (DQuat::from_rotation_arc(from, to) * rotation).normalize(),
                    _ => rotation,
                };
                element.rotation = rotation;
                element.position = p0 - rotation * pivots[0].local;
                element.dl_current = rotation.angle_between(*initial_rotation);
            }
            Restorer::LinearBushing {
                frame,
                rod_end,
                offset,
                ..
            } => {
                let Some([f0, f1, rod]) = resolve(nodes, &[frame[0], frame[1], *rod_end]) else {
                    return;
                };
                let rotation = align_axis(element.rotation, frame[1].local - frame[0].local, f1 - f0);
                element.rotation = rotation;
                element.position = f0 - rotation * frame[0].local;
                let axis = (f1 - f0).normalize_or_zero();
                element.dl_current = (rod - f0).dot(axis) - offset;
            }
            Restorer::TorsionSpring {
                axis,
                arms,
                nominal_twist,
                ..
            } => {
                let Some([a0, a1, arm0, arm1]) = resolve(nodes, &[axis[0], axis[1], arms[0], arms[1]])
                else {
                    return;
                };
                let rotation = align_axis(element.rotation, axis[1].local - axis[0].local, a1 - a0);
                element.rotation = rotation;
                element.position = a0 - rotation * axis[0].local;
                element.dl_current = twist_angle_value(a0, a1 - a0, arm0, arm1) - nominal_twist;
            }
        }
    }
}

fn resolve<const N: usize>(nodes: &HashMap<Uuid, DVec3>, refs: &[NodeRef; N]) -> Option<[DVec3; N]> {
    let mut out = [DVec3::ZERO; N];
    for (slot, r) in out.iter_mut().zip(refs) {
        *slot = *nodes.get(&r.node)?;
    }
    Some(out)
}

/// Component of `v` orthogonal to the unit vector `axis`
fn reject(v: DVec3, axis: DVec3) -> DVec3 {
    v - axis * v.dot(axis)
}

/// Rotate `current` by the shortest arc taking `current * local_axis` onto
/// `world_axis`
fn align_axis(current: DQuat, local_axis: DVec3, world_axis: DVec3) -> DQuat {
    if local_axis.length() < COINCIDENT_EPSILON || world_axis.length() < COINCIDENT_EPSILON {
        return current;
    }
    let from = (current * local_axis).normalize();
    let to = world_axis.normalize();
    (DQuat::from_rotation_arc(from, to) * current).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use susp_core::Element;

    #[test]
    fn test_bar_restore() {
        let mut assembly = Assembly::new("bar");
        let bar = Element::bar("bar", DVec3::ZERO, DVec3::new(100.0, 0.0, 0.0));
        let ends = [
            NodeRef { node: bar.fixed_points[0].id, local: DVec3::ZERO },
            NodeRef { node: bar.points[0].id, local: DVec3::new(100.0, 0.0, 0.0) },
        ];
        let id = assembly.add_element(bar);
        let nodes = HashMap::from([
            (ends[0].node, DVec3::new(0.0, 0.0, 10.0)),
            (ends[1].node, DVec3::new(0.0, 101.0, 10.0)),
        ]);
        Restorer::Bar { element: id, ends }.restore(&mut assembly, &[], &nodes);

        let element = assembly.element(id).unwrap();
        let end1 = element.world_point(ends[1].local);
        assert_relative_eq!(end1.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(end1.y, 100.0, epsilon = 1e-9);
        assert_relative_eq!(end1.z, 10.0, epsilon = 1e-9);
        assert_relative_eq!(element.dl_current, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_a_arm_restore_swings_outer_point() {
        let mut assembly = Assembly::new("arm");
        let arm = Element::a_arm(
            "arm",
            DVec3::new(-100.0, 0.0, 0.0),
            DVec3::new(100.0, 0.0, 0.0),
            DVec3::new(0.0, 300.0, 0.0),
        );
        let pivots = [
            NodeRef { node: arm.fixed_points[0].id, local: arm.fixed_points[0].position },
            NodeRef { node: arm.fixed_points[1].id, local: arm.fixed_points[1].position },
        ];
        let outer = NodeRef { node: arm.points[0].id, local: arm.points[0].position };
        let id = assembly.add_element(arm);
        let angle: f64 = 0.2;
        let nodes = HashMap::from([
            (pivots[0].node, pivots[0].local),
            (pivots[1].node, pivots[1].local),
            (outer.node, DVec3::new(0.0, 300.0 * angle.cos(), 300.0 * angle.sin())),
        ]);
        let restorer = Restorer::AArm {
            element: id,
            pivots,
            outer,
            initial_rotation: DQuat::IDENTITY,
        };
        restorer.restore(&mut assembly, &[], &nodes);

        let element = assembly.element(id).unwrap();
        let o = element.world_point(outer.local);
        assert_relative_eq!(o.z, 300.0 * angle.sin(), epsilon = 1e-9);
        assert_relative_eq!(element.dl_current, angle, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_node_leaves_pose() {
        let mut assembly = Assembly::new("bar");
        let bar = Element::bar("bar", DVec3::ZERO, DVec3::X);
        let ends = [
            NodeRef { node: bar.fixed_points[0].id, local: DVec3::ZERO },
            NodeRef { node: bar.points[0].id, local: DVec3::X },
        ];
        let id = assembly.add_element(bar);
        Restorer::Bar { element: id, ends }.restore(&mut assembly, &[], &HashMap::new());
        assert_eq!(assembly.element(id).unwrap().rotation, DQuat::IDENTITY);
    }
}
