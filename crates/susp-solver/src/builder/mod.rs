//! Assembly → variable/constraint graph
//!
//! Pipeline:
//! 1. every element solved as a full rigid body gets a [`RigidBodyVariable`]
//! 2. bodies sharing three or more joints are merged into rigid unions
//! 3. single-element constraints: plane controls, tire ground contact
//! 4. reduced elements (bars, spring/dampers, simple A-arms, linear bushings,
//!    torsion springs) become constraints on shared anchor points; tires ride
//!    on their hub
//! 5. one spherical joint (1 joint) or hinge (2 joints) per pair of bodies
//! 6. union-find grouping, quaternion normalization, column assignment

mod reduce;
mod skidpad;

use std::collections::HashMap;
use std::rc::Rc;

use glam::{DQuat, DVec3};
use tracing::debug;
use uuid::Uuid;

use susp_core::{Assembly, Control, Controls, Element, ElementKind};

use crate::autodiff::{Leaf, Rotation, Vector};
use crate::config::{ConstraintsOptions, SkidpadConfig, SolverConfig};
use crate::constraint::{
    Constraint, ConstraintEquations, ConstraintId, PlaneConstraint, PlanePoint,
    QuaternionNormalization, RevoluteJoint, SphericalJoint,
};
use crate::error::{SolverError, SolverResult};
use crate::restorer::{AttachedPose, Restorer};
use crate::tire::TireFriction;
use crate::union_find::UnionFind;
use crate::variable::{BodyMode, PointVariable, RigidBodyVariable, VarId, Variable};

pub use skidpad::{JointForce, SkidpadModel};

/// What the graph is built for
pub enum BuildMode<'a> {
    Kinematics,
    Skidpad {
        config: &'a SkidpadConfig,
        friction: Rc<dyn TireFriction>,
    },
}

/// An independent nonlinear system
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub variables: Vec<VarId>,
    pub constraints: Vec<ConstraintId>,
    pub degrees_of_freedom: usize,
}

/// Variables, constraints and their grouping for one assembly
pub struct ConstraintGraph {
    pub variables: Vec<Variable>,
    pub constraints: Vec<Constraint>,
    pub groups: Vec<Group>,
    pub restorers: Vec<Restorer>,
    /// World-position expressions of every node of a reduced element
    pub reduced_nodes: Vec<(Uuid, Vector)>,
    /// World-position expressions of every node
    pub node_points: HashMap<Uuid, Vector>,
    pub skidpad: Option<SkidpadModel>,
}

impl ConstraintGraph {
    pub fn build(
        assembly: &Assembly,
        controls: &Controls,
        config: &SolverConfig,
        mode: BuildMode,
    ) -> SolverResult<Self> {
        GraphBuilder::new(assembly, controls, config).build(mode)
    }

    /// Assign contiguous columns within each group
    pub fn assign_columns(&mut self) {
        for variable in &mut self.variables {
            variable.set_col(None);
        }
        for group in &mut self.groups {
            let mut col = 0;
            for var in &group.variables {
                let variable = &mut self.variables[var.0];
                variable.set_col(Some(col));
                col += variable.degree_of_freedom();
            }
            group.degrees_of_freedom = col;
        }
    }

    /// Rows of a group under `options`
    pub fn group_rows(&self, group: usize, options: &ConstraintsOptions) -> usize {
        self.groups[group]
            .constraints
            .iter()
            .map(|c| self.constraints[c.0].as_equations().equations(options))
            .sum()
    }

    /// Group index of a variable
    pub fn group_of(&self, var: VarId) -> Option<usize> {
        self.groups.iter().position(|g| g.variables.contains(&var))
    }

    /// World-position expression of a node
    pub fn node_point(&self, node: Uuid) -> Option<&Vector> {
        self.node_points.get(&node)
    }
}

/// Mapping of an element's local coordinates into the frame of the body
/// variable it is solved with
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub body: VarId,
    pub free: bool,
    /// Pose of the body at build time
    pub root_position: DVec3,
    pub root_rotation: DQuat,
    /// Element origin and orientation in the body frame
    pub position: DVec3,
    pub rotation: DQuat,
}

impl Frame {
    fn identity(body: VarId, free: bool, position: DVec3, rotation: DQuat) -> Self {
        Self {
            body,
            free,
            root_position: position,
            root_rotation: rotation,
            position: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
        }
    }

    /// Element-local point in the body frame
    pub fn in_root(&self, local: DVec3) -> DVec3 {
        self.position + self.rotation * local
    }

    /// Element-local point in world coordinates at build time
    pub fn world(&self, local: DVec3) -> DVec3 {
        self.root_position + self.root_rotation * self.in_root(local)
    }

    /// Frame of an element with world pose `(position, rotation)` solved
    /// with this frame's body
    fn attach(&self, position: DVec3, rotation: DQuat) -> Self {
        let inverse = self.root_rotation.inverse();
        Self {
            position: inverse * (position - self.root_position),
            rotation: (inverse * rotation).normalize(),
            ..*self
        }
    }
}

/// Nodes connected through joints, in assembly order
struct NodeClusters {
    root_of: HashMap<Uuid, usize>,
    members: HashMap<usize, Vec<Uuid>>,
}

impl NodeClusters {
    fn new(assembly: &Assembly) -> Self {
        let nodes: Vec<Uuid> = assembly
            .elements
            .iter()
            .flat_map(|e| e.nodes().map(|n| n.id))
            .collect();
        let index: HashMap<Uuid, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut sets = UnionFind::new(nodes.len());
        for joint in &assembly.joints {
            if let (Some(&l), Some(&r)) = (index.get(&joint.lhs), index.get(&joint.rhs)) {
                sets.union(l, r);
            }
        }
        let mut root_of = HashMap::new();
        let mut members: HashMap<usize, Vec<Uuid>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            let root = sets.find(i);
            root_of.insert(*node, root);
            members.entry(root).or_default().push(*node);
        }
        Self { root_of, members }
    }

    fn members_of(&self, node: Uuid) -> &[Uuid] {
        self.root_of
            .get(&node)
            .and_then(|r| self.members.get(r))
            .map_or(&[], Vec::as_slice)
    }
}

/// Ground contact data of a tire
#[derive(Debug, Clone)]
pub(crate) struct TireInfo {
    pub index: usize,
    pub frame: Frame,
    pub center: DVec3,
    pub axis: DVec3,
    pub radius: f64,
}

pub(crate) struct GraphBuilder<'a> {
    assembly: &'a Assembly,
    controls: &'a Controls,
    config: &'a SolverConfig,
    variables: Vec<Variable>,
    constraints: Vec<Constraint>,
    restorers: Vec<Restorer>,
    /// Element index to frame, for full bodies and tires
    frames: HashMap<usize, Frame>,
    body_leaves: HashMap<VarId, (Vector, Rotation)>,
    clusters: NodeClusters,
    cluster_points: HashMap<usize, VarId>,
    node_exprs: HashMap<Uuid, Vector>,
    reduced_nodes: Vec<(Uuid, Vector)>,
    tires: Vec<TireInfo>,
}

/// Whether an element is solved as a full rigid body
fn is_full_body(element: &Element) -> bool {
    match element.kind {
        ElementKind::Body { .. } => true,
        ElementKind::AArm => element.points.len() > 1,
        _ => false,
    }
}

impl<'a> GraphBuilder<'a> {
    fn new(assembly: &'a Assembly, controls: &'a Controls, config: &'a SolverConfig) -> Self {
        Self {
            assembly,
            controls,
            config,
            variables: Vec::new(),
            constraints: Vec::new(),
            restorers: Vec::new(),
            frames: HashMap::new(),
            body_leaves: HashMap::new(),
            clusters: NodeClusters::new(assembly),
            cluster_points: HashMap::new(),
            node_exprs: HashMap::new(),
            reduced_nodes: Vec::new(),
            tires: Vec::new(),
        }
    }

    fn build(mut self, mode: BuildMode) -> SolverResult<ConstraintGraph> {
        if let Err(errors) = self.assembly.validate() {
            if let Some(first) = errors.into_iter().next() {
                return Err(first.into());
            }
        }

        self.create_bodies();
        let pairs = self.rigid_pairs();
        self.merge_rigid_unions(&pairs);
        self.attach_tires()?;

        let skidpad = matches!(mode, BuildMode::Skidpad { .. });
        self.add_plane_controls()?;
        if skidpad || self.config.ground_tires {
            self.add_ground_contacts()?;
        }

        self.reduce_elements()?;
        self.add_body_joints(&pairs)?;

        let model = match mode {
            BuildMode::Kinematics => None,
            BuildMode::Skidpad { config, friction } => Some(self.add_skidpad(config, friction)?),
        };

        self.finish(model)
    }

    /// Step 1: one rigid body variable per full element
    fn create_bodies(&mut self) {
        let assembly = self.assembly;
        for (index, element) in assembly.elements.iter().enumerate() {
            if !is_full_body(element) {
                continue;
            }
            let var = VarId(self.variables.len());
            let body = if element.is_fixed() {
                RigidBodyVariable::fixed(element.id, &element.name, element.position, element.rotation)
            } else {
                RigidBodyVariable::free(element.id, &element.name, element.position, element.rotation)
            };
            self.variables.push(Variable::from(body));
            self.frames.insert(
                index,
                Frame::identity(var, !element.is_fixed(), element.position, element.rotation),
            );
        }
    }

    /// Pairs of full-body nodes sharing a joint cluster
    fn rigid_pairs(&self) -> Vec<(Uuid, Uuid)> {
        let mut pairs = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for element in &self.assembly.elements {
            for node in element.nodes() {
                let members = self.clusters.members_of(node.id);
                if members.first() != Some(&node.id) {
                    continue;
                }
                let full: Vec<Uuid> = members
                    .iter()
                    .copied()
                    .filter(|n| {
                        self.assembly
                            .node_owner(*n)
                            .is_some_and(|i| is_full_body(&self.assembly.elements[i]))
                    })
                    .collect();
                if let Some((first, rest)) = full.split_first() {
                    for other in rest {
                        if seen.insert((*first, *other)) {
                            pairs.push((*first, *other));
                        }
                    }
                }
            }
        }
        pairs
    }

    fn frame_of_node(&self, node: Uuid) -> Option<(Frame, DVec3)> {
        let index = self.assembly.node_owner(node)?;
        let frame = self.frames.get(&index)?;
        let local = self.assembly.elements[index].node(node)?.position;
        Some((*frame, local))
    }

    /// Body pairs (sorted) and the joints between them, in first-seen order
    fn joints_by_body_pair(&self, pairs: &[(Uuid, Uuid)]) -> Vec<((VarId, VarId), Vec<(Uuid, Uuid)>)> {
        let mut grouped: Vec<((VarId, VarId), Vec<(Uuid, Uuid)>)> = Vec::new();
        for &(a, b) in pairs {
            let (Some((fa, _)), Some((fb, _))) = (self.frame_of_node(a), self.frame_of_node(b)) else {
                continue;
            };
            if fa.body == fb.body || (!fa.free && !fb.free) {
                continue;
            }
            // orient so the first node sits on the lower body index
            let (key, joint) = if fa.body < fb.body {
                ((fa.body, fb.body), (a, b))
            } else {
                ((fb.body, fa.body), (b, a))
            };
            match grouped.iter_mut().find(|(k, _)| *k == key) {
                Some((_, joints)) => joints.push(joint),
                None => grouped.push((key, vec![joint])),
            }
        }
        grouped
    }

    /// Step 2: collapse body pairs with three or more joints
    fn merge_rigid_unions(&mut self, pairs: &[(Uuid, Uuid)]) {
        loop {
            let grouped = self.joints_by_body_pair(pairs);
            let Some(((a, b), _)) = grouped.into_iter().find(|(_, joints)| joints.len() >= 3) else {
                break;
            };
            let b_fixed = self.frames.values().any(|f| f.body == b && !f.free);
            let (parent, dependent) = if b_fixed { (b, a) } else { (a, b) };
            let Some(parent_frame) = self.frames.values().find(|f| f.body == parent).copied() else {
                break;
            };
            debug!(
                parent = self.variables[parent.0].name(),
                dependent = self.variables[dependent.0].name(),
                "merging rigid union"
            );
            for frame in self.frames.values_mut() {
                if frame.body == dependent {
                    let world_position = frame.world(DVec3::ZERO);
                    let world_rotation = frame.root_rotation * frame.rotation;
                    *frame = parent_frame.attach(world_position, world_rotation);
                }
            }
        }

        // Every full element not solved with its own variable is attached
        for (index, frame) in &self.frames {
            let element = &self.assembly.elements[*index];
            let Some(var) = self.variables.iter().position(|v| {
                v.as_rigid_body().is_some_and(|b| b.element == element.id)
            }) else {
                continue;
            };
            if VarId(var) == frame.body {
                continue;
            }
            if let Some(body) = self.variables[var].as_rigid_body_mut() {
                body.mode = BodyMode::Attached {
                    parent: frame.body,
                    position: frame.position,
                    rotation: frame.rotation,
                };
            }
            self.restorers.push(Restorer::RigidUnion(AttachedPose {
                element: element.id,
                body: frame.body,
                position: frame.position,
                rotation: frame.rotation,
            }));
        }
        self.restorers.sort_by_key(|r| {
            self.assembly
                .element_position(r.element())
                .unwrap_or(usize::MAX)
        });
    }

    /// Tires ride on the single body their bearings attach to
    fn attach_tires(&mut self) -> SolverResult<()> {
        let assembly = self.assembly;
        for (index, element) in assembly.elements.iter().enumerate() {
            let ElementKind::Tire {
                radius,
                center,
                axis,
            } = element.kind
            else {
                continue;
            };
            let mut hubs = Vec::new();
            for bearing in element.fixed_points.iter().take(2) {
                let members = self.clusters.members_of(bearing.id);
                if members.len() < 2 {
                    return Err(SolverError::MissingJointPartner {
                        element: element.name.clone(),
                        node: bearing.id,
                    });
                }
                let hub = members
                    .iter()
                    .filter(|n| **n != bearing.id)
                    .find_map(|n| self.frame_of_node(*n).map(|(f, _)| f))
                    .ok_or_else(|| SolverError::UnsupportedTireAxle(element.name.clone()))?;
                hubs.push(hub);
            }
            let [hub0, hub1] = hubs[..] else {
                return Err(SolverError::UnsupportedTireAxle(element.name.clone()));
            };
            if hub0.body != hub1.body && (hub0.free || hub1.free) {
                return Err(SolverError::UnsupportedTireAxle(element.name.clone()));
            }
            let frame = hub0.attach(element.position, element.rotation);
            self.frames.insert(index, frame);
            self.restorers.push(Restorer::Tire(AttachedPose {
                element: element.id,
                body: frame.body,
                position: frame.position,
                rotation: frame.rotation,
            }));
            self.tires.push(TireInfo {
                index,
                frame,
                center,
                axis,
                radius,
            });
        }
        Ok(())
    }

    /// Position and rotation leaves of a free body, shared by all expressions
    fn body_leaves(&mut self, body: VarId) -> (Vector, Rotation) {
        self.body_leaves
            .entry(body)
            .or_insert_with(|| {
                (
                    Vector::variable(Leaf {
                        var: body,
                        dof: 7,
                        offset: 0,
                    }),
                    Rotation::variable(Leaf {
                        var: body,
                        dof: 7,
                        offset: 3,
                    }),
                )
            })
            .clone()
    }

    /// World position of an element-local point
    pub(crate) fn point_expr(&mut self, frame: &Frame, local: DVec3) -> Vector {
        if frame.free {
            let (position, rotation) = self.body_leaves(frame.body);
            position.add(&rotation.rotate(&Vector::constant(frame.in_root(local))))
        } else {
            Vector::constant(frame.world(local))
        }
    }

    /// World direction of an element-local vector
    pub(crate) fn direction_expr(&mut self, frame: &Frame, local: DVec3) -> Vector {
        let in_root = frame.rotation * local;
        if frame.free {
            let (_, rotation) = self.body_leaves(frame.body);
            rotation.rotate(&Vector::constant(in_root))
        } else {
            Vector::constant(frame.root_rotation * in_root)
        }
    }

    /// Expression of any node: the body point for nodes of full bodies and
    /// tires, the shared anchor otherwise
    pub(crate) fn node_point(&mut self, node: Uuid) -> SolverResult<Vector> {
        if let Some((frame, local)) = self.frame_of_node(node) {
            return Ok(self.point_expr(&frame, local));
        }
        self.node_expr(node)
    }

    /// Anchor of a reduced element's node: a body point when the joint
    /// cluster contains one, otherwise a point variable per cluster
    pub(crate) fn node_expr(&mut self, node: Uuid) -> SolverResult<Vector> {
        if let Some(expr) = self.node_exprs.get(&node) {
            return Ok(expr.clone());
        }
        let members = self.clusters.members_of(node).to_vec();
        let anchor = members.iter().find_map(|n| self.frame_of_node(*n));
        let expr = match anchor {
            Some((frame, local)) => self.point_expr(&frame, local),
            None => {
                if members.len() < 2 {
                    let element = self
                        .assembly
                        .node(node)
                        .map_or_else(|| node.to_string(), |(e, _)| e.name.clone());
                    return Err(SolverError::MissingJointPartner { element, node });
                }
                let cluster = self.clusters.root_of[&node];
                let var = match self.cluster_points.get(&cluster) {
                    Some(var) => *var,
                    None => {
                        let var = VarId(self.variables.len());
                        let position = self.assembly.node_world_position(node).unwrap_or_default();
                        let name = self
                            .assembly
                            .node(node)
                            .map_or_else(String::new, |(e, n)| format!("{}.{}", e.name, n.name));
                        self.variables
                            .push(Variable::from(PointVariable::new(members[0], name, position)));
                        self.cluster_points.insert(cluster, var);
                        var
                    }
                };
                Vector::variable(Leaf {
                    var,
                    dof: 3,
                    offset: 0,
                })
            }
        };
        self.node_exprs.insert(node, expr.clone());
        Ok(expr)
    }

    /// Body variable anchoring a node's cluster, if any
    pub(crate) fn anchor_body(&self, node: Uuid) -> Option<VarId> {
        self.clusters
            .members_of(node)
            .iter()
            .find_map(|n| self.frame_of_node(*n))
            .map(|(frame, _)| frame.body)
    }

    fn push(&mut self, constraint: Constraint) -> ConstraintId {
        self.constraints.push(constraint);
        ConstraintId(self.constraints.len() - 1)
    }

    /// Step 3a: point-to-plane controls
    fn add_plane_controls(&mut self) -> SolverResult<()> {
        let (assembly, controls) = (self.assembly, self.controls);
        for element in &assembly.elements {
            for control in controls.get(element.id) {
                let Control::Plane {
                    node,
                    normal,
                    distance,
                    dl_min,
                    dl_max,
                    value,
                } = *control
                else {
                    continue;
                };
                let point = self.node_point(node)?;
                let plane = PlaneConstraint::new(
                    format!("{} plane", element.name),
                    PlanePoint::Fixed(point),
                    normal,
                    distance,
                )?
                .controlled_by(element.id, value, dl_min, dl_max);
                self.push(Constraint::Plane(plane));
            }
        }
        Ok(())
    }

    /// Step 3b: every tire touches the ground plane
    fn add_ground_contacts(&mut self) -> SolverResult<()> {
        for tire in self.tires.clone() {
            let center = self.point_expr(&tire.frame, tire.center);
            let axis = self.direction_expr(&tire.frame, tire.axis);
            let plane = PlaneConstraint::new(
                format!("{} ground", self.assembly.elements[tire.index].name),
                PlanePoint::NearestOnTire {
                    center,
                    axis,
                    radius: tire.radius,
                },
                self.config.ground_normal,
                self.config.ground_height,
            )?;
            self.push(Constraint::Plane(plane));
        }
        Ok(())
    }

    /// Step 5: spherical joints and hinges between bodies
    fn add_body_joints(&mut self, pairs: &[(Uuid, Uuid)]) -> SolverResult<()> {
        for ((a, b), joints) in self.joints_by_body_pair(pairs) {
            let name = format!("{}-{}", self.variables[a.0].name(), self.variables[b.0].name());
            let mut sides = Vec::new();
            for (na, nb) in &joints {
                sides.push((self.node_point(*na)?, self.node_point(*nb)?));
            }
            let constraint = match joints.len() {
                1 => Constraint::Sphere(SphericalJoint::new(name, &sides[0].0, &sides[0].1)),
                2 => {
                    let world = |n: Uuid| self.assembly.node_world_position(n).unwrap_or_default();
                    let initial = [
                        world(joints[0].0),
                        world(joints[1].0),
                        world(joints[0].1),
                        world(joints[1].1),
                    ];
                    Constraint::Hinge(RevoluteJoint::new(
                        name,
                        [&sides[0].0, &sides[1].0, &sides[0].1, &sides[1].1],
                        initial,
                    )?)
                }
                count => {
                    return Err(SolverError::TooManyJoints {
                        lhs: self.variables[a.0].name().to_string(),
                        rhs: self.variables[b.0].name().to_string(),
                        count,
                    });
                }
            };
            self.push(constraint);
        }
        Ok(())
    }

    /// Expressions of the nodes of bodies and tires, plus the reduced ones
    fn collect_node_points(&mut self) -> HashMap<Uuid, Vector> {
        let assembly = self.assembly;
        let mut framed: Vec<(usize, Frame)> = self.frames.iter().map(|(i, f)| (*i, *f)).collect();
        framed.sort_by_key(|(i, _)| *i);
        let mut points: HashMap<Uuid, Vector> = self.reduced_nodes.iter().cloned().collect();
        for (index, frame) in framed {
            for node in assembly.elements[index].nodes() {
                let expr = self.point_expr(&frame, node.position);
                points.insert(node.id, expr);
            }
        }
        points
    }

    /// Step 6: group by union-find and assign columns
    fn finish(mut self, skidpad: Option<SkidpadModel>) -> SolverResult<ConstraintGraph> {
        let node_points = self.collect_node_points();
        let options = ConstraintsOptions::default();
        let mut sets = UnionFind::new(self.variables.len());
        for constraint in &self.constraints {
            let equations = constraint.as_equations();
            let vars = equations.relevant_variables();
            let demanded = equations.equations(&options)
                + equations.equations(&ConstraintsOptions {
                    disable_spring_elasticity: true,
                    fix_linear_bushing: true,
                    ..options
                });
            if vars.is_empty() && demanded > 0 {
                return Err(SolverError::NoDegreesOfFreedom(equations.name().to_string()));
            }
            for pair in vars.windows(2) {
                sets.union(pair[0].0, pair[1].0);
            }
        }

        for (i, variable) in self.variables.iter().enumerate() {
            if variable.as_rigid_body().is_some_and(RigidBodyVariable::is_free) {
                self.constraints.push(Constraint::QuaternionNormalization(
                    QuaternionNormalization::new(variable.name(), VarId(i)),
                ));
            }
        }

        let mut group_of_root: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for (i, variable) in self.variables.iter().enumerate() {
            if variable.degree_of_freedom() == 0 {
                continue;
            }
            let root = sets.find(i);
            let group = *group_of_root.entry(root).or_insert_with(|| {
                groups.push(Group::default());
                groups.len() - 1
            });
            groups[group].variables.push(VarId(i));
        }
        for (c, constraint) in self.constraints.iter().enumerate() {
            let Some(first) = constraint.as_equations().relevant_variables().first() else {
                continue;
            };
            if let Some(group) = group_of_root.get(&sets.find(first.0)) {
                groups[*group].constraints.push(ConstraintId(c));
            }
        }

        debug!(
            variables = self.variables.len(),
            constraints = self.constraints.len(),
            groups = groups.len(),
            "constraint graph built"
        );

        let mut graph = ConstraintGraph {
            variables: self.variables,
            constraints: self.constraints,
            groups,
            restorers: self.restorers,
            reduced_nodes: self.reduced_nodes,
            node_points,
            skidpad,
        };
        graph.assign_columns();
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use susp_core::{Control, SpringProperties};

    use crate::constraint::{ConstraintState, twist_angle_value};
    use crate::solver::KinematicsSolver;

    fn build(assembly: &Assembly, controls: &Controls) -> SolverResult<ConstraintGraph> {
        ConstraintGraph::build(assembly, controls, &SolverConfig::default(), BuildMode::Kinematics)
    }

    struct QuarterCar {
        assembly: Assembly,
        controls: Controls,
        upright: Uuid,
        lower_arm: Uuid,
        lower_pivot: Uuid,
        lower_ball: Uuid,
        upper_pivot: Uuid,
        upper_ball: Uuid,
        tie_rod: (Uuid, Uuid),
    }

    /// Double wishbone with single-ball A-arms and a tie rod, wheel travel
    /// driven by a plane control on the lower ball joint
    fn quarter_car() -> QuarterCar {
        let mut assembly = Assembly::new("quarter car");
        let mut ground = Element::body("chassis", true);
        let u0 = ground.add_point("upper front", DVec3::new(-100.0, 300.0, 400.0));
        let u1 = ground.add_point("upper rear", DVec3::new(100.0, 300.0, 400.0));
        let l0 = ground.add_point("lower front", DVec3::new(-100.0, 200.0, 150.0));
        let l1 = ground.add_point("lower rear", DVec3::new(100.0, 200.0, 150.0));
        let t = ground.add_point("rack", DVec3::new(150.0, 250.0, 250.0));
        let mut upright = Element::body("upright", false);
        let ub = upright.add_point("upper ball", DVec3::new(0.0, 550.0, 400.0));
        let lb = upright.add_point("lower ball", DVec3::new(0.0, 600.0, 150.0));
        let to = upright.add_point("steering arm", DVec3::new(150.0, 580.0, 260.0));
        let upper = Element::a_arm(
            "upper arm",
            DVec3::new(-100.0, 300.0, 400.0),
            DVec3::new(100.0, 300.0, 400.0),
            DVec3::new(0.0, 550.0, 400.0),
        );
        let lower = Element::a_arm(
            "lower arm",
            DVec3::new(-100.0, 200.0, 150.0),
            DVec3::new(100.0, 200.0, 150.0),
            DVec3::new(0.0, 600.0, 150.0),
        );
        let tie = Element::bar(
            "tie rod",
            DVec3::new(150.0, 250.0, 250.0),
            DVec3::new(150.0, 580.0, 260.0),
        );
        let joints = [
            (u0, upper.fixed_points[0].id),
            (u1, upper.fixed_points[1].id),
            (ub, upper.points[0].id),
            (l0, lower.fixed_points[0].id),
            (l1, lower.fixed_points[1].id),
            (lb, lower.points[0].id),
            (t, tie.fixed_points[0].id),
            (to, tie.points[0].id),
        ];
        let (upright_id, lower_id) = (upright.id, lower.id);
        let mut controls = Controls::new();
        controls.add(upright_id, Control::plane(lb, DVec3::Z, 150.0, 50.0));
        assembly.add_element(ground);
        assembly.add_element(upright);
        assembly.add_element(upper);
        assembly.add_element(lower);
        assembly.add_element(tie);
        for (lhs, rhs) in joints {
            assembly.connect(lhs, rhs).unwrap();
        }
        QuarterCar {
            assembly,
            controls,
            upright: upright_id,
            lower_arm: lower_id,
            lower_pivot: l0,
            lower_ball: lb,
            upper_pivot: u0,
            upper_ball: ub,
            tie_rod: (t, to),
        }
    }

    #[test]
    fn test_reduced_elements_leave_one_body() {
        let car = quarter_car();
        let graph = build(&car.assembly, &car.controls).unwrap();
        // chassis and upright only: arms and tie rod are reduced
        assert_eq!(graph.variables.len(), 2);
        assert_eq!(graph.groups.len(), 1);
        assert_eq!(graph.groups[0].degrees_of_freedom, 7);
        // 2 + 2 arm sides, tie rod, plane control, normalization
        assert_eq!(graph.group_rows(0, &ConstraintsOptions::default()), 7);
        assert_eq!(graph.restorers.len(), 3);
        assert!(graph.node_point(car.lower_ball).is_some());
    }

    #[test]
    fn test_wheel_travel_keeps_link_lengths() {
        let car = quarter_car();
        let mut solver = KinematicsSolver::new(car.assembly, car.controls, SolverConfig::default()).unwrap();
        let options = ConstraintsOptions::default();
        let before = solver.node_positions();

        solver.set_controlled_offset(car.upright, 10.0).unwrap();
        solver.solve(&options).unwrap();
        let after = solver.node_positions();

        assert_relative_eq!(after[&car.lower_ball].z, 160.0, epsilon = 1e-3);
        for (a, b) in [
            (car.lower_pivot, car.lower_ball),
            (car.upper_pivot, car.upper_ball),
            car.tie_rod,
        ] {
            assert_relative_eq!(
                after[&a].distance(after[&b]),
                before[&a].distance(before[&b]),
                epsilon = 1e-3
            );
        }

        let arm = solver.assembly().element(car.lower_arm).unwrap();
        assert!(arm.dl_current > 0.01);
        let outer = arm.node_world_position(arm.points[0].id).unwrap();
        assert!(outer.distance(after[&car.lower_ball]) < 1e-3);
    }

    #[test]
    fn test_plane_offset_is_clamped() {
        let car = quarter_car();
        let mut graph = build(&car.assembly, &car.controls).unwrap();
        let plane = graph
            .constraints
            .iter_mut()
            .map(Constraint::as_equations_mut)
            .find(|c| c.controller() == Some(car.upright))
            .unwrap();
        plane.set_controlled_offset(80.0);
        assert!(matches!(plane.save_state(), ConstraintState::Offset { dl } if dl == 50.0));
    }

    #[test]
    fn test_three_joints_make_a_rigid_union() {
        let mut assembly = Assembly::new("union");
        let mut ground = Element::body("ground", true);
        let g = ground.add_point("ball", DVec3::ZERO);
        let mut b = Element::body("b", false);
        let b0 = b.add_point("ball", DVec3::ZERO);
        let mut c = Element::body("c", false);
        let mut bolts = Vec::new();
        for (i, p) in [DVec3::X, DVec3::Y, DVec3::Z].into_iter().enumerate() {
            let p = p * 100.0;
            bolts.push((b.add_point(format!("bolt{i}"), p), c.add_point(format!("bolt{i}"), p)));
        }
        let c_id = c.id;
        assembly.add_element(ground);
        assembly.add_element(b);
        assembly.add_element(c);
        assembly.connect(g, b0).unwrap();
        for (lhs, rhs) in bolts {
            assembly.connect(lhs, rhs).unwrap();
        }

        let graph = build(&assembly, &Controls::new()).unwrap();
        assert_eq!(graph.groups.len(), 1);
        assert_eq!(graph.groups[0].degrees_of_freedom, 7);
        // one spherical joint to the ground, one normalization
        assert_eq!(graph.group_rows(0, &ConstraintsOptions::default()), 4);
        assert!(matches!(
            graph.variables[2].as_rigid_body().map(|b| b.mode),
            Some(BodyMode::Attached { parent: VarId(1), .. })
        ));
        assert!(matches!(&graph.restorers[..], [Restorer::RigidUnion(pose)] if pose.element == c_id));
    }

    #[test]
    fn test_disconnected_bodies_split_into_groups() {
        let mut assembly = Assembly::new("split");
        let mut ground = Element::body("ground", true);
        let g0 = ground.add_point("left", DVec3::ZERO);
        let g1 = ground.add_point("right", DVec3::X * 500.0);
        let mut b = Element::body("b", false);
        let b0 = b.add_point("ball", DVec3::ZERO);
        let mut c = Element::body("c", false);
        let c0 = c.add_point("ball", DVec3::X * 500.0);
        assembly.add_element(ground);
        assembly.add_element(b);
        assembly.add_element(c);
        assembly.connect(g0, b0).unwrap();
        assembly.connect(g1, c0).unwrap();

        let graph = build(&assembly, &Controls::new()).unwrap();
        assert_eq!(graph.groups.len(), 2);
        for group in 0..2 {
            assert_eq!(graph.group_rows(group, &ConstraintsOptions::default()), 4);
        }
        assert_eq!(graph.group_of(VarId(2)), Some(1));
        assert_eq!(graph.group_of(VarId(0)), None);
    }

    #[test]
    fn test_linear_bushing_rows_follow_options() {
        let mut assembly = Assembly::new("rack");
        let mut ground = Element::body("ground", true);
        let g0 = ground.add_point("rack0", DVec3::ZERO);
        let g1 = ground.add_point("rack1", DVec3::new(0.0, 100.0, 0.0));
        let gs = ground.add_point("ball", DVec3::new(500.0, 300.0, 0.0));
        let mut knuckle = Element::body("knuckle", false);
        let k = knuckle.add_point("rod", DVec3::new(0.0, 300.0, 0.0));
        let ks = knuckle.add_point("ball", DVec3::new(500.0, 300.0, 0.0));
        let rack = Element::linear_bushing(
            "rack",
            DVec3::ZERO,
            DVec3::new(0.0, 100.0, 0.0),
            &[DVec3::new(0.0, 300.0, 0.0)],
            -30.0,
            30.0,
        );
        let joints = [
            (g0, rack.fixed_points[0].id),
            (g1, rack.fixed_points[1].id),
            (k, rack.points[0].id),
            (gs, ks),
        ];
        assembly.add_element(ground);
        assembly.add_element(knuckle);
        assembly.add_element(rack);
        for (lhs, rhs) in joints {
            assembly.connect(lhs, rhs).unwrap();
        }

        let graph = build(&assembly, &Controls::new()).unwrap();
        let free = graph.group_rows(0, &ConstraintsOptions::default());
        let fixed = graph.group_rows(0, &ConstraintsOptions::default().with_fixed_linear_bushing());
        assert_eq!(free, 3 + 2 + 1);
        assert_eq!(fixed, free + 1);
    }

    struct Steering {
        assembly: Assembly,
        controls: Controls,
        rack: Uuid,
        tie_rod: Uuid,
        arm: Uuid,
        pivot: Uuid,
        rod_end: Uuid,
        steering_arm: Uuid,
    }

    /// Rack on the ground driving a hinged steering arm through a tie rod
    fn steering() -> Steering {
        let mut assembly = Assembly::new("steering");
        let mut ground = Element::body("ground", true);
        let g0 = ground.add_point("rack0", DVec3::ZERO);
        let g1 = ground.add_point("rack1", DVec3::new(0.0, 100.0, 0.0));
        let gh0 = ground.add_point("kingpin0", DVec3::new(200.0, 250.0, 0.0));
        let gh1 = ground.add_point("kingpin1", DVec3::new(200.0, 250.0, 100.0));
        let mut arm = Element::body("knuckle", false);
        let ah0 = arm.add_point("kingpin0", DVec3::new(200.0, 250.0, 0.0));
        let ah1 = arm.add_point("kingpin1", DVec3::new(200.0, 250.0, 100.0));
        let steering_arm = arm.add_point("steering arm", DVec3::new(200.0, 150.0, 0.0));
        let rack = Element::linear_bushing(
            "rack",
            DVec3::ZERO,
            DVec3::new(0.0, 100.0, 0.0),
            &[DVec3::new(0.0, 150.0, 0.0)],
            -30.0,
            30.0,
        );
        let tie = Element::bar("tie rod", DVec3::new(0.0, 150.0, 0.0), DVec3::new(200.0, 150.0, 0.0));
        let rod_end = rack.points[0].id;
        let joints = [
            (g0, rack.fixed_points[0].id),
            (g1, rack.fixed_points[1].id),
            (rod_end, tie.fixed_points[0].id),
            (tie.points[0].id, steering_arm),
            (gh0, ah0),
            (gh1, ah1),
        ];
        let (rack_id, tie_id, arm_id) = (rack.id, tie.id, arm.id);
        let mut controls = Controls::new();
        controls.add(rack_id, Control::offset(0.0));
        assembly.add_element(ground);
        assembly.add_element(arm);
        assembly.add_element(rack);
        assembly.add_element(tie);
        for (lhs, rhs) in joints {
            assembly.connect(lhs, rhs).unwrap();
        }
        Steering {
            assembly,
            controls,
            rack: rack_id,
            tie_rod: tie_id,
            arm: arm_id,
            pivot: ah0,
            rod_end,
            steering_arm,
        }
    }

    #[test]
    fn test_rack_travel_steers_the_knuckle() {
        let model = steering();
        let mut solver = KinematicsSolver::new(model.assembly, model.controls, SolverConfig::default()).unwrap();
        let options = ConstraintsOptions::default();

        solver.set_controlled_offset(model.rack, 20.0).unwrap();
        solver.solve(&options).unwrap();
        let after = solver.node_positions();

        let rod_end = after[&model.rod_end];
        assert_relative_eq!(rod_end.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(rod_end.y, 170.0, epsilon = 1e-3);
        assert_relative_eq!(rod_end.z, 0.0, epsilon = 1e-3);
        let arm_end = after[&model.steering_arm];
        assert_relative_eq!(rod_end.distance(arm_end), 200.0, epsilon = 1e-3);
        assert_relative_eq!(arm_end.distance(after[&model.pivot]), 100.0, epsilon = 1e-3);
        assert_relative_eq!(arm_end.z, 0.0, epsilon = 1e-3);

        let assembly = solver.assembly();
        let knuckle = assembly.element(model.arm).unwrap();
        assert!(knuckle.rotation.angle_between(DQuat::IDENTITY) > 1e-3);

        let rack = assembly.element(model.rack).unwrap();
        assert_relative_eq!(rack.dl_current, 20.0, epsilon = 1e-3);
        let frame1 = rack.node_world_position(rack.fixed_points[1].id).unwrap();
        assert!(frame1.distance(DVec3::new(0.0, 100.0, 0.0)) < 1e-6);

        let tie = assembly.element(model.tie_rod).unwrap();
        assert_relative_eq!(tie.dl_current, 0.0, epsilon = 1e-3);
        let tie_outer = tie.node_world_position(tie.points[0].id).unwrap();
        assert!(tie_outer.distance(arm_end) < 1e-3);
    }

    #[test]
    fn test_rack_travel_stops_at_its_limit() {
        let model = steering();
        let mut solver = KinematicsSolver::new(model.assembly, model.controls, SolverConfig::default()).unwrap();

        solver.set_controlled_offset(model.rack, 50.0).unwrap();
        solver.solve(&ConstraintsOptions::default()).unwrap();

        assert_relative_eq!(solver.node_positions()[&model.rod_end].y, 180.0, epsilon = 1e-3);
        let rack = solver.assembly().element(model.rack).unwrap();
        assert_relative_eq!(rack.dl_current, 30.0, epsilon = 1e-3);
    }

    struct AntiRollBar {
        assembly: Assembly,
        controls: Controls,
        bar: Uuid,
        left: Uuid,
        left_arm: Uuid,
        right_arm: Uuid,
    }

    /// Torsion bar along Y whose arms ride on two rockers hinged about the
    /// bar axis, the left rocker driven by a vertical plane control
    fn anti_roll_bar() -> AntiRollBar {
        let mut assembly = Assembly::new("anti-roll bar");
        let mut ground = Element::body("ground", true);
        let axis0 = ground.add_point("bar0", DVec3::new(0.0, -100.0, 0.0));
        let axis1 = ground.add_point("bar1", DVec3::new(0.0, 100.0, 0.0));
        let mut joints = Vec::new();
        let mut rockers = Vec::new();
        for (side, y) in [("left", -200.0), ("right", 200.0)] {
            let g0 = ground.add_point(format!("{side} pivot0"), DVec3::new(0.0, y - 50.0, 0.0));
            let g1 = ground.add_point(format!("{side} pivot1"), DVec3::new(0.0, y + 50.0, 0.0));
            let mut rocker = Element::body(format!("{side} rocker"), false);
            let r0 = rocker.add_point("pivot0", DVec3::new(0.0, y - 50.0, 0.0));
            let r1 = rocker.add_point("pivot1", DVec3::new(0.0, y + 50.0, 0.0));
            let arm = rocker.add_point("drop link", DVec3::new(100.0, y / 2.0, 0.0));
            joints.push((g0, r0));
            joints.push((g1, r1));
            rockers.push((rocker, arm));
        }
        let bar = Element::torsion_spring(
            "anti-roll bar",
            DVec3::new(0.0, -100.0, 0.0),
            DVec3::new(0.0, 100.0, 0.0),
            DVec3::new(100.0, -100.0, 0.0),
            DVec3::new(100.0, 100.0, 0.0),
            SpringProperties::default(),
        );
        joints.push((axis0, bar.fixed_points[0].id));
        joints.push((axis1, bar.fixed_points[1].id));
        joints.push((rockers[0].1, bar.points[0].id));
        joints.push((rockers[1].1, bar.points[1].id));

        let (left_arm, right_arm) = (rockers[0].1, rockers[1].1);
        let left = rockers[0].0.id;
        let bar_id = bar.id;
        let mut controls = Controls::new();
        controls.add(left, Control::plane(left_arm, DVec3::Z, 0.0, 50.0));
        controls.add(bar_id, Control::offset(0.0));
        assembly.add_element(ground);
        for (rocker, _) in rockers {
            assembly.add_element(rocker);
        }
        assembly.add_element(bar);
        for (lhs, rhs) in joints {
            assembly.connect(lhs, rhs).unwrap();
        }
        AntiRollBar {
            assembly,
            controls,
            bar: bar_id,
            left,
            left_arm,
            right_arm,
        }
    }

    #[test]
    fn test_locked_torsion_bar_carries_the_roll() {
        let model = anti_roll_bar();
        let mut solver = KinematicsSolver::new(model.assembly, model.controls, SolverConfig::default()).unwrap();
        let options = ConstraintsOptions::default();

        solver.set_controlled_offset(model.left, 20.0).unwrap();
        solver.solve(&options).unwrap();
        let after = solver.node_positions();

        let (left, right) = (after[&model.left_arm], after[&model.right_arm]);
        assert_relative_eq!(left.z, 20.0, epsilon = 1e-3);
        assert_relative_eq!(right.z, 20.0, epsilon = 1e-3);
        assert_relative_eq!(right.x, left.x, epsilon = 1e-3);
        assert_relative_eq!(right.y, 100.0, epsilon = 1e-3);
        let bar = solver.assembly().element(model.bar).unwrap();
        assert_relative_eq!(bar.dl_current, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_torsion_bar_twist_is_restored() {
        let model = anti_roll_bar();
        let mut solver = KinematicsSolver::new(model.assembly, model.controls, SolverConfig::default()).unwrap();
        let options = ConstraintsOptions::default();

        solver.set_controlled_offset(model.bar, 0.1).unwrap();
        solver.solve(&options).unwrap();
        let after = solver.node_positions();

        let axis0 = DVec3::new(0.0, -100.0, 0.0);
        let (left, right) = (after[&model.left_arm], after[&model.right_arm]);
        assert_relative_eq!(left.z, 0.0, epsilon = 1e-3);
        assert_relative_eq!(twist_angle_value(axis0, DVec3::Y, left, right), 0.1, epsilon = 1e-6);
        for arm in [left, right] {
            assert_relative_eq!(DVec3::new(arm.x, 0.0, arm.z).length(), 100.0, epsilon = 1e-3);
        }

        let bar = solver.assembly().element(model.bar).unwrap();
        assert_relative_eq!(bar.dl_current, 0.1, epsilon = 1e-6);
        let axis1 = bar.node_world_position(bar.fixed_points[1].id).unwrap();
        assert!(axis1.distance(DVec3::new(0.0, 100.0, 0.0)) < 1e-6);
    }

    #[test]
    fn test_dangling_bar_end() {
        let mut assembly = Assembly::new("dangling");
        let mut ground = Element::body("ground", true);
        let g = ground.add_point("mount", DVec3::ZERO);
        let bar = Element::bar("bar", DVec3::ZERO, DVec3::X * 100.0);
        let end0 = bar.fixed_points[0].id;
        assembly.add_element(ground);
        assembly.add_element(bar);
        assembly.connect(g, end0).unwrap();

        assert!(matches!(
            build(&assembly, &Controls::new()),
            Err(SolverError::MissingJointPartner { .. })
        ));
    }

    #[test]
    fn test_bar_between_grounded_points() {
        let mut assembly = Assembly::new("grounded");
        let mut ground = Element::body("ground", true);
        let g0 = ground.add_point("a", DVec3::ZERO);
        let g1 = ground.add_point("b", DVec3::X * 100.0);
        let bar = Element::bar("bar", DVec3::ZERO, DVec3::X * 100.0);
        let (e0, e1) = (bar.fixed_points[0].id, bar.points[0].id);
        assembly.add_element(ground);
        assembly.add_element(bar);
        assembly.connect(g0, e0).unwrap();
        assembly.connect(g1, e1).unwrap();

        assert!(matches!(
            build(&assembly, &Controls::new()),
            Err(SolverError::NoDegreesOfFreedom(_))
        ));
    }

    #[test]
    fn test_coincident_bar_ends() {
        let mut assembly = Assembly::new("coincident");
        let mut ground = Element::body("ground", true);
        let g = ground.add_point("a", DVec3::ZERO);
        let mut body = Element::body("body", false);
        let b = body.add_point("a", DVec3::ZERO);
        let bar = Element::bar("bar", DVec3::ZERO, DVec3::ZERO);
        let (e0, e1) = (bar.fixed_points[0].id, bar.points[0].id);
        assembly.add_element(ground);
        assembly.add_element(body);
        assembly.add_element(bar);
        assembly.connect(g, e0).unwrap();
        assembly.connect(b, e1).unwrap();

        assert!(matches!(
            build(&assembly, &Controls::new()),
            Err(SolverError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_tire_with_loose_bearing() {
        let mut assembly = Assembly::new("loose");
        let mut hub = Element::body("hub", false);
        let tire = Element::tire("tire", DVec3::new(0.0, 0.0, 250.0), DVec3::Y, 250.0);
        let h = hub.add_point("bearing", tire.fixed_points[0].position);
        let b0 = tire.fixed_points[0].id;
        assembly.add_element(hub);
        assembly.add_element(tire);
        assembly.connect(h, b0).unwrap();

        assert!(matches!(
            build(&assembly, &Controls::new()),
            Err(SolverError::MissingJointPartner { .. })
        ));
    }

    #[test]
    fn test_invalid_assembly_is_reported() {
        let mut assembly = Assembly::new("invalid");
        assembly.add_element(Element::new("bar", ElementKind::Bar));
        assert!(matches!(
            build(&assembly, &Controls::new()),
            Err(SolverError::Assembly(_))
        ));
    }

    #[test]
    fn test_frame_attach_roundtrip() {
        let rotation = DQuat::from_rotation_z(0.3);
        let parent = Frame::identity(VarId(0), true, DVec3::new(1.0, 2.0, 3.0), rotation);
        let child = parent.attach(DVec3::new(4.0, 5.0, 6.0), DQuat::from_rotation_x(0.2));
        let world = child.world(DVec3::X);
        let expected = DVec3::new(4.0, 5.0, 6.0) + DQuat::from_rotation_x(0.2) * DVec3::X;
        assert_relative_eq!(world.x, expected.x, epsilon = 1e-12);
        assert_relative_eq!(world.y, expected.y, epsilon = 1e-12);
        assert_relative_eq!(world.z, expected.z, epsilon = 1e-12);
    }
}
