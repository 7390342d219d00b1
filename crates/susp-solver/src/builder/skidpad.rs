//! Unknown forces and balance equations for the steady-state skidpad
//!
//! Every joint between two different force owners (a free body, or a reduced
//! element) carries a reaction force variable; every tire carries a contact
//! force. Balances are written per owner: rigid bodies with their masses,
//! reduced elements massless. The yaw rate `omega` and the longitudinal
//! drive error are scalar unknowns.

use std::collections::HashMap;
use std::rc::Rc;

use glam::DVec3;
use tracing::debug;
use uuid::Uuid;

use susp_core::constants::MM_TO_M;
use susp_core::{Element, ElementKind, SpringProperties};

use super::{GraphBuilder, TireInfo};
use crate::autodiff::{Leaf, Parameter, Scalar, Vector};
use crate::config::SkidpadConfig;
use crate::constraint::{BalanceKind, Constraint, ForceBalance, Gate, PlanePoint, SpringLaw, twist_angle, twist_angle_value};
use crate::error::SolverResult;
use crate::tire::{FrictionFunction, TireFriction};
use crate::variable::{PointForceVariable, ScalarVariable, VarId, Variable};

/// Reaction force carried by a joint
#[derive(Debug, Clone, Copy)]
pub struct JointForce {
    pub var: VarId,
    pub joint: Uuid,
    /// Node receiving the force with a positive sign
    pub lhs: Uuid,
    pub rhs: Uuid,
}

/// Skidpad unknowns beyond the kinematic ones
#[derive(Debug, Clone)]
pub struct SkidpadModel {
    /// Yaw rate (rad/s)
    pub omega: VarId,
    /// Longitudinal drive force error (N)
    pub error: VarId,
    pub joint_forces: Vec<JointForce>,
    /// (force variable, tire element)
    pub contact_forces: Vec<(VarId, Uuid)>,
    pub velocity: f64,
    pub gravity: DVec3,
    /// Direction towards the turn center
    pub lateral: DVec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Owner {
    Body(VarId),
    Element(usize),
}

fn scalar_leaf(var: VarId) -> Scalar {
    Scalar::variable(Leaf {
        var,
        dof: 1,
        offset: 0,
    })
}

fn sum(vectors: impl IntoIterator<Item = Vector>) -> Vector {
    vectors
        .into_iter()
        .reduce(|a, b| a.add(&b))
        .unwrap_or_else(|| Vector::constant(DVec3::ZERO))
}

/// Moment of `force` applied at `point` about `origin`
fn moment(point: &Vector, origin: &Vector, force: &Vector) -> Vector {
    point.sub(origin).cross(force)
}

impl GraphBuilder<'_> {
    fn owner(&self, element: usize) -> Owner {
        self.frames
            .get(&element)
            .map_or(Owner::Element(element), |f| Owner::Body(f.body))
    }

    fn owner_is_fixed(&self, owner: Owner) -> bool {
        match owner {
            Owner::Body(body) => self.frames.values().any(|f| f.body == body && !f.free),
            Owner::Element(_) => false,
        }
    }

    pub(super) fn add_skidpad(
        &mut self,
        config: &SkidpadConfig,
        friction: Rc<dyn TireFriction>,
    ) -> SolverResult<SkidpadModel> {
        let assembly = self.assembly;
        let normal = self.config.ground_normal.normalize();
        let lateral = normal.cross(DVec3::X).normalize();

        let omega = self.push_variable(ScalarVariable::new("omega", 0.0));
        let error = self.push_variable(ScalarVariable::new("drive error", 0.0));

        // reaction forces, keyed by the node they act on
        let mut node_forces: HashMap<Uuid, Vec<Vector>> = HashMap::new();
        let mut joint_forces = Vec::new();
        for joint in &assembly.joints {
            let (Some(li), Some(ri)) = (assembly.node_owner(joint.lhs), assembly.node_owner(joint.rhs)) else {
                continue;
            };
            let (lo, ro) = (self.owner(li), self.owner(ri));
            if lo == ro || (self.owner_is_fixed(lo) && self.owner_is_fixed(ro)) {
                continue;
            }
            let (le, re) = (&assembly.elements[li], &assembly.elements[ri]);
            let var = self.push_variable(PointForceVariable::new(
                Some(joint.id),
                le.id,
                format!("{}/{}", le.name, re.name),
            ));
            let force = Vector::variable(Leaf {
                var,
                dof: 3,
                offset: 0,
            });
            node_forces.entry(joint.rhs).or_default().push(force.scale_by(-1.0));
            node_forces.entry(joint.lhs).or_default().push(force);
            joint_forces.push(JointForce {
                var,
                joint: joint.id,
                lhs: joint.lhs,
                rhs: joint.rhs,
            });
        }

        // tire contact forces act at the contact patch
        let tire_ids: Vec<Uuid> = self.tires.iter().map(|t| assembly.elements[t.index].id).collect();
        let mut contacts: Vec<(TireInfo, Vector, Vector)> = Vec::new();
        let mut contact_forces = Vec::new();
        for tire in self.tires.clone() {
            let element = &assembly.elements[tire.index];
            let var = self.push_variable(PointForceVariable::new(
                None,
                element.id,
                format!("{} contact", element.name),
            ));
            let force = Vector::variable(Leaf {
                var,
                dof: 3,
                offset: 0,
            });
            let center = self.point_expr(&tire.frame, tire.center);
            let axis = self.direction_expr(&tire.frame, tire.axis);
            let patch = PlanePoint::NearestOnTire {
                center,
                axis,
                radius: tire.radius,
            }
            .expression(normal);
            contact_forces.push((var, element.id));
            contacts.push((tire, patch, force));
        }

        let omega_scalar = scalar_leaf(omega);
        let error_scalar = scalar_leaf(error);

        // free bodies
        let mut bodies: Vec<VarId> = self.frames.values().filter(|f| f.free).map(|f| f.body).collect();
        bodies.sort();
        bodies.dedup();
        for body in bodies {
            let balance = self.rigid_body_balance(body, &node_forces, &contacts, config, lateral, &omega_scalar);
            self.push(Constraint::Balance(balance));
        }

        // reduced elements
        for (index, element) in assembly.elements.iter().enumerate() {
            if self.frames.contains_key(&index) {
                continue;
            }
            let balance = self.reduced_balance(element, &node_forces)?;
            if let Some(balance) = balance {
                self.push(Constraint::Balance(balance));
            }
        }

        // tire laws
        let function = Rc::new(FrictionFunction(friction));
        for (tire, patch, force) in &contacts {
            let element = &assembly.elements[tire.index];
            let axis = self.direction_expr(&tire.frame, tire.axis);
            let n = Vector::constant(normal);
            let heading = axis.cross(&n).normalize();
            let side = n.cross(&heading);

            let travel = Vector::constant(DVec3::X * config.velocity)
                .add(&n.cross(patch).scale(&omega_scalar).scale_by(MM_TO_M));
            let slip_angle = Scalar::atan2(&travel.dot(&side), &travel.dot(&heading));
            let inclination = Scalar::atan2(&axis.dot(&n), &Scalar::length(&axis.cross(&n)));
            let vertical = force.dot(&n);
            let lateral_force = Scalar::function(function.clone(), vec![slip_angle, inclination, vertical]);

            let ratio = config.torque_ratio_of(element.id, &tire_ids);
            let balance = ForceBalance::new(format!("{} tire", element.name), element.id, BalanceKind::Tire)
                .with_scalar(
                    force.dot(&heading).sub(&error_scalar.scale(ratio)),
                    Gate::Forces,
                )
                .with_scalar(force.dot(&side), Gate::Frictionless)
                .with_scalar(force.dot(&side).sub(&lateral_force), Gate::Friction);
            self.push(Constraint::Balance(balance));
        }

        let yaw = ForceBalance::new("yaw rate", Uuid::nil(), BalanceKind::YawRate)
            .with_scalar(omega_scalar, Gate::Frictionless);
        self.push(Constraint::Balance(yaw));

        debug!(
            joint_forces = joint_forces.len(),
            contacts = contact_forces.len(),
            "skidpad unknowns added"
        );

        Ok(SkidpadModel {
            omega,
            error,
            joint_forces,
            contact_forces,
            velocity: config.velocity,
            gravity: config.gravity,
            lateral,
        })
    }

    fn push_variable(&mut self, variable: impl Into<Variable>) -> VarId {
        self.variables.push(variable.into());
        VarId(self.variables.len() - 1)
    }

    /// ΣF = 0 and ΣM = 0 about the body origin, with gravity and the
    /// centrifugal load of every member's mass
    fn rigid_body_balance(
        &mut self,
        body: VarId,
        node_forces: &HashMap<Uuid, Vec<Vector>>,
        contacts: &[(TireInfo, Vector, Vector)],
        config: &SkidpadConfig,
        lateral: DVec3,
        omega: &Scalar,
    ) -> ForceBalance {
        let assembly = self.assembly;
        let mut members: Vec<(usize, super::Frame)> = self
            .frames
            .iter()
            .filter(|(_, f)| f.body == body)
            .map(|(i, f)| (*i, *f))
            .collect();
        members.sort_by_key(|(i, _)| *i);
        let origin = self.body_leaves(body).0;

        let mut forces = Vec::new();
        let mut moments = Vec::new();
        for (index, frame) in &members {
            let element = &assembly.elements[*index];
            for node in element.nodes() {
                let Some(applied) = node_forces.get(&node.id) else {
                    continue;
                };
                let point = self.point_expr(frame, node.position);
                for force in applied {
                    moments.push(moment(&point, &origin, force));
                    forces.push(force.clone());
                }
            }
            if element.mass > 0.0 {
                let cog = self.point_expr(frame, element.center_of_gravity);
                let load = Vector::constant(config.gravity * element.mass)
                    .add(&Vector::constant(-lateral * element.mass * config.velocity).scale(omega));
                moments.push(moment(&cog, &origin, &load));
                forces.push(load);
            }
        }
        for (tire, patch, force) in contacts {
            if tire.frame.body == body {
                moments.push(moment(patch, &origin, force));
                forces.push(force.clone());
            }
        }

        let (name, id) = members
            .first()
            .map(|(i, _)| {
                let e = &assembly.elements[*i];
                (e.name.clone(), e.id)
            })
            .unwrap_or_default();
        ForceBalance::new(format!("{name} balance"), id, BalanceKind::RigidBody)
            .with_vector(sum(forces), Gate::Forces)
            .with_vector(sum(moments), Gate::Forces)
    }

    /// Massless balance of a reduced element
    fn reduced_balance(
        &mut self,
        element: &Element,
        node_forces: &HashMap<Uuid, Vec<Vector>>,
    ) -> SolverResult<Option<ForceBalance>> {
        let force_at = |node: Uuid| sum(node_forces.get(&node).into_iter().flatten().cloned());
        let controlled = self.controls.is_controlled(element.id);
        let name = format!("{} balance", element.name);

        let balance = match &element.kind {
            ElementKind::Bar | ElementKind::SpringDamper { .. } => {
                let (n0, n1) = (&element.fixed_points[0], &element.points[0]);
                let p0 = self.node_expr(n0.id)?;
                let p1 = self.node_expr(n1.id)?;
                let (f0, f1) = (force_at(n0.id), force_at(n1.id));
                let initial = element.world_point(n1.position) - element.world_point(n0.position);
                let span = p1.sub(&p0);
                let direction = span.normalize();
                let ortho0 = direction.stable_orthogonal(initial);
                let ortho1 = direction.cross(&ortho0);
                let kind = match element.kind {
                    ElementKind::Bar => BalanceKind::Bar,
                    _ => BalanceKind::SpringDamper,
                };
                let mut balance = ForceBalance::new(name, element.id, kind)
                    .with_vector(f0.add(&f1), Gate::Forces)
                    .with_scalar(f0.dot(&ortho0), Gate::Forces)
                    .with_scalar(f0.dot(&ortho1), Gate::Forces);
                if let ElementKind::SpringDamper { spring } = &element.kind {
                    if !controlled {
                        balance = balance.with_spring(spring_law(
                            spring,
                            f1.dot(&direction),
                            span.length(),
                            initial.length(),
                        ));
                    }
                }
                balance
            }
            ElementKind::AArm => {
                let (p0, p1, outer) = (&element.fixed_points[0], &element.fixed_points[1], &element.points[0]);
                let o = self.node_expr(outer.id)?;
                let mut forces = vec![force_at(outer.id)];
                let mut moments = Vec::new();
                for pivot in [p0, p1] {
                    let point = self.node_expr(pivot.id)?;
                    let force = force_at(pivot.id);
                    moments.push(moment(&point, &o, &force));
                    forces.push(force);
                }
                ForceBalance::new(name, element.id, BalanceKind::AArm)
                    .with_vector(sum(forces), Gate::Forces)
                    .with_vector(sum(moments), Gate::Forces)
            }
            ElementKind::LinearBushing { .. } => {
                let (n0, n1) = (&element.fixed_points[0], &element.fixed_points[1]);
                let f0 = self.node_expr(n0.id)?;
                let f1 = self.node_expr(n1.id)?;
                let axis = f1.sub(&f0).normalize();
                let mut forces = vec![force_at(n0.id)];
                let mut moments = Vec::new();
                let force = force_at(n1.id);
                moments.push(moment(&f1, &f0, &force));
                forces.push(force);
                let mut axial = Vec::new();
                for rod_end in &element.points {
                    let point = self.node_expr(rod_end.id)?;
                    let force = force_at(rod_end.id);
                    moments.push(moment(&point, &f0, &force));
                    axial.push(force.clone());
                    forces.push(force);
                }
                let mut balance = ForceBalance::new(name, element.id, BalanceKind::LinearBushing)
                    .with_vector(sum(forces), Gate::Forces)
                    .with_vector(sum(moments), Gate::Forces);
                if !controlled {
                    balance = balance.with_scalar(sum(axial).dot(&axis), Gate::FreeBushing);
                }
                balance
            }
            ElementKind::TorsionSpring { spring } => {
                let ids = [
                    element.fixed_points[0].id,
                    element.fixed_points[1].id,
                    element.points[0].id,
                    element.points[1].id,
                ];
                let mut points = Vec::with_capacity(4);
                for id in ids {
                    points.push(self.node_expr(id)?);
                }
                let forces: Vec<Vector> = ids.iter().map(|id| force_at(*id)).collect();
                let moments: Vec<Vector> = points
                    .iter()
                    .zip(&forces)
                    .skip(1)
                    .map(|(p, f)| moment(p, &points[0], f))
                    .collect();
                let axis = points[1].sub(&points[0]);
                let mut balance = ForceBalance::new(name, element.id, BalanceKind::TorsionSpring)
                    .with_vector(sum(forces.iter().cloned()), Gate::Forces)
                    .with_vector(sum(moments), Gate::Forces);
                if !controlled {
                    // torque applied on the second arm about the axis
                    let torque = moment(&points[3], &points[0], &forces[3]).dot(&axis.normalize());
                    let twist = twist_angle(&points[0], &axis, &points[2], &points[3]);
                    let world = ids.map(|id| assembly_world(self.assembly, id));
                    let nominal = twist_angle_value(world[0], world[1] - world[0], world[2], world[3]);
                    balance = balance.with_spring(spring_law(spring, torque, twist, nominal));
                }
                balance
            }
            ElementKind::Body { .. } | ElementKind::Tire { .. } => return Ok(None),
        };
        Ok(Some(balance))
    }
}

fn assembly_world(assembly: &susp_core::Assembly, node: Uuid) -> DVec3 {
    assembly.node_world_position(node).unwrap_or_default()
}

fn spring_law(spring: &SpringProperties, load: Scalar, extension: Scalar, nominal: f64) -> SpringLaw {
    SpringLaw {
        load,
        extension,
        spring_constant: spring.spring_constant,
        free_length: Parameter::new(spring.free_length.unwrap_or(nominal)),
    }
}
