//! Model reduction: elements that only transmit forces between their nodes
//! are replaced by distance, slider and twist constraints on shared anchors

use glam::DVec3;
use uuid::Uuid;

use susp_core::constants::COINCIDENT_EPSILON;
use susp_core::{Element, ElementKind, NodePoint, SpringProperties};

use super::GraphBuilder;
use crate::autodiff::{Parameter, Vector};
use crate::constraint::{Constraint, LinearSlider, RigidLink, TorsionLock, twist_angle, twist_angle_value};
use crate::error::{SolverError, SolverResult};
use crate::restorer::{NodeRef, Restorer};

fn node_ref(node: &NodePoint) -> NodeRef {
    NodeRef {
        node: node.id,
        local: node.position,
    }
}

impl GraphBuilder<'_> {
    /// Step 4: constraints and restorers for every reduced element
    pub(super) fn reduce_elements(&mut self) -> SolverResult<()> {
        let assembly = self.assembly;
        for (index, element) in assembly.elements.iter().enumerate() {
            if self.frames.contains_key(&index) {
                continue;
            }
            match &element.kind {
                ElementKind::Bar => self.reduce_link(element, None)?,
                ElementKind::SpringDamper { spring } => self.reduce_link(element, Some(spring))?,
                ElementKind::AArm => self.reduce_a_arm(element)?,
                ElementKind::LinearBushing { dl_min, dl_max } => {
                    self.reduce_linear_bushing(element, *dl_min, *dl_max)?
                }
                ElementKind::TorsionSpring { spring } => self.reduce_torsion_spring(element, spring)?,
                ElementKind::Body { .. } | ElementKind::Tire { .. } => continue,
            }
            for node in element.nodes() {
                let expr = self.node_expr(node.id)?;
                self.reduced_nodes.push((node.id, expr));
            }
        }
        Ok(())
    }

    /// Distance link between two nodes of `element`
    fn link(
        &mut self,
        name: String,
        element: &Element,
        n0: &NodePoint,
        n1: &NodePoint,
    ) -> SolverResult<RigidLink> {
        let length = (element.world_point(n1.position) - element.world_point(n0.position)).length();
        if length < COINCIDENT_EPSILON {
            return Err(SolverError::DegenerateGeometry {
                element: element.name.clone(),
                reason: format!("nodes {} and {} are coincident", n0.name, n1.name),
            });
        }
        let p0 = self.node_expr(n0.id)?;
        let p1 = self.node_expr(n1.id)?;
        Ok(RigidLink::new(name, element.id, &p0, &p1, length))
    }

    /// Whether two nodes are already held at a fixed distance by one body
    fn same_rigid_anchor(&self, n0: Uuid, n1: Uuid) -> bool {
        match (self.anchor_body(n0), self.anchor_body(n1)) {
            (Some(b0), Some(b1)) => b0 == b1,
            _ => false,
        }
    }

    fn reduce_link(&mut self, element: &Element, spring: Option<&SpringProperties>) -> SolverResult<()> {
        let (n0, n1) = (&element.fixed_points[0], &element.points[0]);
        let mut link = self.link(element.name.clone(), element, n0, n1)?;
        if let Some(spring) = spring {
            link = link.spring_dumper(spring.dl_min, spring.dl_max);
        }
        if let Some(dl) = self.controls.offset_of(element.id) {
            link = link.controlled_by(element.id, dl);
        }
        self.push(Constraint::RigidLink(link));
        self.restorers.push(Restorer::Bar {
            element: element.id,
            ends: [node_ref(n0), node_ref(n1)],
        });
        Ok(())
    }

    /// A-arm with a single outer point: two sides, plus the pivot span when
    /// the pivots are not on one body
    fn reduce_a_arm(&mut self, element: &Element) -> SolverResult<()> {
        let (p0, p1, outer) = (&element.fixed_points[0], &element.fixed_points[1], &element.points[0]);
        let side0 = self.link(format!("{} side0", element.name), element, p0, outer)?;
        let side1 = self.link(format!("{} side1", element.name), element, p1, outer)?;
        self.push(Constraint::RigidLink(side0));
        self.push(Constraint::RigidLink(side1));
        if !self.same_rigid_anchor(p0.id, p1.id) {
            let span = self.link(format!("{} pivots", element.name), element, p0, p1)?;
            self.push(Constraint::RigidLink(span));
        }
        self.restorers.push(Restorer::AArm {
            element: element.id,
            pivots: [node_ref(p0), node_ref(p1)],
            outer: node_ref(outer),
            initial_rotation: element.rotation,
        });
        Ok(())
    }

    fn reduce_linear_bushing(&mut self, element: &Element, dl_min: f64, dl_max: f64) -> SolverResult<()> {
        let (n0, n1) = (&element.fixed_points[0], &element.fixed_points[1]);
        let f0 = self.node_expr(n0.id)?;
        let f1 = self.node_expr(n1.id)?;
        let w0 = element.world_point(n0.position);
        let w1 = element.world_point(n1.position);
        let dl = Parameter::new(0.0);
        let controller = self.controls.offset_of(element.id);

        let mut offset = 0.0;
        let mut rods: Vec<Vector> = Vec::new();
        for (i, rod_end) in element.points.iter().enumerate() {
            let rod = self.node_expr(rod_end.id)?;
            let mut slider = LinearSlider::new(
                format!("{} rod end {i}", element.name),
                element.id,
                [&f0, &f1, &rod],
                &dl,
                [w0, w1, element.world_point(rod_end.position)],
            )?
            .with_bounds(dl_min, dl_max);
            if let Some(value) = controller {
                slider = slider.controlled_by(element.id, value);
            }
            if i == 0 {
                offset = slider.offset();
            }
            self.push(Constraint::LinearSlider(slider));
            rods.push(rod);
        }

        // rod ends move together
        for (i, pair) in element.points.windows(2).enumerate() {
            let link = self.link(format!("{} rod spacing {i}", element.name), element, &pair[0], &pair[1])?;
            self.push(Constraint::RigidLink(link));
        }

        // the frame span is otherwise free when its nodes sit on different bodies
        if !self.same_rigid_anchor(n0.id, n1.id) {
            let span = self.link(format!("{} frame", element.name), element, n0, n1)?;
            self.push(Constraint::RigidLink(span));
        }

        self.restorers.push(Restorer::LinearBushing {
            element: element.id,
            frame: [node_ref(n0), node_ref(n1)],
            rod_end: node_ref(&element.points[0]),
            offset,
        });
        Ok(())
    }

    /// Torsion spring: both arm ends ride at fixed distances from the axis
    /// nodes; the twist between them is locked while the spring is rigid
    fn reduce_torsion_spring(&mut self, element: &Element, spring: &SpringProperties) -> SolverResult<()> {
        let (a0, a1) = (&element.fixed_points[0], &element.fixed_points[1]);
        let (arm0, arm1) = (&element.points[0], &element.points[1]);
        for (i, arm) in [arm0, arm1].into_iter().enumerate() {
            for (j, axis) in [a0, a1].into_iter().enumerate() {
                let link = self.link(format!("{} arm{i} axis{j}", element.name), element, axis, arm)?;
                self.push(Constraint::RigidLink(link));
            }
        }
        if !self.same_rigid_anchor(a0.id, a1.id) {
            let span = self.link(format!("{} axis", element.name), element, a0, a1)?;
            self.push(Constraint::RigidLink(span));
        }

        let world: [DVec3; 4] = [a0, a1, arm0, arm1].map(|n| element.world_point(n.position));
        let nominal = twist_angle_value(world[0], world[1] - world[0], world[2], world[3]);
        let [e0, e1, e2, e3] = [a0, a1, arm0, arm1].map(|n| n.id);
        let (origin, axis_end, r0, r1) = (
            self.node_expr(e0)?,
            self.node_expr(e1)?,
            self.node_expr(e2)?,
            self.node_expr(e3)?,
        );
        let twist = twist_angle(&origin, &axis_end.sub(&origin), &r0, &r1);
        let mut lock = TorsionLock::new(format!("{} twist", element.name), element.id, &twist, nominal)
            .with_bounds(spring.dl_min, spring.dl_max);
        if let Some(dl) = self.controls.offset_of(element.id) {
            lock = lock.controlled_by(element.id, dl);
        }
        self.push(Constraint::TorsionLock(lock));

        self.restorers.push(Restorer::TorsionSpring {
            element: element.id,
            axis: [node_ref(a0), node_ref(a1)],
            arms: [node_ref(arm0), node_ref(arm1)],
            nominal_twist: nominal,
        });
        Ok(())
    }
}
