//! Unknowns of the constraint graph
//!
//! Every variable kind implements [`DegreesOfFreedom`]; [`Variable`] wraps a
//! kind together with the column it occupies in its group's Jacobian.

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SolverError, SolverResult};

/// Arena index of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Saved value of one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableState {
    RigidBody { position: DVec3, quaternion: DQuat },
    Point { position: DVec3 },
    PointForce { force: DVec3 },
    Scalar { value: f64 },
}

/// Capability set shared by all variable kinds
pub trait DegreesOfFreedom {
    fn name(&self) -> &str;

    /// Number of scalar unknowns contributed to the group
    fn degree_of_freedom(&self) -> usize;

    /// Current value of scalar component `offset`
    fn component(&self, offset: usize) -> f64;

    /// Subtract a Newton step (already multiplied by the column scale)
    fn apply_dq(&mut self, dq: &[f64]);

    fn save_state(&self) -> VariableState;

    fn restore_state(&mut self, state: &VariableState) -> SolverResult<()>;

    /// Record the current value as written back to the assembly
    fn mark_applied(&mut self);

    /// Return to the value last written back to the assembly
    fn reset_to_applied(&mut self);
}

/// How a rigid body participates in the solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyMode {
    /// Seven unknowns: position and quaternion
    Free,
    /// Grounded, excluded from the unknowns
    Fixed,
    /// Rigidly attached to another body; pose is `parent * (position, rotation)`
    Attached {
        parent: VarId,
        position: DVec3,
        rotation: DQuat,
    },
}

/// Position and orientation of a full rigid body
#[derive(Debug, Clone)]
pub struct RigidBodyVariable {
    pub element: Uuid,
    name: String,
    pub position: DVec3,
    /// `(w, x, y, z)` in the solve, unit length after every update
    pub quaternion: DQuat,
    applied: (DVec3, DQuat),
    pub mode: BodyMode,
}

impl RigidBodyVariable {
    pub fn free(element: Uuid, name: impl Into<String>, position: DVec3, quaternion: DQuat) -> Self {
        Self {
            element,
            name: name.into(),
            position,
            quaternion,
            applied: (position, quaternion),
            mode: BodyMode::Free,
        }
    }

    pub fn fixed(element: Uuid, name: impl Into<String>, position: DVec3, quaternion: DQuat) -> Self {
        Self {
            mode: BodyMode::Fixed,
            ..Self::free(element, name, position, quaternion)
        }
    }

    pub fn is_free(&self) -> bool {
        self.mode == BodyMode::Free
    }

    /// Map a body-local point to world coordinates
    pub fn world_point(&self, local: DVec3) -> DVec3 {
        self.position + self.quaternion * local
    }

    /// Pose of an attached body given its parent's pose
    pub fn attached_pose(parent: (DVec3, DQuat), position: DVec3, rotation: DQuat) -> (DVec3, DQuat) {
        (parent.0 + parent.1 * position, (parent.1 * rotation).normalize())
    }
}

impl DegreesOfFreedom for RigidBodyVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn degree_of_freedom(&self) -> usize {
        match self.mode {
            BodyMode::Free => 7,
            BodyMode::Fixed | BodyMode::Attached { .. } => 0,
        }
    }

    fn component(&self, offset: usize) -> f64 {
        match offset {
            0 => self.position.x,
            1 => self.position.y,
            2 => self.position.z,
            3 => self.quaternion.w,
            4 => self.quaternion.x,
            5 => self.quaternion.y,
            6 => self.quaternion.z,
            _ => 0.0,
        }
    }

    fn apply_dq(&mut self, dq: &[f64]) {
        self.position -= DVec3::new(dq[0], dq[1], dq[2]);
        let q = DQuat::from_xyzw(
            self.quaternion.x - dq[4],
            self.quaternion.y - dq[5],
            self.quaternion.z - dq[6],
            self.quaternion.w - dq[3],
        );
        self.quaternion = if q.length_squared() > 0.0 {
            q.normalize()
        } else {
            DQuat::IDENTITY
        };
    }

    fn save_state(&self) -> VariableState {
        VariableState::RigidBody {
            position: self.position,
            quaternion: self.quaternion,
        }
    }

    fn restore_state(&mut self, state: &VariableState) -> SolverResult<()> {
        match state {
            VariableState::RigidBody {
                position,
                quaternion,
            } => {
                self.position = *position;
                self.quaternion = *quaternion;
                Ok(())
            }
            other => Err(mismatch(&self.name, other)),
        }
    }

    fn mark_applied(&mut self) {
        self.applied = (self.position, self.quaternion);
    }

    fn reset_to_applied(&mut self) {
        (self.position, self.quaternion) = self.applied;
    }
}

/// Synthetic point standing in for the end of a reduced element
#[derive(Debug, Clone)]
pub struct PointVariable {
    /// Representative node of the joint cluster this point stands for
    pub node: Uuid,
    name: String,
    pub position: DVec3,
    applied: DVec3,
}

impl PointVariable {
    pub fn new(node: Uuid, name: impl Into<String>, position: DVec3) -> Self {
        Self {
            node,
            name: name.into(),
            position,
            applied: position,
        }
    }
}

impl DegreesOfFreedom for PointVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn degree_of_freedom(&self) -> usize {
        3
    }

    fn component(&self, offset: usize) -> f64 {
        self.position[offset]
    }

    fn apply_dq(&mut self, dq: &[f64]) {
        self.position -= DVec3::new(dq[0], dq[1], dq[2]);
    }

    fn save_state(&self) -> VariableState {
        VariableState::Point {
            position: self.position,
        }
    }

    fn restore_state(&mut self, state: &VariableState) -> SolverResult<()> {
        match state {
            VariableState::Point { position } => {
                self.position = *position;
                Ok(())
            }
            other => Err(mismatch(&self.name, other)),
        }
    }

    fn mark_applied(&mut self) {
        self.applied = self.position;
    }

    fn reset_to_applied(&mut self) {
        self.position = self.applied;
    }
}

/// Reaction force carried by a joint (or by the ground under a tire)
///
/// The force acts with `+1` on the `lhs` element and `-1` on the other side.
#[derive(Debug, Clone)]
pub struct PointForceVariable {
    /// Joint carrying the force, `None` for a tire contact patch
    pub joint: Option<Uuid>,
    /// Element receiving the force with a positive sign
    pub lhs: Uuid,
    name: String,
    pub force: DVec3,
    applied: DVec3,
}

impl PointForceVariable {
    pub fn new(joint: Option<Uuid>, lhs: Uuid, name: impl Into<String>) -> Self {
        Self {
            joint,
            lhs,
            name: name.into(),
            force: DVec3::ZERO,
            applied: DVec3::ZERO,
        }
    }

    /// Sign with which the force acts on `element`
    pub fn sign_for(&self, element: Uuid) -> f64 {
        if element == self.lhs { 1.0 } else { -1.0 }
    }
}

impl DegreesOfFreedom for PointForceVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn degree_of_freedom(&self) -> usize {
        3
    }

    fn component(&self, offset: usize) -> f64 {
        self.force[offset]
    }

    fn apply_dq(&mut self, dq: &[f64]) {
        self.force -= DVec3::new(dq[0], dq[1], dq[2]);
    }

    fn save_state(&self) -> VariableState {
        VariableState::PointForce { force: self.force }
    }

    fn restore_state(&mut self, state: &VariableState) -> SolverResult<()> {
        match state {
            VariableState::PointForce { force } => {
                self.force = *force;
                Ok(())
            }
            other => Err(mismatch(&self.name, other)),
        }
    }

    fn mark_applied(&mut self) {
        self.applied = self.force;
    }

    fn reset_to_applied(&mut self) {
        self.force = self.applied;
    }
}

/// A single scalar unknown (yaw rate, drive force slack)
#[derive(Debug, Clone)]
pub struct ScalarVariable {
    name: String,
    pub value: f64,
    applied: f64,
}

impl ScalarVariable {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            applied: value,
        }
    }
}

impl DegreesOfFreedom for ScalarVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn degree_of_freedom(&self) -> usize {
        1
    }

    fn component(&self, _offset: usize) -> f64 {
        self.value
    }

    fn apply_dq(&mut self, dq: &[f64]) {
        self.value -= dq[0];
    }

    fn save_state(&self) -> VariableState {
        VariableState::Scalar { value: self.value }
    }

    fn restore_state(&mut self, state: &VariableState) -> SolverResult<()> {
        match state {
            VariableState::Scalar { value } => {
                self.value = *value;
                Ok(())
            }
            other => Err(mismatch(&self.name, other)),
        }
    }

    fn mark_applied(&mut self) {
        self.applied = self.value;
    }

    fn reset_to_applied(&mut self) {
        self.value = self.applied;
    }
}

fn mismatch(name: &str, state: &VariableState) -> SolverError {
    SolverError::SnapshotMismatch(format!("variable {name} cannot take {state:?}"))
}

/// Closed set of variable kinds
#[derive(Debug, Clone)]
pub enum VariableKind {
    RigidBody(RigidBodyVariable),
    Point(PointVariable),
    PointForce(PointForceVariable),
    Scalar(ScalarVariable),
}

impl VariableKind {
    fn inner(&self) -> &dyn DegreesOfFreedom {
        match self {
            VariableKind::RigidBody(v) => v,
            VariableKind::Point(v) => v,
            VariableKind::PointForce(v) => v,
            VariableKind::Scalar(v) => v,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DegreesOfFreedom {
        match self {
            VariableKind::RigidBody(v) => v,
            VariableKind::Point(v) => v,
            VariableKind::PointForce(v) => v,
            VariableKind::Scalar(v) => v,
        }
    }
}

/// A variable in the arena, with its column in the group Jacobian
#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: VariableKind,
    col: Option<usize>,
    scale: f64,
}

impl Variable {
    pub fn name(&self) -> &str {
        self.kind.inner().name()
    }

    pub fn degree_of_freedom(&self) -> usize {
        self.kind.inner().degree_of_freedom()
    }

    pub fn component(&self, offset: usize) -> f64 {
        self.kind.inner().component(offset)
    }

    /// First Jacobian column, assigned per group before each solve
    pub fn col(&self) -> Option<usize> {
        self.col
    }

    pub fn set_col(&mut self, col: Option<usize>) {
        self.col = col;
    }

    /// Column scale: the Jacobian column is multiplied by it and the solved
    /// step is multiplied back before being applied
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Apply the slice of a group step belonging to this variable
    pub fn apply_dq(&mut self, dq: &[f64]) {
        let scaled: Vec<f64> = dq.iter().map(|d| d * self.scale).collect();
        self.kind.inner_mut().apply_dq(&scaled);
    }

    pub fn save_state(&self) -> VariableState {
        self.kind.inner().save_state()
    }

    pub fn restore_state(&mut self, state: &VariableState) -> SolverResult<()> {
        self.kind.inner_mut().restore_state(state)
    }

    pub fn mark_applied(&mut self) {
        self.kind.inner_mut().mark_applied();
    }

    pub fn reset_to_applied(&mut self) {
        self.kind.inner_mut().reset_to_applied();
    }

    pub fn as_rigid_body(&self) -> Option<&RigidBodyVariable> {
        match &self.kind {
            VariableKind::RigidBody(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_rigid_body_mut(&mut self) -> Option<&mut RigidBodyVariable> {
        match &mut self.kind {
            VariableKind::RigidBody(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<&PointVariable> {
        match &self.kind {
            VariableKind::Point(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_point_force(&self) -> Option<&PointForceVariable> {
        match &self.kind {
            VariableKind::PointForce(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarVariable> {
        match &self.kind {
            VariableKind::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_from_kind {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Variable {
            fn from(v: $ty) -> Self {
                Variable {
                    kind: VariableKind::$variant(v),
                    col: None,
                    scale: 1.0,
                }
            }
        }
    };
}

impl_from_kind!(RigidBodyVariable, RigidBody);
impl_from_kind!(PointVariable, Point);
impl_from_kind!(PointForceVariable, PointForce);
impl_from_kind!(ScalarVariable, Scalar);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rigid_body_apply_dq_renormalizes() {
        let mut body = RigidBodyVariable::free(Uuid::new_v4(), "b", DVec3::ZERO, DQuat::IDENTITY);
        body.apply_dq(&[1.0, 0.0, -2.0, 0.1, 0.0, 0.0, -0.2]);
        assert_eq!(body.position, DVec3::new(-1.0, 0.0, 2.0));
        assert_relative_eq!(body.quaternion.length(), 1.0, epsilon = 1e-12);
        assert!(body.quaternion.z > 0.0);
        assert_eq!(body.degree_of_freedom(), 7);
    }

    #[test]
    fn test_excluded_bodies_have_no_dof() {
        let fixed = RigidBodyVariable::fixed(Uuid::new_v4(), "g", DVec3::ZERO, DQuat::IDENTITY);
        assert_eq!(fixed.degree_of_freedom(), 0);
        let mut attached = RigidBodyVariable::free(Uuid::new_v4(), "a", DVec3::ZERO, DQuat::IDENTITY);
        attached.mode = BodyMode::Attached {
            parent: VarId(0),
            position: DVec3::X,
            rotation: DQuat::IDENTITY,
        };
        assert_eq!(attached.degree_of_freedom(), 0);
    }

    #[test]
    fn test_attached_pose() {
        let parent = (DVec3::new(0.0, 0.0, 1.0), DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2));
        let (position, rotation) = RigidBodyVariable::attached_pose(parent, DVec3::X, DQuat::IDENTITY);
        assert_relative_eq!(position.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(position.z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(rotation.z, parent.1.z, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_applies_to_step() {
        let mut variable = Variable::from(ScalarVariable::new("omega", 1.0)).with_scale(0.5);
        variable.apply_dq(&[2.0]);
        assert_relative_eq!(variable.component(0), 0.0);
        variable.reset_to_applied();
        assert_relative_eq!(variable.component(0), 1.0);
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let mut variable = Variable::from(PointVariable::new(Uuid::new_v4(), "p", DVec3::ONE));
        let state = VariableState::Scalar { value: 1.0 };
        assert!(matches!(
            variable.restore_state(&state),
            Err(SolverError::SnapshotMismatch(_))
        ));
    }

    #[test]
    fn test_force_sign() {
        let lhs = Uuid::new_v4();
        let force = PointForceVariable::new(None, lhs, "contact");
        assert_eq!(force.sign_for(lhs), 1.0);
        assert_eq!(force.sign_for(Uuid::new_v4()), -1.0);
    }
}
