//! Tire lateral friction models
//!
//! Sign convention: the slip angle is positive when the contact patch moves
//! to the left of the wheel heading; the returned force is along the wheel's
//! left direction, so a positive slip angle yields a negative force.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::autodiff::ScalarFunction;

/// Lateral force as a function of slip angle (rad), inclination angle (rad)
/// and vertical load (N)
pub trait TireFriction {
    /// Force value and its partials with respect to the three arguments
    fn lateral_force(
        &self,
        slip_angle: f64,
        inclination_angle: f64,
        vertical_load: f64,
    ) -> (f64, [f64; 3]);
}

/// `Fy = -fz (cα α + cγ γ)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearTire {
    /// Normalized cornering stiffness (1/rad)
    pub cornering: f64,
    /// Normalized camber stiffness (1/rad)
    pub camber: f64,
}

impl Default for LinearTire {
    fn default() -> Self {
        Self {
            cornering: 20.0,
            camber: 1.0,
        }
    }
}

impl TireFriction for LinearTire {
    fn lateral_force(&self, slip_angle: f64, inclination_angle: f64, vertical_load: f64) -> (f64, [f64; 3]) {
        let coefficient = self.cornering * slip_angle + self.camber * inclination_angle;
        (
            -vertical_load * coefficient,
            [
                -vertical_load * self.cornering,
                -vertical_load * self.camber,
                -coefficient,
            ],
        )
    }
}

/// `Fy = -fz (μ sin(C atan(B α)) + cγ γ)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedMagicFormula {
    pub stiffness: f64,
    pub shape: f64,
    pub peak: f64,
    pub camber: f64,
}

impl Default for SimplifiedMagicFormula {
    fn default() -> Self {
        Self {
            stiffness: 10.0,
            shape: 1.9,
            peak: 1.5,
            camber: 1.0,
        }
    }
}

impl TireFriction for SimplifiedMagicFormula {
    fn lateral_force(&self, slip_angle: f64, inclination_angle: f64, vertical_load: f64) -> (f64, [f64; 3]) {
        let ba = self.stiffness * slip_angle;
        let inner = self.shape * ba.atan();
        let coefficient = self.peak * inner.sin() + self.camber * inclination_angle;
        let d_alpha = self.peak * inner.cos() * self.shape * self.stiffness / (1.0 + ba * ba);
        (
            -vertical_load * coefficient,
            [
                -vertical_load * d_alpha,
                -vertical_load * self.camber,
                -coefficient,
            ],
        )
    }
}

/// Serializable model selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TireModel {
    Linear(LinearTire),
    MagicFormula(SimplifiedMagicFormula),
}

impl Default for TireModel {
    fn default() -> Self {
        TireModel::Linear(LinearTire::default())
    }
}

impl TireModel {
    pub fn friction(&self) -> Rc<dyn TireFriction> {
        match *self {
            TireModel::Linear(model) => Rc::new(model),
            TireModel::MagicFormula(model) => Rc::new(model),
        }
    }
}

/// Adapter exposing a friction model as a computation graph function of
/// `(slip angle, inclination angle, vertical load)`
pub(crate) struct FrictionFunction(pub Rc<dyn TireFriction>);

impl ScalarFunction for FrictionFunction {
    fn evaluate(&self, args: &[f64]) -> (f64, Vec<f64>) {
        let (value, partials) = self.0.lateral_force(args[0], args[1], args[2]);
        (value, partials.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn check_partials(model: &dyn TireFriction, args: [f64; 3]) {
        let (_, partials) = model.lateral_force(args[0], args[1], args[2]);
        let h = 1e-6;
        for i in 0..3 {
            let mut plus = args;
            plus[i] += h;
            let mut minus = args;
            minus[i] -= h;
            let numeric = (model.lateral_force(plus[0], plus[1], plus[2]).0
                - model.lateral_force(minus[0], minus[1], minus[2]).0)
                / (2.0 * h);
            assert_relative_eq!(partials[i], numeric, epsilon = 1e-4, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_force_opposes_slip() {
        let (force, _) = LinearTire::default().lateral_force(0.05, 0.0, 1000.0);
        assert!(force < 0.0);
        let (force, _) = SimplifiedMagicFormula::default().lateral_force(-0.05, 0.0, 1000.0);
        assert!(force > 0.0);
    }

    #[test]
    fn test_zero_at_zero_slip() {
        let (force, _) = SimplifiedMagicFormula::default().lateral_force(0.0, 0.0, 800.0);
        assert_relative_eq!(force, 0.0);
    }

    #[test]
    fn test_partials() {
        check_partials(&LinearTire::default(), [0.03, 0.01, 900.0]);
        check_partials(&SimplifiedMagicFormula::default(), [0.08, -0.02, 1200.0]);
    }

    #[test]
    fn test_model_serde() {
        let model = TireModel::MagicFormula(SimplifiedMagicFormula::default());
        let text = ron::to_string(&model).unwrap();
        let back: TireModel = ron::from_str(&text).unwrap();
        assert_eq!(back, model);
    }
}
