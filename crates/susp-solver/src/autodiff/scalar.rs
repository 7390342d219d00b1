//! Scalar expression nodes

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use nalgebra::DMatrix;

use super::{EvalContext, Gradients, Leaf, Parameter, Vector, collect_leaf, row};
use crate::variable::VarId;

/// Differentiable function of several scalar arguments
pub trait ScalarFunction {
    /// Value and partial derivative per argument
    fn evaluate(&self, args: &[f64]) -> (f64, Vec<f64>);
}

enum ScalarOp {
    Constant(f64),
    Parameter(Parameter),
    Variable(Leaf),
    Add(Scalar, Scalar),
    Sub(Scalar, Scalar),
    Mul(Scalar, Scalar),
    Neg(Scalar),
    Dot(Vector, Vector),
    Component(Vector, usize),
    Length(Vector),
    Atan2(Scalar, Scalar),
    Function {
        function: Rc<dyn ScalarFunction>,
        args: Vec<Scalar>,
        partials: RefCell<Vec<f64>>,
    },
}

struct ScalarNode {
    op: ScalarOp,
    cache: Cell<(u64, f64)>,
}

/// Shared handle to a scalar expression
#[derive(Clone)]
pub struct Scalar(Rc<ScalarNode>);

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scalar({})", self.value())
    }
}

impl Scalar {
    fn from_op(op: ScalarOp) -> Self {
        Self(Rc::new(ScalarNode {
            op,
            cache: Cell::new((0, 0.0)),
        }))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_op(ScalarOp::Constant(value))
    }

    pub fn parameter(parameter: &Parameter) -> Self {
        Self::from_op(ScalarOp::Parameter(parameter.clone()))
    }

    pub fn variable(leaf: Leaf) -> Self {
        Self::from_op(ScalarOp::Variable(leaf))
    }

    pub fn add(&self, rhs: &Scalar) -> Self {
        Self::from_op(ScalarOp::Add(self.clone(), rhs.clone()))
    }

    pub fn sub(&self, rhs: &Scalar) -> Self {
        Self::from_op(ScalarOp::Sub(self.clone(), rhs.clone()))
    }

    pub fn mul(&self, rhs: &Scalar) -> Self {
        Self::from_op(ScalarOp::Mul(self.clone(), rhs.clone()))
    }

    pub fn scale(&self, factor: f64) -> Self {
        self.mul(&Scalar::constant(factor))
    }

    pub fn neg(&self) -> Self {
        Self::from_op(ScalarOp::Neg(self.clone()))
    }

    pub fn dot(a: &Vector, b: &Vector) -> Self {
        Self::from_op(ScalarOp::Dot(a.clone(), b.clone()))
    }

    /// Component 0, 1 or 2 of a vector
    pub fn component(v: &Vector, index: usize) -> Self {
        Self::from_op(ScalarOp::Component(v.clone(), index))
    }

    pub fn length(v: &Vector) -> Self {
        Self::from_op(ScalarOp::Length(v.clone()))
    }

    /// `atan2(y, x)`
    pub fn atan2(y: &Scalar, x: &Scalar) -> Self {
        Self::from_op(ScalarOp::Atan2(y.clone(), x.clone()))
    }

    /// Apply an externally supplied differentiable function
    pub fn function(function: Rc<dyn ScalarFunction>, args: Vec<Scalar>) -> Self {
        let partials = RefCell::new(vec![0.0; args.len()]);
        Self::from_op(ScalarOp::Function {
            function,
            args,
            partials,
        })
    }

    /// Recompute the cached value unless already done in this pass
    pub fn reset(&self, ctx: &EvalContext) {
        if self.0.cache.get().0 == ctx.epoch() {
            return;
        }
        let value = match &self.0.op {
            ScalarOp::Constant(v) => *v,
            ScalarOp::Parameter(p) => p.get(),
            ScalarOp::Variable(leaf) => ctx.component(leaf.var, leaf.offset),
            ScalarOp::Add(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value() + b.value()
            }
            ScalarOp::Sub(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value() - b.value()
            }
            ScalarOp::Mul(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value() * b.value()
            }
            ScalarOp::Neg(a) => {
                a.reset(ctx);
                -a.value()
            }
            ScalarOp::Dot(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value().dot(b.value())
            }
            ScalarOp::Component(v, i) => {
                v.reset(ctx);
                v.value()[*i]
            }
            ScalarOp::Length(v) => {
                v.reset(ctx);
                v.value().length()
            }
            ScalarOp::Atan2(y, x) => {
                y.reset(ctx);
                x.reset(ctx);
                y.value().atan2(x.value())
            }
            ScalarOp::Function {
                function,
                args,
                partials,
            } => {
                let values: Vec<f64> = args
                    .iter()
                    .map(|a| {
                        a.reset(ctx);
                        a.value()
                    })
                    .collect();
                let (value, grads) = function.evaluate(&values);
                *partials.borrow_mut() = grads;
                value
            }
        };
        self.0.cache.set((ctx.epoch(), value));
    }

    /// Value cached by the last `reset`
    pub fn value(&self) -> f64 {
        self.0.cache.get().1
    }

    /// Propagate an `m × 1` upstream block to the leaves
    pub fn diff(&self, upstream: &DMatrix<f64>, grads: &mut Gradients) {
        match &self.0.op {
            ScalarOp::Constant(_) | ScalarOp::Parameter(_) => {}
            ScalarOp::Variable(leaf) => grads.accumulate(*leaf, upstream),
            ScalarOp::Add(a, b) => {
                a.diff(upstream, grads);
                b.diff(upstream, grads);
            }
            ScalarOp::Sub(a, b) => {
                a.diff(upstream, grads);
                b.diff(&-upstream, grads);
            }
            ScalarOp::Mul(a, b) => {
                a.diff(&(upstream * b.value()), grads);
                b.diff(&(upstream * a.value()), grads);
            }
            ScalarOp::Neg(a) => a.diff(&-upstream, grads),
            ScalarOp::Dot(a, b) => {
                a.diff(&(upstream * row(b.value())), grads);
                b.diff(&(upstream * row(a.value())), grads);
            }
            ScalarOp::Component(v, i) => {
                let mut unit = DMatrix::zeros(1, 3);
                unit[(0, *i)] = 1.0;
                v.diff(&(upstream * unit), grads);
            }
            ScalarOp::Length(v) => {
                let value = v.value();
                let length = value.length();
                if length > 0.0 {
                    v.diff(&(upstream * row(value / length)), grads);
                }
            }
            ScalarOp::Atan2(y, x) => {
                let (yv, xv) = (y.value(), x.value());
                let denom = xv * xv + yv * yv;
                if denom > 0.0 {
                    y.diff(&(upstream * (xv / denom)), grads);
                    x.diff(&(upstream * (-yv / denom)), grads);
                }
            }
            ScalarOp::Function { args, partials, .. } => {
                let partials = partials.borrow();
                for (arg, partial) in args.iter().zip(partials.iter()) {
                    if *partial != 0.0 {
                        arg.diff(&(upstream * *partial), grads);
                    }
                }
            }
        }
    }

    /// Variables this expression depends on
    pub fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match &self.0.op {
            ScalarOp::Constant(_) | ScalarOp::Parameter(_) => {}
            ScalarOp::Variable(leaf) => collect_leaf(leaf, out),
            ScalarOp::Add(a, b) | ScalarOp::Sub(a, b) | ScalarOp::Mul(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            ScalarOp::Atan2(y, x) => {
                y.collect_variables(out);
                x.collect_variables(out);
            }
            ScalarOp::Neg(a) => a.collect_variables(out),
            ScalarOp::Dot(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            ScalarOp::Component(v, _) | ScalarOp::Length(v) => v.collect_variables(out),
            ScalarOp::Function { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }

    /// Evaluate and differentiate in one call: returns the value and the
    /// `1 × dof` gradient blocks
    pub fn gradient(&self, ctx: &EvalContext) -> (f64, Gradients) {
        self.reset(ctx);
        let mut grads = Gradients::new(1);
        self.diff(&DMatrix::from_element(1, 1, 1.0), &mut grads);
        (self.value(), grads)
    }
}
