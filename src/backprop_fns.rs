//! Local gradient rules of the graph operations
//!
//! Every rule adds `d out / d input * out.grad` to the gradient of each input. Operand
//! data is read before any gradient is written, so an operation may use the same value
//! for several of its operands (e.g. `x * x`).

use crate::values::Value;

/// The operation which produced a non-leaf value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    /// Power with a constant exponent, the exponent receives no gradient
    Pow,
    ReLU,
    Exp,
    Ln,
    /// Inner product, operands are all left hand side values followed by all right hand side values
    Dot,
    Sum,
}

impl BackpropFunc {
    /// Number of operands for fixed arity functions, `None` for variadic ones
    pub fn arity(&self) -> Option<usize> {
        match self {
            BackpropFunc::Neg | BackpropFunc::ReLU | BackpropFunc::Exp | BackpropFunc::Ln => Some(1),
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => Some(2),
            BackpropFunc::Dot | BackpropFunc::Sum => None,
        }
    }

    /// Propagates the gradient of `out` to `inputs`, the operands `out` was created from
    pub fn propagate(&self, inputs: &[Value], out: &Value) {
        debug_assert!(self.arity().is_none_or(|n| n == inputs.len()));
        let grad = out.grad();
        match (self, inputs) {
            (BackpropFunc::Add, [a, b]) => {
                accumulate(a, grad);
                accumulate(b, grad);
            }
            (BackpropFunc::Sub, [a, b]) => {
                accumulate(a, grad);
                accumulate(b, -grad);
            }
            (BackpropFunc::Mul, [a, b]) => {
                let (x, y) = (a.data(), b.data());
                accumulate(a, y * grad);
                accumulate(b, x * grad);
            }
            (BackpropFunc::Div, [a, b]) => {
                let (x, y) = (a.data(), b.data());
                accumulate(a, grad / y);
                accumulate(b, -x * grad / (y * y));
            }
            (BackpropFunc::Pow, [a, b]) => {
                let (x, y) = (a.data(), b.data());
                accumulate(a, y * x.powf(y - 1.0) * grad);
            }
            (BackpropFunc::Neg, [a]) => accumulate(a, -grad),
            (BackpropFunc::ReLU, [a]) => {
                if a.data() > 0.0 {
                    accumulate(a, grad);
                }
            }
            // d exp(x) / dx = exp(x), which is the output itself
            (BackpropFunc::Exp, [a]) => accumulate(a, out.data() * grad),
            (BackpropFunc::Ln, [a]) => {
                let x = a.data();
                accumulate(a, grad / x);
            }
            (BackpropFunc::Dot, inputs) => {
                let (lhs, rhs) = inputs.split_at(inputs.len() / 2);
                for (a, b) in lhs.iter().zip(rhs.iter()) {
                    let (x, y) = (a.data(), b.data());
                    accumulate(a, y * grad);
                    accumulate(b, x * grad);
                }
            }
            (BackpropFunc::Sum, inputs) => {
                for input in inputs {
                    accumulate(input, grad);
                }
            }
            (f, inputs) => panic!("{f:?} cannot be applied to {} operands", inputs.len()),
        }
    }
}

fn accumulate(value: &Value, delta: f32) {
    value.0.borrow_mut().grad += delta;
}
