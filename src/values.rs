//! Scalar values which form a computation graph
//!
//! Every operation on a [`Value`] creates a new node holding shared handles to its
//! operands, so calling [`Value::backward`] on a result reaches all of its inputs.

use std::{
    cell::RefCell,
    collections::HashSet,
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::backprop_fns::BackpropFunc;

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc, children: Vec<SharedValue>) -> Self {
        let mut inner = InnerValue::new(data, Some(backprop_fn));
        inner.children = children;
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    /// Whether the value was created directly rather than by an operation
    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    /// Overwrites the data, used by optimizers and when loading a checkpoint.
    /// The storage is shared, `&mut` only marks the call site as a write.
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Clears the gradient of this node and of every node it was computed from
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    /// Backpropagates from this node. Leaf gradients are added to whatever the leaves
    /// already hold, so repeated calls accumulate until `zero_grad`. Gradients of derived
    /// nodes only describe the latest pass.
    pub fn backward(&self) {
        let order = self.topological_order();
        for value in &order {
            let mut inner = value.0.borrow_mut();
            if inner.backprop_fn.is_some() {
                inner.grad = 0.0;
            }
        }
        self.0.borrow_mut().grad = 1.0;

        // walk from the root down so every node has its full gradient before it is propagated
        for value in order.into_iter().rev() {
            let (backprop_fn, inputs) = {
                let inner = value.0.borrow();
                let inputs = inner
                    .children
                    .iter()
                    .map(|c| Value(c.clone()))
                    .collect::<Vec<_>>();
                (inner.backprop_fn, inputs)
            };
            if let Some(f) = backprop_fn {
                f.propagate(&inputs, &value);
            }
        }
    }

    /// Post order traversal of the graph below this node, the node itself last
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        visited.insert(self.0.borrow().id);
        self.visit(&mut order, &mut visited);
        order
    }

    fn visit(&self, order: &mut Vec<Value>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if !visited.insert(c.borrow().id) {
                continue;
            }
            Value(c.clone()).visit(order, visited);
        }
        order.push(self.clone());
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, other: &Value) -> Value {
        let data = self.data().powf(other.data());
        Value::new_derived(
            data,
            BackpropFunc::Pow,
            vec![self.0.clone(), other.0.clone()],
        )
    }

    pub fn relu(&self) -> Value {
        Value::new_derived(self.data().max(0.0), BackpropFunc::ReLU, vec![self.0.clone()])
    }

    pub fn exp(&self) -> Value {
        Value::new_derived(self.data().exp(), BackpropFunc::Exp, vec![self.0.clone()])
    }

    /// Natural logarithm
    pub fn ln(&self) -> Value {
        Value::new_derived(self.data().ln(), BackpropFunc::Ln, vec![self.0.clone()])
    }

    /// Inner product of two equally sized slices as a single graph node.
    ///
    /// An affine neuron over a 784 wide input would otherwise create ~1600 nodes
    /// chained through `Add`, which makes both memory use and the recursion depth
    /// of backprop grow with the input width.
    ///
    /// # Panics
    /// If `lhs` and `rhs` differ in length.
    pub fn dot(lhs: &[Value], rhs: &[Value]) -> Value {
        assert_eq!(lhs.len(), rhs.len(), "dot product of slices with different lengths");
        let data = lhs
            .iter()
            .zip(rhs.iter())
            .map(|(a, b)| a.data() * b.data())
            .sum::<f32>();
        let children = lhs.iter().chain(rhs.iter()).map(|v| v.0.clone()).collect();
        Value::new_derived(data, BackpropFunc::Dot, children)
    }

    /// Sum of any number of values as a single graph node
    pub fn sum_all(values: &[Value]) -> Value {
        let data = values.iter().map(|v| v.data()).sum::<f32>();
        let children = values.iter().map(|v| v.0.clone()).collect();
        Value::new_derived(data, BackpropFunc::Sum, children)
    }
}

/// Implements a binary operator on `&Value` recording `$func` as the node's backprop rule,
/// and on `Value` by borrowing both operands
macro_rules! impl_binary_op(
    ($trait:ident, $method:ident, $func:expr, $eval:expr) => {
        impl $trait for &Value {
            type Output = Value;

            fn $method(self, rhs: &Value) -> Value {
                let eval: fn(f32, f32) -> f32 = $eval;
                let data = eval(self.data(), rhs.data());
                Value::new_derived(data, $func, vec![self.0.clone(), rhs.0.clone()])
            }
        }

        impl $trait for Value {
            type Output = Value;

            fn $method(self, rhs: Value) -> Value {
                (&self).$method(&rhs)
            }
        }
    }
);
impl_binary_op!(Add, add, BackpropFunc::Add, |a, b| a + b);
impl_binary_op!(Sub, sub, BackpropFunc::Sub, |a, b| a - b);
impl_binary_op!(Mul, mul, BackpropFunc::Mul, |a, b| a * b);
impl_binary_op!(Div, div, BackpropFunc::Div, |a, b| a / b);

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::new_derived(-self.data(), BackpropFunc::Neg, vec![self.0.clone()])
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Value::sum_all(&iter.collect::<Vec<_>>())
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    pub(crate) data: f32,
    /// d root / d self, summed over every backward pass since the last `zero_grad`
    pub(crate) grad: f32,
    /// Operands of the operation which produced this value
    children: Vec<SharedValue>,
    id: u64,
    /// `None` for leaves
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            id: next_id(),
            backprop_fn,
        }
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
