//! Optimizers which update parameters in place from their accumulated gradients

use crate::values::Value;

/// Same contract as `torch.optim.Optimizer`: `step` applies the gradients accumulated
/// since the last `zero_grad`
pub trait Optim {
    fn step(&mut self);
    fn zero_grad(&mut self);
}

fn zero_grads(params: &mut [Value]) {
    for param in params {
        param.zero_grad();
    }
}

/// Stochastic gradient descent with (optional) momentum and a constant learning rate
///
/// `v <- momentum * v - lr * grad`, then `p <- p + v`
pub struct SGD {
    params: Vec<Value>,
    lr: f32,
    momentum: f32,
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        Self {
            velocity: vec![0.0; params.len()],
            params,
            lr,
            momentum,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, v) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            *v = self.momentum * *v - self.lr * param.grad();
            let updated = param.data() + *v;
            param.set_data(updated);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}

/// Adam with bias correction
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    // running products beta1^t and beta2^t
    beta1_t: f32,
    beta2_t: f32,
    // first and second moment estimates per parameter
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        Self::with_betas(params, lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(params: Vec<Value>, lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let bc1 = 1.0 - self.beta1_t;
        let bc2 = 1.0 - self.beta2_t;

        for ((param, m), v) in self
            .params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let g = param.grad();
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            let new_val = param.data() - lr * m_hat / (v_hat.sqrt() + eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}
