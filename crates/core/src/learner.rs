//! Learner contract and the reference dense learner.
//!
//! A learner keeps its parameters as plain (untracked) tensors. Gradient
//! flow happens only through [`Learner::forward_with`], which evaluates the
//! same architecture on an externally supplied parameter list; the inner
//! loop uses it to run the learner on its functional parameters.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use candle_nn::Module;

use gtn_common::{GtnError, Result};

/// A parameterised function approximator trained by the inner loop.
///
/// `Module::forward` must equal `forward_with(&self.parameters(), xs)`.
pub trait Learner: Module + Send {
    /// Trainable tensors, in a fixed order.
    fn parameters(&self) -> Vec<Tensor>;

    /// Names matching [`parameters`](Self::parameters), used for state dicts.
    fn parameter_names(&self) -> Vec<String>;

    /// Replace every parameter. Lengths and shapes must match.
    fn set_parameters(&mut self, params: &[Tensor]) -> Result<()>;

    /// Forward pass with `params` substituted for the stored parameters.
    fn forward_with(&self, params: &[Tensor], xs: &Tensor) -> candle_core::Result<Tensor>;

    /// Fresh, independent copy (the prototype is never mutated).
    fn boxed_clone(&self) -> Box<dyn Learner>;

    fn state(&self) -> HashMap<String, Tensor> {
        self.parameter_names()
            .into_iter()
            .zip(self.parameters())
            .collect()
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let params = self
            .parameter_names()
            .iter()
            .map(|name| {
                state
                    .get(name)
                    .cloned()
                    .ok_or_else(|| GtnError::config(format!("state is missing `{name}`")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.set_parameters(&params)
    }
}

/// Shape-checked, detached replacement of a parameter list.
pub fn replace_parameters(current: &mut [Tensor], new: &[Tensor]) -> Result<()> {
    if current.len() != new.len() {
        return Err(GtnError::config(format!(
            "expected {} parameters, got {}",
            current.len(),
            new.len()
        )));
    }
    for (cur, n) in current.iter().zip(new) {
        if cur.dims() != n.dims() {
            return Err(candle_core::Error::ShapeMismatchBinaryOp {
                lhs: cur.shape().clone(),
                rhs: n.shape().clone(),
                op: "set_parameters",
            }
            .into());
        }
    }
    for (cur, n) in current.iter_mut().zip(new) {
        *cur = n.detach();
    }
    Ok(())
}

// ── FunctionalLearner ───────────────────────────────────────────────────────

/// A learner evaluated on a separate parameter list (the functional clone).
pub struct FunctionalLearner<'a> {
    learner: &'a dyn Learner,
    params: &'a [Tensor],
}

impl<'a> FunctionalLearner<'a> {
    pub fn new(learner: &'a dyn Learner, params: &'a [Tensor]) -> Self {
        Self { learner, params }
    }

    pub fn parameters(&self) -> &[Tensor] {
        self.params
    }
}

impl Module for FunctionalLearner<'_> {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.learner.forward_with(self.params, xs)
    }
}

// ── Mlp ─────────────────────────────────────────────────────────────────────

/// Fully connected learner: flatten → (linear → tanh)* → linear.
///
/// `tanh` is twice differentiable everywhere, which keeps the
/// second-order outer gradient well defined.
#[derive(Clone)]
pub struct Mlp {
    dims: Vec<usize>,
    params: Vec<Tensor>,
}

impl Mlp {
    /// `dims` = `[input, hidden.., output]`. Layers use torch's default
    /// `U(-1/√fan_in, 1/√fan_in)` initialisation.
    pub fn new(dims: &[usize], device: &Device) -> Result<Self> {
        if dims.len() < 2 {
            return Err(GtnError::config("an MLP needs at least input and output sizes"));
        }
        let mut params = Vec::with_capacity(2 * (dims.len() - 1));
        for w in dims.windows(2) {
            let (fan_in, fan_out) = (w[0], w[1]);
            let bound = 1.0 / (fan_in as f32).sqrt();
            params.push(Tensor::rand(-bound, bound, (fan_out, fan_in), device)?);
            params.push(Tensor::rand(-bound, bound, fan_out, device)?);
        }
        Ok(Self {
            dims: dims.to_vec(),
            params,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_layers(&self) -> usize {
        self.dims.len() - 1
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_with(&self.params, xs)
    }
}

impl Learner for Mlp {
    fn parameters(&self) -> Vec<Tensor> {
        self.params.clone()
    }

    fn parameter_names(&self) -> Vec<String> {
        (0..self.num_layers())
            .flat_map(|i| [format!("layers.{i}.weight"), format!("layers.{i}.bias")])
            .collect()
    }

    fn set_parameters(&mut self, params: &[Tensor]) -> Result<()> {
        replace_parameters(&mut self.params, params)
    }

    fn forward_with(&self, params: &[Tensor], xs: &Tensor) -> candle_core::Result<Tensor> {
        let layers = self.num_layers();
        if params.len() != 2 * layers {
            candle_core::bail!("Mlp expects {} parameters, got {}", 2 * layers, params.len());
        }
        let mut x = xs.flatten_from(1)?;
        for (i, pair) in params.chunks(2).enumerate() {
            x = x.matmul(&pair[0].t()?)?.broadcast_add(&pair[1])?;
            if i + 1 < layers {
                x = x.tanh()?;
            }
        }
        Ok(x)
    }

    fn boxed_clone(&self) -> Box<dyn Learner> {
        Box::new(self.clone())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
