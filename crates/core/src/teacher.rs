//! Teacher networks: generators mapping `(noise, one-hot label)` to
//! synthetic learner inputs. Their weights are trained by the outer loop.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use gtn_common::{GtnError, Result};

pub trait TeacherNetwork: Send {
    /// Generate one inner batch. `noise` is `(batch, *noise_dims)`,
    /// `one_hot` is `(batch, num_classes)`.
    fn generate(&self, noise: &Tensor, one_hot: &Tensor) -> candle_core::Result<Tensor>;

    /// Weights the outer optimiser updates.
    fn vars(&self) -> Vec<Var>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Dense generator: `[flatten(noise) ‖ one_hot]` → (linear → tanh)* → linear,
/// reshaped to `(batch, *output_shape)`.
pub struct MlpTeacher {
    varmap: VarMap,
    layers: Vec<Linear>,
    output_shape: Vec<usize>,
}

impl MlpTeacher {
    pub fn new(
        noise_dim: usize,
        num_classes: usize,
        hidden: &[usize],
        output_shape: &[usize],
        device: &Device,
    ) -> Result<Self> {
        if output_shape.is_empty() {
            return Err(GtnError::config("teacher output shape is empty"));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut dims = vec![noise_dim + num_classes];
        dims.extend_from_slice(hidden);
        dims.push(output_shape.iter().product());

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| linear(w[0], w[1], vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            varmap,
            layers,
            output_shape: output_shape.to_vec(),
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl TeacherNetwork for MlpTeacher {
    fn generate(&self, noise: &Tensor, one_hot: &Tensor) -> candle_core::Result<Tensor> {
        let batch = noise.dim(0)?;
        let cond = one_hot.to_dtype(noise.dtype())?;
        let mut x = Tensor::cat(&[&noise.flatten_from(1)?, &cond], 1)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i < last {
                x = x.tanh()?;
            }
        }
        let mut shape = vec![batch];
        shape.extend_from_slice(&self.output_shape);
        x.reshape(shape)
    }

    fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
