//! Curriculum visualisation hook, called every `plot_steps`-th learner.

use candle_core::{DType, Tensor};

use gtn_common::Result;

pub trait Visualizer: Send {
    fn show(&self, data: &Tensor) -> Result<()>;
}

/// Logs the shape and value range of the latest curriculum batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryVisualizer;

impl Visualizer for SummaryVisualizer {
    fn show(&self, data: &Tensor) -> Result<()> {
        let flat = data.detach().flatten_all()?.to_dtype(DType::F64)?;
        let min = flat.min(0)?.to_scalar::<f64>()?;
        let max = flat.max(0)?.to_scalar::<f64>()?;
        let mean = flat.mean_all()?.to_scalar::<f64>()?;
        tracing::info!(
            shape = ?data.dims(),
            min = format!("{min:.4}"),
            mean = format!("{mean:.4}"),
            max = format!("{max:.4}"),
            "curriculum sample"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn summary_accepts_any_rank() {
        let v = SummaryVisualizer;
        let t = Tensor::randn(0f32, 1f32, (2, 3, 4), &Device::Cpu).unwrap();
        v.show(&t).unwrap();
        v.show(&Tensor::new(1f32, &Device::Cpu).unwrap()).unwrap();
    }
}
