//! Loss functions and the shared forward / metric / loss evaluation step.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{encoding::one_hot, loss, Module};

use gtn_common::{LossKind, Result};

use crate::metric::Metric;

/// `(prediction, label) -> scalar loss`.
pub type LossFn = Arc<dyn Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor> + Send + Sync>;

/// Build the configured loss. Labels are class indices in both cases.
pub fn loss_fn(kind: LossKind, num_classes: usize) -> LossFn {
    match kind {
        LossKind::CrossEntropy => Arc::new(|pred: &Tensor, target: &Tensor| {
            loss::cross_entropy(pred, &target.to_dtype(DType::U32)?)
        }),
        LossKind::Mse => Arc::new(move |pred: &Tensor, target: &Tensor| {
            let target = one_hot(target.to_dtype(DType::U32)?, num_classes, 1f32, 0f32)?
                .to_dtype(pred.dtype())?;
            loss::mse(pred, &target)
        }),
    }
}

/// Move the batch to `device`, run `model`, feed the metric, and return the
/// loss. Errors from the model or loss propagate unchanged.
pub fn train_on_batch<M: Module + ?Sized>(
    data: &Tensor,
    labels: &Tensor,
    model: &M,
    metric: &mut dyn Metric,
    loss: &LossFn,
    device: &Device,
) -> Result<Tensor> {
    let data = data.to_device(device)?;
    let labels = labels.to_device(device)?;
    let output = model.forward(&data)?;
    metric.update(&output, &labels)?;
    Ok(loss(&output, &labels)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::Mlp;
    use crate::metric::Accuracy;

    #[test]
    fn cross_entropy_of_uniform_logits() {
        let dev = Device::Cpu;
        let f = loss_fn(LossKind::CrossEntropy, 4);
        let pred = Tensor::zeros((3, 4), DType::F32, &dev).unwrap();
        let target = Tensor::new(&[0u32, 1, 3], &dev).unwrap();
        let l = f(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((l - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn mse_against_one_hot() {
        let dev = Device::Cpu;
        let f = loss_fn(LossKind::Mse, 2);
        let pred = Tensor::new(&[[1f32, 0.], [0., 1.]], &dev).unwrap();
        let target = Tensor::new(&[0u32, 0], &dev).unwrap();
        // second row is off by 1 in both entries → 2 / 4
        let l = f(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((l - 0.5).abs() < 1e-6);
    }

    #[test]
    fn train_on_batch_updates_metric() {
        let dev = Device::Cpu;
        let model = Mlp::new(&[3, 2], &dev).unwrap();
        let mut acc = Accuracy::new();
        let f = loss_fn(LossKind::CrossEntropy, 2);
        let x = Tensor::randn(0f32, 1f32, (5, 3), &dev).unwrap();
        let y = Tensor::new(&[0u32, 1, 0, 1, 0], &dev).unwrap();
        let l = train_on_batch(&x, &y, &model, &mut acc, &f, &dev).unwrap();
        assert_eq!(l.rank(), 0);
        assert_eq!(acc.total(), 5);
    }
}
