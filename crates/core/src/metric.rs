//! Metric accumulators with an update / compute / reset contract.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};

use gtn_common::Result;

pub trait Metric: Send {
    /// Accumulate one batch of predictions against its labels.
    fn update(&mut self, prediction: &Tensor, target: &Tensor) -> Result<()>;

    /// Current values keyed by metric name.
    fn compute(&self) -> BTreeMap<String, f64>;

    /// Forget everything accumulated since construction or the last reset.
    fn reset(&mut self);

    /// Independent accumulator of the same kind, starting empty.
    fn boxed_clone(&self) -> Box<dyn Metric>;
}

// ── Accuracy ────────────────────────────────────────────────────────────────

/// Fraction of samples whose argmax prediction equals the label.
///
/// Labels may be class indices `(batch,)` or one-hot `(batch, classes)`.
/// With no samples seen, reports `0.0`.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: u64,
    total: u64,
}

impl Accuracy {
    pub const NAME: &'static str = "Accuracy";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Metric for Accuracy {
    fn update(&mut self, prediction: &Tensor, target: &Tensor) -> Result<()> {
        let predicted = prediction.detach().argmax(D::Minus1)?;
        let target = target.detach();
        let target = if target.rank() == prediction.rank() && target.rank() > 1 {
            target.argmax(D::Minus1)?
        } else {
            target.to_dtype(DType::U32)?
        };
        let hits = predicted
            .eq(&target)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        self.correct += hits as u64;
        self.total += target.elem_count() as u64;
        Ok(())
    }

    fn compute(&self) -> BTreeMap<String, f64> {
        let value = if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        };
        BTreeMap::from([(Self::NAME.to_string(), value)])
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn boxed_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new())
    }
}

// ── MetricCollection ────────────────────────────────────────────────────────

/// Several metrics updated together; `compute` merges their maps.
#[derive(Default)]
pub struct MetricCollection {
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricCollection {
    pub fn new(metrics: Vec<Box<dyn Metric>>) -> Self {
        Self { metrics }
    }

    pub fn with(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl Metric for MetricCollection {
    fn update(&mut self, prediction: &Tensor, target: &Tensor) -> Result<()> {
        for m in &mut self.metrics {
            m.update(prediction, target)?;
        }
        Ok(())
    }

    fn compute(&self) -> BTreeMap<String, f64> {
        self.metrics.iter().flat_map(|m| m.compute()).collect()
    }

    fn reset(&mut self) {
        for m in &mut self.metrics {
            m.reset();
        }
    }

    fn boxed_clone(&self) -> Box<dyn Metric> {
        Box::new(Self::new(
            self.metrics.iter().map(|m| m.boxed_clone()).collect(),
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(dev: &Device) -> Tensor {
        Tensor::new(&[[2f32, 1., 0.], [0., 3., 1.], [0., 0., 5.], [4., 0., 0.]], dev).unwrap()
    }

    #[test]
    fn accuracy_counts_hits() {
        let dev = Device::Cpu;
        let mut acc = Accuracy::new();
        let labels = Tensor::new(&[0u32, 1, 1, 0], &dev).unwrap();
        acc.update(&logits(&dev), &labels).unwrap();
        assert_eq!(acc.compute()["Accuracy"], 0.75);
        assert_eq!(acc.total(), 4);
    }

    #[test]
    fn accuracy_accepts_one_hot() {
        let dev = Device::Cpu;
        let mut acc = Accuracy::new();
        let labels = Tensor::new(
            &[[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.], [0., 1., 0.]],
            &dev,
        )
        .unwrap();
        acc.update(&logits(&dev), &labels).unwrap();
        assert_eq!(acc.compute()["Accuracy"], 0.75);
    }

    #[test]
    fn reset_empties_accumulator() {
        let dev = Device::Cpu;
        let mut acc = Accuracy::new();
        acc.update(&logits(&dev), &Tensor::new(&[0u32, 1, 2, 0], &dev).unwrap())
            .unwrap();
        assert_eq!(acc.compute()["Accuracy"], 1.0);
        acc.reset();
        assert_eq!(acc.total(), 0);
        assert_eq!(acc.compute()["Accuracy"], 0.0);
    }

    #[test]
    fn collection_clone_starts_empty() {
        let dev = Device::Cpu;
        let mut coll = MetricCollection::default().with(Accuracy::new());
        coll.update(&logits(&dev), &Tensor::new(&[1u32, 1, 1, 1], &dev).unwrap())
            .unwrap();
        assert_eq!(coll.compute()["Accuracy"], 0.25);

        let fresh = coll.boxed_clone();
        assert_eq!(fresh.compute()["Accuracy"], 0.0);
        assert_eq!(coll.len(), 1);
    }
}
