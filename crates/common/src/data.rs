//! Data plumbing: in-memory tensor datasets, cyclic batch streams, and the
//! inner-step chunking used by the outer loop.
//!
//! * **[`TensorDataset`]**: `(data, labels)` held in memory; sequential or
//!   shuffled batches; safetensors load/save; synthetic Gaussian blobs.
//! * **[`CyclicSource`]**: yields the batches of a finite slice forever.
//! * **[`divide_chunks`]**: contiguous partition of `0..n` into groups.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{GtnError, Result};

/// One `(data, labels)` pair.
pub type Batch = (Tensor, Tensor);

const DATA_KEY: &str = "data";
const LABELS_KEY: &str = "labels";

// ── Chunking ────────────────────────────────────────────────────────────────

/// Split `0..n` into contiguous, non-overlapping chunks of `size` (the last
/// chunk may be shorter). `size == 0` yields no chunks.
pub fn divide_chunks(n: usize, size: usize) -> Vec<Vec<usize>> {
    if size == 0 {
        return Vec::new();
    }
    (0..n)
        .step_by(size)
        .map(|start| (start..(start + size).min(n)).collect())
        .collect()
}

// ── TensorDataset ───────────────────────────────────────────────────────────

/// Labelled samples stacked along dim 0.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    data: Tensor,
    labels: Tensor,
}

impl TensorDataset {
    pub fn new(data: Tensor, labels: Tensor) -> Result<Self> {
        let (n, m) = (data.dim(0)?, labels.dim(0)?);
        if n != m {
            return Err(GtnError::config(format!(
                "dataset has {n} samples but {m} labels"
            )));
        }
        Ok(Self { data, labels })
    }

    /// Load a dataset saved with [`save`](Self::save).
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let data = tensors
            .remove(DATA_KEY)
            .ok_or_else(|| GtnError::config(format!("{}: missing `{DATA_KEY}`", path.display())))?;
        let labels = tensors.remove(LABELS_KEY).ok_or_else(|| {
            GtnError::config(format!("{}: missing `{LABELS_KEY}`", path.display()))
        })?;
        tracing::debug!(path = %path.display(), shape = ?data.dims(), "dataset loaded");
        Self::new(data, labels)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors = HashMap::from([
            (DATA_KEY.to_string(), self.data.clone()),
            (LABELS_KEY.to_string(), self.labels.clone()),
        ]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Synthetic classification set: one random centre per class, samples
    /// scattered around it with standard deviation `spread`. Labels cycle
    /// through the classes so every class is equally represented.
    pub fn gaussian_blobs(
        num_samples: usize,
        num_classes: usize,
        sample_shape: &[usize],
        spread: f64,
        device: &Device,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(GtnError::config("gaussian_blobs needs at least one class"));
        }
        let features: usize = sample_shape.iter().product();
        let centres = Tensor::randn(0f32, 1f32, (num_classes, features), device)?;
        let labels: Vec<u32> = (0..num_samples).map(|i| (i % num_classes) as u32).collect();
        let labels = Tensor::from_vec(labels, num_samples, device)?;
        let noise = Tensor::randn(0f32, spread as f32, (num_samples, features), device)?;
        let data = (centres.index_select(&labels, 0)? + noise)?;

        let mut shape = vec![num_samples];
        shape.extend_from_slice(sample_shape);
        Self::new(data.reshape(shape)?, labels)
    }

    pub fn len(&self) -> usize {
        self.data.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Sequential batches; the final batch may be shorter.
    pub fn batches(&self, batch_size: usize) -> Result<Vec<Batch>> {
        let n = self.len();
        let mut out = Vec::with_capacity(n.div_ceil(batch_size.max(1)));
        for chunk in divide_chunks(n, batch_size) {
            let (start, len) = (chunk[0], chunk.len());
            out.push((
                self.data.narrow(0, start, len)?,
                self.labels.narrow(0, start, len)?,
            ));
        }
        Ok(out)
    }

    /// Batches over a random permutation of the samples.
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Batch>> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.shuffle(rng);
        let index = Tensor::from_vec(order, self.len(), self.data.device())?;
        let shuffled = Self {
            data: self.data.index_select(&index, 0)?,
            labels: self.labels.index_select(&index, 0)?,
        };
        shuffled.batches(batch_size)
    }

    /// First `count` sequential batches with integer labels, as handed to a
    /// data curriculum.
    pub fn curriculum_batches(&self, batch_size: usize, count: usize) -> Result<Vec<Batch>> {
        let full = if batch_size == 0 { 0 } else { self.len() / batch_size };
        if full < count {
            return Err(GtnError::config(format!(
                "dataset yields {full} full batches of {batch_size}, curriculum needs {count}"
            )));
        }
        self.batches(batch_size)?
            .into_iter()
            .take(count)
            .map(|(x, y)| Ok((x, y.to_dtype(DType::U32)?)))
            .collect()
    }
}

// ── CyclicSource ────────────────────────────────────────────────────────────

/// Endless stream over a finite slice of batches. When the slice is
/// exhausted iteration restarts from the first batch.
#[derive(Debug, Clone)]
pub struct CyclicSource<'a> {
    batches: &'a [Batch],
    cursor: usize,
}

impl<'a> CyclicSource<'a> {
    /// `name` only labels the error for an empty source.
    pub fn new(batches: &'a [Batch], name: &str) -> Result<Self> {
        if batches.is_empty() {
            return Err(GtnError::config(format!("{name} data source is empty")));
        }
        Ok(Self { batches, cursor: 0 })
    }

    /// Batches in one pass over the underlying slice.
    pub fn period(&self) -> usize {
        self.batches.len()
    }

    pub fn next_batch(&mut self) -> &'a Batch {
        let batch = &self.batches[self.cursor];
        self.cursor = (self.cursor + 1) % self.batches.len();
        batch
    }
}

impl<'a> Iterator for CyclicSource<'a> {
    type Item = &'a Batch;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
