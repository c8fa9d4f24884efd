//! Per-learner checkpoints: learner parameters and inner-optimiser state in
//! one safetensors file, keys prefixed `learner.` and `optimizer.`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use gtn_common::Result;
use gtn_core::{InnerOptimizer, Learner};

const LEARNER_PREFIX: &str = "learner.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// `{dir}/{index}.pth`.
pub fn checkpoint_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{index}.pth"))
}

pub struct Checkpoint;

impl Checkpoint {
    pub fn save(path: &Path, learner: &dyn Learner, optimizer: &InnerOptimizer) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tensors: HashMap<String, Tensor> = learner
            .state()
            .into_iter()
            .map(|(k, v)| (format!("{LEARNER_PREFIX}{k}"), v))
            .collect();
        tensors.extend(
            optimizer
                .state_tensors()?
                .into_iter()
                .map(|(k, v)| (format!("{OPTIMIZER_PREFIX}{k}"), v)),
        );
        candle_core::safetensors::save(&tensors, path)?;
        tracing::debug!(path = %path.display(), entries = tensors.len(), "checkpoint saved");
        Ok(())
    }

    /// Restore a checkpoint written by [`Checkpoint::save`] into an existing
    /// learner and optimiser of matching architecture.
    pub fn load_into(
        path: &Path,
        learner: &mut dyn Learner,
        optimizer: &mut InnerOptimizer,
        device: &Device,
    ) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, device)?;
        let mut learner_state = HashMap::new();
        let mut optimizer_state = HashMap::new();
        for (key, t) in tensors {
            if let Some(k) = key.strip_prefix(LEARNER_PREFIX) {
                learner_state.insert(k.to_string(), t);
            } else if let Some(k) = key.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer_state.insert(k.to_string(), t);
            }
        }
        learner.load_state(&learner_state)?;
        optimizer.load_state_tensors(&optimizer_state)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
