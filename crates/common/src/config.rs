//! GTN configuration.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working (if small) meta-training run. The struct is built
//! once, validated, and then threaded read-only through the training routine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GtnError, Result};

/// Top-level configuration for a GTN run.
///
/// Backwards-compatible: missing fields fall back to their `#[serde(default)]`
/// values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtnConfig {
    // ── Population / task ───────────────────────────────────────────────────
    /// Number of classes in the real data.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Number of inner-loop steps unrolled before each outer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Every `plot_steps`-th learner hands its last inner data to the visualizer.
    #[serde(default = "default_plot_steps")]
    pub plot_steps: usize,
    /// Epochs per learner.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Where per-learner checkpoints and the result table are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    // ── Optimisers ──────────────────────────────────────────────────────────
    /// Inner (learner) optimiser and its fixed hyper-parameters.
    #[serde(default)]
    pub inner_optimizer: InnerOptimizerConfig,
    /// Inner hyper-parameters learned by the outer loop. Scalars are
    /// one-element lists.
    #[serde(default = "default_override_params")]
    pub override_params: BTreeMap<String, Vec<f64>>,
    /// Outer (curriculum) optimiser.
    #[serde(default)]
    pub outer_optimizer: OuterOptimizerConfig,

    // ── Loss / curriculum ───────────────────────────────────────────────────
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default)]
    pub curriculum: CurriculumConfig,
}

/// Inner optimiser family. Both have a differentiable update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerOptimizerKind {
    #[default]
    Sgd,
    Adam,
}

impl InnerOptimizerKind {
    /// Hyper-parameter names understood by this optimiser.
    pub fn hyperparameters(&self) -> &'static [&'static str] {
        match self {
            Self::Sgd => &["lr", "momentum", "dampening", "weight_decay", "nesterov"],
            Self::Adam => &["lr", "beta1", "beta2", "eps", "weight_decay"],
        }
    }

    /// torch-compatible default for a hyper-parameter not set explicitly.
    pub fn default_value(&self, name: &str) -> Option<f64> {
        let v = match (self, name) {
            (_, "lr") => 0.01,
            (_, "weight_decay") => 0.0,
            (Self::Sgd, "momentum") => 0.0,
            (Self::Sgd, "dampening") => 0.0,
            (Self::Sgd, "nesterov") => 0.0,
            (Self::Adam, "beta1") => 0.9,
            (Self::Adam, "beta2") => 0.999,
            (Self::Adam, "eps") => 1e-8,
            _ => return None,
        };
        Some(v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerOptimizerConfig {
    #[serde(default)]
    pub kind: InnerOptimizerKind,
    #[serde(default = "default_inner_params")]
    pub params: BTreeMap<String, f64>,
}

/// Adam-family outer optimiser (decoupled weight decay, 0 by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterOptimizerConfig {
    #[serde(default = "default_outer_lr")]
    pub lr: f64,
    #[serde(default = "default_beta")]
    pub beta1: f64,
    #[serde(default = "default_beta")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    CrossEntropy,
    /// Mean squared error against one-hot targets.
    Mse,
}

/// Which curriculum provider to prepare, with its shape knobs.
///
/// The data variant takes its shape from the curriculum loader it is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum CurriculumConfig {
    Data,
    FixedNoiseTeacher(TeacherCurriculumConfig),
    RandomNoiseTeacher(TeacherCurriculumConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherCurriculumConfig {
    #[serde(default = "default_inner_loop_iterations")]
    pub inner_loop_iterations: usize,
    #[serde(default = "default_inner_batch_size")]
    pub inner_batch_size: usize,
    #[serde(default = "default_noise_size")]
    pub noise_size: Vec<usize>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_num_classes() -> usize {
    10
}
fn default_batch_size() -> usize {
    4
}
fn default_plot_steps() -> usize {
    25
}
fn default_epochs() -> usize {
    3
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./gtn")
}
fn default_inner_params() -> BTreeMap<String, f64> {
    BTreeMap::from([("lr".to_string(), 0.01)])
}
fn default_override_params() -> BTreeMap<String, Vec<f64>> {
    BTreeMap::from([
        ("lr".to_string(), vec![0.02]),
        ("momentum".to_string(), vec![0.9]),
    ])
}
fn default_outer_lr() -> f64 {
    0.01
}
fn default_beta() -> f64 {
    0.9
}
fn default_eps() -> f64 {
    1e-8
}
fn default_inner_loop_iterations() -> usize {
    32
}
fn default_inner_batch_size() -> usize {
    128
}
fn default_noise_size() -> Vec<usize> {
    vec![128]
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for GtnConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            batch_size: default_batch_size(),
            plot_steps: default_plot_steps(),
            epochs: default_epochs(),
            output_dir: default_output_dir(),
            inner_optimizer: InnerOptimizerConfig::default(),
            override_params: default_override_params(),
            outer_optimizer: OuterOptimizerConfig::default(),
            loss: LossKind::default(),
            curriculum: CurriculumConfig::default(),
        }
    }
}

impl Default for InnerOptimizerConfig {
    fn default() -> Self {
        Self {
            kind: InnerOptimizerKind::Sgd,
            params: default_inner_params(),
        }
    }
}

impl Default for OuterOptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_outer_lr(),
            beta1: default_beta(),
            beta2: default_beta(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        Self::RandomNoiseTeacher(TeacherCurriculumConfig::default())
    }
}

impl Default for TeacherCurriculumConfig {
    fn default() -> Self {
        Self {
            inner_loop_iterations: default_inner_loop_iterations(),
            inner_batch_size: default_inner_batch_size(),
            noise_size: default_noise_size(),
        }
    }
}

impl GtnConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Reject values the training routine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(GtnError::config("num_classes must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(GtnError::config("batch_size must be > 0"));
        }
        if self.plot_steps == 0 {
            return Err(GtnError::config("plot_steps must be > 0"));
        }
        let kind = self.inner_optimizer.kind;
        let known = kind.hyperparameters();
        for name in self
            .inner_optimizer
            .params
            .keys()
            .chain(self.override_params.keys())
        {
            if !known.contains(&name.as_str()) {
                return Err(GtnError::config(format!(
                    "unknown {kind:?} hyper-parameter `{name}` (expected one of {known:?})"
                )));
            }
        }
        for (name, values) in &self.override_params {
            if values.is_empty() {
                return Err(GtnError::config(format!(
                    "override `{name}` has no initial value"
                )));
            }
        }
        if let CurriculumConfig::FixedNoiseTeacher(t) | CurriculumConfig::RandomNoiseTeacher(t) =
            &self.curriculum
        {
            if t.inner_loop_iterations == 0 || t.inner_batch_size == 0 {
                return Err(GtnError::config(
                    "teacher curriculum needs inner_loop_iterations > 0 and inner_batch_size > 0",
                ));
            }
        }
        Ok(())
    }

    /// Resolved value of an inner hyper-parameter (explicit or default).
    pub fn inner_hyperparameter(&self, name: &str) -> Option<f64> {
        self.inner_optimizer
            .params
            .get(name)
            .copied()
            .or_else(|| self.inner_optimizer.kind.default_value(name))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = GtnConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: GtnConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.num_classes, 10);
        assert_eq!(loaded.batch_size, 4);
        assert_eq!(loaded.override_params["lr"], vec![0.02]);
        assert_eq!(loaded.curriculum, config.curriculum);
    }

    #[test]
    fn empty_json_gives_defaults() {
        let loaded: GtnConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.plot_steps, 25);
        assert_eq!(loaded.epochs, 3);
        assert_eq!(loaded.inner_optimizer.kind, InnerOptimizerKind::Sgd);
        assert_eq!(loaded.outer_optimizer.beta2, 0.9);
        assert_eq!(loaded.loss, LossKind::CrossEntropy);
        loaded.validate().unwrap();
    }

    #[test]
    fn curriculum_variant_tagging() {
        let json = r#"{ "curriculum": { "variant": "fixed_noise_teacher", "noise_size": [8, 2] } }"#;
        let loaded: GtnConfig = serde_json::from_str(json).unwrap();
        match loaded.curriculum {
            CurriculumConfig::FixedNoiseTeacher(t) => {
                assert_eq!(t.noise_size, vec![8, 2]);
                assert_eq!(t.inner_loop_iterations, 32);
            }
            other => panic!("unexpected variant {other:?}"),
        }

        let data: GtnConfig = serde_json::from_str(r#"{ "curriculum": { "variant": "data" } }"#).unwrap();
        assert_eq!(data.curriculum, CurriculumConfig::Data);
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut config = GtnConfig::default();
        config.override_params.insert("beta1".into(), vec![0.9]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GtnError::Configuration(_)));

        config.inner_optimizer.kind = InnerOptimizerKind::Adam;
        config.override_params.remove("momentum");
        config.validate().unwrap();
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = GtnConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inner_hyperparameter_falls_back_to_default() {
        let config = GtnConfig::default();
        assert_eq!(config.inner_hyperparameter("lr"), Some(0.01));
        assert_eq!(config.inner_hyperparameter("momentum"), Some(0.0));
        assert_eq!(config.inner_hyperparameter("beta1"), None);
    }
}
