//! Gtn: the outer-loop driver.
//!
//! For each learner of the population: clone the prototype, give it a
//! fresh inner optimiser, then for every epoch and every chunk of inner
//! steps run the differentiable inner loop on the curriculum, take one
//! outer AdamW step on the real-data loss of the unrolled learner, sync the
//! state back, and evaluate the persistent learner on held-out data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};

use gtn_common::{
    divide_chunks, Batch, CyclicSource, GtnConfig, GtnError, History, InnerOptimizerConfig,
    OuterOptimizerConfig, Result, ResultTable,
};
use gtn_core::{
    ensure_higher_order_grads, loss_fn, train_on_batch, InnerLoop, InnerOptimizer, Learner,
    LossFn, Metric, Overrides,
};

use crate::checkpoint::{checkpoint_path, Checkpoint};
use crate::curriculum::Curriculum;
use crate::visualize::{SummaryVisualizer, Visualizer};

// ── Builder ─────────────────────────────────────────────────────────────────

/// Collects the population, metrics, loss, optimisers and curriculum, and
/// validates them once in [`GtnBuilder::build`].
pub struct GtnBuilder {
    config: GtnConfig,
    device: Device,
    learners: Vec<Box<dyn Learner>>,
    metrics: Option<Box<dyn Metric>>,
    loss: Option<LossFn>,
    curriculum: Option<Curriculum>,
    visualizer: Option<Box<dyn Visualizer>>,
}

impl GtnBuilder {
    pub fn new(config: GtnConfig, device: Device) -> Self {
        Self {
            config,
            device,
            learners: Vec::new(),
            metrics: None,
            loss: None,
            curriculum: None,
            visualizer: None,
        }
    }

    /// Prototype learners, trained in list order.
    pub fn learners(mut self, learners: Vec<Box<dyn Learner>>) -> Self {
        self.learners = learners;
        self
    }

    pub fn learner(mut self, learner: impl Learner + 'static) -> Self {
        self.learners.push(Box::new(learner));
        self
    }

    /// Metric prototype; the inner, train and test phases each get an
    /// independent copy.
    pub fn metrics(mut self, metrics: impl Metric + 'static) -> Self {
        self.metrics = Some(Box::new(metrics));
        self
    }

    /// Custom loss. Defaults to the one named by `config.loss`.
    pub fn loss(mut self, loss: LossFn) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Replace the optimiser section of the configuration.
    pub fn optimizers(
        mut self,
        inner: InnerOptimizerConfig,
        overrides: BTreeMap<String, Vec<f64>>,
        outer: OuterOptimizerConfig,
    ) -> Self {
        self.config.inner_optimizer = inner;
        self.config.override_params = overrides;
        self.config.outer_optimizer = outer;
        self
    }

    pub fn curriculum(mut self, curriculum: impl Into<Curriculum>) -> Self {
        self.curriculum = Some(curriculum.into());
        self
    }

    pub fn visualizer(mut self, visualizer: impl Visualizer + 'static) -> Self {
        self.visualizer = Some(Box::new(visualizer));
        self
    }

    pub fn build(self) -> Result<Gtn> {
        self.config.validate()?;
        if self.learners.is_empty() {
            return Err(GtnError::config("no learners configured"));
        }
        let metrics = self
            .metrics
            .ok_or_else(|| GtnError::config("no metrics configured"))?;
        let curriculum = self
            .curriculum
            .ok_or_else(|| GtnError::config("no curriculum configured"))?;
        let loss = self
            .loss
            .unwrap_or_else(|| loss_fn(self.config.loss, self.config.num_classes));

        let overrides = Overrides::new(&self.config.override_params, &self.device)?;
        let mut vars: Vec<Var> = curriculum.vars();
        vars.extend(overrides.vars());
        let outer_config = &self.config.outer_optimizer;
        let outer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: outer_config.lr,
                beta1: outer_config.beta1,
                beta2: outer_config.beta2,
                eps: outer_config.eps,
                weight_decay: outer_config.weight_decay,
            },
        )?;

        tracing::info!(
            learners = self.learners.len(),
            curriculum = curriculum.variant(),
            inner_steps = curriculum.inner_loop_iterations(),
            inner_optimizer = ?self.config.inner_optimizer.kind,
            overrides = ?overrides.names().collect::<Vec<_>>(),
            "GTN configured"
        );

        Ok(Gtn {
            config: self.config,
            device: self.device,
            learners: self.learners,
            metrics,
            loss,
            curriculum,
            overrides,
            outer,
            visualizer: self
                .visualizer
                .unwrap_or_else(|| Box::new(SummaryVisualizer)),
        })
    }
}

// ── Gtn ─────────────────────────────────────────────────────────────────────

/// Metric accumulators of the three phases of an outer step.
struct PhaseMetrics {
    inner: Box<dyn Metric>,
    train: Box<dyn Metric>,
    test: Box<dyn Metric>,
}

impl PhaseMetrics {
    fn new(prototype: &dyn Metric) -> Self {
        Self {
            inner: prototype.boxed_clone(),
            train: prototype.boxed_clone(),
            test: prototype.boxed_clone(),
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.train.reset();
        self.test.reset();
    }
}

/// Losses and the last inner data of one outer step.
struct OuterStep {
    inner_loss: f64,
    train_loss: f64,
    test_loss: f64,
    inner_data: Tensor,
}

pub struct Gtn {
    config: GtnConfig,
    device: Device,
    learners: Vec<Box<dyn Learner>>,
    metrics: Box<dyn Metric>,
    loss: LossFn,
    curriculum: Curriculum,
    overrides: Overrides,
    outer: AdamW,
    visualizer: Box<dyn Visualizer>,
}

impl Gtn {
    pub fn builder(config: GtnConfig, device: Device) -> GtnBuilder {
        GtnBuilder::new(config, device)
    }

    pub fn config(&self) -> &GtnConfig {
        &self.config
    }

    pub fn curriculum(&self) -> &Curriculum {
        &self.curriculum
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Train every learner in turn and return one result row per learner.
    ///
    /// `train` and `test` are cycled indefinitely; each outer step draws one
    /// batch from each. Checkpoints land at `{output_dir}/{index}.pth`.
    pub fn train(
        &mut self,
        train: &[Batch],
        test: &[Batch],
        output_dir: &Path,
        epochs: usize,
    ) -> Result<ResultTable> {
        ensure_higher_order_grads(&self.device)?;
        let mut train_stream = CyclicSource::new(train, "outer train source")?;
        let mut test_stream = CyclicSource::new(test, "outer validation source")?;
        std::fs::create_dir_all(output_dir)?;

        let chunks = divide_chunks(
            self.curriculum.inner_loop_iterations(),
            self.config.batch_size,
        );
        let mut metrics = PhaseMetrics::new(self.metrics.as_ref());
        let mut table = ResultTable::new();
        let population = self.learners.len();

        let pb = ProgressBar::new(population as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .map_err(|e| GtnError::config(e.to_string()))?,
        );

        let started = Instant::now();
        for index in 0..population {
            // ── Per-learner setup ───────────────────────────────────────────
            let mut learner = self.learners[index].boxed_clone();
            let mut optimizer = InnerOptimizer::new(
                self.config.inner_optimizer.kind,
                &self.config.inner_optimizer.params,
                &self.device,
            )?;
            let mut history = History::new();
            let mut last_inner_data: Option<Tensor> = None;

            for epoch in 0..epochs {
                for (batch, chunk) in chunks.iter().enumerate() {
                    let step = self.outer_step(
                        learner.as_mut(),
                        &mut optimizer,
                        chunk,
                        train_stream.next_batch(),
                        test_stream.next_batch(),
                        &mut metrics,
                    )?;
                    history.record_prefixed("Inner", &metrics.inner.compute());
                    history.record("InnerLoss", step.inner_loss);
                    history.record_prefixed("Train", &metrics.train.compute());
                    history.record("TrainLoss", step.train_loss);
                    history.record_prefixed("Test", &metrics.test.compute());
                    history.record("TestLoss", step.test_loss);
                    metrics.reset();
                    last_inner_data = Some(step.inner_data);
                    tracing::debug!(epoch, batch, learner = index + 1, "outer step done");
                }
                let latest: Vec<String> = history
                    .latest()
                    .into_iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect();
                tracing::info!(
                    epoch,
                    batch = chunks.len(),
                    learner = index + 1,
                    "{}",
                    latest.join(" ")
                );
            }

            // ── Per-learner teardown ────────────────────────────────────────
            let path = checkpoint_path(output_dir, index);
            Checkpoint::save(&path, learner.as_ref(), &optimizer)?;
            tracing::info!(learner = index + 1, path = %path.display(), "checkpoint saved");
            table.push(history, path);

            if (index + 1) % self.config.plot_steps == 0 {
                if let Some(data) = &last_inner_data {
                    if let Err(e) = self.visualizer.show(data) {
                        tracing::warn!(error = %e, "visualizer failed");
                    }
                }
            }
            pb.inc(1);
        }
        pb.finish_with_message("population trained");

        self.device.synchronize()?;
        let total = started.elapsed().as_secs_f64();
        tracing::info!(
            total_secs = format!("{total:.2}"),
            average_secs = format!("{:.2}", total / population.max(1) as f64),
            "GTN training finished"
        );
        Ok(table)
    }

    /// One batch of inner steps followed by one outer update, the state
    /// sync, and the held-out evaluation. Metrics are left accumulated for
    /// the caller to record and reset.
    fn outer_step(
        &mut self,
        learner: &mut dyn Learner,
        optimizer: &mut InnerOptimizer,
        chunk: &[usize],
        (train_x, train_y): &Batch,
        (test_x, test_y): &Batch,
        metrics: &mut PhaseMetrics,
    ) -> Result<OuterStep> {
        let device = &self.device;
        let loss = &self.loss;
        let curriculum = &self.curriculum;

        let mut inner = None;
        let train_loss = {
            let mut tx = InnerLoop::open(&mut *learner, optimizer, &self.overrides)?;
            for &step in chunk {
                let (x, y) = curriculum.sample(step)?;
                let l = tx.step(|model| {
                    train_on_batch(&x, &y, model, metrics.inner.as_mut(), loss, device)
                })?;
                inner = Some((l, x));
            }
            let train_loss = train_on_batch(
                train_x,
                train_y,
                &tx.model(),
                metrics.train.as_mut(),
                loss,
                device,
            )?;
            let grads = train_loss.backward()?;
            self.outer.step(&grads)?;
            tx.commit()?;
            train_loss
        };
        let (inner_loss, inner_data) =
            inner.ok_or_else(|| GtnError::config("empty chunk of inner steps"))?;

        // The persistent learner holds detached parameters: no graph is built.
        let test_loss = train_on_batch(
            test_x,
            test_y,
            &*learner,
            metrics.test.as_mut(),
            loss,
            device,
        )?;

        Ok(OuterStep {
            inner_loss: scalar(&inner_loss)?,
            train_loss: scalar(&train_loss)?,
            test_loss: scalar(&test_loss)?,
            inner_data: inner_data.detach(),
        })
    }

    /// Persist the learned curriculum and override values into `dir`.
    pub fn save_curriculum(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let overrides = self
            .overrides
            .tensors()
            .into_iter()
            .map(|(k, v)| (format!("override.{k}"), v))
            .collect();
        let written = self.curriculum.save(dir, overrides)?;
        tracing::info!(files = ?written, "curriculum saved");
        Ok(written)
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.detach().to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
