//! Differentiable inner loop.
//!
//! [`InnerLoop`] is a scoped transaction over one learner and its optimiser.
//! Opening it snapshots the learner's parameters and the optimiser state into
//! a functional clone; every [`InnerLoop::step`] replaces the functional
//! parameters with an update that stays on the autodiff graph, so a loss
//! computed afterwards back-propagates through all unrolled steps into the
//! curriculum and the override hyper-parameters. Closing it (explicitly via
//! [`InnerLoop::commit`], or on drop) copies the final parameters and
//! optimiser state back into the persistent objects, detached.
//!
//! ## Gradients at intermediate parameters
//!
//! Candle keeps gradients only for variables, and detaches them unless
//! `CANDLE_GRAD_DO_NOT_DETACH` is set. Each step therefore adds a zero
//! "tap" [`Var`] to every functional parameter before the forward pass:
//! the tap's gradient is the gradient at that parameter, and with
//! detaching disabled it remains a function of the curriculum.

use std::cell::Cell;
use std::sync::Once;

use candle_core::{DType, Device, Tensor, Var};

use gtn_common::{GtnError, Result};

use crate::learner::{FunctionalLearner, Learner};
use crate::optimizer::{DiffOptimizer, InnerOptimizer, Overrides};

static HIGHER_ORDER: Once = Once::new();

thread_local! {
    static VERIFIED: Cell<bool> = const { Cell::new(false) };
}

/// Make candle keep the graph of computed gradients. Must run before the
/// first backward pass on a thread; candle reads the flag once per thread.
pub fn enable_higher_order_grads() {
    HIGHER_ORDER.call_once(|| {
        std::env::set_var("CANDLE_GRAD_DO_NOT_DETACH", "1");
        tracing::debug!("second-order gradients enabled");
    });
}

/// Enable second-order gradients and check that they reach a variable on
/// the current thread.
///
/// A thread that ran a backward pass before the flag was set keeps
/// detaching gradients for its whole lifetime; on such a thread the outer
/// loop would never update the curriculum, so this fails with
/// `Configuration` instead.
pub fn ensure_higher_order_grads(device: &Device) -> Result<()> {
    enable_higher_order_grads();
    if VERIFIED.with(Cell::get) {
        return Ok(());
    }
    // d/dx sum(x²) = 2x, whose own gradient is 2 only if it kept its graph.
    let x = Var::ones(1, DType::F32, device)?;
    let first = x.as_tensor().sqr()?.sum_all()?.backward()?;
    let reached = match first.get(x.as_tensor()) {
        Some(g) => g.sum_all()?.backward()?.get(x.as_tensor()).is_some(),
        None => false,
    };
    if !reached {
        return Err(GtnError::config(
            "second-order gradients unavailable on this thread: a backward pass ran \
             before they were enabled (call `enable_higher_order_grads` first, or \
             train on a fresh thread)",
        ));
    }
    VERIFIED.with(|v| v.set(true));
    Ok(())
}

/// Live functional snapshot of a learner and its optimiser.
///
/// Borrowing both mutably guarantees one snapshot per learner at a time.
pub struct InnerLoop<'a> {
    learner: &'a mut dyn Learner,
    optimizer: &'a mut InnerOptimizer,
    params: Vec<Tensor>,
    diffopt: DiffOptimizer,
    steps: usize,
    synced: bool,
}

impl<'a> InnerLoop<'a> {
    /// Open the block. Override values are substituted for the matching
    /// optimiser hyper-parameters.
    pub fn open(
        learner: &'a mut dyn Learner,
        optimizer: &'a mut InnerOptimizer,
        overrides: &Overrides,
    ) -> Result<Self> {
        let params = learner.parameters();
        if let Some(p) = params.first() {
            ensure_higher_order_grads(p.device())?;
        }
        let diffopt = optimizer.functional(overrides)?;
        Ok(Self {
            learner,
            optimizer,
            params,
            diffopt,
            steps: 0,
            synced: false,
        })
    }

    /// One differentiable update. `loss_of` evaluates the inner loss on the
    /// functional learner; the loss is returned for logging.
    pub fn step<F>(&mut self, loss_of: F) -> Result<Tensor>
    where
        F: FnOnce(&FunctionalLearner<'_>) -> Result<Tensor>,
    {
        let taps = self
            .params
            .iter()
            .map(|p| Var::zeros(p.dims(), p.dtype(), p.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let tapped = self
            .params
            .iter()
            .zip(&taps)
            .map(|(p, d)| p + d.as_tensor())
            .collect::<candle_core::Result<Vec<_>>>()?;

        let loss = loss_of(&FunctionalLearner::new(&*self.learner, &tapped))?;
        let grads = loss.backward()?;
        let grads = taps
            .iter()
            .map(|d| match grads.get(d.as_tensor()) {
                Some(g) => Ok(g.clone()),
                None => d.as_tensor().zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        self.params = self.diffopt.step(&self.params, &grads)?;
        self.steps += 1;
        Ok(loss)
    }

    /// The functional learner at its current parameters.
    pub fn model(&self) -> FunctionalLearner<'_> {
        FunctionalLearner::new(&*self.learner, &self.params)
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn optimizer(&self) -> &DiffOptimizer {
        &self.diffopt
    }

    /// Inner steps taken since the block opened.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Close the block, copying the functional state back.
    pub fn commit(mut self) -> Result<()> {
        self.sync()
    }

    fn sync(&mut self) -> Result<()> {
        if self.synced {
            return Ok(());
        }
        self.synced = true;
        let detached: Vec<Tensor> = self.params.iter().map(Tensor::detach).collect();
        self.learner.set_parameters(&detached)?;
        self.optimizer.load_functional(&self.diffopt);
        Ok(())
    }
}

impl Drop for InnerLoop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!(error = %e, "inner-loop state sync failed on teardown");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use candle_core::{Device, Tensor};
    use candle_nn::Module;
    use gtn_common::{GtnError, InnerOptimizerKind, LossKind};

    use crate::learner::Mlp;
    use crate::loss::{loss_fn, train_on_batch};
    use crate::metric::Accuracy;

    fn sgd(lr: f64, dev: &Device) -> InnerOptimizer {
        let params = BTreeMap::from([("lr".to_string(), lr)]);
        InnerOptimizer::new(InnerOptimizerKind::Sgd, &params, dev).unwrap()
    }

    fn flat(ts: &[Tensor]) -> Vec<f32> {
        ts.iter()
            .flat_map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn gradient_reaches_curriculum_through_unrolled_steps() {
        let dev = Device::Cpu;
        let mut learner = Mlp::new(&[3, 4, 2], &dev).unwrap();
        let mut opt = sgd(0.1, &dev);
        let loss = loss_fn(LossKind::CrossEntropy, 2);
        let mut metric = Accuracy::new();

        let synthetic = Var::randn(0f32, 1f32, (2, 4, 3), &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 0, 1], &dev).unwrap();
        let real_x = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();

        let mut tx = InnerLoop::open(&mut learner, &mut opt, &Overrides::empty()).unwrap();
        for step in 0..2 {
            let x = synthetic.as_tensor().get(step).unwrap();
            tx.step(|m| train_on_batch(&x, &labels, m, &mut metric, &loss, &dev))
                .unwrap();
        }
        let outer = train_on_batch(&real_x, &labels, &tx.model(), &mut metric, &loss, &dev).unwrap();
        let grads = outer.backward().unwrap();
        let g = grads.get(synthetic.as_tensor()).expect("no gradient on curriculum");
        let norm = g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm > 0.0);
        tx.commit().unwrap();
        assert_eq!(metric.total(), 12);
    }

    #[test]
    fn higher_order_check_passes_on_a_fresh_thread() {
        std::thread::spawn(|| ensure_higher_order_grads(&Device::Cpu).unwrap())
            .join()
            .unwrap();
    }

    #[test]
    fn earlier_backward_on_thread_never_fails_silently() {
        std::thread::spawn(|| {
            let dev = Device::Cpu;
            let w = Var::new(&[1f32, 2.], &dev).unwrap();
            w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();

            let mut learner = Mlp::new(&[3, 2], &dev).unwrap();
            let mut opt = sgd(0.1, &dev);
            let loss = loss_fn(LossKind::CrossEntropy, 2);
            let mut metric = Accuracy::new();
            let synthetic = Var::randn(0f32, 1f32, (4, 3), &dev).unwrap();
            let labels = Tensor::new(&[0u32, 1, 0, 1], &dev).unwrap();
            let real_x = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();

            match InnerLoop::open(&mut learner, &mut opt, &Overrides::empty()) {
                // the flag was read as unset before this thread's first backward
                Err(e) => assert!(matches!(e, GtnError::Configuration(_)), "{e}"),
                Ok(mut tx) => {
                    let x = synthetic.as_tensor();
                    tx.step(|m| train_on_batch(x, &labels, m, &mut metric, &loss, &dev))
                        .unwrap();
                    let outer =
                        train_on_batch(&real_x, &labels, &tx.model(), &mut metric, &loss, &dev)
                            .unwrap();
                    let grads = outer.backward().unwrap();
                    assert!(grads.get(synthetic.as_tensor()).is_some());
                }
            };
        })
        .join()
        .unwrap();
    }

    #[test]
    fn gradient_reaches_learning_rate_override() {
        let dev = Device::Cpu;
        let mut learner = Mlp::new(&[3, 2], &dev).unwrap();
        let mut opt = sgd(0.01, &dev);
        let overrides =
            Overrides::new(&BTreeMap::from([("lr".to_string(), vec![0.5])]), &dev).unwrap();
        let loss = loss_fn(LossKind::CrossEntropy, 2);
        let mut metric = Accuracy::new();
        let x = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();
        let y = Tensor::new(&[0u32, 1, 1, 0], &dev).unwrap();

        let mut tx = InnerLoop::open(&mut learner, &mut opt, &overrides).unwrap();
        tx.step(|m| train_on_batch(&x, &y, m, &mut metric, &loss, &dev))
            .unwrap();
        let outer = train_on_batch(&x, &y, &tx.model(), &mut metric, &loss, &dev).unwrap();
        let grads = outer.backward().unwrap();
        let lr = overrides.get("lr").unwrap();
        assert!(grads.get(lr.as_tensor()).is_some());
    }

    #[test]
    fn commit_syncs_learner_with_functional_parameters() {
        let dev = Device::Cpu;
        let mut learner = Mlp::new(&[3, 2], &dev).unwrap();
        let before = flat(&learner.parameters());
        let mut opt = sgd(0.1, &dev);
        let loss = loss_fn(LossKind::CrossEntropy, 2);
        let mut metric = Accuracy::new();
        let x = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();
        let y = Tensor::new(&[0u32, 1, 1, 0], &dev).unwrap();

        let final_params = {
            let mut tx = InnerLoop::open(&mut learner, &mut opt, &Overrides::empty()).unwrap();
            tx.step(|m| train_on_batch(&x, &y, m, &mut metric, &loss, &dev))
                .unwrap();
            assert_eq!(tx.steps(), 1);
            let p = flat(tx.params());
            tx.commit().unwrap();
            p
        };
        assert_eq!(flat(&learner.parameters()), final_params);
        assert_ne!(before, final_params);
        assert_eq!(opt.state().step, 1);
        // persistent parameters carry no graph
        assert!(learner.parameters().iter().all(|p| !p.is_variable()));
        let _ = learner.forward(&x).unwrap();
    }

    #[test]
    fn drop_without_commit_still_syncs() {
        let dev = Device::Cpu;
        let mut learner = Mlp::new(&[3, 2], &dev).unwrap();
        let mut opt = sgd(0.1, &dev);
        let loss = loss_fn(LossKind::CrossEntropy, 2);
        let mut metric = Accuracy::new();
        let x = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();
        let y = Tensor::new(&[1u32, 1, 0, 0], &dev).unwrap();

        let expected = {
            let mut tx = InnerLoop::open(&mut learner, &mut opt, &Overrides::empty()).unwrap();
            tx.step(|m| train_on_batch(&x, &y, m, &mut metric, &loss, &dev))
                .unwrap();
            flat(tx.params())
        };
        assert_eq!(flat(&learner.parameters()), expected);
    }
}
