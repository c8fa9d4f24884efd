//! # gtn-core — The Differentiable Engine
//!
//! Every compute primitive the bi-level loop needs:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`learner`] | `Learner` contract, functional view, reference `Mlp` |
//! | [`teacher`] | `TeacherNetwork` contract, reference `MlpTeacher` |
//! | [`metric`] | `Metric` contract, `Accuracy`, `MetricCollection` |
//! | [`loss`] | configured loss functions, `train_on_batch` |
//! | [`optimizer`] | persistent + differentiable inner optimiser (SGD, Adam), `Overrides` |
//! | [`inner_loop`] | `InnerLoop`: scoped functional snapshot with copy-back |
//!
//! ## Design principles
//!
//! 1. **Candle autodiff only.** Second-order gradients come from running
//!    candle's backward pass with gradient detaching disabled.
//! 2. **Persistent state is never on the graph.** Learners and optimisers
//!    hold detached tensors; only the inner-loop snapshot is differentiable.

pub mod inner_loop;
pub mod learner;
pub mod loss;
pub mod metric;
pub mod optimizer;
pub mod teacher;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use inner_loop::{enable_higher_order_grads, ensure_higher_order_grads, InnerLoop};
pub use learner::{FunctionalLearner, Learner, Mlp};
pub use loss::{loss_fn, train_on_batch, LossFn};
pub use metric::{Accuracy, Metric, MetricCollection};
pub use optimizer::{DiffOptimizer, InnerOptimizer, OptimizerState, Overrides, ParamBuffers};
pub use teacher::{MlpTeacher, TeacherNetwork};
