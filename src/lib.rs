//! GTN: Generative Teaching Networks on Candle.
//!
//! A population of learners is trained on a learned curriculum (synthetic
//! samples, or a teacher network over noise); the curriculum and selected
//! inner-optimiser hyper-parameters are meta-learned by back-propagating
//! real-data loss through the unrolled inner training loop.
//!
//! This crate re-exports the workspace:
//! [`common`] (config, errors, data, history), [`engine`] (learners, metrics,
//! optimisers, inner loop) and [`train`] (curricula, driver, checkpoints).

pub use gtn_common as common;
pub use gtn_core as engine;
pub use gtn_train as train;

pub use gtn_common::{GtnConfig, GtnError, ResultTable};
pub use gtn_core::{InnerLoop, Learner, Metric};
pub use gtn_train::{Curriculum, Gtn, GtnBuilder};
