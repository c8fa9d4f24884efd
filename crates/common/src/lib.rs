//! # gtn-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`GtnConfig`]** — run configuration (serialised as JSON).
//! * **[`GtnError`]** — the error taxonomy every crate returns.
//! * **[`TensorDataset`]** / **[`CyclicSource`]** / **[`divide_chunks`]** — data plumbing.
//! * **[`History`]** / **[`ResultTable`]** — per-step metric history, one row per learner.

pub mod config;
pub mod data;
pub mod error;
pub mod history;

pub use config::{
    CurriculumConfig, GtnConfig, InnerOptimizerConfig, InnerOptimizerKind, LossKind,
    OuterOptimizerConfig, TeacherCurriculumConfig,
};
pub use data::{divide_chunks, Batch, CyclicSource, TensorDataset};
pub use error::{GtnError, Result};
pub use history::{round3, History, LearnerRow, ResultTable, PATH_COLUMN};
