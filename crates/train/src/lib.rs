//! # gtn-train — The Meta-Learning Loop
//!
//! Everything above the differentiable engine:
//!
//! * **[`Curriculum`]** — tagged variant over the data, fixed-noise teacher
//!   and random-noise teacher providers, dispatched through `sample(step)`.
//! * **[`Gtn`]** — the outer-loop driver, assembled by [`GtnBuilder`]. One
//!   call to [`Gtn::train`] trains the whole learner population and returns
//!   the [`ResultTable`](gtn_common::ResultTable).
//! * **[`Checkpoint`]** — per-learner learner + optimiser persistence.
//! * **[`Visualizer`]** — hook for the last inner-loop data.

pub mod checkpoint;
pub mod curriculum;
pub mod trainer;
pub mod visualize;

pub use checkpoint::{checkpoint_path, Checkpoint};
pub use curriculum::{
    teacher_labels, Curriculum, DataCurriculum, FixedNoiseTeacher, RandomNoiseTeacher,
    CURRICULUM_FILE, TEACHER_FILE,
};
pub use trainer::{Gtn, GtnBuilder};
pub use visualize::{SummaryVisualizer, Visualizer};
