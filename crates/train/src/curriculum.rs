//! Curriculum providers: the synthetic `(data, label)` pair each inner step
//! trains on.
//!
//! * **[`DataCurriculum`]**: the samples themselves are learnable.
//! * **[`FixedNoiseTeacher`]**: a teacher network over a learnable, fixed
//!   noise tensor (one slice per step).
//! * **[`RandomNoiseTeacher`]**: a teacher network over fresh standard
//!   normal noise on every call.
//!
//! [`Curriculum`] dispatches `sample(step)` over the three.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::encoding::one_hot;

use gtn_common::{Batch, GtnError, Result, TeacherCurriculumConfig};
use gtn_core::TeacherNetwork;

/// File the curriculum tensors are written to by [`Curriculum::save`].
pub const CURRICULUM_FILE: &str = "curriculum.safetensors";
/// File teacher weights are written to by [`Curriculum::save`].
pub const TEACHER_FILE: &str = "teacher.safetensors";

/// `arange(batch) mod num_classes` and its one-hot encoding.
pub fn teacher_labels(
    batch_size: usize,
    num_classes: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if num_classes == 0 {
        return Err(GtnError::config("num_classes must be > 0"));
    }
    let labels: Vec<u32> = (0..batch_size).map(|i| (i % num_classes) as u32).collect();
    let labels = Tensor::from_vec(labels, batch_size, device)?;
    let encoded = one_hot(labels.clone(), num_classes, 1f32, 0f32)?;
    Ok((labels, encoded))
}

// ── DataCurriculum ──────────────────────────────────────────────────────────

/// One learnable sample batch per inner step, with labels fixed at prepare
/// time.
pub struct DataCurriculum {
    data: Var,
    labels: Tensor,
}

impl DataCurriculum {
    /// Materialise every batch of `loader` once; the number of batches is
    /// the number of inner-loop iterations. Batches must share a shape.
    pub fn prepare(loader: &[Batch], device: &Device) -> Result<Self> {
        if loader.is_empty() {
            return Err(GtnError::config("curriculum loader is empty"));
        }
        let data = loader
            .iter()
            .map(|(x, _)| Ok(x.to_device(device)?.to_dtype(DType::F32)?.detach()))
            .collect::<Result<Vec<_>>>()?;
        let labels = loader
            .iter()
            .map(|(_, y)| Ok(y.to_device(device)?.to_dtype(DType::U32)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            data: Var::from_tensor(&Tensor::stack(&data, 0)?)?,
            labels: Tensor::stack(&labels, 0)?,
        })
    }

    pub fn data(&self) -> &Var {
        &self.data
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    fn iterations(&self) -> usize {
        self.data.as_tensor().dims()[0]
    }

    fn sample(&self, step: usize) -> Result<Batch> {
        Ok((self.data.as_tensor().get(step)?, self.labels.get(step)?))
    }
}

// ── FixedNoiseTeacher ───────────────────────────────────────────────────────

/// Teacher over a learnable noise tensor `(iterations, batch, *noise_dims)`.
pub struct FixedNoiseTeacher {
    teacher: Box<dyn TeacherNetwork>,
    noise: Var,
    labels: Tensor,
    one_hot: Tensor,
}

impl FixedNoiseTeacher {
    pub fn prepare(
        teacher: Box<dyn TeacherNetwork>,
        noise: &Tensor,
        num_classes: usize,
    ) -> Result<Self> {
        if noise.rank() < 3 {
            return Err(GtnError::config(format!(
                "teacher noise must be (iterations, batch, *noise_dims), got {:?}",
                noise.dims()
            )));
        }
        let (labels, one_hot) = teacher_labels(noise.dims()[1], num_classes, noise.device())?;
        Ok(Self {
            teacher,
            noise: Var::from_tensor(&noise.detach())?,
            labels,
            one_hot,
        })
    }

    pub fn noise(&self) -> &Var {
        &self.noise
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    fn iterations(&self) -> usize {
        self.noise.as_tensor().dims()[0]
    }

    fn sample(&self, step: usize) -> Result<Batch> {
        let z = self.noise.as_tensor().get(step)?;
        let data = self.teacher.generate(&z, &self.one_hot)?;
        Ok((data, self.labels.clone()))
    }
}

// ── RandomNoiseTeacher ──────────────────────────────────────────────────────

/// Teacher over noise resampled on every call; only the teacher is learned.
pub struct RandomNoiseTeacher {
    teacher: Box<dyn TeacherNetwork>,
    iterations: usize,
    noise_shape: Vec<usize>,
    labels: Tensor,
    one_hot: Tensor,
    device: Device,
}

impl RandomNoiseTeacher {
    pub fn prepare(
        teacher: Box<dyn TeacherNetwork>,
        config: &TeacherCurriculumConfig,
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        if config.inner_batch_size == 0 {
            return Err(GtnError::config("inner_batch_size must be > 0"));
        }
        let (labels, one_hot) = teacher_labels(config.inner_batch_size, num_classes, device)?;
        let mut noise_shape = vec![config.inner_batch_size];
        noise_shape.extend_from_slice(&config.noise_size);
        Ok(Self {
            teacher,
            iterations: config.inner_loop_iterations,
            noise_shape,
            labels,
            one_hot,
            device: device.clone(),
        })
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    fn sample(&self) -> Result<Batch> {
        let z = Tensor::randn(0f32, 1f32, self.noise_shape.as_slice(), &self.device)?;
        let data = self.teacher.generate(&z, &self.one_hot)?;
        Ok((data, self.labels.clone()))
    }
}

// ── Curriculum ──────────────────────────────────────────────────────────────

pub enum Curriculum {
    Data(DataCurriculum),
    FixedNoiseTeacher(FixedNoiseTeacher),
    RandomNoiseTeacher(RandomNoiseTeacher),
}

impl Curriculum {
    /// Inner-loop steps per pass (the range `sample` accepts).
    pub fn inner_loop_iterations(&self) -> usize {
        match self {
            Self::Data(c) => c.iterations(),
            Self::FixedNoiseTeacher(c) => c.iterations(),
            Self::RandomNoiseTeacher(c) => c.iterations,
        }
    }

    /// Training pair for a 0-based inner step in `0..inner_loop_iterations()`.
    pub fn sample(&self, step: usize) -> Result<Batch> {
        let n = self.inner_loop_iterations();
        if step >= n {
            return Err(GtnError::config(format!(
                "inner step {step} is outside 0..{n}"
            )));
        }
        match self {
            Self::Data(c) => c.sample(step),
            Self::FixedNoiseTeacher(c) => c.sample(step),
            Self::RandomNoiseTeacher(c) => c.sample(),
        }
    }

    /// Parameters the outer optimiser owns.
    pub fn vars(&self) -> Vec<Var> {
        match self {
            Self::Data(c) => vec![c.data.clone()],
            Self::FixedNoiseTeacher(c) => {
                let mut vars = c.teacher.vars();
                vars.push(c.noise.clone());
                vars
            }
            Self::RandomNoiseTeacher(c) => c.teacher.vars(),
        }
    }

    pub fn variant(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::FixedNoiseTeacher(_) => "fixed_noise_teacher",
            Self::RandomNoiseTeacher(_) => "random_noise_teacher",
        }
    }

    /// Learned curriculum tensors (teacher weights excluded).
    pub fn tensors(&self) -> HashMap<String, Tensor> {
        match self {
            Self::Data(c) => HashMap::from([
                ("curriculum_data".to_string(), c.data.as_tensor().detach()),
                ("curriculum_labels".to_string(), c.labels.clone()),
            ]),
            Self::FixedNoiseTeacher(c) => HashMap::from([
                ("teacher_noise".to_string(), c.noise.as_tensor().detach()),
                ("teacher_labels".to_string(), c.labels.clone()),
            ]),
            Self::RandomNoiseTeacher(c) => {
                HashMap::from([("teacher_labels".to_string(), c.labels.clone())])
            }
        }
    }

    /// Write [`CURRICULUM_FILE`] (plus `extra` tensors) and, for teacher
    /// variants, [`TEACHER_FILE`] into `dir`. Returns the written paths.
    pub fn save(&self, dir: &Path, extra: HashMap<String, Tensor>) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut tensors = self.tensors();
        tensors.extend(extra);
        let path = dir.join(CURRICULUM_FILE);
        candle_core::safetensors::save(&tensors, &path)?;
        let mut written = vec![path];

        let teacher = match self {
            Self::Data(_) => None,
            Self::FixedNoiseTeacher(c) => Some(&c.teacher),
            Self::RandomNoiseTeacher(c) => Some(&c.teacher),
        };
        if let Some(teacher) = teacher {
            let path = dir.join(TEACHER_FILE);
            teacher.save(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}

impl From<DataCurriculum> for Curriculum {
    fn from(c: DataCurriculum) -> Self {
        Self::Data(c)
    }
}

impl From<FixedNoiseTeacher> for Curriculum {
    fn from(c: FixedNoiseTeacher) -> Self {
        Self::FixedNoiseTeacher(c)
    }
}

impl From<RandomNoiseTeacher> for Curriculum {
    fn from(c: RandomNoiseTeacher) -> Self {
        Self::RandomNoiseTeacher(c)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
