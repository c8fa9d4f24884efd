//! Inner-loop optimiser: a persistent form that lives across outer steps and
//! a differentiable form used while the inner loop is unrolled.
//!
//! Both share one update rule ([`DiffOptimizer::step`]). In the
//! differentiable form every hyper-parameter is a tensor, so a learned
//! override (a [`Var`] owned by the outer optimiser) enters the graph of
//! every parameter update it touches.
//!
//! | Kind | Update (torch semantics) |
//! |------|--------------------------|
//! | SGD  | `d = g + wd·θ`; `b = μ·b + (1-τ)·d` (first step `b = d`); Nesterov `d += μ·b` else `d = b`; `θ ← θ - lr·d` |
//! | Adam | `m = β1·m + (1-β1)·d`; `v = β2·v + (1-β2)·d²`; `θ ← θ - lr/(1-β1ᵗ) · m / (√v/√(1-β2ᵗ) + ε)` |

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor, Var};

use gtn_common::{GtnError, InnerOptimizerKind, Result};

/// Keeps `√v` differentiable at `v = 0`.
const SQRT_FLOOR: f64 = 1e-16;

const MOMENTUM_BUFFER: &str = "momentum_buffer";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

// ── State ───────────────────────────────────────────────────────────────────

/// Per-parameter optimiser buffers.
#[derive(Debug, Clone, Default)]
pub struct ParamBuffers {
    pub momentum: Option<Tensor>,
    pub exp_avg: Option<Tensor>,
    pub exp_avg_sq: Option<Tensor>,
}

impl ParamBuffers {
    fn detached(&self) -> Self {
        Self {
            momentum: self.momentum.as_ref().map(Tensor::detach),
            exp_avg: self.exp_avg.as_ref().map(Tensor::detach),
            exp_avg_sq: self.exp_avg_sq.as_ref().map(Tensor::detach),
        }
    }

    fn named(&self) -> [(&'static str, Option<&Tensor>); 3] {
        [
            (MOMENTUM_BUFFER, self.momentum.as_ref()),
            (EXP_AVG, self.exp_avg.as_ref()),
            (EXP_AVG_SQ, self.exp_avg_sq.as_ref()),
        ]
    }
}

/// Step count plus buffers, one entry per learner parameter.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    pub step: usize,
    pub buffers: Vec<ParamBuffers>,
}

impl OptimizerState {
    pub fn detached(&self) -> Self {
        Self {
            step: self.step,
            buffers: self.buffers.iter().map(ParamBuffers::detached).collect(),
        }
    }
}

// ── Overrides ───────────────────────────────────────────────────────────────

/// Learnable inner hyper-parameters, one f32 [`Var`] per name. Updates cast
/// them to the parameter dtype, so f64 learners train against them too.
pub struct Overrides {
    entries: Vec<(String, Var)>,
}

impl Overrides {
    pub fn new(values: &BTreeMap<String, Vec<f64>>, device: &Device) -> Result<Self> {
        let entries = values
            .iter()
            .map(|(name, v)| {
                let data: Vec<f32> = v.iter().map(|x| *x as f32).collect();
                let len = data.len();
                Ok((name.clone(), Var::from_vec(data, len, device)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Current learned values.
    pub fn values(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        self.entries
            .iter()
            .map(|(n, v)| {
                let vals: Vec<f32> = v.as_tensor().to_vec1()?;
                Ok((n.clone(), vals.into_iter().map(f64::from).collect()))
            })
            .collect()
    }

    pub fn tensors(&self) -> HashMap<String, Tensor> {
        self.entries
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().detach()))
            .collect()
    }
}

// ── InnerOptimizer (persistent) ─────────────────────────────────────────────

/// The learner's optimiser between inner-loop blocks. Holds plain
/// hyper-parameter values and detached state.
#[derive(Debug, Clone)]
pub struct InnerOptimizer {
    kind: InnerOptimizerKind,
    hyper: BTreeMap<String, f64>,
    state: OptimizerState,
    device: Device,
}

impl InnerOptimizer {
    /// Unset hyper-parameters take the kind's defaults; unknown names are
    /// rejected.
    pub fn new(
        kind: InnerOptimizerKind,
        params: &BTreeMap<String, f64>,
        device: &Device,
    ) -> Result<Self> {
        let known = kind.hyperparameters();
        if let Some(name) = params.keys().find(|n| !known.contains(&n.as_str())) {
            return Err(GtnError::config(format!(
                "unknown {kind:?} hyper-parameter `{name}`"
            )));
        }
        let hyper = known
            .iter()
            .map(|name| {
                let v = params
                    .get(*name)
                    .copied()
                    .or_else(|| kind.default_value(name))
                    .unwrap_or_default();
                (name.to_string(), v)
            })
            .collect();
        Ok(Self {
            kind,
            hyper,
            state: OptimizerState::default(),
            device: device.clone(),
        })
    }

    pub fn kind(&self) -> InnerOptimizerKind {
        self.kind
    }

    pub fn hyperparameter(&self, name: &str) -> Option<f64> {
        self.hyper.get(name).copied()
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Differentiable clone. Overridden names read their [`Var`] so the
    /// outer gradient reaches it; the rest become constants.
    pub fn functional(&self, overrides: &Overrides) -> Result<DiffOptimizer> {
        let known = self.kind.hyperparameters();
        if let Some(name) = overrides.names().find(|n| !known.contains(n)) {
            return Err(GtnError::config(format!(
                "override `{name}` is not a {:?} hyper-parameter",
                self.kind
            )));
        }
        let hyper = self
            .hyper
            .iter()
            .map(|(name, v)| {
                let t = match overrides.get(name) {
                    Some(var) => var.as_tensor().clone(),
                    None => Tensor::new(&[*v as f32], &self.device)?,
                };
                Ok((name.clone(), t))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(DiffOptimizer {
            kind: self.kind,
            hyper,
            state: self.state.clone(),
        })
    }

    /// Take the functional clone's final state, detached.
    pub fn load_functional(&mut self, diff: &DiffOptimizer) {
        self.state = diff.state.detached();
    }

    /// Plain (non-differentiable) update. Returns the new parameters.
    pub fn step(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut diff = self.functional(&Overrides::empty())?;
        let updated = diff.step(params, grads)?;
        self.load_functional(&diff);
        Ok(updated.iter().map(Tensor::detach).collect())
    }

    /// Serialisable state: step count, hyper-parameters (f64, kept on the
    /// CPU), and buffers (`{index}.{buffer}`).
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        out.insert(
            "step".to_string(),
            Tensor::new(&[self.state.step as u32], &Device::Cpu)?,
        );
        for (name, v) in &self.hyper {
            out.insert(
                format!("hyper.{name}"),
                Tensor::new(&[*v], &Device::Cpu)?,
            );
        }
        for (i, buffers) in self.state.buffers.iter().enumerate() {
            for (name, t) in buffers.named() {
                if let Some(t) = t {
                    out.insert(format!("{i}.{name}"), t.clone());
                }
            }
        }
        Ok(out)
    }

    /// Inverse of [`state_tensors`](Self::state_tensors).
    pub fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let step = tensors
            .get("step")
            .ok_or(GtnError::NotPrepared("optimizer state (no `step` entry)"))?
            .to_vec1::<u32>()?;
        let mut state = OptimizerState {
            step: step.first().copied().unwrap_or_default() as usize,
            buffers: Vec::new(),
        };
        for (key, t) in tensors {
            if let Some(name) = key.strip_prefix("hyper.") {
                if let Some(v) = self.hyper.get_mut(name) {
                    *v = t
                        .flatten_all()?
                        .to_dtype(DType::F64)?
                        .to_vec1::<f64>()?
                        .first()
                        .copied()
                        .ok_or_else(|| {
                            GtnError::config(format!("empty hyper-parameter `{name}` in state"))
                        })?;
                }
                continue;
            }
            let Some((index, buffer)) = key.split_once('.') else {
                continue;
            };
            let Ok(index) = index.parse::<usize>() else {
                continue;
            };
            if state.buffers.len() <= index {
                state.buffers.resize(index + 1, ParamBuffers::default());
            }
            let slot = &mut state.buffers[index];
            match buffer {
                MOMENTUM_BUFFER => slot.momentum = Some(t.clone()),
                EXP_AVG => slot.exp_avg = Some(t.clone()),
                EXP_AVG_SQ => slot.exp_avg_sq = Some(t.clone()),
                _ => {}
            }
        }
        self.state = state;
        Ok(())
    }
}

// ── DiffOptimizer (functional) ──────────────────────────────────────────────

/// Differentiable optimiser: every update is built from graph ops on the
/// previous parameters, the gradient, and the hyper-parameter tensors.
pub struct DiffOptimizer {
    kind: InnerOptimizerKind,
    hyper: BTreeMap<String, Tensor>,
    state: OptimizerState,
}

impl DiffOptimizer {
    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    fn hyper(&self, name: &str) -> Result<&Tensor> {
        self.hyper
            .get(name)
            .ok_or_else(|| GtnError::config(format!("missing hyper-parameter `{name}`")))
    }

    /// A hyper-parameter in the parameters' dtype. The cast stays on the graph.
    fn hyper_as(&self, name: &str, dtype: DType) -> Result<Tensor> {
        Ok(self.hyper(name)?.to_dtype(dtype)?)
    }

    /// First element of a hyper-parameter, for on/off decisions.
    fn scalar(&self, name: &str) -> Result<f64> {
        let v = self
            .hyper(name)?
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        Ok(v.first().copied().unwrap_or_default())
    }

    /// One update. `grads[i]` is the gradient for `params[i]`; the returned
    /// parameters stay attached to the graph.
    pub fn step(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<Vec<Tensor>> {
        if params.len() != grads.len() {
            return Err(GtnError::config(format!(
                "{} parameters but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if self.state.buffers.len() != params.len() {
            self.state.buffers.resize(params.len(), ParamBuffers::default());
        }
        self.state.step += 1;
        match self.kind {
            InnerOptimizerKind::Sgd => self.sgd(params, grads),
            InnerOptimizerKind::Adam => self.adam(params, grads),
        }
    }

    fn sgd(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<Vec<Tensor>> {
        let dtype = params.first().map_or(DType::F32, Tensor::dtype);
        let lr = self.hyper_as("lr", dtype)?;
        let momentum = self.hyper_as("momentum", dtype)?;
        let weight_decay = self.hyper_as("weight_decay", dtype)?;
        let keep = self.hyper_as("dampening", dtype)?.affine(-1.0, 1.0)?;
        let use_momentum = self.scalar("momentum")? != 0.0;
        let use_decay = self.scalar("weight_decay")? != 0.0;
        let nesterov = self.scalar("nesterov")? != 0.0;

        let mut out = Vec::with_capacity(params.len());
        for (i, (p, g)) in params.iter().zip(grads).enumerate() {
            let mut d = g.clone();
            if use_decay {
                d = (d + p.broadcast_mul(&weight_decay)?)?;
            }
            if use_momentum {
                let buf = match self.state.buffers[i].momentum.take() {
                    None => d.clone(),
                    Some(b) => (b.broadcast_mul(&momentum)? + d.broadcast_mul(&keep)?)?,
                };
                d = if nesterov {
                    (d + buf.broadcast_mul(&momentum)?)?
                } else {
                    buf.clone()
                };
                self.state.buffers[i].momentum = Some(buf);
            }
            out.push((p - d.broadcast_mul(&lr)?)?);
        }
        Ok(out)
    }

    fn adam(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<Vec<Tensor>> {
        let t = self.state.step as f64;
        let dtype = params.first().map_or(DType::F32, Tensor::dtype);
        let lr = self.hyper_as("lr", dtype)?;
        let beta1 = self.hyper_as("beta1", dtype)?;
        let beta2 = self.hyper_as("beta2", dtype)?;
        let eps = self.hyper_as("eps", dtype)?;
        let weight_decay = self.hyper_as("weight_decay", dtype)?;
        let use_decay = self.scalar("weight_decay")? != 0.0;

        let one_minus_b1 = beta1.affine(-1.0, 1.0)?;
        let one_minus_b2 = beta2.affine(-1.0, 1.0)?;
        let bias1 = beta1.powf(t)?.affine(-1.0, 1.0)?;
        let bias2_sqrt = beta2.powf(t)?.affine(-1.0, 1.0)?.sqrt()?;
        let step_size = lr.broadcast_div(&bias1)?;

        let mut out = Vec::with_capacity(params.len());
        for (i, (p, g)) in params.iter().zip(grads).enumerate() {
            let mut d = g.clone();
            if use_decay {
                d = (d + p.broadcast_mul(&weight_decay)?)?;
            }
            let slot = &mut self.state.buffers[i];
            let m_prev = match slot.exp_avg.take() {
                Some(m) => m,
                None => d.zeros_like()?,
            };
            let v_prev = match slot.exp_avg_sq.take() {
                Some(v) => v,
                None => d.zeros_like()?,
            };
            let m = (m_prev.broadcast_mul(&beta1)? + d.broadcast_mul(&one_minus_b1)?)?;
            let v = (v_prev.broadcast_mul(&beta2)? + d.sqr()?.broadcast_mul(&one_minus_b2)?)?;
            let denom = v
                .affine(1.0, SQRT_FLOOR)?
                .sqrt()?
                .broadcast_div(&bias2_sqrt)?
                .broadcast_add(&eps)?;
            let update = (&m / &denom)?.broadcast_mul(&step_size)?;
            out.push((p - update)?);
            slot.exp_avg = Some(m);
            slot.exp_avg_sq = Some(v);
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vec1(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn plain_sgd_step() {
        let dev = Device::Cpu;
        let params = BTreeMap::from([("lr".to_string(), 0.1)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &params, &dev).unwrap();
        let p = Tensor::new(&[1f32, 2.], &dev).unwrap();
        let g = Tensor::new(&[0.5f32, -1.], &dev).unwrap();
        let out = opt.step(&[p], &[g]).unwrap();
        assert!(close(&vec1(&out[0]), &[0.95, 2.1]));
        assert_eq!(opt.state().step, 1);
        assert!(opt.state().buffers[0].momentum.is_none());
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let dev = Device::Cpu;
        let params = BTreeMap::from([("lr".to_string(), 1.0), ("momentum".to_string(), 0.5)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &params, &dev).unwrap();
        let p = Tensor::new(&[0f32], &dev).unwrap();
        let g = Tensor::new(&[1f32], &dev).unwrap();
        let p1 = opt.step(&[p], &[g.clone()]).unwrap();
        assert!(close(&vec1(&p1[0]), &[-1.0]));
        // buffer = 0.5 * 1 + 1 = 1.5
        let p2 = opt.step(&p1, &[g]).unwrap();
        assert!(close(&vec1(&p2[0]), &[-2.5]));
        let buf = opt.state().buffers[0].momentum.as_ref().unwrap();
        assert!(close(&vec1(buf), &[1.5]));
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let dev = Device::Cpu;
        let params = BTreeMap::from([("lr".to_string(), 0.1)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Adam, &params, &dev).unwrap();
        let p = Tensor::new(&[1f32, -1.], &dev).unwrap();
        let g = Tensor::new(&[3f32, -0.2], &dev).unwrap();
        let out = opt.step(&[p], &[g]).unwrap();
        // bias-corrected first step is lr·sign(g)
        assert!(close(&vec1(&out[0]), &[0.9, -0.9]));
        assert!(opt.state().buffers[0].exp_avg_sq.is_some());
    }

    #[test]
    fn override_value_replaces_hyperparameter() {
        let dev = Device::Cpu;
        let opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &BTreeMap::new(), &dev).unwrap();
        let overrides =
            Overrides::new(&BTreeMap::from([("lr".to_string(), vec![2.0])]), &dev).unwrap();
        let mut diff = opt.functional(&overrides).unwrap();
        let p = Tensor::new(&[1f32], &dev).unwrap();
        let g = Tensor::new(&[1f32], &dev).unwrap();
        let out = diff.step(&[p], &[g]).unwrap();
        assert!(close(&vec1(&out[0]), &[-1.0]));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let dev = Device::Cpu;
        let bad = BTreeMap::from([("beta1".to_string(), 0.9)]);
        assert!(InnerOptimizer::new(InnerOptimizerKind::Sgd, &bad, &dev).is_err());

        let opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &BTreeMap::new(), &dev).unwrap();
        let overrides =
            Overrides::new(&BTreeMap::from([("eps".to_string(), vec![1e-3])]), &dev).unwrap();
        assert!(matches!(
            opt.functional(&overrides),
            Err(GtnError::Configuration(_))
        ));
    }

    #[test]
    fn state_tensors_round_trip() {
        let dev = Device::Cpu;
        let params = BTreeMap::from([("lr".to_string(), 0.1), ("momentum".to_string(), 0.9)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &params, &dev).unwrap();
        let p = Tensor::new(&[1f32, 2.], &dev).unwrap();
        let g = Tensor::new(&[1f32, 1.], &dev).unwrap();
        opt.step(&[p], &[g]).unwrap();

        let saved = opt.state_tensors().unwrap();
        assert!(saved.contains_key("0.momentum_buffer"));
        assert!(saved.contains_key("hyper.lr"));

        let mut restored =
            InnerOptimizer::new(InnerOptimizerKind::Sgd, &BTreeMap::new(), &dev).unwrap();
        restored.load_state_tensors(&saved).unwrap();
        assert_eq!(restored.state().step, 1);
        assert_eq!(restored.hyperparameter("momentum"), Some(0.9));
        let buf = restored.state().buffers[0].momentum.as_ref().unwrap();
        assert!(close(&vec1(buf), &[1.0, 1.0]));
    }
    #[test]
    fn empty_hyperparameter_in_state_is_an_error() {
        let dev = Device::Cpu;
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &BTreeMap::new(), &dev).unwrap();
        let tensors = HashMap::from([
            ("step".to_string(), Tensor::new(&[3u32], &dev).unwrap()),
            ("hyper.lr".to_string(), Tensor::zeros(0, DType::F64, &dev).unwrap()),
        ]);
        assert!(matches!(
            opt.load_state_tensors(&tensors),
            Err(GtnError::Configuration(_))
        ));
    }

    #[test]
    fn f64_parameters_step_with_f32_hyperparameters() {
        let dev = Device::Cpu;
        let sgd = BTreeMap::from([("lr".to_string(), 1.0), ("momentum".to_string(), 0.5)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &sgd, &dev).unwrap();
        let p = Tensor::new(&[0f64], &dev).unwrap();
        let g = Tensor::new(&[1f64], &dev).unwrap();
        let p1 = opt.step(&[p], &[g.clone()]).unwrap();
        let p2 = opt.step(&p1, &[g.clone()]).unwrap();
        assert_eq!(p2[0].dtype(), DType::F64);
        assert_eq!(p2[0].to_vec1::<f64>().unwrap(), vec![-2.5]);

        let adam = BTreeMap::from([("lr".to_string(), 0.1)]);
        let mut opt = InnerOptimizer::new(InnerOptimizerKind::Adam, &adam, &dev).unwrap();
        let p = Tensor::new(&[1f64], &dev).unwrap();
        let out = opt.step(&[p], &[g]).unwrap();
        let v = out[0].to_vec1::<f64>().unwrap()[0];
        assert!((v - 0.9).abs() < 1e-5);
    }

    #[test]
    fn override_gradient_flows_from_f64_parameters() {
        let dev = Device::Cpu;
        let opt = InnerOptimizer::new(InnerOptimizerKind::Sgd, &BTreeMap::new(), &dev).unwrap();
        let overrides =
            Overrides::new(&BTreeMap::from([("lr".to_string(), vec![0.5])]), &dev).unwrap();
        let mut diff = opt.functional(&overrides).unwrap();
        let p = Tensor::new(&[1f64, 2.], &dev).unwrap();
        let g = Tensor::new(&[1f64, 3.], &dev).unwrap();
        let out = diff.step(&[p], &[g]).unwrap();
        let grads = out[0].sum_all().unwrap().backward().unwrap();
        let lr = overrides.get("lr").unwrap();
        // d/dlr sum(p - lr·g) = -sum(g)
        let dlr = grads.get(lr.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!(close(&dlr, &[-4.0]));
    }
}
