use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{bail, DType, Result, Tensor, Var};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub step_size: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn new(step_size: f64) -> Self {
        Self {
            step_size,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

/// When to emit periodic side effects, instead of hard-coded modulo checks.
#[derive(Debug, Clone)]
pub struct DiagnosticPolicy {
    /// Log objective value and gradient norm every this many iterations
    pub log_every: usize,
    /// Fire the caller's checkpoint hook every this many iterations
    pub checkpoint_every: usize,
}

impl Default for DiagnosticPolicy {
    fn default() -> Self {
        Self {
            log_every: 100,
            checkpoint_every: 200,
        }
    }
}

/// Loop-level configuration for one optimization run.
#[derive(Clone)]
pub struct RunConfig {
    /// Fixed iteration budget; the only termination criterion
    pub max_iter: usize,
    pub diagnostics: DiagnosticPolicy,
    pub show_progress: bool,
    pub verbose: bool,
    /// Checked once per iteration boundary
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunConfig {
    pub fn new(max_iter: usize) -> Self {
        Self {
            max_iter,
            diagnostics: DiagnosticPolicy::default(),
            show_progress: true,
            verbose: false,
            cancel: None,
        }
    }
}

/// Adam state over one flat parameter vector. The moment estimates live
/// here and nowhere else; they are zeroed at construction and dropped with
/// the optimizer.
pub struct Adam {
    cfg: AdamConfig,
    m: Tensor,
    v: Tensor,
    t: usize,
}

impl Adam {
    pub fn new(cfg: AdamConfig, params: &Tensor) -> Result<Self> {
        let m = params.zeros_like()?;
        let v = params.zeros_like()?;
        Ok(Self { cfg, m, v, t: 0 })
    }

    /// One bias-corrected update in place.
    pub fn step(&mut self, params: &Var, grad: &Tensor) -> Result<()> {
        let c = &self.cfg;
        let m = ((&self.m * c.beta1)? + (grad * (1.0 - c.beta1))?)?;
        let v = ((&self.v * c.beta2)? + (grad.sqr()? * (1.0 - c.beta2))?)?;

        let t = (self.t + 1) as i32;
        let m_hat = (&m / (1.0 - c.beta1.powi(t)))?;
        let v_hat = (&v / (1.0 - c.beta2.powi(t)))?;

        let step = (m_hat * c.step_size)?.div(&(v_hat.sqrt()? + c.epsilon)?)?;
        params.set(&(params.as_tensor() - step)?.detach())?;

        self.m = m.detach();
        self.v = v.detach();
        self.t += 1;
        Ok(())
    }
}

/// Minimize a differentiable objective by Adam over a flat parameter vector.
///
/// The objective must build its value from the tensor handed to it so the
/// backward pass reaches the parameters. The callback fires once per
/// iteration after the update with `(params, t, gradient)`; its effects are
/// the caller's business and nothing it produces feeds back into the loop.
///
/// A non-finite objective value is reported at warn level and the update is
/// applied regardless; the run only ends at the iteration budget or when the
/// cancel flag is raised.
///
/// # Returns `(final parameters, objective trace)`
pub fn run_adam<F, C>(
    mut objective: F,
    init: &Tensor,
    adam_cfg: &AdamConfig,
    run_cfg: &RunConfig,
    mut callback: C,
) -> Result<(Tensor, Vec<f64>)>
where
    F: FnMut(&Tensor, usize) -> Result<Tensor>,
    C: FnMut(&Tensor, usize, &Tensor) -> Result<()>,
{
    let params = Var::from_tensor(init)?;
    let mut adam = Adam::new(adam_cfg.clone(), init)?;

    let pb = ProgressBar::new(run_cfg.max_iter as u64);
    if !run_cfg.show_progress || run_cfg.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = Vec::with_capacity(run_cfg.max_iter);
    let log_every = run_cfg.diagnostics.log_every;

    for t in 0..run_cfg.max_iter {
        if let Some(flag) = &run_cfg.cancel {
            if flag.load(Ordering::Relaxed) {
                info!("[{}] optimization cancelled", t);
                break;
            }
        }

        let loss = objective(params.as_tensor(), t)?;
        let fe = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !fe.is_finite() {
            warn!("[{}] non-finite free energy: {}", t, fe);
        }
        trace.push(fe);

        let grads = loss.backward()?;
        let grad = match grads.get(params.as_tensor()) {
            Some(g) => g.clone(),
            None => bail!("objective does not depend on the parameter vector"),
        };

        if run_cfg.verbose && log_every > 0 && t % log_every == 0 {
            let grad_mag = grad
                .sqr()?
                .sum_all()?
                .sqrt()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            info!("[{}] free energy: {:.6} |grad|: {:.3}", t, fe, grad_mag);
        }

        adam.step(&params, &grad)?;
        callback(params.as_tensor(), t, &grad)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok((params.as_tensor().detach(), trace))
}
