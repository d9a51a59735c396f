use candle_core::{bail, Result, Tensor};

use crate::feedforward::{DecodeModule, EncodeModule};
use crate::gaussian::{log_std_normal, reparameterize};
use crate::params::{AmortizedPosterior, FlowLayout, FlowPosterior};
use crate::planar::{PlanarTransform, DET_FLOOR};

/// Everything the objective closes over, passed by value. No hidden state.
#[derive(Debug, Clone)]
pub struct FreeEnergyConfig {
    /// Latent dimension D
    pub dim_z: usize,
    /// Number of planar layers K
    pub n_flows: usize,
    /// Monte Carlo batch size N
    pub n_samples: usize,
    /// Iteration budget, also the anchor of the cooling schedule
    pub max_iter: usize,
    /// Stabilizer inside the log-determinant
    pub det_floor: f64,
    /// Scale the likelihood term by the cooling fraction
    pub tempered: bool,
    /// Reparameterize flow scales to keep each layer invertible
    pub strict_invertible: bool,
}

impl FreeEnergyConfig {
    pub fn new(dim_z: usize, n_flows: usize, n_samples: usize, max_iter: usize) -> Self {
        Self {
            dim_z,
            n_flows,
            n_samples,
            max_iter,
            det_floor: DET_FLOOR,
            tempered: false,
            strict_invertible: false,
        }
    }

    pub fn layout(&self) -> FlowLayout {
        FlowLayout::new(self.dim_z, self.n_flows)
    }
}

/// Free energy (negative evidence lower bound) of the flow posterior:
///
/// F = mean(log q0(eps)) - mean(log p(x, zK)) - mean(Σ_k logdet_k)
///
/// A pure, differentiable function of the noise batch and the parameters;
/// minimizing it maximizes the evidence lower bound. The base density is
/// evaluated on the raw pre-affine noise.
pub struct FreeEnergy {
    cfg: FreeEnergyConfig,
    planar: PlanarTransform,
}

impl FreeEnergy {
    pub fn new(cfg: FreeEnergyConfig) -> Self {
        let planar = PlanarTransform::new(cfg.det_floor, cfg.strict_invertible);
        Self { cfg, planar }
    }

    pub fn config(&self) -> &FreeEnergyConfig {
        &self.cfg
    }

    /// Annealing coefficient for the likelihood term:
    ///
    /// beta_t = min(1, 0.001 + t / cooling_max), cooling_max = min(max_iter/2, 10000)
    ///
    /// Only multiplied into the objective when `tempered` is set.
    pub fn cooling_fraction(&self, t: usize) -> f64 {
        let cooling_max = ((self.cfg.max_iter as f64) / 2.0).min(10_000.0);
        (0.001 + (t as f64) / cooling_max).min(1.0)
    }

    /// Push a base sample through all K layers.
    ///
    /// # Returns `(zK, logdet)`
    /// * `zK` - transformed batch (n x d)
    /// * `logdet` - summed log-determinant contributions (n)
    pub fn transform(&self, z0: &Tensor, phi: &FlowPosterior) -> Result<(Tensor, Tensor)> {
        self.flow_chain(z0, |k| phi.layer(k))
    }

    /// Per-sample variant of [`FreeEnergy::transform`].
    pub fn transform_amortized(
        &self,
        z0: &Tensor,
        post: &AmortizedPosterior,
    ) -> Result<(Tensor, Tensor)> {
        self.flow_chain(z0, |k| post.layer(k))
    }

    fn flow_chain<F>(&self, z0: &Tensor, layer: F) -> Result<(Tensor, Tensor)>
    where
        F: Fn(usize) -> Result<(Tensor, Tensor, Tensor)>,
    {
        let (n, _d) = z0.dims2()?;
        let mut zk = z0.clone();
        let mut logdet = Tensor::zeros(n, z0.dtype(), z0.device())?;
        for k in 0..self.cfg.n_flows {
            let (w, u, b) = layer(k)?;
            let (z_next, ld) = self.planar.forward(&zk, &w, &u, &b)?;
            zk = z_next;
            logdet = (logdet + ld)?;
        }
        Ok((zk, logdet))
    }

    /// Scalar free energy for shared variational parameters.
    ///
    /// * `eps0` - raw standard-normal noise (n x d)
    /// * `phi` - variational parameters
    /// * `logp` - joint log-density of data and latents, per sample
    /// * `t` - iteration index, drives the cooling schedule
    pub fn evaluate<L>(
        &self,
        eps0: &Tensor,
        phi: &FlowPosterior,
        logp: &L,
        t: usize,
    ) -> Result<Tensor>
    where
        L: Fn(&Tensor) -> Result<Tensor>,
    {
        self.check_noise(eps0)?;
        phi.validate(&self.cfg.layout())?;

        let z0 = reparameterize(eps0, &phi.mu0, &phi.log_sigma_diag0)?;
        let (zk, logdet) = self.transform(&z0, phi)?;

        let lp = logp(&zk)?;
        if lp.dims1()? != self.cfg.n_samples {
            bail!(
                "likelihood returned {} values for {} samples",
                lp.dims1()?,
                self.cfg.n_samples
            );
        }
        self.assemble(eps0, &lp, &logdet, t)
    }

    /// Scalar free energy with encoder-produced per-sample parameters and a
    /// decoder mapping latents to likelihood parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_amortized<E, Dm, L>(
        &self,
        eps0: &Tensor,
        x_nd: &Tensor,
        phi_w: &Tensor,
        theta_w: &Tensor,
        encoder: &E,
        decoder: &Dm,
        llik: &L,
        t: usize,
    ) -> Result<Tensor>
    where
        E: EncodeModule,
        Dm: DecodeModule,
        L: Fn(&Tensor, &Tensor, &Tensor) -> Result<Tensor>,
    {
        self.check_noise(eps0)?;
        let n = x_nd.dim(0)?;
        if n != self.cfg.n_samples {
            bail!(
                "data batch has {} rows but the objective draws {} samples",
                n,
                self.cfg.n_samples
            );
        }

        let post = encoder.forward(phi_w, x_nd)?;
        post.validate(n, self.cfg.dim_z, self.cfg.n_flows)?;

        let z0 = reparameterize(eps0, &post.mu0, &post.log_sigma_diag0)?;
        let (zk, logdet) = self.transform_amortized(&z0, &post)?;

        let decoded = decoder.forward(theta_w, &zk)?;
        let lp = llik(x_nd, &zk, &decoded)?;
        if lp.dims1()? != n {
            bail!("likelihood returned {} values for {} samples", lp.dims1()?, n);
        }
        self.assemble(eps0, &lp, &logdet, t)
    }

    fn assemble(&self, eps0: &Tensor, lp: &Tensor, logdet: &Tensor, t: usize) -> Result<Tensor> {
        let base = log_std_normal(eps0)?.mean_all()?;
        let mut lp_mean = lp.mean_all()?;
        if self.cfg.tempered {
            lp_mean = (lp_mean * self.cooling_fraction(t))?;
        }
        let logdet_mean = logdet.mean_all()?;
        (base - lp_mean)? - logdet_mean
    }

    fn check_noise(&self, eps0: &Tensor) -> Result<()> {
        let (n, d) = eps0.dims2()?;
        if n != self.cfg.n_samples || d != self.cfg.dim_z {
            bail!(
                "noise batch has shape ({}, {}) but the objective expects ({}, {})",
                n,
                d,
                self.cfg.n_samples,
                self.cfg.dim_z
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::NoiseSource;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device, Var};

    #[test]
    fn cooling_schedule_endpoints() {
        let fe = FreeEnergy::new(FreeEnergyConfig::new(1, 1, 10, 20_000));
        assert_abs_diff_eq!(fe.cooling_fraction(0), 0.001, epsilon = 1e-12);
        assert_abs_diff_eq!(fe.cooling_fraction(10_000), 1.0, epsilon = 1e-12);

        let fe = FreeEnergy::new(FreeEnergyConfig::new(1, 1, 10, 1000));
        assert_abs_diff_eq!(fe.cooling_fraction(250), 0.501, epsilon = 1e-12);
    }

    #[test]
    fn evaluate_is_scalar_and_differentiable() -> Result<()> {
        let device = Device::Cpu;
        let cfg = FreeEnergyConfig::new(2, 2, 16, 100);
        let layout = cfg.layout();
        let fe = FreeEnergy::new(cfg.clone());

        let mut noise = NoiseSource::new(0, &device, DType::F64);
        let eps0 = noise.standard_normal(cfg.n_samples, cfg.dim_z)?;

        let init = noise.standard_normal_vec(layout.num_params())?;
        let params = Var::from_tensor(&(init * 0.1)?)?;
        let phi = layout.unpack(params.as_tensor())?;

        let loss = fe.evaluate(&eps0, &phi, &log_std_normal, 0)?;
        assert!(loss.dims().is_empty());
        assert!(loss.to_scalar::<f64>()?.is_finite());

        let grads = loss.backward()?;
        let grad = grads.get(params.as_tensor());
        assert!(grad.is_some(), "no gradient reached the parameter vector");
        assert_eq!(grad.unwrap().dims(), &[layout.num_params()]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_noise_shape() -> Result<()> {
        let device = Device::Cpu;
        let cfg = FreeEnergyConfig::new(2, 1, 8, 100);
        let layout = cfg.layout();
        let fe = FreeEnergy::new(cfg);

        let params = Tensor::zeros(layout.num_params(), DType::F64, &device)?;
        let phi = layout.unpack(&params)?;
        let eps0 = Tensor::zeros((8, 3), DType::F64, &device)?;

        assert!(fe.evaluate(&eps0, &phi, &log_std_normal, 0).is_err());
        Ok(())
    }

    #[test]
    fn tempering_scales_the_likelihood_term() -> Result<()> {
        let device = Device::Cpu;

        let plain_cfg = FreeEnergyConfig::new(1, 0, 4, 1000);
        let mut cooled_cfg = plain_cfg.clone();
        cooled_cfg.tempered = true;

        let layout = plain_cfg.layout();
        let params = Tensor::zeros(layout.num_params(), DType::F64, &device)?;
        let phi = layout.unpack(&params)?;

        let mut noise = NoiseSource::new(1, &device, DType::F64);
        let eps0 = noise.standard_normal(4, 1)?;

        let c = 3.0;
        let constant_lp = move |z: &Tensor| -> Result<Tensor> {
            let n = z.dim(0)?;
            Tensor::full(c, n, z.device())?.to_dtype(z.dtype())
        };

        let plain = FreeEnergy::new(plain_cfg)
            .evaluate(&eps0, &phi, &constant_lp, 0)?
            .to_scalar::<f64>()?;
        let cooled_fe = FreeEnergy::new(cooled_cfg);
        let beta = cooled_fe.cooling_fraction(0);
        let cooled = cooled_fe
            .evaluate(&eps0, &phi, &constant_lp, 0)?
            .to_scalar::<f64>()?;

        // only the likelihood term shrinks, by exactly (1 - beta)·c
        assert_abs_diff_eq!(cooled - plain, (1.0 - beta) * c, epsilon = 1e-9);
        Ok(())
    }
}
