use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Per-sample log-density under the standard Gaussian:
///
/// log q0(z) = -D/2·ln(2π) - ½·Σ_d z_d²
///
/// * `z_nd` - batch (n x d)
///
/// # Returns log-density per sample (n)
pub fn log_std_normal(z_nd: &Tensor) -> Result<Tensor> {
    let (_n, d) = z_nd.dims2()?;
    let half_ln_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
    (z_nd.sqr()?.sum(1)? * (-0.5))? - (d as f64) * half_ln_2pi
}

/// Shift and scale raw noise into the base sample:
///
/// z0 = eps · exp(½·log_sigma_diag0) + mu0
///
/// `mu0` and `log_sigma_diag0` may be shared `(d)` vectors or per-sample
/// `(n x d)` matrices; broadcasting covers both.
pub fn reparameterize(eps_nd: &Tensor, mu0: &Tensor, log_sigma_diag0: &Tensor) -> Result<Tensor> {
    let sd = (log_sigma_diag0 * 0.5)?.exp()?;
    eps_nd.broadcast_mul(&sd)?.broadcast_add(mu0)
}

/// Seeded standard-normal noise source.
///
/// Passed explicitly into every sampling call; the crate keeps no ambient
/// random state. Two sources built from the same seed produce identical
/// draw sequences.
pub struct NoiseSource {
    rng: StdRng,
    device: Device,
    dtype: DType,
}

impl NoiseSource {
    pub fn new(seed: u64, device: &Device, dtype: DType) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
            dtype,
        }
    }

    /// Draw an (n x d) batch of standard-normal noise.
    pub fn standard_normal(&mut self, n: usize, d: usize) -> Result<Tensor> {
        let data: Vec<f64> = (0..n * d)
            .map(|_| self.rng.sample::<f64, _>(StandardNormal))
            .collect();
        Tensor::from_vec(data, (n, d), &self.device)?.to_dtype(self.dtype)
    }

    /// Draw a flat vector of standard-normal noise.
    pub fn standard_normal_vec(&mut self, len: usize) -> Result<Tensor> {
        let data: Vec<f64> = (0..len)
            .map(|_| self.rng.sample::<f64, _>(StandardNormal))
            .collect();
        Tensor::from_vec(data, len, &self.device)?.to_dtype(self.dtype)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
