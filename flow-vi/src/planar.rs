use candle_core::{bail, Result, Tensor};

use crate::likelihood::softplus;

/// Default stabilizer added inside the log-determinant.
pub const DET_FLOOR: f64 = 1e-7;

/// One invertible planar map over a batch of latent vectors.
///
/// `z' = z + u ⊗ tanh(z·w + b)`
///
/// The Jacobian of this map is a rank-one correction of the identity, so its
/// determinant collapses to a scalar per sample:
///
/// `ψ = (1 − tanh²(z·w + b)) · w`, `logdet = ln(ε + |1 + u·ψ|)`
///
/// The absolute value is taken unconditionally; a negative determinant term
/// is not an error here. Setting `strict_invertible` instead reparameterizes
/// the scale so that `1 + u·ψ` stays positive.
#[derive(Debug, Clone)]
pub struct PlanarTransform {
    det_floor: f64,
    strict_invertible: bool,
}

impl Default for PlanarTransform {
    fn default() -> Self {
        Self {
            det_floor: DET_FLOOR,
            strict_invertible: false,
        }
    }
}

impl PlanarTransform {
    pub fn new(det_floor: f64, strict_invertible: bool) -> Self {
        Self {
            det_floor,
            strict_invertible,
        }
    }

    /// Apply the map to a batch and report the per-sample log-determinant.
    ///
    /// * `z_nd` - latent batch (n x d)
    /// * `w` - direction, (1 x d) shared or (n x d) per sample
    /// * `u` - scale, same shape as `w`
    /// * `b` - bias, (1 x 1) shared or (n x 1) per sample
    ///
    /// # Returns `(z_next, logdet)`
    /// * `z_next` - transformed batch (n x d)
    /// * `logdet` - log-determinant contribution (n)
    pub fn forward(
        &self,
        z_nd: &Tensor,
        w: &Tensor,
        u: &Tensor,
        b: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (n, d) = z_nd.dims2()?;
        let (rows, width) = w.dims2()?;
        if width != d {
            bail!(
                "planar direction has width {} but the latent batch has dimension {}",
                width,
                d
            );
        }
        if rows != 1 && rows != n {
            bail!(
                "planar parameters have {} rows; expected 1 (shared) or {} (per sample)",
                rows,
                n
            );
        }
        if u.dims() != w.dims() {
            bail!(
                "planar scale shape {:?} does not match direction shape {:?}",
                u.dims(),
                w.dims()
            );
        }
        let (b_rows, b_cols) = b.dims2()?;
        if b_cols != 1 || b_rows != rows {
            bail!(
                "planar bias shape {:?} does not match parameter rows {}",
                b.dims(),
                rows
            );
        }

        let u = if self.strict_invertible {
            self.constrained_scale(w, u)?
        } else {
            u.clone()
        };

        let act_n1 = z_nd
            .broadcast_mul(w)?
            .sum_keepdim(1)?
            .broadcast_add(b)?
            .tanh()?;
        let z_next = z_nd.broadcast_add(&act_n1.broadcast_mul(&u)?)?;

        let psi_nd = act_n1.sqr()?.affine(-1.0, 1.0)?.broadcast_mul(w)?;
        let det_n = (psi_nd.broadcast_mul(&u)?.sum(1)? + 1.0)?;
        let logdet_n = (det_n.abs()? + self.det_floor)?.log()?;

        Ok((z_next, logdet_n))
    }

    /// ψ(z) = (1 − tanh²(z·w + b)) · w, shape (n x d).
    pub fn psi(&self, z_nd: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
        let act_n1 = z_nd
            .broadcast_mul(w)?
            .sum_keepdim(1)?
            .broadcast_add(b)?
            .tanh()?;
        act_n1.sqr()?.affine(-1.0, 1.0)?.broadcast_mul(w)
    }

    /// Reparameterize the scale so that `w·û ≥ −1` holds row-wise:
    ///
    /// `û = u + (m(w·u) − w·u) · w / ‖w‖²` with `m(x) = −1 + softplus(x)`
    pub fn constrained_scale(&self, w: &Tensor, u: &Tensor) -> Result<Tensor> {
        let wu = w.mul(u)?.sum_keepdim(1)?;
        let m_wu = (softplus(&wu)? - 1.0)?;
        let w_norm_sq = w.sqr()?.sum_keepdim(1)?;
        let coef = ((m_wu - &wu)? / (w_norm_sq + self.det_floor)?)?;
        u.broadcast_add(&coef.broadcast_mul(w)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn forward_shapes_shared_params() -> Result<()> {
        let device = Device::Cpu;
        let flow = PlanarTransform::default();

        let z = Tensor::randn(0f32, 1f32, (5, 3), &device)?;
        let w = Tensor::randn(0f32, 1f32, (1, 3), &device)?;
        let u = Tensor::randn(0f32, 1f32, (1, 3), &device)?;
        let b = Tensor::zeros((1, 1), candle_core::DType::F32, &device)?;

        let (z_next, logdet) = flow.forward(&z, &w, &u, &b)?;
        assert_eq!(z_next.dims(), &[5, 3]);
        assert_eq!(logdet.dims(), &[5]);

        Ok(())
    }

    #[test]
    fn forward_shapes_per_sample_params() -> Result<()> {
        let device = Device::Cpu;
        let flow = PlanarTransform::default();

        let z = Tensor::randn(0f32, 1f32, (4, 2), &device)?;
        let w = Tensor::randn(0f32, 1f32, (4, 2), &device)?;
        let u = Tensor::randn(0f32, 1f32, (4, 2), &device)?;
        let b = Tensor::randn(0f32, 1f32, (4, 1), &device)?;

        let (z_next, logdet) = flow.forward(&z, &w, &u, &b)?;
        assert_eq!(z_next.dims(), &[4, 2]);
        assert_eq!(logdet.dims(), &[4]);

        Ok(())
    }

    #[test]
    fn rejects_mismatched_direction() -> Result<()> {
        let device = Device::Cpu;
        let flow = PlanarTransform::default();

        let z = Tensor::randn(0f32, 1f32, (4, 3), &device)?;
        let w = Tensor::randn(0f32, 1f32, (1, 2), &device)?;
        let u = Tensor::randn(0f32, 1f32, (1, 2), &device)?;
        let b = Tensor::zeros((1, 1), candle_core::DType::F32, &device)?;

        assert!(flow.forward(&z, &w, &u, &b).is_err());
        Ok(())
    }

    #[test]
    fn logdet_matches_finite_difference() -> Result<()> {
        let device = Device::Cpu;
        let flow = PlanarTransform::new(0.0, false);

        let w = Tensor::new(&[[0.6f64, -0.4]], &device)?;
        let u = Tensor::new(&[[0.3f64, 0.5]], &device)?;
        let b = Tensor::new(&[[0.2f64]], &device)?;

        let z = [0.7f64, -0.3];
        let h = 1e-5;

        let push = |zv: &[f64]| -> Result<Vec<f64>> {
            let zt = Tensor::from_vec(zv.to_vec(), (1, 2), &device)?;
            let (z_next, _) = flow.forward(&zt, &w, &u, &b)?;
            z_next.flatten_all()?.to_vec1::<f64>()
        };

        let mut jac = [[0f64; 2]; 2];
        for j in 0..2 {
            let mut zp = z;
            let mut zm = z;
            zp[j] += h;
            zm[j] -= h;
            let fp = push(&zp)?;
            let fm = push(&zm)?;
            for i in 0..2 {
                jac[i][j] = (fp[i] - fm[i]) / (2.0 * h);
            }
        }
        let det = jac[0][0] * jac[1][1] - jac[0][1] * jac[1][0];

        let zt = Tensor::from_vec(z.to_vec(), (1, 2), &device)?;
        let (_, logdet) = flow.forward(&zt, &w, &u, &b)?;
        let analytic = logdet.to_vec1::<f64>()?[0];

        assert_abs_diff_eq!(analytic, det.abs().ln(), epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn strict_scale_respects_invertibility_bound() -> Result<()> {
        let device = Device::Cpu;
        let flow = PlanarTransform::new(DET_FLOOR, true);

        // w·u = -6, far past the -1 invertibility boundary
        let w = Tensor::new(&[[2.0f64]], &device)?;
        let u = Tensor::new(&[[-3.0f64]], &device)?;

        let u_hat = flow.constrained_scale(&w, &u)?;
        let wu_hat = w.mul(&u_hat)?.sum_all()?.to_scalar::<f64>()?;
        assert!(wu_hat > -1.0, "w·û = {} still violates the bound", wu_hat);

        Ok(())
    }
}
