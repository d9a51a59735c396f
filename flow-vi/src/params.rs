use candle_core::{bail, Result, Tensor};

/// Flat layout of the direct variational parameter vector:
///
/// `[mu0 (d) | log_sigma_diag0 (d) | W (k·d) | U (k·d) | b (k)]`
///
/// Unpacking uses narrow/reshape views so gradients keep flowing back to
/// the flat vector; pack followed by unpack (and the reverse) is exact.
#[derive(Debug, Clone, Copy)]
pub struct FlowLayout {
    pub dim_z: usize,
    pub n_flows: usize,
}

impl FlowLayout {
    pub fn new(dim_z: usize, n_flows: usize) -> Self {
        Self { dim_z, n_flows }
    }

    pub fn num_params(&self) -> usize {
        2 * self.dim_z + 2 * self.n_flows * self.dim_z + self.n_flows
    }

    pub fn unpack(&self, params: &Tensor) -> Result<FlowPosterior> {
        let expected = self.num_params();
        let got = params.dims1()?;
        if got != expected {
            bail!(
                "parameter vector has {} entries but layout (dim_z={}, n_flows={}) needs {}",
                got,
                self.dim_z,
                self.n_flows,
                expected
            );
        }
        let d = self.dim_z;
        let k = self.n_flows;

        let mu0 = params.narrow(0, 0, d)?;
        let log_sigma_diag0 = params.narrow(0, d, d)?;
        let w = params.narrow(0, 2 * d, k * d)?.reshape((k, d))?;
        let u = params.narrow(0, 2 * d + k * d, k * d)?.reshape((k, d))?;
        let b = params.narrow(0, 2 * d + 2 * k * d, k)?;

        Ok(FlowPosterior {
            mu0,
            log_sigma_diag0,
            w,
            u,
            b,
        })
    }

    pub fn pack(&self, phi: &FlowPosterior) -> Result<Tensor> {
        phi.validate(self)?;
        let w_flat = phi.w.flatten_all()?;
        let u_flat = phi.u.flatten_all()?;
        Tensor::cat(
            &[&phi.mu0, &phi.log_sigma_diag0, &w_flat, &u_flat, &phi.b],
            0,
        )
    }
}

/// Variational parameters shared across the batch.
#[derive(Debug, Clone)]
pub struct FlowPosterior {
    /// Base mean (d)
    pub mu0: Tensor,
    /// Base log-variance diagonal (d)
    pub log_sigma_diag0: Tensor,
    /// Flow directions (k x d)
    pub w: Tensor,
    /// Flow scales (k x d)
    pub u: Tensor,
    /// Flow biases (k)
    pub b: Tensor,
}

impl FlowPosterior {
    pub fn validate(&self, layout: &FlowLayout) -> Result<()> {
        let d = layout.dim_z;
        let k = layout.n_flows;
        if self.mu0.dims() != [d] {
            bail!("mu0 has shape {:?}, expected ({})", self.mu0.dims(), d);
        }
        if self.log_sigma_diag0.dims() != [d] {
            bail!(
                "log_sigma_diag0 has shape {:?}, expected ({})",
                self.log_sigma_diag0.dims(),
                d
            );
        }
        if self.w.dims() != [k, d] {
            bail!("W has shape {:?}, expected ({}, {})", self.w.dims(), k, d);
        }
        if self.u.dims() != [k, d] {
            bail!("U has shape {:?}, expected ({}, {})", self.u.dims(), k, d);
        }
        if self.b.dims() != [k] {
            bail!("b has shape {:?}, expected ({})", self.b.dims(), k);
        }
        Ok(())
    }

    /// Parameters of layer `k` shaped for broadcasting: (1 x d), (1 x d), (1 x 1).
    pub fn layer(&self, k: usize) -> Result<(Tensor, Tensor, Tensor)> {
        let w = self.w.narrow(0, k, 1)?;
        let u = self.u.narrow(0, k, 1)?;
        let b = self.b.narrow(0, k, 1)?.reshape((1, 1))?;
        Ok((w, u, b))
    }
}

/// Variational parameters produced per sample by an encoder.
#[derive(Debug, Clone)]
pub struct AmortizedPosterior {
    /// Base means (n x d)
    pub mu0: Tensor,
    /// Base log-variance diagonals (n x d)
    pub log_sigma_diag0: Tensor,
    /// Flow directions (k x n x d)
    pub w: Tensor,
    /// Flow scales (k x n x d)
    pub u: Tensor,
    /// Flow biases (k x n)
    pub b: Tensor,
}

impl AmortizedPosterior {
    pub fn validate(&self, n: usize, d: usize, k: usize) -> Result<()> {
        if self.mu0.dims() != [n, d] {
            bail!("mu0 has shape {:?}, expected ({}, {})", self.mu0.dims(), n, d);
        }
        if self.log_sigma_diag0.dims() != [n, d] {
            bail!(
                "log_sigma_diag0 has shape {:?}, expected ({}, {})",
                self.log_sigma_diag0.dims(),
                n,
                d
            );
        }
        if self.w.dims() != [k, n, d] {
            bail!(
                "W has shape {:?}, expected ({}, {}, {})",
                self.w.dims(),
                k,
                n,
                d
            );
        }
        if self.u.dims() != [k, n, d] {
            bail!(
                "U has shape {:?}, expected ({}, {}, {})",
                self.u.dims(),
                k,
                n,
                d
            );
        }
        if self.b.dims() != [k, n] {
            bail!("b has shape {:?}, expected ({}, {})", self.b.dims(), k, n);
        }
        Ok(())
    }

    /// Parameters of layer `k` shaped per sample: (n x d), (n x d), (n x 1).
    pub fn layer(&self, k: usize) -> Result<(Tensor, Tensor, Tensor)> {
        let w = self.w.get(k)?;
        let u = self.u.get(k)?;
        let b = self.b.get(k)?.unsqueeze(1)?;
        Ok((w, u, b))
    }
}

/// Split of the concatenated encoder/decoder weight vector.
#[derive(Debug, Clone, Copy)]
pub struct AmortizedLayout {
    pub n_encoder: usize,
    pub n_decoder: usize,
}

impl AmortizedLayout {
    pub fn num_params(&self) -> usize {
        self.n_encoder + self.n_decoder
    }

    pub fn unpack(&self, params: &Tensor) -> Result<(Tensor, Tensor)> {
        let got = params.dims1()?;
        if got != self.num_params() {
            bail!(
                "weight vector has {} entries but encoder/decoder need {} + {}",
                got,
                self.n_encoder,
                self.n_decoder
            );
        }
        let phi_w = params.narrow(0, 0, self.n_encoder)?;
        let theta_w = params.narrow(0, self.n_encoder, self.n_decoder)?;
        Ok((phi_w, theta_w))
    }

    pub fn pack(&self, phi_w: &Tensor, theta_w: &Tensor) -> Result<Tensor> {
        if phi_w.dims1()? != self.n_encoder {
            bail!(
                "encoder weights have {} entries, expected {}",
                phi_w.dims1()?,
                self.n_encoder
            );
        }
        if theta_w.dims1()? != self.n_decoder {
            bail!(
                "decoder weights have {} entries, expected {}",
                theta_w.dims1()?,
                self.n_decoder
            );
        }
        Tensor::cat(&[phi_w, theta_w], 0)
    }
}
