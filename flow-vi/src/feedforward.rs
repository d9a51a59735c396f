use candle_core::{bail, Result, Tensor};
use candle_nn::ops;

use crate::gaussian::NoiseSource;
use crate::params::AmortizedPosterior;

#[derive(Debug, Clone, Copy)]
pub enum Nonlinearity {
    Tanh,
    Relu,
    Sigmoid,
}

impl Nonlinearity {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Nonlinearity::Tanh => x.tanh(),
            Nonlinearity::Relu => x.relu(),
            Nonlinearity::Sigmoid => ops::sigmoid(x),
        }
    }
}

/// Recognition network contract.
///
/// Maps a flat weight vector and a data batch to per-sample variational
/// parameters. Differentiable in the weight argument; only the output
/// shapes are imposed here.
pub trait EncodeModule {
    /// # Arguments
    /// * `weights` - flat recognition weights
    /// * `x_nd` - data batch (n x d_x)
    fn forward(&self, weights: &Tensor, x_nd: &Tensor) -> Result<AmortizedPosterior>;

    fn num_weights(&self) -> usize;
}

/// Generative network contract.
///
/// Maps a flat weight vector and a latent batch to likelihood parameters
/// (for instance Bernoulli logits), one row per sample.
pub trait DecodeModule {
    fn forward(&self, weights: &Tensor, z_nk: &Tensor) -> Result<Tensor>;

    fn num_weights(&self) -> usize;
}

/// Fully connected network evaluated from a packed flat weight vector.
///
/// Each layer consumes `(in + 1) * out` consecutive entries (weight matrix
/// then bias). Keeping the weights packed means one optimizer vector covers
/// the whole network and gradients flow back through narrow/reshape.
#[derive(Debug, Clone)]
pub struct Feedforward {
    dims: Vec<usize>,
    activation: Nonlinearity,
    output_activation: Option<Nonlinearity>,
}

impl Feedforward {
    pub fn new(
        input_dim: usize,
        hidden_dims: &[usize],
        output_dim: usize,
        activation: Nonlinearity,
        output_activation: Option<Nonlinearity>,
    ) -> Self {
        let mut dims = Vec::with_capacity(hidden_dims.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden_dims);
        dims.push(output_dim);
        Self {
            dims,
            activation,
            output_activation,
        }
    }

    pub fn num_weights(&self) -> usize {
        self.dims.windows(2).map(|p| (p[0] + 1) * p[1]).sum()
    }

    pub fn forward(&self, weights: &Tensor, x_ni: &Tensor) -> Result<Tensor> {
        let need = self.num_weights();
        let got = weights.dims1()?;
        if got != need {
            bail!("weight vector has {} entries but the network needs {}", got, need);
        }
        let in_dim = x_ni.dim(1)?;
        if in_dim != self.dims[0] {
            bail!(
                "input batch has width {} but the network expects {}",
                in_dim,
                self.dims[0]
            );
        }

        let mut h = x_ni.clone();
        let mut offset = 0;
        let last = self.dims.len() - 2;
        for (i, pair) in self.dims.windows(2).enumerate() {
            let (w_in, w_out) = (pair[0], pair[1]);
            let w = weights.narrow(0, offset, w_in * w_out)?.reshape((w_in, w_out))?;
            offset += w_in * w_out;
            let bias = weights.narrow(0, offset, w_out)?;
            offset += w_out;

            h = h.matmul(&w)?.broadcast_add(&bias)?;
            if i < last {
                h = self.activation.apply(&h)?;
            } else if let Some(out_act) = self.output_activation {
                h = out_act.apply(&h)?;
            }
        }
        Ok(h)
    }
}

/// Encoder that splits one network output row into the per-sample
/// variational parameters `(mu0, log_sigma_diag0, W, U, b)`.
#[derive(Debug, Clone)]
pub struct FlowEncoder {
    net: Feedforward,
    dim_z: usize,
    n_flows: usize,
}

impl FlowEncoder {
    pub fn new(dim_x: usize, hidden_dims: &[usize], dim_z: usize, n_flows: usize) -> Self {
        let output_dim = 2 * dim_z + 2 * n_flows * dim_z + n_flows;
        let net = Feedforward::new(dim_x, hidden_dims, output_dim, Nonlinearity::Tanh, None);
        Self {
            net,
            dim_z,
            n_flows,
        }
    }
}

impl EncodeModule for FlowEncoder {
    fn forward(&self, weights: &Tensor, x_nd: &Tensor) -> Result<AmortizedPosterior> {
        let out = self.net.forward(weights, x_nd)?;
        let n = out.dim(0)?;
        let d = self.dim_z;
        let k = self.n_flows;

        let mu0 = out.narrow(1, 0, d)?.contiguous()?;
        let log_sigma_diag0 = out.narrow(1, d, d)?.contiguous()?;
        let w = out
            .narrow(1, 2 * d, k * d)?
            .contiguous()?
            .reshape((n, k, d))?
            .transpose(0, 1)?
            .contiguous()?;
        let u = out
            .narrow(1, 2 * d + k * d, k * d)?
            .contiguous()?
            .reshape((n, k, d))?
            .transpose(0, 1)?
            .contiguous()?;
        let b = out
            .narrow(1, 2 * d + 2 * k * d, k)?
            .t()?
            .contiguous()?;

        Ok(AmortizedPosterior {
            mu0,
            log_sigma_diag0,
            w,
            u,
            b,
        })
    }

    fn num_weights(&self) -> usize {
        self.net.num_weights()
    }
}

/// Decoder emitting Bernoulli logits; pair with
/// [`crate::likelihood::joint_bernoulli_llik`].
#[derive(Debug, Clone)]
pub struct BernoulliLogitsDecoder {
    net: Feedforward,
}

impl BernoulliLogitsDecoder {
    pub fn new(dim_z: usize, hidden_dims: &[usize], dim_x: usize) -> Self {
        let net = Feedforward::new(dim_z, hidden_dims, dim_x, Nonlinearity::Tanh, None);
        Self { net }
    }
}

impl DecodeModule for BernoulliLogitsDecoder {
    fn forward(&self, weights: &Tensor, z_nk: &Tensor) -> Result<Tensor> {
        self.net.forward(weights, z_nk)
    }

    fn num_weights(&self) -> usize {
        self.net.num_weights()
    }
}

/// Small random initialization for a packed weight vector.
pub fn init_weights(num: usize, scale: f64, noise: &mut NoiseSource) -> Result<Tensor> {
    noise.standard_normal_vec(num)? * scale
}
