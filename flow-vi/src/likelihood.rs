use candle_core::{bail, Result, Tensor};

use crate::gaussian::log_std_normal;

/// Numerically stable softplus: `max(x, 0) + ln(1 + exp(-|x|))`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.relu()?;
    let log_term = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    linear + &log_term
}

/// Bernoulli log-likelihood of binary data against logits:
///
/// llik(i) = sum_w x(i,w) * logit(i,w) - softplus(logit(i,w))
///
/// * `x_nd` - binary observations (n x d)
/// * `logits_nd` - decoder logits (n x d)
///
/// # Returns log-likelihood per sample (n)
pub fn bernoulli_logits_llik(x_nd: &Tensor, logits_nd: &Tensor) -> Result<Tensor> {
    if x_nd.dims() != logits_nd.dims() {
        bail!(
            "data shape {:?} does not match logits shape {:?}",
            x_nd.dims(),
            logits_nd.dims()
        );
    }
    let sp = softplus(logits_nd)?;
    (x_nd.mul(logits_nd)? - &sp)?.sum(x_nd.rank() - 1)
}

/// Gaussian log-likelihood with unit noise, up to the additive constant:
///
/// llik(i) = -0.5 * sum_w [ x(i,w) - xhat(i,w) ]^2
pub fn gaussian_llik(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.powf(2.)?.sum(1)? * (-0.5)
}

/// Joint log-probability with a standard Gaussian prior on the latents and
/// a Bernoulli data term, the shape the amortized objective consumes.
pub fn joint_bernoulli_llik(x_nd: &Tensor, z_nd: &Tensor, logits_nd: &Tensor) -> Result<Tensor> {
    log_std_normal(z_nd)? + &bernoulli_logits_llik(x_nd, logits_nd)?
}
