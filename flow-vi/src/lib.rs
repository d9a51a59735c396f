//! Planar normalizing-flow variational inference.
//!
//! Fits an approximate posterior over latent variables with a diagonal
//! Gaussian base distribution pushed through a stack of planar
//! transformations, trained by stochastic gradient descent on the free
//! energy (negative evidence lower bound). Gradients come from the candle
//! autodiff graph rooted at a single flat parameter vector, so the same
//! machinery covers both per-problem variational parameters and the
//! amortized encoder/decoder setting.

pub mod feedforward;
pub mod fit;
pub mod free_energy;
pub mod gaussian;
pub mod likelihood;
pub mod optimizer;
pub mod params;
pub mod planar;

pub use candle_core;
pub use candle_nn;
