use candle_core::{Result as CandleResult, Tensor};

use crate::feedforward::{DecodeModule, EncodeModule};
use crate::free_energy::{FreeEnergy, FreeEnergyConfig};
use crate::gaussian::{reparameterize, NoiseSource};
use crate::optimizer::{run_adam, AdamConfig, RunConfig};
use crate::params::{AmortizedLayout, FlowPosterior};

/// Fit shared variational parameters against a caller-supplied joint
/// log-density.
///
/// Each iteration draws a fresh noise batch from `noise`, rebuilds the
/// free energy at the current parameter vector, and takes one Adam step.
/// `on_checkpoint` receives the unpacked posterior every
/// `checkpoint_every` iterations for visualization or persistence; the
/// loop never looks at what it does.
///
/// # Returns the final posterior and the per-iteration objective trace.
#[allow(clippy::too_many_arguments)]
pub fn fit_flow<L, C>(
    cfg: &FreeEnergyConfig,
    logp: L,
    init: &FlowPosterior,
    noise: &mut NoiseSource,
    adam: &AdamConfig,
    run: &RunConfig,
    mut on_checkpoint: C,
) -> anyhow::Result<(FlowPosterior, Vec<f64>)>
where
    L: Fn(&Tensor) -> CandleResult<Tensor>,
    C: FnMut(&FlowPosterior, usize) -> CandleResult<()>,
{
    let layout = cfg.layout();
    let objective = FreeEnergy::new(cfg.clone());
    let init_vec = layout.pack(init)?;
    let every = run.diagnostics.checkpoint_every;

    let (final_vec, trace) = run_adam(
        |params, t| {
            let eps0 = noise.standard_normal(cfg.n_samples, cfg.dim_z)?;
            let phi = layout.unpack(params)?;
            objective.evaluate(&eps0, &phi, &logp, t)
        },
        &init_vec,
        adam,
        run,
        |params, t, _grad| {
            if every > 0 && t % every == 0 {
                on_checkpoint(&layout.unpack(params)?, t)?;
            }
            Ok(())
        },
    )?;

    Ok((layout.unpack(&final_vec)?, trace))
}

/// Fit encoder and decoder weights jointly (amortized inference).
///
/// `init_weights` is the concatenation of the packed encoder and decoder
/// weight vectors; the split is recovered from the modules' own weight
/// counts. `llik(x, zK, decoded)` supplies the joint log-probability per
/// sample, prior term included.
///
/// # Returns the final `(encoder, decoder)` weights and the objective trace.
#[allow(clippy::too_many_arguments)]
pub fn fit_amortized<E, Dm, L, C>(
    cfg: &FreeEnergyConfig,
    x_nd: &Tensor,
    encoder: &E,
    decoder: &Dm,
    llik: L,
    init_weights: &Tensor,
    noise: &mut NoiseSource,
    adam: &AdamConfig,
    run: &RunConfig,
    mut on_checkpoint: C,
) -> anyhow::Result<((Tensor, Tensor), Vec<f64>)>
where
    E: EncodeModule,
    Dm: DecodeModule,
    L: Fn(&Tensor, &Tensor, &Tensor) -> CandleResult<Tensor>,
    C: FnMut(&Tensor, &Tensor, usize) -> CandleResult<()>,
{
    let layout = AmortizedLayout {
        n_encoder: encoder.num_weights(),
        n_decoder: decoder.num_weights(),
    };
    // fail on a bad concatenation before the first gradient pass
    layout.unpack(init_weights)?;

    let objective = FreeEnergy::new(cfg.clone());
    let every = run.diagnostics.checkpoint_every;

    let (final_vec, trace) = run_adam(
        |params, t| {
            let eps0 = noise.standard_normal(cfg.n_samples, cfg.dim_z)?;
            let (phi_w, theta_w) = layout.unpack(params)?;
            objective.evaluate_amortized(&eps0, x_nd, &phi_w, &theta_w, encoder, decoder, &llik, t)
        },
        init_weights,
        adam,
        run,
        |params, t, _grad| {
            if every > 0 && t % every == 0 {
                let (phi_w, theta_w) = layout.unpack(params)?;
                on_checkpoint(&phi_w, &theta_w, t)?;
            }
            Ok(())
        },
    )?;

    Ok((layout.unpack(&final_vec)?, trace))
}

/// Draw a posterior sample batch: the base draw and its image under the
/// flow. Useful for inspecting what the fitted posterior looks like.
pub fn posterior_samples(
    cfg: &FreeEnergyConfig,
    phi: &FlowPosterior,
    noise: &mut NoiseSource,
) -> anyhow::Result<(Tensor, Tensor)> {
    let objective = FreeEnergy::new(cfg.clone());
    let eps0 = noise.standard_normal(cfg.n_samples, cfg.dim_z)?;
    let z0 = reparameterize(&eps0, &phi.mu0, &phi.log_sigma_diag0)?;
    let (zk, _logdet) = objective.transform(&z0, phi)?;
    Ok((z0, zk))
}
