use candle_core::{DType, Device, Result, Tensor, Var};

use flow_vi::feedforward::{
    init_weights, BernoulliLogitsDecoder, DecodeModule, EncodeModule, FlowEncoder,
};
use flow_vi::fit::fit_amortized;
use flow_vi::free_energy::{FreeEnergy, FreeEnergyConfig};
use flow_vi::gaussian::NoiseSource;
use flow_vi::likelihood::joint_bernoulli_llik;
use flow_vi::optimizer::{AdamConfig, RunConfig};
use flow_vi::params::AmortizedLayout;

fn binary_batch(n: usize, dim_x: usize, device: &Device) -> Result<Tensor> {
    Tensor::rand(0f64, 1f64, (n, dim_x), device)?
        .gt(0.5)?
        .to_dtype(DType::F64)
}

#[test]
fn amortized_objective_reaches_all_weights() -> Result<()> {
    let device = Device::Cpu;
    let (dim_x, dim_z, n_flows, n) = (6, 2, 2, 12);

    let cfg = FreeEnergyConfig::new(dim_z, n_flows, n, 100);
    let objective = FreeEnergy::new(cfg.clone());

    let encoder = FlowEncoder::new(dim_x, &[8], dim_z, n_flows);
    let decoder = BernoulliLogitsDecoder::new(dim_z, &[8], dim_x);
    let layout = AmortizedLayout {
        n_encoder: encoder.num_weights(),
        n_decoder: decoder.num_weights(),
    };

    let mut noise = NoiseSource::new(5, &device, DType::F64);
    let x = binary_batch(n, dim_x, &device)?;
    let init = init_weights(layout.num_params(), 0.1, &mut noise)?;
    let params = Var::from_tensor(&init)?;

    let eps0 = noise.standard_normal(n, dim_z)?;
    let (phi_w, theta_w) = layout.unpack(params.as_tensor())?;
    let loss = objective.evaluate_amortized(
        &eps0,
        &x,
        &phi_w,
        &theta_w,
        &encoder,
        &decoder,
        &joint_bernoulli_llik,
        0,
    )?;

    assert!(loss.dims().is_empty());
    assert!(loss.to_scalar::<f64>()?.is_finite());

    let grads = loss.backward()?;
    let grad = grads
        .get(params.as_tensor())
        .expect("no gradient reached the packed weights");
    assert_eq!(grad.dims(), &[layout.num_params()]);

    // both halves of the packed vector should carry signal
    let enc_grad = grad
        .narrow(0, 0, layout.n_encoder)?
        .abs()?
        .sum_all()?
        .to_scalar::<f64>()?;
    let dec_grad = grad
        .narrow(0, layout.n_encoder, layout.n_decoder)?
        .abs()?
        .sum_all()?
        .to_scalar::<f64>()?;
    assert!(enc_grad > 0.0);
    assert!(dec_grad > 0.0);

    Ok(())
}

#[test]
fn amortized_fit_runs_to_budget() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let device = Device::Cpu;
    let (dim_x, dim_z, n_flows, n) = (6, 2, 2, 12);

    let cfg = FreeEnergyConfig::new(dim_z, n_flows, n, 40);

    let encoder = FlowEncoder::new(dim_x, &[8], dim_z, n_flows);
    let decoder = BernoulliLogitsDecoder::new(dim_z, &[8], dim_x);
    let total = encoder.num_weights() + decoder.num_weights();

    let mut noise = NoiseSource::new(17, &device, DType::F64);
    let x = binary_batch(n, dim_x, &device)?;
    let init = init_weights(total, 0.1, &mut noise)?;

    let mut run = RunConfig::new(40);
    run.show_progress = false;
    run.diagnostics.checkpoint_every = 10;

    let mut checkpoints = 0usize;
    let ((phi_w, theta_w), trace) = fit_amortized(
        &cfg,
        &x,
        &encoder,
        &decoder,
        joint_bernoulli_llik,
        &init,
        &mut noise,
        &AdamConfig::new(1e-2),
        &run,
        |_phi_w, _theta_w, _t| {
            checkpoints += 1;
            Ok(())
        },
    )?;

    assert_eq!(phi_w.dims(), &[encoder.num_weights()]);
    assert_eq!(theta_w.dims(), &[decoder.num_weights()]);
    assert_eq!(trace.len(), 40);
    assert!(trace.iter().all(|fe| fe.is_finite()));
    assert_eq!(checkpoints, 4);

    Ok(())
}
