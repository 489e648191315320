use anyhow::Result;
use burn::backend::{Autodiff, Candle, candle::CandleDevice};
use log::info;
use policy_attack::{config, data::DemoDataset, policy::PolicyKind};

type AutodiffBackend = Autodiff<Candle>;

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| String::from("config.toml"));
    let config = config::load(&path)?;
    let device = CandleDevice::default();

    let dataset = DemoDataset::load(&config.paths.dataset)?;
    let normalizer = dataset.fit_normalizer()?;
    let policy = config.policy()?;
    let training = config.training()?.config(&config.paths);

    info!("training a {} policy from {}", policy.kind, config.paths.dataset.display());

    match policy.kind {
        PolicyKind::Ibc => {
            let policy = policy.ibc(dataset.meta()).init::<AutodiffBackend>(normalizer, &device)?;
            training.init(policy, device)?.run(dataset)?;
        }
        PolicyKind::Bc => {
            let policy = policy.bc(dataset.meta()).init::<AutodiffBackend>(normalizer, &device)?;
            training.init(policy, device)?.run(dataset)?;
        }
    }

    Ok(())
}
