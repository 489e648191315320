use anyhow::Result;
use burn::backend::{NdArray, ndarray::NdArrayDevice};
use log::info;
use policy_attack::{attack::Perturbation, config, data::DemoDataset};
use rand::{SeedableRng, rngs::StdRng};

type B = NdArray;

/// Writes a uniform noise perturbation in `[-eps / 2, eps / 2]` for every
/// configured view, as a baseline for the optimized attacks.
fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| String::from("config.toml"));
    let config = config::load(&path)?;
    let attack = config.attack()?;
    let device = NdArrayDevice::default();

    let dataset = DemoDataset::load(&config.paths.dataset)?;
    let layout = dataset.meta().layout(&attack.views, &attack.mask)?;
    let mut rng = StdRng::seed_from_u64(attack.seed);

    let noise = Perturbation::<B>::uniform(&layout, attack.epsilon / 2.0, attack.clip, &mut rng, &device)?;
    let artifact = noise.to_artifact(attack.kind, attack.epsilon, 0, None, None)?;
    let path = artifact.save_in(&config.paths.artifact_dir())?;

    info!("random perturbation for {:?} saved to {}", attack.views, path.display());
    Ok(())
}
