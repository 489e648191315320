use anyhow::{Result, ensure};
use burn::backend::{Candle, candle::CandleDevice};
use log::info;
use policy_attack::{
    artifact::PerturbationArtifact,
    attack::Perturbation,
    checkpoint::{Checkpoint, read_manifest},
    config::{self, Config},
    data::DemoDataset,
    policy::{BcPolicy, IbcPolicy, PolicyKind},
    rollout::{OfflineEvaluator, RolloutEvaluator, RolloutLog},
};

type B = Candle;

fn evaluate<P: Checkpoint<B>>(config: &Config, device: &CandleDevice) -> Result<RolloutLog> {
    let policy = P::load(&config.paths.checkpoint, device)?;
    let perturbation = match &config.paths.patch_path {
        Some(path) => {
            let artifact = PerturbationArtifact::load(path)?;
            info!("evaluating under {} ({} attack, eps {})", path.display(), artifact.kind, artifact.epsilon);
            Some(Perturbation::<B>::from_artifact(&artifact, device)?)
        }
        None => None,
    };

    let dataset = DemoDataset::load(config.paths.eval_dataset())?;
    let mut evaluator = OfflineEvaluator::<B>::new(config.rollout.config(), dataset, device.clone())?;

    evaluator.run(&policy, perturbation.as_ref())
}

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| String::from("config.toml"));
    let config = config::load(&path)?;
    let device = CandleDevice::default();

    let output_dir = &config.paths.output_dir;
    ensure!(
        !output_dir.exists(),
        "output directory {} already exists",
        output_dir.display()
    );

    let log = match read_manifest(&config.paths.checkpoint)? {
        PolicyKind::Ibc => evaluate::<IbcPolicy<B>>(&config, &device)?,
        PolicyKind::Bc => evaluate::<BcPolicy<B>>(&config, &device)?,
    };

    std::fs::create_dir_all(output_dir)?;
    std::fs::write(output_dir.join("eval_log.json"), serde_json::to_string_pretty(&log)?)?;
    info!(
        "mean score {:.3} over {} episodes, written to {}",
        log.mean_score,
        log.episodes,
        output_dir.display()
    );

    Ok(())
}
