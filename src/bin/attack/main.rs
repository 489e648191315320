use anyhow::Result;
use burn::backend::{Autodiff, Candle, candle::CandleDevice};
use log::info;
use policy_attack::{
    attack::{PatchWorkspace, UniversalWorkspace},
    checkpoint::{Checkpoint, read_manifest},
    config::{self, Config, Workspace},
    data::DemoDataset,
    policy::{BcPolicy, IbcPolicy, PolicyKind, TrainablePolicy},
    rollout::OfflineEvaluator,
};

type AutodiffBackend = Autodiff<Candle>;

fn run<P>(config: &Config, device: CandleDevice) -> Result<()>
where
    P: TrainablePolicy<AutodiffBackend> + Checkpoint<AutodiffBackend>,
{
    let attack = config.attack()?;
    let paths = &config.paths;

    let policy = P::load(&paths.checkpoint, &device)?;
    let dataset = DemoDataset::load(&paths.dataset)?;
    let mut evaluator = OfflineEvaluator::<AutodiffBackend>::new(
        config.rollout.config(),
        DemoDataset::load(paths.eval_dataset())?,
        device.clone(),
    )?;
    let prior = attack.prior(paths)?;

    let perturbation = match attack.workspace {
        Workspace::Patch => PatchWorkspace::new(
            attack.patch()?,
            policy,
            &dataset,
            &paths.output_dir,
            paths.artifact_dir(),
            prior.as_deref(),
            device,
        )?
        .run(dataset, &mut evaluator)?,
        Workspace::Universal => UniversalWorkspace::new(
            attack.universal()?,
            policy,
            &dataset,
            &paths.output_dir,
            paths.artifact_dir(),
            prior.as_deref(),
            device,
        )?
        .run(dataset, &mut evaluator)?,
    };

    info!("finished with |delta| = {:.4}", perturbation.linf_norm()?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| String::from("config.toml"));
    let config = config::load(&path)?;
    let device = CandleDevice::default();

    match read_manifest(&config.paths.checkpoint)? {
        PolicyKind::Ibc => run::<IbcPolicy<AutodiffBackend>>(&config, device),
        PolicyKind::Bc => run::<BcPolicy<AutodiffBackend>>(&config, device),
    }
}
