use std::path::PathBuf;

use anyhow::{Result, ensure};
use burn::{
    config::Config,
    data::dataloader::DataLoaderBuilder,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use log::info;
use num_format::{Locale, ToFormattedString};
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;

use crate::{
    checkpoint::Checkpoint,
    data::{DemoBatch, DemoBatcher, DemoDataset},
    logger::JsonLogger,
    policy::{Phase, TrainablePolicy},
    util::scalar,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub artifact_dir: PathBuf,
    pub optimizer: AdamConfig,

    #[config(default = 10)]
    pub num_epochs: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    #[config(default = 0x12C0FFEE)]
    pub seed: u64,

    #[config(default = 1)]
    pub num_workers: usize,

    /// Epochs between intermediate checkpoints, the final one is always written.
    #[config(default = 1)]
    pub checkpoint_every: usize,

    #[config(default = "None")]
    pub max_train_steps: Option<usize>,

    #[config(default = 0.1)]
    pub val_ratio: f32,

    #[config(default = false)]
    pub debug: bool,
}

impl TrainingConfig {
    pub fn debugged(mut self) -> Self {
        if self.debug {
            self.num_epochs = 2;
            self.max_train_steps = Some(3);
            self.checkpoint_every = 1;
        }
        self
    }

    pub fn init<B, P>(self, policy: P, device: B::Device) -> Result<Trainer<B, P>>
    where
        B: AutodiffBackend,
        P: TrainablePolicy<B> + Checkpoint<B>,
    {
        Trainer::new(self, policy, device)
    }
}

/// Fits a policy to demonstrations with Adam, logging one JSON line per step.
pub struct Trainer<B, P>
where
    B: AutodiffBackend,
    P: TrainablePolicy<B> + Checkpoint<B>,
{
    config: TrainingConfig,
    policy: P,
    logger: JsonLogger,
    rng: StdRng,
    global_step: usize,
    device: B::Device,
}

impl<B, P> Trainer<B, P>
where
    B: AutodiffBackend,
    P: TrainablePolicy<B> + Checkpoint<B>,
{
    pub fn new(config: TrainingConfig, policy: P, device: B::Device) -> Result<Self> {
        let config = config.debugged();
        ensure!(config.batch_size > 0, "batch size must be positive");
        ensure!(config.checkpoint_every > 0, "checkpoint_every must be positive");

        std::fs::create_dir_all(&config.artifact_dir)?;
        config.save(config.artifact_dir.join("train.json"))?;

        B::seed(config.seed);

        Ok(Self {
            logger: JsonLogger::open(config.artifact_dir.join("logs.json.txt")),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            policy,
            global_step: 0,
            device,
        })
    }

    pub fn run(mut self, dataset: DemoDataset) -> Result<P> {
        let (train, valid) = dataset.split(self.config.val_ratio, self.config.seed)?;
        info!("train dataset size: {}", train.samples().len().to_formatted_string(&Locale::en));
        info!("valid dataset size: {}", valid.samples().len().to_formatted_string(&Locale::en));

        let meta = train.meta().clone();
        let loader_train = DataLoaderBuilder::new(DemoBatcher::<B>::new(self.device.clone(), meta.clone()))
            .batch_size(self.config.batch_size)
            .shuffle(self.config.seed)
            .num_workers(self.config.num_workers)
            .build(train);
        let loader_valid = DataLoaderBuilder::new(DemoBatcher::<B>::new(self.device.clone(), meta))
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .build(valid);

        let mut optim = self.config.optimizer.init::<B, P::Model>();

        for epoch in 0..self.config.num_epochs {
            let mut losses = Vec::new();

            for (iteration, batch) in loader_train.iter().enumerate() {
                if self.config.max_train_steps.is_some_and(|max| iteration >= max) {
                    break;
                }

                let loss = self
                    .policy
                    .compute_loss(&batch.obs, batch.action, Phase::Train, &mut self.rng)?;
                let value = scalar(loss.clone());

                let grads = GradientsParams::from_grads(loss.backward(), self.policy.model());
                let model = optim.step(self.config.learning_rate, self.policy.model().clone(), grads);
                self.policy = self.policy.with_model(model);

                self.logger.log(&json!({
                    "train_loss": value,
                    "global_step": self.global_step,
                    "epoch": epoch,
                    "lr": self.config.learning_rate,
                }));
                losses.push(value);
                self.global_step += 1;
            }

            let val_loss = self.validate(loader_valid.iter())?;
            let train_loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            self.logger.log(&json!({
                "epoch": epoch,
                "global_step": self.global_step,
                "val_loss": val_loss,
            }));
            info!(
                "epoch {epoch} step {}: train loss {train_loss:.5}, valid loss {}",
                self.global_step.to_formatted_string(&Locale::en),
                val_loss.map_or_else(|| "n/a".to_string(), |loss| format!("{loss:.5}"))
            );

            if (epoch + 1) % self.config.checkpoint_every == 0 && epoch + 1 < self.config.num_epochs {
                let dir = self.config.artifact_dir.join(format!("epoch_{epoch}"));
                self.policy.save(&dir)?;
                info!("saved checkpoint to {}", dir.display());
            }
        }

        self.policy.save(&self.config.artifact_dir)?;
        info!("saved policy to {}", self.config.artifact_dir.display());

        Ok(self.policy)
    }

    /// Mean evaluation-mode loss over `batches`, `None` when there are none.
    fn validate(&mut self, batches: impl Iterator<Item = DemoBatch<B>>) -> Result<Option<f32>> {
        let mut total = 0.0;
        let mut count = 0usize;

        for batch in batches {
            let loss = self
                .policy
                .compute_loss(&batch.obs, batch.action, Phase::Eval, &mut self.rng)?;
            total += scalar(loss.detach());
            count += 1;
        }

        Ok((count > 0).then(|| total / count as f32))
    }
}
