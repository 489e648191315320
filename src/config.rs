//! TOML experiment files read by the binaries.
use std::{fs, path::PathBuf};

use anyhow::{Context, Result, ensure};
use burn::optim::AdamConfig;
use serde::{Deserialize, Serialize};

use crate::{
    attack::{AttackKind, ClipRange, MaskSpec, PatchAttackConfig, UniversalAttackConfig},
    data::DemoMeta,
    policy::{BcPolicyConfig, EncoderConfig, IbcPolicyConfig, PolicyKind, PolicyShape},
    rollout::RolloutConfig,
    sampler::{DfoConfig, Resampling, Selection},
    training::TrainingConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Policy directory written by `train` and read by the attacks.
    pub checkpoint: PathBuf,
    pub dataset: PathBuf,
    /// Held-out windows for evaluation, the training set when absent.
    pub eval_dataset: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Where perturbation artifacts go, next to the checkpoint when absent.
    pub artifact_dir: Option<PathBuf>,
    /// Prior perturbation for `retrain` and `eval`.
    pub patch_path: Option<PathBuf>,
}

impl Paths {
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(|| self.checkpoint.clone())
    }

    pub fn eval_dataset(&self) -> PathBuf {
        self.eval_dataset.clone().unwrap_or_else(|| self.dataset.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workspace {
    Patch,
    Universal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attack {
    pub workspace: Workspace,
    pub kind: AttackKind,
    pub views: Vec<String>,
    pub epsilon: f32,
    pub step_size: f32,
    #[serde(default)]
    pub target_offsets: Vec<Vec<f32>>,
    #[serde(default)]
    pub clip: ClipRange,
    #[serde(default)]
    pub mask: MaskSpec,
    pub epochs: usize,
    /// PGD iterations per batch, patch attacks only.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "one")]
    pub rollout_every: usize,
    pub batch_size: usize,
    pub max_train_steps: Option<usize>,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default)]
    pub eta: f32,
    #[serde(default)]
    pub retrain: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Attack {
    pub fn patch(&self) -> Result<PatchAttackConfig> {
        ensure!(
            self.views.len() == 1,
            "a patch attack perturbs exactly one view, got {:?}",
            self.views
        );

        Ok(
            PatchAttackConfig::new(self.views[0].clone(), self.epsilon, self.step_size)
                .with_mask(self.mask.clone())
                .with_kind(self.kind)
                .with_target_offsets(self.target_offsets.clone())
                .with_clip_min(self.clip.min)
                .with_clip_max(self.clip.max)
                .with_iterations(self.iterations)
                .with_num_epochs(self.epochs)
                .with_rollout_every(self.rollout_every)
                .with_batch_size(self.batch_size)
                .with_seed(self.seed)
                .with_max_train_steps(self.max_train_steps)
                .with_kernel_size(self.kernel_size)
                .with_eta(self.eta)
                .with_debug(self.debug),
        )
    }

    pub fn universal(&self) -> Result<UniversalAttackConfig> {
        ensure!(
            self.mask == MaskSpec::Full,
            "universal perturbations cover the full frame, remove the mask"
        );

        Ok(
            UniversalAttackConfig::new(self.views.clone(), self.epsilon, self.step_size)
                .with_kind(self.kind)
                .with_target_offsets(self.target_offsets.clone())
                .with_clip_min(self.clip.min)
                .with_clip_max(self.clip.max)
                .with_num_epochs(self.epochs)
                .with_rollout_every(self.rollout_every)
                .with_batch_size(self.batch_size)
                .with_seed(self.seed)
                .with_max_train_steps(self.max_train_steps)
                .with_kernel_size(self.kernel_size)
                .with_eta(self.eta)
                .with_debug(self.debug),
        )
    }

    /// The perturbation to resume from, if `retrain` is set.
    pub fn prior(&self, paths: &Paths) -> Result<Option<PathBuf>> {
        if !self.retrain {
            return Ok(None);
        }

        let path = paths
            .patch_path
            .clone()
            .context("retrain needs `paths.patch_path`")?;
        ensure!(path.exists(), "retrain perturbation {} does not exist", path.display());

        Ok(Some(path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f32,
    #[serde(default = "one")]
    pub checkpoint_every: usize,
    pub max_train_steps: Option<usize>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Training {
    pub fn config(&self, paths: &Paths) -> TrainingConfig {
        TrainingConfig::new(paths.checkpoint.clone(), AdamConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_val_ratio(self.val_ratio)
            .with_checkpoint_every(self.checkpoint_every)
            .with_max_train_steps(self.max_train_steps)
            .with_debug(self.debug)
            .with_seed(self.seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dfo {
    pub iterations: usize,
    pub samples: usize,
    pub noise_std: f32,
    pub resampling: Resampling,
    pub selection: Selection,
}

impl Default for Dfo {
    fn default() -> Self {
        Self {
            iterations: 5,
            samples: 1024,
            noise_std: 0.03,
            resampling: Resampling::Clipped,
            selection: Selection::Best,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub kind: PolicyKind,
    #[serde(default = "one")]
    pub n_action_steps: usize,
    pub hidden_size: usize,
    #[serde(default = "default_hidden_layers")]
    pub hidden_layers: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default = "default_train_n_neg")]
    pub train_n_neg: usize,
    pub encoder_channels: usize,
    pub feature_dim: usize,
    #[serde(default)]
    pub dfo: Dfo,
}

impl Policy {
    /// Temporal shape and encoder inputs follow the dataset.
    fn parts(&self, meta: &DemoMeta) -> (PolicyShape, EncoderConfig) {
        let shape = PolicyShape::new(meta.action_dim)
            .with_n_obs_steps(meta.obs_steps)
            .with_n_action_steps(self.n_action_steps)
            .with_horizon(meta.horizon);
        let encoder = EncoderConfig::new(meta.images.clone())
            .with_low_dim(meta.low_dim.clone())
            .with_channels(self.encoder_channels)
            .with_feature_dim(self.feature_dim);

        (shape, encoder)
    }

    pub fn ibc(&self, meta: &DemoMeta) -> IbcPolicyConfig {
        let (shape, encoder) = self.parts(meta);
        let sampler = DfoConfig::new()
            .with_iterations(self.dfo.iterations)
            .with_samples(self.dfo.samples)
            .with_noise_std(self.dfo.noise_std)
            .with_resampling(self.dfo.resampling)
            .with_selection(self.dfo.selection);

        IbcPolicyConfig::new(shape, encoder)
            .with_sampler(sampler)
            .with_hidden_size(self.hidden_size)
            .with_hidden_layers(self.hidden_layers)
            .with_dropout(self.dropout)
            .with_train_n_neg(self.train_n_neg)
    }

    pub fn bc(&self, meta: &DemoMeta) -> BcPolicyConfig {
        let (shape, encoder) = self.parts(meta);
        BcPolicyConfig::new(shape, encoder).with_hidden_size(self.hidden_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub tolerance: f32,
    pub batch_size: usize,
    pub max_batches: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for Rollout {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            batch_size: 32,
            max_batches: None,
            seed: default_seed(),
        }
    }
}

impl Rollout {
    pub fn config(&self) -> RolloutConfig {
        RolloutConfig::new()
            .with_tolerance(self.tolerance)
            .with_batch_size(self.batch_size)
            .with_max_batches(self.max_batches)
            .with_seed(self.seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: Paths,
    pub policy: Option<Policy>,
    pub training: Option<Training>,
    pub attack: Option<Attack>,
    #[serde(default)]
    pub rollout: Rollout,
}

impl Config {
    pub fn policy(&self) -> Result<&Policy> {
        self.policy.as_ref().context("missing [policy] section")
    }

    pub fn training(&self) -> Result<&Training> {
        self.training.as_ref().context("missing [training] section")
    }

    pub fn attack(&self) -> Result<&Attack> {
        self.attack.as_ref().context("missing [attack] section")
    }
}

pub fn load(filename: &str) -> Result<Config> {
    let contents = fs::read_to_string(filename).with_context(|| format!("failed to read {filename}"))?;
    let config: Config = toml::from_str(&contents)?;

    Ok(config)
}

fn one() -> usize {
    1
}

fn default_iterations() -> usize {
    10
}

fn default_kernel_size() -> usize {
    3
}

fn default_seed() -> u64 {
    42
}

fn default_val_ratio() -> f32 {
    0.1
}

fn default_hidden_layers() -> usize {
    3
}

fn default_train_n_neg() -> usize {
    128
}
