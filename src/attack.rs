//! Adversarial perturbations of image observations, optimized by signed
//! gradient steps through a frozen policy.
use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use burn::{prelude::*, tensor::backend::AutodiffBackend};
use log::info;
use num_format::{Locale, ToFormattedString};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    artifact::{PerturbationArtifact, retrain_path},
    logger::JsonLogger,
    observation::Observation,
    policy::{Phase, Policy},
    rollout::{RolloutEvaluator, RolloutLog},
    util::to_vec,
};

pub mod mask;
pub mod patch;
pub mod perturbation;
pub mod smoothing;
pub mod step;
pub mod target;
pub mod universal;

pub use mask::MaskSpec;
pub use patch::{PatchAttack, PatchAttackConfig, PatchWorkspace};
pub use perturbation::{ClipRange, Perturbation, ViewLayout, compose};
pub use smoothing::Smoothing;
pub use step::SignGradientStep;
pub use target::TargetOffsets;
pub use universal::{UniversalAttackConfig, UniversalWorkspace};

/// Targeted attacks steer the policy towards a chosen action; untargeted
/// attacks push it away from the demonstrations.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    #[strum(serialize = "tar")]
    Targeted,
    #[strum(serialize = "untar")]
    Untargeted,
}

impl AttackKind {
    pub fn direction(self) -> Direction {
        match self {
            Self::Targeted => Direction::Minimize,
            Self::Untargeted => Direction::Maximize,
        }
    }
}

/// Whether a perturbation step climbs or descends the attack loss.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    pub fn sign(self) -> f32 {
        match self {
            Self::Maximize => 1.0,
            Self::Minimize => -1.0,
        }
    }
}

/// Counters and mode threaded through every attack step.
#[derive(Clone, Debug)]
pub struct AttackSession {
    pub phase: Phase,
    pub epoch: usize,
    pub global_step: usize,
}

impl Default for AttackSession {
    fn default() -> Self {
        Self {
            phase: Phase::Eval,
            epoch: 0,
            global_step: 0,
        }
    }
}

impl AttackSession {
    pub fn advance(&mut self) {
        self.global_step += 1;
    }

    pub fn finish_epoch(&mut self) {
        self.epoch += 1;
    }
}

/// What the attack loss is computed against for one batch.
#[derive(Clone, Debug)]
pub enum Objective<B: Backend> {
    /// Demonstrated actions `(batch, horizon, action_dim)`.
    Untargeted { actions: Tensor<B, 3> },
    /// Target and clean prediction, both `(batch, n_action_steps, action_dim)`.
    Targeted { target: Tensor<B, 3>, clean: Tensor<B, 3> },
}

impl<B> Objective<B>
where
    B: Backend,
{
    /// Targeted objectives query the policy once on the clean observation and
    /// offset its prediction.
    pub fn for_batch<P, R>(
        kind: AttackKind,
        policy: &P,
        obs: &Observation<B>,
        actions: Tensor<B, 3>,
        offsets: Option<&TargetOffsets>,
        rng: &mut R,
    ) -> Result<Self>
    where
        P: Policy<B>,
        R: Rng,
    {
        match kind {
            AttackKind::Untargeted => Ok(Self::Untargeted { actions }),
            AttackKind::Targeted => {
                let offsets = offsets.ok_or_else(|| anyhow::anyhow!("targeted attacks need target offsets"))?;
                let clean = policy.predict_action(obs, rng)?.detach();
                let target = offsets.apply(clean.clone())?;
                Ok(Self::Targeted { target, clean })
            }
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Untargeted { .. } => Direction::Maximize,
            Self::Targeted { .. } => Direction::Minimize,
        }
    }

    pub fn loss<P, R>(&self, policy: &P, obs: &Observation<B>, phase: Phase, rng: &mut R) -> Result<Tensor<B, 1>>
    where
        P: Policy<B>,
        R: Rng,
    {
        match self {
            Self::Untargeted { actions } => policy.compute_loss(obs, actions.clone(), phase, rng),
            Self::Targeted { target, clean } => policy.targeted_loss(obs, target.clone(), clean.clone(), rng),
        }
    }
}

/// Where and how a workspace writes its perturbation artifacts.
#[derive(Clone, Debug)]
pub struct ArtifactSink {
    pub dir: PathBuf,
    /// Overrides the generated file name, used when resuming from a prior artifact.
    pub fixed_path: Option<PathBuf>,
    pub kind: AttackKind,
    pub epsilon: f32,
    pub target_offsets: Option<TargetOffsets>,
}

impl ArtifactSink {
    /// Evaluates `perturbation` on `evaluator` and writes it next to the checkpoint.
    pub(crate) fn checkpoint<B, P, E>(
        &self,
        policy: &P,
        evaluator: &mut E,
        perturbation: &Perturbation<B::InnerBackend>,
        session: &AttackSession,
        device: &B::Device,
        logger: &mut JsonLogger,
    ) -> Result<(RolloutLog, PathBuf)>
    where
        B: AutodiffBackend,
        P: Policy<B>,
        E: RolloutEvaluator<B, P> + ?Sized,
    {
        let log = evaluator.run(policy, Some(&perturbation.to_backend::<B>(device)?))?;
        logger.log(&serde_json::json!({
            "epoch": session.epoch,
            "global_step": session.global_step,
            "test/mean_score": log.mean_score,
            "rollout": log,
        }));

        let artifact = perturbation.to_artifact(
            self.kind,
            self.epsilon,
            session.epoch,
            Some(log.mean_score),
            self.target_offsets.as_ref(),
        )?;
        let path = match &self.fixed_path {
            Some(path) => {
                artifact.save(path)?;
                path.clone()
            }
            None => artifact.save_in(&self.dir)?,
        };

        info!(
            "epoch {} step {}: mean score {:.3}, saved {}",
            session.epoch,
            session.global_step.to_formatted_string(&Locale::en),
            log.mean_score,
            path.display()
        );

        Ok((log, path))
    }
}

/// Refuses to start a run whose output directory is already in use.
pub(crate) fn ensure_fresh_output(output_dir: &Path) -> Result<()> {
    ensure!(
        !output_dir.exists(),
        "output directory {} already exists",
        output_dir.display()
    );
    Ok(())
}

/// Opens the step log inside `output_dir`, creating the directory.
pub(crate) fn open_logger(output_dir: &Path) -> Result<JsonLogger> {
    std::fs::create_dir_all(output_dir)?;
    Ok(JsonLogger::open(output_dir.join("logs.json.txt")))
}

/// Starting point of an attack: a prior artifact when resuming, otherwise
/// zeros for targeted runs and `uniform[-eps, eps]` for untargeted ones.
/// Resumed runs also return the path their results are saved under.
pub(crate) fn initial_perturbation<B: Backend, R: Rng>(
    kind: AttackKind,
    layout: &[ViewLayout],
    epsilon: f32,
    clip: ClipRange,
    prior: Option<&Path>,
    rng: &mut R,
    device: &B::Device,
) -> Result<(Perturbation<B>, Option<PathBuf>)> {
    let Some(prior) = prior else {
        let perturbation = match kind {
            AttackKind::Targeted => Perturbation::zeros(layout, clip, device)?,
            AttackKind::Untargeted => Perturbation::uniform(layout, epsilon, clip, rng, device)?,
        };
        return Ok((perturbation, None));
    };

    let artifact = PerturbationArtifact::load(prior)?;
    let perturbation = Perturbation::<B>::from_artifact(&artifact, device)?;

    let mut expected = layout.iter().map(|view| view.name.as_str()).collect::<Vec<_>>();
    expected.sort_unstable();
    let stored = perturbation.names().map(String::as_str).collect::<Vec<_>>();
    ensure!(
        stored == expected,
        "{} perturbs {stored:?}, the attack is configured for {expected:?}",
        prior.display()
    );

    for view in layout {
        let stored = perturbation.view(&view.name)?;
        let shape = stored.delta.dims();
        ensure!(
            shape == view.shape,
            "`{}` in {} has shape {shape:?}, the dataset {:?}",
            view.name,
            prior.display(),
            view.shape
        );
        ensure!(
            to_vec(stored.mask.clone())? == view.mask.values(view.shape)?,
            "`{}` in {} was optimized under a different mask than {:?}",
            view.name,
            prior.display(),
            view.mask
        );
    }
    info!("resuming from {}", prior.display());

    Ok((perturbation, Some(retrain_path(prior))))
}

pub(crate) fn validate_budget(epsilon: f32, step_size: f32, clip: ClipRange) -> Result<()> {
    ensure!(epsilon.is_finite() && epsilon >= 0.0, "epsilon must be non-negative, got {epsilon}");
    ensure!(step_size.is_finite() && step_size >= 0.0, "step size must be non-negative, got {step_size}");
    ensure!(clip.min <= clip.max, "clip range [{}, {}] is empty", clip.min, clip.max);
    Ok(())
}
