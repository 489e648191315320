//! Policy directories: a manifest naming the policy kind, the burn config of
//! the model, its weights and the fitted normalizer.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use burn::{prelude::*, record::CompactRecorder};
use serde::{Deserialize, Serialize};

use crate::{
    normalizer::LinearNormalizer,
    policy::{BcPolicy, BcPolicyConfig, IbcPolicy, IbcPolicyConfig, Policy, PolicyKind},
};

pub const MANIFEST: &str = "policy.json";
const CONFIG: &str = "model.json";
const WEIGHTS: &str = "model";
const NORMALIZER: &str = "normalizer.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: PolicyKind,
}

/// Reads the policy kind stored in `dir`.
pub fn read_manifest(dir: &Path) -> Result<PolicyKind> {
    let path = dir.join(MANIFEST);
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("missing checkpoint manifest {}", path.display()))?;
    let manifest: Manifest =
        serde_json::from_str(&contents).with_context(|| format!("invalid checkpoint manifest {}", path.display()))?;

    Ok(manifest.kind)
}

/// A policy that can be written to and restored from a directory.
pub trait Checkpoint<B: Backend>: Policy<B> + Sized {
    const KIND: PolicyKind;

    fn save(&self, dir: &Path) -> Result<()>;

    fn load(dir: &Path, device: &B::Device) -> Result<Self>;
}

impl<B: Backend> Checkpoint<B> for IbcPolicy<B> {
    const KIND: PolicyKind = PolicyKind::Ibc;

    fn save(&self, dir: &Path) -> Result<()> {
        write_parts::<B, _, _>(dir, Self::KIND, self.config(), self.ibc_model().clone(), self.normalizer())
    }

    fn load(dir: &Path, device: &B::Device) -> Result<Self> {
        ensure_kind(dir, Self::KIND)?;
        let config = IbcPolicyConfig::load(dir.join(CONFIG))
            .map_err(|err| anyhow!("failed to load {}: {err:?}", dir.join(CONFIG).display()))?;
        let model = load_weights(dir, config.init_model::<B>(device), device)?;

        IbcPolicy::new(config, model, load_normalizer(dir)?)
    }
}

impl<B: Backend> Checkpoint<B> for BcPolicy<B> {
    const KIND: PolicyKind = PolicyKind::Bc;

    fn save(&self, dir: &Path) -> Result<()> {
        write_parts::<B, _, _>(dir, Self::KIND, self.config(), self.bc_model().clone(), self.normalizer())
    }

    fn load(dir: &Path, device: &B::Device) -> Result<Self> {
        ensure_kind(dir, Self::KIND)?;
        let config = BcPolicyConfig::load(dir.join(CONFIG))
            .map_err(|err| anyhow!("failed to load {}: {err:?}", dir.join(CONFIG).display()))?;
        let model = load_weights(dir, config.init_model::<B>(device), device)?;

        BcPolicy::new(config, model, load_normalizer(dir)?)
    }
}

fn write_parts<B, M, C>(dir: &Path, kind: PolicyKind, config: &C, model: M, normalizer: &LinearNormalizer) -> Result<()>
where
    B: Backend,
    M: Module<B>,
    C: Config,
{
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let manifest = serde_json::to_string_pretty(&Manifest { kind })?;
    std::fs::write(dir.join(MANIFEST), manifest)?;
    config
        .save(dir.join(CONFIG))
        .with_context(|| format!("failed to write {}", dir.join(CONFIG).display()))?;
    model
        .save_file(dir.join(WEIGHTS), &CompactRecorder::new())
        .map_err(|err| anyhow!("failed to save weights in {}: {err:?}", dir.display()))?;
    normalizer.save(dir.join(NORMALIZER))
}

fn ensure_kind(dir: &Path, expected: PolicyKind) -> Result<()> {
    let kind = read_manifest(dir)?;
    ensure!(
        kind == expected,
        "{} holds a {kind} policy, expected {expected}",
        dir.display()
    );
    Ok(())
}

fn load_weights<B: Backend, M: Module<B>>(dir: &Path, model: M, device: &B::Device) -> Result<M> {
    let path: PathBuf = dir.join(WEIGHTS);
    model
        .load_file(path.clone(), &CompactRecorder::new(), device)
        .map_err(|err| anyhow!("failed to load weights {}: {err:?}", path.display()))
}

fn load_normalizer(dir: &Path) -> Result<LinearNormalizer> {
    let path = dir.join(NORMALIZER);
    ensure!(path.exists(), "missing normalizer {}", path.display());
    LinearNormalizer::load(&path)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        test_util::{TestBackend, bc_config, device, ibc_config, observation, unit_normalizer},
        util::to_vec,
    };

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("policy-attack-checkpoint-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn bc_policies_predict_the_same_after_a_reload() {
        let dir = scratch("bc");
        let policy = bc_config().init::<TestBackend>(unit_normalizer(), &device()).unwrap();
        policy.save(&dir).unwrap();

        let restored = BcPolicy::<TestBackend>::load(&dir, &device()).unwrap();
        let obs = observation::<TestBackend>(2, &device());
        let mut rng = StdRng::seed_from_u64(0);

        let before = to_vec(policy.predict_action(&obs, &mut rng).unwrap()).unwrap();
        let after = to_vec(restored.predict_action(&obs, &mut rng).unwrap()).unwrap();

        // weights are stored in half precision
        assert_eq!(read_manifest(&dir).unwrap(), PolicyKind::Bc);
        for (a, b) in before.iter().zip(&after) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-2);
        }
    }

    #[test]
    fn loading_checks_the_manifest_kind() {
        let dir = scratch("kind");
        ibc_config()
            .init::<TestBackend>(unit_normalizer(), &device())
            .unwrap()
            .save(&dir)
            .unwrap();

        assert!(BcPolicy::<TestBackend>::load(&dir, &device()).is_err());
        assert!(IbcPolicy::<TestBackend>::load(&dir, &device()).is_ok());
    }

    #[test]
    fn missing_directories_are_reported() {
        let dir = scratch("missing");
        let err = BcPolicy::<TestBackend>::load(&dir, &device()).unwrap_err();

        assert!(err.to_string().contains(MANIFEST));
    }
}
