//! Perturbation files written by the attack workspaces.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    attack::{AttackKind, ClipRange},
    util::to_vec,
};

pub const EXTENSION: &str = "mpk";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ArtifactTensor {
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        Ok(Self {
            shape,
            values: to_vec(tensor)?,
        })
    }

    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        ensure!(
            self.shape.len() == D,
            "stored tensor has rank {}, expected {D}",
            self.shape.len()
        );
        ensure!(
            self.shape.iter().product::<usize>() == self.values.len(),
            "stored tensor has {} values for shape {:?}",
            self.values.len(),
            self.shape
        );

        Ok(Tensor::from_data(TensorData::new(self.values.clone(), self.shape.clone()), device))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactView {
    pub delta: ArtifactTensor,
    pub mask: ArtifactTensor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbationArtifact {
    pub kind: AttackKind,
    pub epsilon: f32,
    pub epoch: usize,
    pub mean_score: Option<f32>,
    pub clip: ClipRange,
    pub views: BTreeMap<String, ArtifactView>,
    pub target_offsets: Option<Vec<Vec<f32>>>,
}

impl PerturbationArtifact {
    /// `{tar|untar}_pert_{eps}_epoch_{epoch}_mean_score_{score}_{views}.mpk`
    pub fn file_name(&self) -> String {
        let score = self
            .mean_score
            .map(|score| format!("{score:.3}"))
            .unwrap_or_else(|| "none".into());
        let views = self.views.keys().cloned().collect::<Vec<_>>().join("_");

        format!(
            "{}_pert_{}_epoch_{}_mean_score_{}_{}.{EXTENSION}",
            self.kind, self.epsilon, self.epoch, score, views
        )
    }

    /// Writes into `dir` under [`Self::file_name`].
    pub fn save_in(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(self.file_name());
        self.save(&path)?;
        Ok(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = rmp_serde::encode::to_vec_named(self)?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        rmp_serde::decode::from_slice(&bytes).with_context(|| format!("failed to decode {}", path.display()))
    }
}

/// Where a perturbation resumed from `prior` is saved: `<stem>_retrain.mpk`
/// beside the prior file.
pub fn retrain_path(prior: &Path) -> PathBuf {
    let stem = prior
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    prior.with_file_name(format!("{stem}_retrain.{EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> PerturbationArtifact {
        let view = ArtifactView {
            delta: ArtifactTensor {
                shape: vec![1, 1, 2],
                values: vec![0.01, -0.02],
            },
            mask: ArtifactTensor {
                shape: vec![1, 1, 2],
                values: vec![1.0, 1.0],
            },
        };

        PerturbationArtifact {
            kind: AttackKind::Targeted,
            epsilon: 0.0625,
            epoch: 4,
            mean_score: Some(0.25),
            clip: ClipRange::default(),
            views: BTreeMap::from([("agentview_image".to_string(), view)]),
            target_offsets: Some(vec![vec![0.0, 0.1]]),
        }
    }

    #[test]
    fn file_names_encode_kind_budget_epoch_and_score() {
        assert_eq!(
            artifact().file_name(),
            "tar_pert_0.0625_epoch_4_mean_score_0.250_agentview_image.mpk"
        );
    }

    #[test]
    fn retrained_perturbations_sit_beside_their_prior() {
        let prior = Path::new("/tmp/ckpt/untar_pert_0.1_epoch_2_mean_score_0.500_view.mpk");

        assert_eq!(
            retrain_path(prior),
            Path::new("/tmp/ckpt/untar_pert_0.1_epoch_2_mean_score_0.500_view_retrain.mpk")
        );
    }

    #[test]
    fn artifacts_survive_disk() {
        let dir = std::env::temp_dir().join(format!("artifact-test-{}", std::process::id()));
        let original = artifact();

        let path = original.save_in(&dir).unwrap();
        let loaded = PerturbationArtifact::load(&path).unwrap();
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(loaded, original);
    }
}
