use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use burn::{
    backend::{Autodiff, NdArray},
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::cast::ToElement,
};
use policy_attack::{
    artifact::{PerturbationArtifact, retrain_path},
    attack::{
        AttackKind, ClipRange, Direction, MaskSpec, PatchAttackConfig, PatchWorkspace, SignGradientStep,
        TargetOffsets, UniversalAttackConfig, UniversalWorkspace, compose,
    },
    data::{DemoBatcher, DemoDataset, DemoMeta, DemoSample},
    policy::{BcPolicy, BcPolicyConfig, EncoderConfig, ImageMeta, LowDimMeta, Policy, PolicyShape, TrainablePolicy},
    rollout::{OfflineEvaluator, RolloutConfig},
};
use rand::{SeedableRng, rngs::StdRng};

type B = Autodiff<NdArray>;

const VIEW: &str = "robot0_eye_in_hand_image";
const POS: &str = "robot0_eef_pos";

fn meta() -> DemoMeta {
    DemoMeta {
        obs_steps: 2,
        horizon: 2,
        action_dim: 2,
        images: vec![ImageMeta::new(VIEW.into(), 3, 8, 8)],
        low_dim: vec![LowDimMeta::new(POS.into(), 2)],
    }
}

fn dataset(len: usize) -> DemoDataset {
    let samples = (0..len)
        .map(|i| {
            let level = 0.25 + 0.5 * (i as f32 / len as f32);
            let pixels = (0..2 * 3 * 8 * 8)
                .map(|p| (level + 0.1 * ((p % 7) as f32 / 7.0)).min(1.0))
                .collect();
            DemoSample {
                images: BTreeMap::from([(VIEW.to_string(), pixels)]),
                low_dim: BTreeMap::from([(POS.to_string(), vec![level, 1.0 - level, level, 1.0 - level])]),
                action: vec![level, -level, level, 0.5 - level],
            }
        })
        .collect();

    DemoDataset::new(meta(), samples).unwrap()
}

fn policy(data: &DemoDataset) -> BcPolicy<B> {
    let shape = PolicyShape::new(2).with_n_obs_steps(2).with_n_action_steps(1).with_horizon(2);
    let encoder = EncoderConfig::new(data.meta().images.clone())
        .with_low_dim(data.meta().low_dim.clone())
        .with_channels(4)
        .with_feature_dim(8);

    BcPolicyConfig::new(shape, encoder)
        .with_hidden_size(16)
        .init::<B>(data.fit_normalizer().unwrap(), &Default::default())
        .unwrap()
}

fn evaluator(data: &DemoDataset) -> OfflineEvaluator<B> {
    OfflineEvaluator::new(
        RolloutConfig::new().with_batch_size(4).with_tolerance(0.5),
        data.clone(),
        Default::default(),
    )
    .unwrap()
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("policy-attack-it-{name}"));
    fs::remove_dir_all(&dir).ok();
    dir
}

fn artifacts(dir: &Path) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".mpk"))
        .collect::<Vec<_>>();
    names.sort();
    names
}

fn values<const D: usize>(tensor: Tensor<NdArray, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

#[test]
fn universal_attack_stays_within_budget_and_saves_every_epoch() {
    let data = dataset(8);
    let dir = scratch("universal");
    let config = UniversalAttackConfig::new(vec![VIEW.into()], 0.05, 0.01)
        .with_num_epochs(3)
        .with_batch_size(4);

    let workspace = UniversalWorkspace::new(
        config,
        policy(&data),
        &data,
        dir.join("logs"),
        dir.join("artifacts"),
        None,
        Default::default(),
    )
    .unwrap();
    let perturbation = workspace.run(data.clone(), &mut evaluator(&data)).unwrap();

    assert!(perturbation.linf_norm().unwrap() <= 0.05 + 1e-6);

    let names = artifacts(&dir.join("artifacts"));
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|name| name.starts_with("untar_pert_0.05_epoch_")));
    assert!(names[0].ends_with(&format!("_{VIEW}.mpk")));

    let logs = fs::read_to_string(dir.join("logs").join("logs.json.txt")).unwrap();
    assert_eq!(logs.lines().filter(|line| line.contains("attack_loss")).count(), 6);
    assert_eq!(logs.lines().filter(|line| line.contains("test/mean_score")).count(), 3);
}

#[test]
fn the_first_universal_epoch_only_measures() {
    let data = dataset(8);
    let dir = scratch("universal-baseline");
    let config = UniversalAttackConfig::new(vec![VIEW.into()], 0.05, 0.01)
        .with_kind(AttackKind::Targeted)
        .with_target_offsets(vec![vec![0.3, -0.3]])
        .with_num_epochs(1)
        .with_batch_size(4);

    let workspace = UniversalWorkspace::new(
        config,
        policy(&data),
        &data,
        dir.join("logs"),
        dir.join("artifacts"),
        None,
        Default::default(),
    )
    .unwrap();
    let perturbation = workspace.run(data.clone(), &mut evaluator(&data)).unwrap();

    assert_eq!(perturbation.linf_norm().unwrap(), 0.0);

    let names = artifacts(&dir.join("artifacts"));
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("tar_pert_0.05_epoch_0_"));

    let artifact = PerturbationArtifact::load(&dir.join("artifacts").join(&names[0])).unwrap();
    assert!(artifact.views[VIEW].delta.values.iter().all(|v| *v == 0.0));
}

#[test]
fn retraining_resumes_from_the_prior_and_saves_beside_it() {
    let data = dataset(8);
    let dir = scratch("universal-retrain");
    let config = || {
        UniversalAttackConfig::new(vec![VIEW.into()], 0.05, 0.01)
            .with_num_epochs(2)
            .with_batch_size(4)
    };

    UniversalWorkspace::new(
        config(),
        policy(&data),
        &data,
        dir.join("first"),
        dir.join("artifacts"),
        None,
        Default::default(),
    )
    .unwrap()
    .run(data.clone(), &mut evaluator(&data))
    .unwrap();
    let prior = dir.join("artifacts").join(artifacts(&dir.join("artifacts")).pop().unwrap());
    let saved = PerturbationArtifact::load(&prior).unwrap();

    let workspace = UniversalWorkspace::new(
        config().with_num_epochs(1),
        policy(&data),
        &data,
        dir.join("second"),
        dir.join("unused"),
        Some(&prior),
        Default::default(),
    )
    .unwrap();
    assert_eq!(
        values(workspace.perturbation().view(VIEW).unwrap().delta.clone()),
        saved.views[VIEW].delta.values
    );
    workspace.run(data.clone(), &mut evaluator(&data)).unwrap();

    let resumed = PerturbationArtifact::load(&retrain_path(&prior)).unwrap();
    assert_eq!(resumed.views[VIEW].delta, saved.views[VIEW].delta);
    assert!(!dir.join("unused").exists());
}

#[test]
fn universal_runs_refuse_a_used_output_directory() {
    let data = dataset(4);
    let dir = scratch("universal-used");
    fs::create_dir_all(dir.join("logs")).unwrap();

    let result = UniversalWorkspace::new(
        UniversalAttackConfig::new(vec![VIEW.into()], 0.05, 0.01),
        policy(&data),
        &data,
        dir.join("logs"),
        dir.join("artifacts"),
        None,
        Default::default(),
    );

    assert!(result.is_err());
}

#[test]
fn targeted_patch_only_touches_the_masked_region() {
    let data = dataset(8);
    let dir = scratch("patch");
    let mask = MaskSpec::Rect {
        top: 2,
        left: 3,
        height: 3,
        width: 3,
    };
    let config = PatchAttackConfig::new(VIEW.into(), 0.1, 0.02)
        .with_mask(mask.clone())
        .with_kind(AttackKind::Targeted)
        .with_target_offsets(vec![vec![0.3, -0.3]])
        .with_iterations(4)
        .with_num_epochs(1)
        .with_batch_size(4);

    let workspace =
        PatchWorkspace::new(config, policy(&data), &data, &dir, &dir, None, Default::default()).unwrap();
    let patch = workspace.run(data.clone(), &mut evaluator(&data)).unwrap();

    let delta = values(patch.view(VIEW).unwrap().delta.clone());
    let inside = mask.values([3, 8, 8]).unwrap();

    assert!(delta.iter().all(|d| d.abs() <= 0.1 + 1e-6));
    assert!(delta.iter().zip(&inside).all(|(d, m)| *m == 1.0 || *d == 0.0));
    assert!(delta.iter().zip(&inside).any(|(d, m)| *m == 1.0 && *d != 0.0));
    assert!(artifacts(&dir).iter().all(|name| name.starts_with("tar_pert_0.1_epoch_0_")));
}

#[test]
fn constant_ascent_saturates_at_epsilon() {
    let device = Default::default();
    let step = SignGradientStep::new(0.01, 0.1, Direction::Maximize).unwrap();
    let signs = Tensor::<NdArray, 3>::ones([3, 4, 4], &device);

    let delta = (0..10).fold(Tensor::zeros([3, 4, 4], &device), |delta, _| step.apply(delta, signs.clone()));

    for value in values(delta) {
        approx::assert_abs_diff_eq!(value, 0.1, epsilon = 1e-6);
    }
}

#[test]
fn descending_the_targeted_loss_lowers_it() {
    let data = dataset(4);
    let policy = policy(&data).freeze();
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(3);

    let batch = DemoBatcher::<B>::new(device, data.meta().clone()).batch(data.samples().to_vec());
    let clean = policy.predict_action(&batch.obs, &mut rng).unwrap().detach();
    let target = TargetOffsets::new(vec![vec![0.4, -0.4]]).unwrap().apply(clean.clone()).unwrap();

    let image = batch.obs.image(VIEW).unwrap().clone().inner();
    let leaf = Tensor::<B, 5>::from_inner(image.clone()).require_grad();
    let obs = batch.obs.clone().with_image(VIEW, leaf.clone());
    let loss = policy
        .targeted_loss(&obs, target.clone(), clean.clone(), &mut rng)
        .unwrap();
    let before = loss.clone().into_scalar().to_f32();
    let grad = leaf.grad(&loss.backward()).unwrap();

    let epsilon = 1e-3;
    let stepped = (image - grad.sign() * epsilon).clamp(0.0, 1.0);
    let obs = batch.obs.with_image(VIEW, Tensor::from_inner(stepped));
    let after = policy
        .targeted_loss(&obs, target, clean, &mut rng)
        .unwrap()
        .into_scalar()
        .to_f32();

    assert!(after < before, "loss went from {before} to {after}");
}

#[test]
fn a_saturated_perturbation_lowers_the_targeted_loss() {
    let data = dataset(4);
    let policy = policy(&data).freeze();
    let device = <NdArray as Backend>::Device::default();
    let mut rng = StdRng::seed_from_u64(5);
    let clip = ClipRange::default();
    let epsilon = 0.1;

    let batch = DemoBatcher::<B>::new(device.clone(), data.meta().clone()).batch(data.samples().to_vec());
    let clean = policy.predict_action(&batch.obs, &mut rng).unwrap().detach();
    let target = TargetOffsets::new(vec![vec![0.4, -0.4]]).unwrap().apply(clean.clone()).unwrap();

    let image = batch.obs.image(VIEW).unwrap().clone().inner();
    let [_, _, c, h, w] = image.dims();
    let full = MaskSpec::Full.tensor::<NdArray>([c, h, w], &device).unwrap();
    let targeted_loss = |delta: Tensor<NdArray, 3>, rng: &mut StdRng| {
        let composed = compose(image.clone(), delta, full.clone(), clip);
        let leaf = Tensor::<B, 5>::from_inner(composed).require_grad();
        let obs = batch.obs.clone().with_image(VIEW, leaf.clone());
        let loss = policy.targeted_loss(&obs, target.clone(), clean.clone(), rng).unwrap();
        (leaf, loss)
    };

    let (leaf, loss) = targeted_loss(Tensor::zeros([c, h, w], &device), &mut rng);
    let before = loss.clone().into_scalar().to_f32();
    let grad = leaf.grad(&loss.backward()).unwrap();

    let signs = grad.sum_dim(0).sum_dim(1).reshape([c, h, w]).sign();
    let step = SignGradientStep::new(epsilon, epsilon, Direction::Minimize).unwrap();
    let delta = step.apply(Tensor::zeros([c, h, w], &device), signs);
    let saturated = values(delta.clone());
    assert!(saturated.iter().all(|d| d.abs() <= epsilon));
    assert!(saturated.iter().any(|d| d.abs() == epsilon));

    let (_, loss) = targeted_loss(delta, &mut rng);
    let after = loss.into_scalar().to_f32();

    assert!(after < before, "loss went from {before} to {after}");
}
