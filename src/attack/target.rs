use anyhow::{Result, ensure};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Offsets added to the clean prediction to form the attack target.
///
/// Either a single row broadcast over every action step, or one row per step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetOffsets {
    rows: Vec<Vec<f32>>,
}

impl TargetOffsets {
    pub fn new(rows: Vec<Vec<f32>>) -> Result<Self> {
        ensure!(!rows.is_empty(), "target offsets need at least one row");
        let dim = rows[0].len();
        ensure!(dim > 0, "target offset rows must not be empty");
        ensure!(
            rows.iter().all(|row| row.len() == dim),
            "target offset rows disagree on the action dimension"
        );

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    /// `prediction + offsets` for `(batch, steps, action_dim)` predictions.
    pub fn apply<B: Backend>(&self, prediction: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_, steps, dim] = prediction.dims();
        ensure!(
            self.rows[0].len() == dim,
            "target offsets have dimension {}, actions have {dim}",
            self.rows[0].len()
        );
        ensure!(
            self.rows.len() == 1 || self.rows.len() == steps,
            "{} offset rows cannot cover {steps} action steps",
            self.rows.len()
        );

        let values = (0..steps)
            .flat_map(|step| self.rows[step % self.rows.len()].iter().copied())
            .collect::<Vec<_>>();
        let offsets = Tensor::from_data(TensorData::new(values, [1, steps, dim]), &prediction.device());

        Ok(prediction + offsets)
    }
}
