//! Small tensor helpers shared by the sampler, the attacks and the evaluators.
use anyhow::{Result, anyhow, ensure};
use burn::{prelude::*, tensor::cast::ToElement};

/// Copies a float tensor back to the host as `f32` values in row-major order.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow!("failed to read tensor data: {err:?}"))
}

pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().to_f32()
}

/// Builds a rank-`D` tensor that broadcasts `values` along the last axis.
pub fn last_axis<B: Backend, const D: usize>(values: &[f32], device: &B::Device) -> Tensor<B, D> {
    let mut shape = [1usize; D];
    shape[D - 1] = values.len();

    Tensor::<B, 1>::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
        .reshape(shape)
}

/// Fails unless every element lies in `[0, 1]`.
pub fn ensure_unit_range<B: Backend, const D: usize>(tensor: &Tensor<B, D>, name: &str) -> Result<()> {
    let min = tensor.clone().min().into_scalar().to_f32();
    let max = tensor.clone().max().into_scalar().to_f32();

    ensure!(
        min >= 0.0 && max <= 1.0,
        "observation `{name}` must lie in [0, 1], found values in [{min}, {max}]"
    );

    Ok(())
}
