pub mod artifact;
pub mod attack;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logger;
pub mod normalizer;
pub mod observation;
pub mod policy;
pub mod rollout;
pub mod sampler;
pub mod training;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;
