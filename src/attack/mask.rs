use anyhow::{Result, ensure};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Region of a view the perturbation may touch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaskSpec {
    #[default]
    Full,
    Rect {
        top: usize,
        left: usize,
        height: usize,
        width: usize,
    },
}

impl MaskSpec {
    /// Binary mask values for a `(channels, height, width)` view.
    pub fn values(&self, [c, h, w]: [usize; 3]) -> Result<Vec<f32>> {
        match *self {
            Self::Full => Ok(vec![1.0; c * h * w]),
            Self::Rect {
                top,
                left,
                height,
                width,
            } => {
                ensure!(
                    top + height <= h && left + width <= w,
                    "patch at ({top}, {left}) of size {height}x{width} exceeds the {h}x{w} view"
                );

                let mut values = vec![0.0; c * h * w];
                for channel in 0..c {
                    for row in top..top + height {
                        let start = (channel * h + row) * w + left;
                        values[start..start + width].fill(1.0);
                    }
                }
                Ok(values)
            }
        }
    }

    pub fn tensor<B: Backend>(&self, shape: [usize; 3], device: &B::Device) -> Result<Tensor<B, 3>> {
        Ok(Tensor::from_data(TensorData::new(self.values(shape)?, shape), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_masks_cover_every_channel() {
        let mask = MaskSpec::Rect {
            top: 1,
            left: 2,
            height: 2,
            width: 1,
        };

        let values = mask.values([2, 3, 4]).unwrap();

        assert_eq!(values.iter().sum::<f32>(), 4.0);
        assert_eq!(values[1 * 4 + 2], 1.0);
        assert_eq!(values[12 + 2 * 4 + 2], 1.0);
        assert_eq!(values[0], 0.0);
    }

    #[test]
    fn oversized_patches_are_rejected() {
        let mask = MaskSpec::Rect {
            top: 2,
            left: 0,
            height: 2,
            width: 1,
        };

        assert!(mask.values([1, 3, 3]).is_err());
    }

    #[test]
    fn masks_deserialize_from_toml() {
        let mask: MaskSpec = toml::from_str("type = \"rect\"\ntop = 0\nleft = 1\nheight = 2\nwidth = 3").unwrap();

        assert_eq!(
            mask,
            MaskSpec::Rect {
                top: 0,
                left: 1,
                height: 2,
                width: 3
            }
        );
    }
}
