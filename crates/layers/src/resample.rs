//! Encoder and decoder stages that change spatial resolution.
//!
//! [`DownBlock`] halves height and width with a `2x2` max-pool before its
//! [`DoubleConv`]. [`UpBlock`] doubles them with a stride-2 transposed
//! convolution, concatenates the encoder skip connection along the channel
//! axis and fuses both with a [`DoubleConv`].

use candle_core::{Error, Result, Tensor};
use candle_nn::{ConvTranspose2d, ConvTranspose2dConfig, Module, VarBuilder};

use crate::{
    checks,
    conv::{DoubleConv, DoubleConvConfig},
};

/// Contracting stage: `max_pool(2) -> DoubleConv`.
#[derive(Debug, Clone)]
pub struct DownBlock {
    conv: DoubleConv,
}

impl DownBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = DoubleConv::new(DoubleConvConfig::new(in_channels, out_channels), vb.pp("conv"))?;
        Ok(Self { conv })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (height, width) =
            checks::expect_nchw("down.input", xs, self.conv.config().in_channels)?;
        checks::expect_divisible_spatial("down.input", height, width, 1)?;
        let pooled = xs.max_pool2d(2)?;
        self.conv.forward_t(&pooled, train)
    }
}

/// Expanding stage: `conv_transpose(2, stride 2) -> concat(skip) -> DoubleConv`.
#[derive(Debug, Clone)]
pub struct UpBlock {
    up: ConvTranspose2d,
    conv: DoubleConv,
    in_channels: usize,
}

impl UpBlock {
    /// `in_channels` is the width of the coarser input; the skip connection is
    /// expected to carry `in_channels / 2` channels, as produced by the
    /// matching encoder stage.
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        if in_channels < 2 || in_channels % 2 != 0 {
            return Err(Error::Msg(format!(
                "up block input channels must be an even number >= 2 (got {in_channels})"
            )));
        }
        let half = in_channels / 2;
        let up_cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let up = candle_nn::conv_transpose2d(in_channels, half, 2, up_cfg, vb.pp("up"))?;
        let conv = DoubleConv::new(DoubleConvConfig::new(in_channels, out_channels), vb.pp("conv"))?;
        Ok(Self {
            up,
            conv,
            in_channels,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, skip: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_nchw("up.input", xs, self.in_channels)?;
        let (skip_h, skip_w) = checks::expect_nchw("up.skip", skip, self.in_channels / 2)?;

        let upsampled = self.up.forward(xs)?;
        checks::expect_shape(
            "up.upsampled",
            &upsampled,
            &[xs.dim(0)?, self.in_channels / 2, skip_h, skip_w],
        )?;

        let merged = Tensor::cat(&[skip, &upsampled], 1)?;
        self.conv.forward_t(&merged, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn down_then_up_restores_resolution() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let down = DownBlock::new(4, 8, vb.pp("down"))?;
        let up = UpBlock::new(8, 4, vb.pp("up"))?;

        let skip = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device)?;
        let coarse = down.forward_t(&skip, true)?;
        assert_eq!(coarse.dims(), &[1, 8, 4, 4]);

        let restored = up.forward_t(&coarse, &skip, true)?;
        assert_eq!(restored.dims(), &[1, 4, 8, 8]);
        Ok(())
    }

    #[test]
    fn down_rejects_odd_extent() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let down = DownBlock::new(2, 4, vb)?;

        let input = Tensor::zeros((1, 2, 5, 4), DType::F32, &device)?;
        assert!(down.forward_t(&input, false).is_err());
        Ok(())
    }

    #[test]
    fn up_rejects_skip_with_other_extent() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let up = UpBlock::new(8, 4, vb)?;

        let coarse = Tensor::zeros((1, 8, 4, 4), DType::F32, &device)?;
        let skip = Tensor::zeros((1, 4, 10, 10), DType::F32, &device)?;
        let err = up.forward_t(&coarse, &skip, false).unwrap_err();
        assert!(err.to_string().contains("up.upsampled"));
        Ok(())
    }

    #[test]
    fn up_rejects_odd_channel_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(UpBlock::new(3, 2, vb).is_err());
    }
}
