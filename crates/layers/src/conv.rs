//! Double convolution block used at every level of the encoder and decoder.
//!
//! Inputs follow the `(batch, channels, height, width)` convention. The block
//! applies two `3x3` convolutions with unit padding, each followed by batch
//! normalisation and a ReLU, so the spatial extent is preserved and only the
//! channel count changes.
//!
//! Batch normalisation is the only mode-dependent component: with
//! `train = true` it normalises with batch statistics and updates its running
//! estimates, with `train = false` it reads the running estimates only.

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

use crate::checks;

/// Shape description of a [`DoubleConv`] block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoubleConvConfig {
    /// Channels consumed by the first convolution.
    pub in_channels: usize,
    /// Channels produced by both convolutions.
    pub out_channels: usize,
    /// Numeric stabiliser for the batch-norm variance.
    pub epsilon: f64,
    /// Weight of the current batch when updating running statistics.
    pub momentum: f64,
}

impl DoubleConvConfig {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }
}

/// `conv3x3 -> batch-norm -> relu`, twice.
#[derive(Debug, Clone)]
pub struct DoubleConv {
    config: DoubleConvConfig,
    conv1: Conv2d,
    norm1: BatchNorm,
    conv2: Conv2d,
    norm2: BatchNorm,
}

impl DoubleConv {
    /// Registers the block's parameters under `vb` (`conv1`, `bn1`, `conv2`, `bn2`).
    pub fn new(config: DoubleConvConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(
            config.in_channels,
            config.out_channels,
            3,
            conv_cfg,
            vb.pp("conv1"),
        )?;
        let norm1 = candle_nn::batch_norm(config.out_channels, norm_config(&config), vb.pp("bn1"))?;
        let conv2 = candle_nn::conv2d(
            config.out_channels,
            config.out_channels,
            3,
            conv_cfg,
            vb.pp("conv2"),
        )?;
        let norm2 = candle_nn::batch_norm(config.out_channels, norm_config(&config), vb.pp("bn2"))?;

        Ok(Self {
            config,
            conv1,
            norm1,
            conv2,
            norm2,
        })
    }

    pub fn config(&self) -> &DoubleConvConfig {
        &self.config
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_nchw("double_conv.input", xs, self.config.in_channels)?;
        let xs = self.conv1.forward(xs)?;
        let xs = self.norm1.forward_t(&xs, train)?.relu()?;
        let xs = self.conv2.forward(&xs)?;
        self.norm2.forward_t(&xs, train)?.relu()
    }
}

fn norm_config(config: &DoubleConvConfig) -> BatchNormConfig {
    BatchNormConfig {
        eps: config.epsilon,
        momentum: config.momentum,
        ..Default::default()
    }
}
