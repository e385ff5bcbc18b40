use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the U-Net.
#[derive(Debug, Clone)]
pub struct UNetConfig {
    /// Channels of the input image (3 for RGB).
    pub input_channels: usize,
    /// Number of output classes; the head emits one logit per class.
    pub num_classes: usize,
    /// Width of the first encoder level; every level below doubles it.
    pub base_channels: usize,
    /// Number of pooling levels between the input resolution and the bottleneck.
    pub depth: usize,
    /// Dropout applied to the bottleneck activations while training.
    pub dropout_p: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl UNetConfig {
    /// Validate structural invariants of the encoder/decoder layout.
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 {
            return Err(Error::Msg("input_channels must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "num_classes must be at least 2 (got {})",
                self.num_classes
            )));
        }
        if self.base_channels == 0 {
            return Err(Error::Msg("base_channels must be greater than zero".into()));
        }
        if self.depth == 0 {
            return Err(Error::Msg("depth must be greater than zero".into()));
        }
        if self.depth > 8 {
            return Err(Error::Msg(format!(
                "depth must not exceed 8 pooling levels (got {})",
                self.depth
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameter dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }

    /// Channel width at encoder level `level` (0 = full resolution,
    /// `depth` = bottleneck).
    pub fn channels_at(&self, level: usize) -> usize {
        self.base_channels << level
    }
}
