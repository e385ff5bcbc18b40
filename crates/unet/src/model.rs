use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{Conv2d, Dropout, Module, VarBuilder, VarMap};
use layers::{checks, DoubleConv, DoubleConvConfig, DownBlock, UpBlock};

use crate::config::UNetConfig;

const RUNNING_STAT_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];
const INPUT_DTYPES: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

/// Encoder-decoder segmentation network with skip connections.
///
/// Inputs and outputs use the channels-last layout of the data pipeline:
/// `(batch, height, width, channels)` in, `(batch, height, width, num_classes)`
/// logits out. All parameters, including batch-norm running statistics, are
/// owned by a single [`VarMap`].
pub struct UNet {
    config: UNetConfig,
    varmap: VarMap,
    stem: DoubleConv,
    encoder: Vec<DownBlock>,
    bottleneck_dropout: Option<Dropout>,
    decoder: Vec<UpBlock>,
    head: Conv2d,
    training: bool,
}

impl UNet {
    /// Builds the network and initialises its parameters on `config.device`.
    pub fn new(config: UNetConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let stem = DoubleConv::new(
            DoubleConvConfig::new(config.input_channels, config.channels_at(0)),
            vb.pp("stem"),
        )?;

        let mut encoder = Vec::with_capacity(config.depth);
        for level in 1..=config.depth {
            encoder.push(DownBlock::new(
                config.channels_at(level - 1),
                config.channels_at(level),
                vb.pp(format!("down{level}")),
            )?);
        }

        let bottleneck_dropout = config.dropout_p.filter(|p| *p > 0.0).map(Dropout::new);

        let mut decoder = Vec::with_capacity(config.depth);
        for level in (1..=config.depth).rev() {
            decoder.push(UpBlock::new(
                config.channels_at(level),
                config.channels_at(level - 1),
                vb.pp(format!("up{level}")),
            )?);
        }

        let head = candle_nn::conv2d(
            config.channels_at(0),
            config.num_classes,
            1,
            Default::default(),
            vb.pp("head"),
        )?;

        Ok(Self {
            config,
            varmap,
            stem,
            encoder,
            bottleneck_dropout,
            decoder,
            head,
            training: true,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Every variable of the model, sorted by name. This is the complete
    /// model state: trainable weights plus batch-norm running statistics.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    /// Variables updated by gradient descent; running statistics are excluded.
    pub fn trainable_parameters(&self) -> Vec<(String, Var)> {
        self.parameters()
            .into_iter()
            .filter(|(name, _)| !is_running_statistic(name))
            .collect()
    }

    /// Forward pass honouring the current mode flag.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        self.forward_t(inputs, self.training)
    }

    /// Produces logits shaped `(batch, height, width, num_classes)`.
    pub fn forward_t(&self, inputs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_dtype_in("unet.input", inputs, &INPUT_DTYPES)?;
        let (_, height, width, channels) = inputs.dims4()?;
        if channels != self.config.input_channels {
            return Err(Error::Msg(format!(
                "unet.input: expected {} channels in (batch, height, width, channels), got {:?}",
                self.config.input_channels,
                inputs.dims()
            )));
        }
        checks::expect_divisible_spatial("unet.input", height, width, self.config.depth)?;

        let xs = inputs
            .to_dtype(self.config.dtype)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let mut skips = Vec::with_capacity(self.config.depth);
        let mut hidden = self.stem.forward_t(&xs, train)?;
        for block in &self.encoder {
            skips.push(hidden.clone());
            hidden = block.forward_t(&hidden, train)?;
        }

        if let Some(dropout) = &self.bottleneck_dropout {
            hidden = dropout.forward(&hidden, train)?;
        }

        for block in &self.decoder {
            let skip = skips
                .pop()
                .ok_or_else(|| Error::Msg("unet: decoder has more stages than skips".into()))?;
            hidden = block.forward_t(&hidden, &skip, train)?;
        }

        let logits = self.head.forward(&hidden)?;
        logits.permute((0, 2, 3, 1))?.contiguous()
    }
}

fn is_running_statistic(name: &str) -> bool {
    RUNNING_STAT_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}
