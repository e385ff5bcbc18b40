//! Building blocks for convolutional encoder-decoder networks.
//!
//! Every block consumes and produces `(batch, channels, height, width)`
//! tensors and takes an explicit `train` flag so mode-dependent components
//! (batch normalisation) behave consistently across the whole network.

pub mod checks;
pub mod conv;
pub mod resample;

pub use conv::{DoubleConv, DoubleConvConfig};
pub use resample::{DownBlock, UpBlock};
