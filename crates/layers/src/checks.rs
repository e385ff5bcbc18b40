//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention with a known
/// channel count and returns the spatial extent.
pub fn expect_nchw(label: &str, tensor: &Tensor, channels: usize) -> Result<(usize, usize)> {
    match tensor.dims() {
        [_, actual, height, width] if *actual == channels => Ok((*height, *width)),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks that both spatial dimensions can be halved `levels` times without
/// remainder, which the pooling path of an encoder requires.
pub fn expect_divisible_spatial(label: &str, height: usize, width: usize, levels: usize) -> Result<()> {
    let factor = 1usize << levels;
    if height % factor == 0 && width % factor == 0 {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: spatial size {height}x{width} must be divisible by {factor} for {levels} pooling level(s)"
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}
