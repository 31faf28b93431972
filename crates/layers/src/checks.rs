//! Lightweight validation helpers shared across layer components.
//!
//! Every routine takes a `name` used to prefix the error message so failures
//! point at the offending parameter or input. They return
//! `candle_core::Result<()>` so call sites can propagate errors with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, features)` convention with a known feature size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Ensures the trailing axis has `size` entries.
pub fn expect_last_dim(name: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name}: expected last dim {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(name: &str, lhs: &Tensor, other: &str, rhs: &Tensor) -> Result<()> {
    if lhs.dtype() == rhs.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} dtype {:?} does not match {other} dtype {:?}",
            lhs.dtype(),
            rhs.dtype()
        )))
    }
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];
