//! Shape and dtype assertions. Each helper takes a `context` label naming the
//! tensor being checked and reports it in the error message.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the requested number of dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got {:?}",
            dims
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks two tensors share a dtype before they are combined.
pub fn expect_same_dtype(
    context: &str,
    tensor: &Tensor,
    other_context: &str,
    other: &Tensor,
) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context} has dtype {:?} but {other_context} has dtype {:?}",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];
