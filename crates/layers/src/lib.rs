//! Building blocks for the dense-history encoder.
//!
//! Every layer follows the `(batch, seq, hidden)` activation layout and takes
//! a [`dtypes::PrecisionPolicy`] describing how parameters stored in reduced
//! precision are promoted for matmuls and reductions.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod norm;
pub mod residual;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
pub use residual::{Dropout, Residual, ResidualConfig};
