//! Neural network building blocks.
//!
//! - Weight-normalized convolutions and transposed convolutions
//! - Dilated residual blocks

mod conv;
mod resblock;

pub(crate) use conv::conv1d_ncl;
pub use conv::{WeightNormConv1d, WeightNormConvTranspose1d};
pub use resblock::{ResBlock, LRELU_SLOPE};
