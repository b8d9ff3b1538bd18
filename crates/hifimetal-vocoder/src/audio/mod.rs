//! Audio feature extraction on MLX.
//!
//! - Reflect-padded framing and a windowed DFT magnitude spectrum
//! - Slaney mel filterbank and log compression

mod mel;
mod stft;

pub use mel::*;
pub use stft::*;
