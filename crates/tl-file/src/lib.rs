//! tl-file: Audio file access for the timeline engine
//!
//! - [`AudioReader`]: the seek/read contract every source satisfies
//! - WAV via hound, compressed formats via symphonia, in-memory buffers
//! - [`ResampleReader`]: presents any reader at the device rate
//! - [`WavFileWriter`]: recording and export output

mod error;
mod reader;
mod resample;
mod writer;

pub use error::*;
pub use reader::*;
pub use resample::*;
pub use writer::*;
