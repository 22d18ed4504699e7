//! Schema module - Accelerator capabilities and scalar types.

mod accel;
mod dtype;

pub use accel::*;
pub use dtype::*;
