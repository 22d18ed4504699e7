//! Accelerator capability description.

use serde::{Deserialize, Serialize};

/// Ceiling division, used throughout for lane and tile rounding.
#[inline]
pub fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Per-role on-chip SRAM capacities, in bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SramConfig {
    /// Input scratchpad.
    pub ibuf: u64,
    /// Weight scratchpad.
    pub wbuf: u64,
    /// Output scratchpad.
    pub obuf: u64,
    /// Bias scratchpad.
    pub bbuf: u64,
}

/// Systolic-array accelerator specification.
///
/// `rows` (N) is the number of input-channel lanes and `cols` (M) the
/// number of output-channel lanes of the MACC array. SRAM capacities are
/// in bits; double buffering halves the usable capacity per tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelSpec {
    /// Systolic rows (N), one input channel per row.
    pub rows: u64,
    /// Systolic columns (M), one output channel per column.
    pub cols: u64,
    /// On-chip SRAM capacities per role.
    pub sram: SramConfig,
    /// DRAM interface width in bits.
    pub mem_if_width: u64,
    /// Clock frequency in Hz (cost model only).
    pub frequency: f64,
    /// Maximum supported operand precision in bits.
    pub max_precision: u32,
    /// Minimum supported operand precision in bits.
    pub min_precision: u32,
}

impl Default for AccelSpec {
    fn default() -> Self {
        Self {
            rows: 32,
            cols: 32,
            sram: SramConfig {
                ibuf: 16 * 32 * 512,
                wbuf: 16 * 32 * 32 * 512,
                obuf: 64 * 32 * 2048,
                bbuf: 32 * 32 * 512,
            },
            mem_if_width: 256,
            frequency: 150e6,
            max_precision: 16,
            min_precision: 16,
        }
    }
}

impl AccelSpec {
    /// Validate array and memory dimensions.
    pub fn validate(&self) -> Result<(), AccelSpecError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(AccelSpecError::InvalidArrayDims);
        }
        if self.sram.ibuf == 0 || self.sram.wbuf == 0 || self.sram.obuf == 0 || self.sram.bbuf == 0
        {
            return Err(AccelSpecError::InvalidSram);
        }
        if self.mem_if_width == 0 {
            return Err(AccelSpecError::InvalidMemIfWidth);
        }
        if self.min_precision == 0 || self.max_precision < self.min_precision {
            return Err(AccelSpecError::InvalidPrecision {
                min: self.min_precision,
                max: self.max_precision,
            });
        }
        Ok(())
    }

    /// Cycles to move `size` bits over the DRAM interface.
    #[inline]
    pub fn mem_cycles(&self, size_bits: u64) -> u64 {
        ceil_div(size_bits, self.mem_if_width)
    }

    /// Compute-cycle estimate for one tile of a convolution.
    ///
    /// The per-loop trip counts (with channel dims reduced to lane
    /// groups) are sorted descending and folded as
    /// `cycles = overhead + trip * cycles`, overhead 2.
    pub fn compute_cycles(&self, ic: u64, oc: u64, ow: u64, oh: u64, b: u64, kw: u64, kh: u64) -> u64 {
        let oc_groups = ceil_div(oc, self.cols);
        let ic_groups = ceil_div(ic, self.rows);

        let mut loops = [b, oc_groups, oh, ow, kh, kw, ic_groups];
        loops.sort_unstable_by(|a, b| b.cmp(a));

        let overhead = 2;
        let mut cycles: u64 = 1;
        for trip in loops {
            cycles = overhead + trip * cycles;
        }
        cycles
    }
}

/// Accelerator specification validation errors.
#[derive(Debug, thiserror::Error)]
pub enum AccelSpecError {
    #[error("Systolic array rows/cols must be non-zero")]
    InvalidArrayDims,
    #[error("All SRAM capacities must be non-zero")]
    InvalidSram,
    #[error("DRAM interface width must be non-zero")]
    InvalidMemIfWidth,
    #[error("Invalid precision range [{min},{max}]")]
    InvalidPrecision { min: u32, max: u32 },
}
