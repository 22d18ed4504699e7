//! DRAM placement for tensors.
//!
//! Bump allocation with 1 KiB rounding and a small randomized gap
//! between regions. The gap reproduces the reference allocation pattern
//! and comes from a seeded RNG so a given compilation is byte-stable;
//! nothing downstream relies on the gap values.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph::{LayoutConflict, Tensor};
use crate::schema::ceil_div;

/// Allocation granule and minimum alignment.
const ALIGN: u64 = 1024;

/// DRAM bump allocator.
pub struct MemoryManager {
    cursor: u64,
    rng: StdRng,
}

impl MemoryManager {
    /// Create an allocator with a seeded gap RNG.
    pub fn new(seed: u64) -> Self {
        Self {
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Place a tensor. The first call assigns the cursor address and
    /// advances it; later calls return the same address.
    pub fn alloc(&mut self, tensor: &mut Tensor) -> Result<u64, LayoutConflict> {
        if let Some(addr) = tensor.fpga_addr() {
            return Ok(addr);
        }
        let addr = self.cursor;
        tensor.assign_addr(addr)?;

        let rounded = 4 * ceil_div(tensor.fpga_size_in_bytes(), ALIGN) * ALIGN;
        let gap = ALIGN * self.rng.gen_range(1..16);
        self.cursor += rounded + gap;

        debug!(
            "Assigned address {:#x}..{:#x} to tensor {}",
            addr,
            addr + tensor.fpga_size_in_bytes(),
            tensor.name
        );
        Ok(addr)
    }

    /// Bytes spanned by all allocations so far.
    pub fn high_water_mark(&self) -> u64 {
        self.cursor
    }
}
