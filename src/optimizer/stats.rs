//! Access statistics and the energy model.

/// On-chip buffer roles tracked by the cost model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Buffer {
    Ibuf,
    Wbuf,
    Obuf,
    Bbuf,
}

/// All buffers, in cost-model accounting order.
pub const BUFFERS: [Buffer; 4] = [Buffer::Ibuf, Buffer::Wbuf, Buffer::Obuf, Buffer::Bbuf];

/// Bit counts per memory, for one direction of access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub ibuf: u64,
    pub wbuf: u64,
    pub obuf: u64,
    pub bbuf: u64,
    pub dram: u64,
}

impl AccessCounts {
    #[inline]
    pub fn get(&self, buf: Buffer) -> u64 {
        match buf {
            Buffer::Ibuf => self.ibuf,
            Buffer::Wbuf => self.wbuf,
            Buffer::Obuf => self.obuf,
            Buffer::Bbuf => self.bbuf,
        }
    }

    #[inline]
    pub fn set(&mut self, buf: Buffer, value: u64) {
        match buf {
            Buffer::Ibuf => self.ibuf = value,
            Buffer::Wbuf => self.wbuf = value,
            Buffer::Obuf => self.obuf = value,
            Buffer::Bbuf => self.bbuf = value,
        }
    }
}

/// Per-access energy costs in pJ/bit (core cost is pJ/cycle).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyCost {
    pub leak: f64,
    pub core_dyn: f64,
    pub wbuf_read: f64,
    pub wbuf_write: f64,
    pub ibuf_read: f64,
    pub ibuf_write: f64,
    pub bbuf_read: f64,
    pub bbuf_write: f64,
    pub obuf_read: f64,
    pub obuf_write: f64,
}

/// DRAM access cost, pJ/bit.
pub const DRAM_COST: f64 = 6.0e-3;

/// Cost-model output for one candidate schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Total estimated cycles (compute + stalls + fill/drain latency).
    pub total_cycles: u64,
    /// Cycles stalled on the DRAM interface.
    pub mem_stall_cycles: u64,
    /// Bits read per memory.
    pub reads: AccessCounts,
    /// Bits written per memory.
    pub writes: AccessCounts,
}

impl Stats {
    /// Dynamic energy under the given cost vector.
    pub fn energy(&self, cost: &EnergyCost) -> f64 {
        let mut e = (self.total_cycles - self.mem_stall_cycles) as f64 * cost.core_dyn;

        e += self.reads.wbuf as f64 * cost.wbuf_read;
        e += self.writes.wbuf as f64 * cost.wbuf_write;
        e += self.reads.ibuf as f64 * cost.ibuf_read;
        e += self.writes.ibuf as f64 * cost.ibuf_write;
        e += self.reads.bbuf as f64 * cost.bbuf_read;
        e += self.writes.bbuf as f64 * cost.bbuf_write;
        e += self.reads.obuf as f64 * cost.obuf_read;
        e += self.writes.obuf as f64 * cost.obuf_write;

        e += self.reads.dram as f64 * DRAM_COST;
        e += self.writes.dram as f64 * DRAM_COST;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_counts_dram_under_zero_cost_vector() {
        let stats = Stats {
            total_cycles: 100,
            mem_stall_cycles: 10,
            reads: AccessCounts {
                dram: 1000,
                ..Default::default()
            },
            writes: AccessCounts {
                dram: 500,
                ..Default::default()
            },
        };
        let e = stats.energy(&EnergyCost::default());
        assert!((e - 1500.0 * DRAM_COST).abs() < 1e-9);
    }
}
