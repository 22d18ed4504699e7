//! Tiling and ordering search.
//!
//! Enumerates all 120 outer-loop orderings, and for each one all
//! power-of-two tilings of the five loops (OC tiles counted in units of
//! M lanes; KH/KW never tiled), scoring each candidate with the cost
//! model and keeping the minimum by (cycles, energy, ordering index).
//! The ordering-index tie-break makes sequential and parallel searches
//! return identical results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rayon::prelude::*;

use crate::schema::{AccelSpec, ceil_div};

use super::cost::{ConvParams, Ordering, TILE_AXES, Tile, Tiling, estimate_stats};
use super::stats::EnergyCost;

/// No candidate tiling fits within the SRAM half-capacity budgets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No feasible tiling fits the accelerator's SRAM budgets")]
pub struct InfeasibleAccelerator;

/// Winning schedule for one convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub tiling: Tiling,
    pub ordering: Ordering,
    pub cycles: u64,
    pub energy: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    tiling: Tiling,
    ordering: Ordering,
    ordering_idx: usize,
    cycles: u64,
    energy: f64,
}

impl Candidate {
    fn better_than(&self, other: &Candidate) -> bool {
        (self.cycles, self.energy, self.ordering_idx)
            < (other.cycles, other.energy, other.ordering_idx)
    }
}

fn min_candidate(a: Option<Candidate>, b: Option<Candidate>) -> Option<Candidate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.better_than(&a) { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// All permutations of the five tileable axes, in a fixed order.
fn all_orderings() -> Vec<Ordering> {
    fn permute(axes: &mut Ordering, k: usize, out: &mut Vec<Ordering>) {
        if k == axes.len() {
            out.push(*axes);
            return;
        }
        for i in k..axes.len() {
            axes.swap(k, i);
            permute(axes, k + 1, out);
            axes.swap(k, i);
        }
    }
    let mut out = Vec::with_capacity(120);
    let mut axes = TILE_AXES;
    permute(&mut axes, 0, &mut out);
    out
}

fn log2_ceil(x: u64) -> u32 {
    (x as f64).log2().ceil() as u32
}

/// Search over tilings and orderings for one fused convolution.
pub struct TilingSearch {
    acc: AccelSpec,
    params: ConvParams,
    pool_kernel: [u64; 4],
    pool_stride: [u64; 4],
    energy_cost: EnergyCost,
    cancelled: Arc<AtomicBool>,
}

impl TilingSearch {
    /// Search for a bare convolution (no fused pool).
    pub fn new(acc: AccelSpec, params: ConvParams) -> Self {
        Self {
            acc,
            params,
            pool_kernel: [1; 4],
            pool_stride: [1; 4],
            energy_cost: EnergyCost::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Constrain the search to a convolution fused with a pool: OW/OH
    /// tile sizes are derived from pooled-output tiles so every conv
    /// tile covers whole pool windows.
    pub fn with_pool(mut self, kernel: [u64; 4], stride: [u64; 4]) -> Self {
        self.pool_kernel = kernel;
        self.pool_stride = stride;
        self
    }

    /// Use a non-zero energy cost vector for tie-breaking.
    pub fn with_energy_cost(mut self, cost: EnergyCost) -> Self {
        self.energy_cost = cost;
        self
    }

    /// Handle for cooperative cancellation; the search returns its
    /// best-so-far result after the flag is raised.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run the search across worker threads.
    pub fn run(&self) -> Result<Schedule, InfeasibleAccelerator> {
        let best = all_orderings()
            .par_iter()
            .enumerate()
            .map(|(idx, ordering)| {
                if self.cancelled.load(AtomicOrdering::Relaxed) {
                    return None;
                }
                self.best_for_ordering(idx, ordering)
            })
            .reduce(|| None, min_candidate);
        self.finish(best)
    }

    /// Run the search on the current thread. Returns the same result
    /// as [`run`](Self::run).
    pub fn run_sequential(&self) -> Result<Schedule, InfeasibleAccelerator> {
        let mut best = None;
        for (idx, ordering) in all_orderings().iter().enumerate() {
            if self.cancelled.load(AtomicOrdering::Relaxed) {
                break;
            }
            best = min_candidate(best, self.best_for_ordering(idx, ordering));
        }
        self.finish(best)
    }

    fn finish(&self, best: Option<Candidate>) -> Result<Schedule, InfeasibleAccelerator> {
        best.map(|c| Schedule {
            tiling: c.tiling,
            ordering: c.ordering,
            cycles: c.cycles,
            energy: c.energy,
        })
        .ok_or(InfeasibleAccelerator)
    }

    /// Best tiling for a fixed ordering, or None if every tiling
    /// overflows an SRAM half-budget.
    fn best_for_ordering(&self, ordering_idx: usize, ordering: &Ordering) -> Option<Candidate> {
        let p = &self.params;
        let m = self.acc.cols;

        // Tile the pooled output; each conv tile must cover its pool
        // windows exactly.
        let pool_o = (p.o - self.pool_kernel[1]) / self.pool_stride[1] + 1;

        let num_o_tiles = log2_ceil(pool_o) + 1;
        let num_ic_tiles = log2_ceil(p.ic) + 1;
        let num_oc_tiles = if p.im2col {
            log2_ceil(p.oc) + 1
        } else {
            log2_ceil(ceil_div(p.oc, m)) + 1
        };
        let num_b_tiles = log2_ceil(p.b) + 1;

        let mut best: Option<Candidate> = None;

        for b_exp in 0..num_b_tiles {
            let b = (1u64 << b_exp).min(p.b);
            let num_b = ceil_div(p.b, b);

            for o_exp in 0..num_o_tiles {
                let p_ow = (1u64 << o_exp).min(pool_o);
                let p_oh = p_ow;
                let ow = (p_ow - 1) * self.pool_stride[1] + self.pool_kernel[1];
                let oh = (p_oh - 1) * self.pool_stride[2] + self.pool_kernel[2];
                let num_ow = ceil_div(pool_o, p_ow);
                let num_oh = ceil_div(pool_o, p_oh);

                if num_ow * p_ow != pool_o {
                    continue;
                }

                for ic_exp in 0..num_ic_tiles {
                    let ic = (1u64 << ic_exp).min(p.ic);
                    let num_ic = ceil_div(p.ic, ic);

                    for oc_exp in 0..num_oc_tiles {
                        let oc = if p.im2col {
                            (1u64 << oc_exp).min(p.oc)
                        } else {
                            ((1u64 << oc_exp) * m).min(p.oc)
                        };
                        let num_oc = ceil_div(p.oc, oc);

                        let tiling = Tiling {
                            b: Tile::new(num_b, b),
                            ow: Tile::new(num_ow, ow),
                            oh: Tile::new(num_oh, oh),
                            ic: Tile::new(num_ic, ic),
                            oc: Tile::new(num_oc, oc),
                        };

                        let Some(stats) = estimate_stats(&self.acc, p, &tiling, ordering) else {
                            continue;
                        };

                        let candidate = Candidate {
                            tiling,
                            ordering: *ordering,
                            ordering_idx,
                            cycles: stats.total_cycles,
                            energy: stats.energy(&self.energy_cost),
                        };
                        best = min_candidate(best, Some(candidate));
                    }
                }
            }
        }

        best
    }
}
