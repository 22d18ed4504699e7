//! Post-processing unit micro-program assembly.
//!
//! The PU consumes conv outputs from the OBUF stream, applies the
//! pre-pool element-wise ops once per pool-window element, reduces the
//! window with max, applies post-pool ops, and pushes results to the
//! ST-DDR stream. Batch-norm parameters arrive on the LD0/LD1 streams.
//!
//! A macro-op with no post-conv ops gets no PU block at all.

use log::debug;

use crate::graph::{Graph, OpId, OpKind, TensorId};
use crate::isa::{
    self, ComputeInst, DEST_ST_PUSH, SRC_LD0_POP, SRC_LD1_POP, SRC_OBUF_POP,
};
use crate::optimizer::Tile;
use crate::schema::ceil_div;

use super::memory::MemoryManager;
use super::{CompileError, NestAxis};

/// PU register-file size.
const RF_SIZE: usize = 8;

/// Stream-engine ids used by the PU address generators.
const SP_OBUF_RD: u64 = 0;
const SP_ST: u64 = 1;
const SP_LD0: u64 = 2;
const SP_LD1: u64 = 3;
const SP_ST_BASE: u64 = 5;
const SP_LD0_BASE: u64 = 6;
const SP_LD1_BASE: u64 = 7;

/// Final outputs stream back to DRAM at 16 bits per value.
const ST_BYTES: u64 = 2;

/// Assembles PU micro-programs; owns the register file.
pub(crate) struct PuCompiler {
    rf: [bool; RF_SIZE],
}

impl PuCompiler {
    pub fn new() -> Self {
        Self {
            rf: [false; RF_SIZE],
        }
    }

    fn acquire_reg(&mut self) -> Result<u8, CompileError> {
        for (i, used) in self.rf.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i as u8);
            }
        }
        Err(CompileError::PuRegistersExhausted)
    }

    fn release_reg(&mut self, reg: u8) {
        self.rf[reg as usize] = false;
    }

    /// Assemble the PU block for one macro-op. Returns None when the
    /// fused chain is empty.
    pub fn compile(
        &mut self,
        graph: &mut Graph,
        mem: &mut MemoryManager,
        nest: &[(NestAxis, Tile)],
        pu_ops: &[OpId],
        simd_lanes: u64,
    ) -> Result<Option<Vec<u32>>, CompileError> {
        let Some(&last_op) = pu_ops.last() else {
            return Ok(None);
        };

        // DRAM placement for the output stream and any bn parameters.
        let out_id = graph.op(last_op).output;
        let out_base = mem.alloc(graph.tensor_mut(out_id))?;
        let mut bn_addrs: Option<(u64, u64)> = None;
        for &op in pu_ops {
            if let OpKind::BatchNorm { mean, scale, .. } = graph.op(op).kind {
                let mean_addr = mem.alloc(graph.tensor_mut(mean))?;
                let scale_addr = mem.alloc(graph.tensor_mut(scale))?;
                bn_addrs = Some((mean_addr, scale_addr));
            }
        }

        let tile = |axis: NestAxis| {
            nest.iter()
                .find(|(a, _)| *a == axis)
                .map(|(_, t)| *t)
                .unwrap_or(Tile::new(1, 1))
        };
        let b = tile(NestAxis::B).size;
        let oc = tile(NestAxis::Oc).size;
        let oh = tile(NestAxis::Oh).size;
        let ow = tile(NestAxis::Ow).size;

        // Classify the chain around the pool.
        let mut pre_pool = Vec::new();
        let mut post_pool = Vec::new();
        let (mut pool_kh, mut pool_kw, mut pool_sh, mut pool_sw) = (1u64, 1u64, 1u64, 1u64);
        let (mut pool_oh, mut pool_ow) = (oh, ow);
        let mut before_pool = true;
        for &op in pu_ops {
            match graph.op(op).kind {
                OpKind::MaxPooling { kernel, stride, .. } => {
                    pool_kh = kernel[1];
                    pool_kw = kernel[2];
                    pool_sh = stride[1];
                    pool_sw = stride[2];
                    pool_ow = (ow - pool_kw) / pool_sw + 1;
                    pool_oh = (oh - pool_kh) / pool_sh + 1;
                    before_pool = false;
                }
                _ if before_pool => pre_pool.push(op),
                _ => post_pool.push(op),
            }
        }
        let ld_required = bn_addrs.is_some();

        let t_out = graph.tensor(out_id);
        let out_shape = t_out.fpga_shape();
        let out_bits = u64::from(t_out.dtype.bits());

        // Leading padding shifts the stream's base into the region.
        let mut pad_offset = 0u64;
        for (i, &(lead, _)) in t_out.fpga_pad().iter().enumerate() {
            pad_offset += lead * out_shape[i + 1..].iter().product::<u64>();
        }
        let out_addr = out_base + pad_offset * out_bits / 8;

        debug!(
            "PU block: pool {}x{}/{} window, tile (b={}, oh={}, ow={}, oc={})",
            pool_kh, pool_kw, pool_sh, b, oh, ow, oc
        );

        let mut words: Vec<u32> = Vec::new();

        // Stream base addresses; the output base lands in both banks.
        words.push(isa::base_addr(SP_OBUF_RD, 0, 0)?);
        words.push(isa::base_addr(SP_ST, 0, out_addr)?);
        words.push(isa::base_addr(SP_ST, 1, out_addr)?);
        if let Some((mean_addr, scale_addr)) = bn_addrs {
            words.push(isa::base_addr(SP_LD0, 0, mean_addr)?);
            words.push(isa::base_addr(SP_LD0, 1, mean_addr)?);
            words.push(isa::base_addr(SP_LD1, 0, scale_addr)?);
            words.push(isa::base_addr(SP_LD1, 1, scale_addr)?);
        }

        // OBUF read-address generator: element strides over the padded
        // conv-output tile (b, oh, ow, oc).
        let obuf_loops: [(u64, u64); 6] = [
            (pool_kw, oc),
            (pool_kh, oc * ow),
            (pool_ow, oc * pool_sw),
            (pool_oh, oc * pool_sh * ow),
            (oc, 1),
            (b, oc * oh * ow),
        ];
        for (trip, stride) in obuf_loops {
            if stride >= (1 << 16) {
                return Err(CompileError::StrideOverflow {
                    context: "PU OBUF read generator",
                    stride,
                });
            }
            words.push(isa::loop_inst(SP_OBUF_RD, SP_OBUF_RD, trip - 1)?);
            words.push(isa::gen_addr_low(SP_OBUF_RD, SP_OBUF_RD, 0, stride)?);
        }

        if ld_required {
            words.push(isa::ldmem(SP_LD0, 32, 0, 0)?);
            words.push(isa::ldmem(SP_LD1, 32, 0, 0)?);
        }

        // Advance the stream bases at each outer tile step.
        let oc_groups = ceil_div(oc, simd_lanes);
        let st_shape = [
            out_shape[0],
            out_shape[1],
            out_shape[2],
            ceil_div(out_shape[3], simd_lanes),
        ];
        let mut advance_loops = 0;
        for &(axis, t) in nest {
            let (dim, pool_factor) = match axis {
                NestAxis::B => (0, b),
                NestAxis::Oh => (1, pool_oh),
                NestAxis::Ow => (2, pool_ow),
                NestAxis::Oc => (3, oc_groups),
                _ => continue,
            };
            if t.num <= 1 {
                continue;
            }
            words.push(isa::loop_inst(SP_ST_BASE, SP_ST_BASE, t.num - 1)?);
            let stride =
                st_shape[dim + 1..].iter().product::<u64>() * ST_BYTES * simd_lanes * pool_factor;
            if stride >= (1 << 16) {
                words.push(isa::gen_addr_high(SP_ST_BASE, SP_ST_BASE, 0, stride)?);
            }
            words.push(isa::gen_addr_low(SP_ST_BASE, SP_ST_BASE, 0, stride)?);
            advance_loops += 1;

            // bn streams only advance along the channel loop
            let ld_stride = if axis == NestAxis::Oc && ld_required {
                ST_BYTES * simd_lanes * oc_groups
            } else {
                0
            };
            if ld_stride >= (1 << 16) {
                return Err(CompileError::StrideOverflow {
                    context: "PU LD stream advance",
                    stride: ld_stride,
                });
            }
            words.push(isa::gen_addr_low(SP_LD0_BASE, SP_LD0_BASE, 0, ld_stride)?);
            words.push(isa::gen_addr_low(SP_LD1_BASE, SP_LD1_BASE, 0, ld_stride)?);
        }
        if advance_loops == 0 {
            words.push(isa::loop_inst(SP_ST_BASE, SP_ST_BASE, 0)?);
            words.push(isa::gen_addr_low(SP_ST_BASE, SP_ST_BASE, 0, 0)?);
            words.push(isa::gen_addr_low(SP_LD0_BASE, SP_LD0_BASE, 0, 0)?);
            words.push(isa::gen_addr_low(SP_LD1_BASE, SP_LD1_BASE, 0, 0)?);
        }

        // ST write-address generator over the pooled tile; the channel
        // dimension counts M-lane groups.
        let p_oc = ceil_div(out_shape[3], simd_lanes);
        let p_ow = st_shape[2];
        let p_oh = st_shape[1];
        let st_loops: [(u64, u64); 4] = [
            (pool_ow, p_oc),
            (pool_oh, p_oc * p_ow),
            (oc, 1),
            (b, p_oc * p_oh * p_ow),
        ];
        for (trip, stride) in st_loops {
            words.push(isa::loop_inst(SP_ST, SP_ST, trip - 1)?);
            if stride >= (1 << 16) {
                words.push(isa::gen_addr_high(SP_ST, SP_ST, 0, stride)?);
            }
            words.push(isa::gen_addr_low(SP_ST, SP_ST, 0, stride)?);
        }

        // LD0/LD1 pop once per channel group and hold otherwise.
        if ld_required {
            for sp in [SP_LD0, SP_LD1] {
                let ld_loops: [(u64, u64); 4] = [(pool_ow, 0), (pool_oh, 0), (oc, 1), (b, 0)];
                for (trip, stride) in ld_loops {
                    words.push(isa::loop_inst(sp, sp, trip - 1)?);
                    words.push(isa::gen_addr_low(sp, sp, 0, stride)?);
                }
            }
        }

        // Compute micro-program.
        let compute = self.assemble_compute(graph, &pre_pool, &post_pool, pool_kw * pool_kh)?;
        for inst in &compute {
            words.push(inst.encode()?);
        }

        let repeat = b * pool_ow * pool_oh * oc;
        words.push(isa::pu_block_repeat(repeat)?);

        debug_assert!(self.rf.iter().all(|&r| !r), "PU register leak");

        let mut block = Vec::with_capacity(words.len() + 1);
        block.push(isa::pu_block_start(words.len() as u64 - 1)?);
        block.extend_from_slice(&words);
        Ok(Some(block))
    }

    /// Expand the element-wise chain into register-file instructions,
    /// one pass per pool-window element.
    fn assemble_compute(
        &mut self,
        graph: &Graph,
        pre_pool: &[OpId],
        post_pool: &[OpId],
        window: u64,
    ) -> Result<Vec<ComputeInst>, CompileError> {
        let mut insts: Vec<ComputeInst> = Vec::new();
        let mut dest_reg: Option<u8> = None;
        let mut pool_reg: Option<u8> = None;
        let mut bn_scale_reg: Option<u8> = None;
        let mut bn_mean_reg: Option<u8> = None;

        for idx in 0..window {
            let dest = match dest_reg {
                Some(r) => r,
                None => {
                    let r = self.acquire_reg()?;
                    insts.push(ComputeInst::nop(SRC_OBUF_POP, r));
                    dest_reg = Some(r);
                    r
                }
            };

            for &op in pre_pool {
                match &graph.op(op).kind {
                    OpKind::LeakyReLU { alpha, .. } => {
                        let alpha_q16 = quantize_alpha(graph, op, *alpha)?;
                        let tmp = self.acquire_reg()?;
                        insts.push(ComputeInst::mul_imm(dest, alpha_q16, tmp));
                        insts.push(ComputeInst::rshift_imm(tmp, 16, tmp));
                        insts.push(ComputeInst::max(dest, tmp, dest));
                        self.release_reg(tmp);
                    }
                    OpKind::BatchNorm { .. } => {
                        // The parameter registers load once, before the
                        // first window element that needs them.
                        let (scale, mean) = match (bn_scale_reg, bn_mean_reg) {
                            (Some(s), Some(m)) => (s, m),
                            _ => {
                                let s = self.acquire_reg()?;
                                insts.push(ComputeInst::nop(SRC_LD0_POP, s));
                                bn_scale_reg = Some(s);
                                let m = self.acquire_reg()?;
                                insts.push(ComputeInst::nop(SRC_LD1_POP, m));
                                bn_mean_reg = Some(m);
                                (s, m)
                            }
                        };

                        // Fold the subtract into the nop that seeded
                        // dest, when it is still the previous word.
                        let fused_src = match insts.last() {
                            Some(last) if last.is_nop() && last.dest == dest => Some(last.src0),
                            _ => None,
                        };
                        match fused_src {
                            Some(src) => {
                                let tail = insts.len() - 1;
                                insts[tail] = ComputeInst::sub(src, scale, dest);
                            }
                            None => insts.push(ComputeInst::sub(dest, scale, dest)),
                        }
                        insts.push(ComputeInst::rshift_imm(dest, 0, dest));
                        insts.push(ComputeInst::mul(dest, mean, dest));
                    }
                    OpKind::TypeCast { data, target } => {
                        let shift = i64::from(graph.tensor(*data).dtype.frac_bits())
                            - i64::from(target.frac_bits());
                        insts.push(ComputeInst::rshift_imm(dest, shift, dest));
                    }
                    _ => {
                        return Err(CompileError::UnsupportedPuOp {
                            op: graph.op(op).name.clone(),
                        });
                    }
                }
            }

            match pool_reg {
                None => {
                    pool_reg = dest_reg.take();
                }
                Some(pool) => {
                    if idx != window - 1 || !post_pool.is_empty() {
                        insts.push(ComputeInst::max(dest, pool, pool));
                    } else {
                        insts.push(ComputeInst::max(dest, pool, DEST_ST_PUSH));
                        self.release_reg(pool);
                        pool_reg = None;
                    }
                    self.release_reg(dest);
                    dest_reg = None;
                }
            }
        }

        if let Some(r) = bn_scale_reg.take() {
            self.release_reg(r);
        }
        if let Some(r) = bn_mean_reg.take() {
            self.release_reg(r);
        }

        // Post-pool ops work on the reduced value; bn parameters come
        // straight off the streams here.
        let mut dest_reg = pool_reg.take();
        for &op in post_pool {
            let dest = dest_reg.ok_or_else(|| CompileError::UnsupportedPuOp {
                op: graph.op(op).name.clone(),
            })?;
            match &graph.op(op).kind {
                OpKind::LeakyReLU { alpha, .. } => {
                    let alpha_q16 = quantize_alpha(graph, op, *alpha)?;
                    let tmp = self.acquire_reg()?;
                    insts.push(ComputeInst::mul_imm(dest, alpha_q16, tmp));
                    insts.push(ComputeInst::rshift_imm(tmp, 16, tmp));
                    insts.push(ComputeInst::max(dest, tmp, dest));
                    self.release_reg(tmp);
                }
                OpKind::BatchNorm { .. } => {
                    insts.push(ComputeInst::sub(dest, SRC_LD0_POP, dest));
                    insts.push(ComputeInst::rshift_imm(dest, 0, dest));
                    insts.push(ComputeInst::mul(dest, SRC_LD1_POP, dest));
                }
                OpKind::TypeCast { data, target } => {
                    let shift = i64::from(graph.tensor(*data).dtype.frac_bits())
                        - i64::from(target.frac_bits());
                    insts.push(ComputeInst::rshift_imm(dest, shift, dest));
                }
                _ => {
                    return Err(CompileError::UnsupportedPuOp {
                        op: graph.op(op).name.clone(),
                    });
                }
            }
        }

        if let Some(dest) = dest_reg.take() {
            insts.push(ComputeInst::nop(dest, DEST_ST_PUSH));
            self.release_reg(dest);
        }

        Ok(insts)
    }
}

/// Quantize a LeakyReLU slope to Q16 and bound it to the signed 16-bit
/// immediate range.
fn quantize_alpha(graph: &Graph, op: OpId, alpha: TensorId) -> Result<i64, CompileError> {
    let value = graph
        .tensor(alpha)
        .scalar_f32()
        .ok_or_else(|| CompileError::UnsupportedOp {
            op: graph.op(op).name.clone(),
            reason: "LeakyReLU alpha tensor has no backing value".to_string(),
        })?;
    Ok((f64::from(value) * f64::from(1u32 << 16)).round() as i64)
}
