//! Compiler module - Lowers a dataflow graph to the instruction stream.
//!
//! Each convolution and its trailing element-wise/pooling ops fuse into
//! one macro-op that maps to a single accelerator pass. Per macro-op the
//! compiler pads tensors to the array lanes, searches for a tiling and
//! loop ordering, places tensors in DRAM, and emits the block: setup and
//! base addresses, the outer tile loops, per-scratchpad transfer loops,
//! the inner MACC loops, and the PU micro-program.

mod layout;
mod memory;
mod program;
mod pu;

pub use layout::*;
pub use memory::*;
pub use program::*;

use log::debug;

use crate::graph::{Graph, LayoutConflict, OpId, OpKind, TensorId};
use crate::isa::{self, AccessType, EncodeError, Scratchpad};
use crate::optimizer::{ConvParams, InfeasibleAccelerator, LoopAxis, Tile, TilingSearch};
use crate::schema::{AccelSpec, ceil_div};

use pu::PuCompiler;

/// Compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Infeasible(#[from] InfeasibleAccelerator),
    #[error("Unsupported op {op}: {reason}")]
    UnsupportedOp { op: String, reason: String },
    #[error("Unsupported op {op} in PU block")]
    UnsupportedPuOp { op: String },
    #[error("{context}: element stride {stride} exceeds the 16-bit address generator")]
    StrideOverflow { context: &'static str, stride: u64 },
    #[error(transparent)]
    Encoding(#[from] EncodeError),
    #[error(transparent)]
    Layout(#[from] LayoutConflict),
    #[error("PU register file exhausted")]
    PuRegistersExhausted,
    #[error("Graph contains no convolution")]
    EmptyGraph,
}

/// A fusion cluster: one convolution plus the element-wise and pooling
/// ops that follow it up to the next convolution.
#[derive(Debug, Clone)]
pub struct MacroNode {
    /// The systolic-array op heading the cluster.
    pub conv: OpId,
    /// Post-conv ops, in graph order.
    pub pu_ops: Vec<OpId>,
    /// Joined member names (`conv0+bn0+pool0`).
    pub name: String,
}

/// Loop axes of the emitted nest: the five tileable loops plus the
/// never-tiled kernel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NestAxis {
    B,
    Ow,
    Oh,
    Ic,
    Oc,
    Kh,
    Kw,
}

impl NestAxis {
    pub(crate) fn label(self) -> &'static str {
        match self {
            NestAxis::B => "B/b",
            NestAxis::Ow => "OW/ow",
            NestAxis::Oh => "OH/oh",
            NestAxis::Ic => "IC/ic",
            NestAxis::Oc => "OC/oc",
            NestAxis::Kh => "KH/kh",
            NestAxis::Kw => "KW/kw",
        }
    }
}

impl From<LoopAxis> for NestAxis {
    fn from(axis: LoopAxis) -> Self {
        match axis {
            LoopAxis::Batch => NestAxis::B,
            LoopAxis::OutW => NestAxis::Ow,
            LoopAxis::OutH => NestAxis::Oh,
            LoopAxis::InC => NestAxis::Ic,
            LoopAxis::OutC => NestAxis::Oc,
        }
    }
}

/// Flattened view of a convolution op.
#[derive(Debug, Clone, Copy)]
struct ConvView {
    data: TensorId,
    weights: TensorId,
    bias: TensorId,
    output: TensorId,
    stride: [u64; 4],
    pad: [(u64, u64); 4],
}

fn conv_view(graph: &Graph, id: OpId) -> Result<ConvView, CompileError> {
    let op = graph.op(id);
    match op.kind {
        OpKind::Convolution {
            data,
            weights,
            bias,
            stride,
            pad,
            ..
        } => Ok(ConvView {
            data,
            weights,
            bias,
            output: op.output,
            stride,
            pad,
        }),
        _ => Err(CompileError::UnsupportedOp {
            op: op.name.clone(),
            reason: "macro-op head is not a convolution".to_string(),
        }),
    }
}

/// Per-axis tile sizes used by the emitter.
#[derive(Debug, Clone, Copy)]
struct TileSizes {
    b: u64,
    ow: u64,
    oh: u64,
    ic: u64,
    oc: u64,
    kh: u64,
    kw: u64,
}

impl TileSizes {
    fn from_nest(nest: &[(NestAxis, Tile)]) -> Self {
        let size = |axis| {
            nest.iter()
                .find(|(a, _)| *a == axis)
                .map(|(_, t)| t.size)
                .unwrap_or(1)
        };
        Self {
            b: size(NestAxis::B),
            ow: size(NestAxis::Ow),
            oh: size(NestAxis::Oh),
            ic: size(NestAxis::Ic),
            oc: size(NestAxis::Oc),
            kh: size(NestAxis::Kh),
            kw: size(NestAxis::Kw),
        }
    }
}

/// DRAM-resident layout of one scratchpad's tensor.
#[derive(Debug, Clone)]
struct BufLayout {
    shape: Vec<u64>,
    elem_bits: u64,
}

/// Scratchpad emission orders: base/outer strides walk the buffers in
/// declaration order, transfer groups in the documented group order.
const SP_OUTER: [Scratchpad; 4] = [
    Scratchpad::Ibuf,
    Scratchpad::Obuf,
    Scratchpad::Wbuf,
    Scratchpad::Bias,
];
const SP_MEM_GROUPS: [Scratchpad; 4] = [
    Scratchpad::Ibuf,
    Scratchpad::Wbuf,
    Scratchpad::Bias,
    Scratchpad::Obuf,
];

/// Inner compute loops run in this fixed order.
const INNER_ORDER: [NestAxis; 7] = [
    NestAxis::Ic,
    NestAxis::Kw,
    NestAxis::Kh,
    NestAxis::Ow,
    NestAxis::Oh,
    NestAxis::Oc,
    NestAxis::B,
];

/// Outer-loop DRAM stride: (dimension into the buffer's layout shape,
/// step in tiles of that dimension). A zero step still emits a zero
/// stride so the generator state advances uniformly.
fn outer_stride_spec(axis: NestAxis, sp: Scratchpad, t: &TileSizes) -> (usize, u64) {
    match (axis, sp) {
        (NestAxis::Ic, Scratchpad::Ibuf) => (3, t.ic),
        (NestAxis::Ic, Scratchpad::Wbuf) => (3, t.ic),
        (NestAxis::Oc, Scratchpad::Obuf) => (3, t.oc),
        (NestAxis::Oc, Scratchpad::Wbuf) => (0, t.oc),
        (NestAxis::Oc, Scratchpad::Bias) => (0, t.oc),
        (NestAxis::B, Scratchpad::Ibuf) => (0, t.b),
        (NestAxis::B, Scratchpad::Obuf) => (0, 1),
        (NestAxis::Oh, Scratchpad::Ibuf) => (1, t.oh),
        (NestAxis::Oh, Scratchpad::Obuf) => (1, t.oh),
        (NestAxis::Ow, Scratchpad::Ibuf) => (2, t.ow),
        (NestAxis::Ow, Scratchpad::Obuf) => (2, t.ow),
        (NestAxis::Kh, Scratchpad::Ibuf) => (1, t.kh),
        (NestAxis::Kh, Scratchpad::Wbuf) => (1, t.kh),
        (NestAxis::Kw, Scratchpad::Ibuf) => (2, t.kw),
        (NestAxis::Kw, Scratchpad::Wbuf) => (2, t.kw),
        _ => (0, 0),
    }
}

/// Inner-loop element stride: (dimension into the buffer's tile shape,
/// unit step flag).
fn inner_stride_spec(axis: NestAxis, sp: Scratchpad) -> (usize, u64) {
    match (axis, sp) {
        (NestAxis::Ic, Scratchpad::Ibuf) => (3, 1),
        (NestAxis::Ic, Scratchpad::Wbuf) => (3, 1),
        (NestAxis::Oc, Scratchpad::Obuf) => (3, 1),
        (NestAxis::Oc, Scratchpad::Wbuf) => (0, 1),
        (NestAxis::Oc, Scratchpad::Bias) => (0, 1),
        (NestAxis::B, Scratchpad::Ibuf) => (0, 1),
        (NestAxis::B, Scratchpad::Obuf) => (0, 1),
        (NestAxis::Oh, Scratchpad::Ibuf) => (1, 1),
        (NestAxis::Oh, Scratchpad::Obuf) => (1, 1),
        (NestAxis::Ow, Scratchpad::Ibuf) => (2, 1),
        (NestAxis::Ow, Scratchpad::Obuf) => (2, 1),
        (NestAxis::Kh, Scratchpad::Ibuf) => (1, 1),
        (NestAxis::Kh, Scratchpad::Wbuf) => (1, 1),
        (NestAxis::Kw, Scratchpad::Ibuf) => (2, 1),
        (NestAxis::Kw, Scratchpad::Wbuf) => (2, 1),
        _ => (0, 0),
    }
}

#[inline]
fn tail_product(shape: &[u64], dim: usize) -> u64 {
    shape[dim + 1..].iter().product()
}

/// Compiled program plus the placement the driver needs.
#[derive(Debug)]
pub struct CompileOutput {
    pub program: Program,
    pub layout: LayoutPlan,
}

/// The graph compiler.
pub struct GraphCompiler {
    acc: AccelSpec,
    seed: u64,
}

impl GraphCompiler {
    /// Create a compiler for the given accelerator.
    pub fn new(acc: AccelSpec) -> Self {
        Self { acc, seed: 0 }
    }

    /// Seed for the DRAM allocation gaps; the same seed reproduces a
    /// byte-identical instruction stream.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Compile a graph to its instruction stream and layout plan.
    ///
    /// Writes the compiler-owned tensor fields (`fpga_pad`,
    /// `fpga_addr`) into the graph as a side effect.
    pub fn compile(&self, graph: &mut Graph) -> Result<CompileOutput, CompileError> {
        let macros = fuse(graph)?;
        debug!("Fused {} ops into {} macro-ops", graph.op_count(), macros.len());

        for node in &macros {
            self.assign_padding(graph, node)?;
        }

        let mut mem = MemoryManager::new(self.seed);
        let mut pu = PuCompiler::new();
        let mut program = Program::default();
        let count = macros.len();
        for (i, node) in macros.iter().enumerate() {
            debug!("Compiling macro-op {}", node.name);
            let words = self.compile_macro(graph, &mut mem, &mut pu, node, i == count - 1)?;
            program.push_block(node.name.clone(), words);
        }

        let layout = LayoutPlan::from_graph(graph);
        Ok(CompileOutput { program, layout })
    }

    /// Pad channel dimensions up to the array lanes; the conv input
    /// additionally carries the conv's own spatial halo, the conv
    /// output any fused-pool padding.
    fn assign_padding(&self, graph: &mut Graph, node: &MacroNode) -> Result<(), CompileError> {
        let conv = conv_view(graph, node.conv)?;
        let (n, m) = (self.acc.rows, self.acc.cols);

        let ic = graph.tensor(conv.data).shape[3];
        let ic_pad = ceil_div(ic, n) * n - ic;
        let oc = graph.tensor(conv.weights).shape[0];
        let oc_pad = ceil_div(oc, m) * m - oc;

        let mut data_pad = conv.pad.to_vec();
        data_pad[3] = (0, ic_pad);
        graph.tensor_mut(conv.data).fpga_pad = data_pad;

        graph.tensor_mut(conv.weights).fpga_pad =
            vec![(0, oc_pad), (0, 0), (0, 0), (0, ic_pad)];
        graph.tensor_mut(conv.bias).fpga_pad = vec![(0, oc_pad)];

        let mut out_pad = vec![(0, 0), (0, 0), (0, 0), (0, oc_pad)];
        for &id in &node.pu_ops {
            if let OpKind::MaxPooling { pad, .. } = graph.op(id).kind {
                out_pad = pad.to_vec();
                out_pad[3] = (pad[3].0, pad[3].1 + oc_pad);
            }
        }
        graph.tensor_mut(conv.output).fpga_pad = out_pad;

        if let Some(&last) = node.pu_ops.last() {
            let out_id = graph.op(last).output;
            graph.tensor_mut(out_id).fpga_pad = vec![(0, 0), (0, 0), (0, 0), (0, oc_pad)];
        }
        Ok(())
    }

    fn compile_macro(
        &self,
        graph: &mut Graph,
        mem: &mut MemoryManager,
        pu: &mut PuCompiler,
        node: &MacroNode,
        last: bool,
    ) -> Result<Vec<u32>, CompileError> {
        let conv = conv_view(graph, node.conv)?;

        let mut pool: Option<([u64; 4], [u64; 4], [(u64, u64); 4])> = None;
        for &id in &node.pu_ops {
            if let OpKind::MaxPooling {
                kernel,
                stride,
                pad,
                ..
            } = graph.op(id).kind
            {
                pool = Some((kernel, stride, pad));
            }
        }

        let d_shape = graph.tensor(conv.data).fpga_shape();
        let w_shape = graph.tensor(conv.weights).fpga_shape();
        let o_shape = graph.tensor(conv.output).fpga_shape();
        let bias_shape = graph.tensor(conv.bias).fpga_shape();
        let iprec = u64::from(graph.tensor(conv.data).dtype.bits());
        let wprec = u64::from(graph.tensor(conv.weights).dtype.bits());
        let oprec = u64::from(graph.tensor(conv.output).dtype.bits());
        let bprec = u64::from(graph.tensor(conv.bias).dtype.bits());

        let params = ConvParams {
            k: w_shape[2],
            o: o_shape[2],
            s: conv.stride[2],
            ic: w_shape[3],
            oc: w_shape[0],
            b: d_shape[0],
            iprec,
            wprec,
            im2col: false,
        };

        let mut search = TilingSearch::new(self.acc.clone(), params);
        if let Some((kernel, stride, _)) = pool {
            search = search.with_pool(kernel, stride);
        }
        let schedule = search.run()?;
        debug!(
            "{}: schedule {:?} at {} cycles",
            node.name,
            schedule.ordering.map(|a| a.label()),
            schedule.cycles
        );

        // The chosen ordering, then the untiled kernel loops.
        let mut nest: Vec<(NestAxis, Tile)> = schedule
            .ordering
            .iter()
            .map(|&a| (NestAxis::from(a), schedule.tiling.get(a)))
            .collect();
        nest.push((NestAxis::Kh, Tile::new(1, params.k)));
        nest.push((NestAxis::Kw, Tile::new(1, params.k)));
        let ts = TileSizes::from_nest(&nest);

        let data_addr = mem.alloc(graph.tensor_mut(conv.data))?;
        let weights_addr = mem.alloc(graph.tensor_mut(conv.weights))?;
        let bias_addr = mem.alloc(graph.tensor_mut(conv.bias))?;
        let out_addr = mem.alloc(graph.tensor_mut(conv.output))?;

        let layouts = [
            BufLayout {
                shape: d_shape,
                elem_bits: iprec,
            },
            BufLayout {
                shape: o_shape,
                elem_bits: oprec,
            },
            BufLayout {
                shape: w_shape,
                elem_bits: wprec,
            },
            BufLayout {
                shape: bias_shape,
                elem_bits: bprec,
            },
        ];
        let layout = |sp: Scratchpad| &layouts[sp as usize];

        // Per-tile transfer footprints; the input halo follows from the
        // conv stride and kernel.
        let ih = (ts.oh - 1) * conv.stride[1] + ts.kh;
        let iw = (ts.ow - 1) * conv.stride[2] + ts.kw;
        let tile_shapes: [Vec<u64>; 4] = [
            vec![ts.b, ih, iw, ts.ic],
            vec![ts.b, ts.oh, ts.ow, ts.oc],
            vec![ts.oc, ts.kh, ts.kw, ts.ic],
            vec![ts.oc],
        ];
        let tile_shape = |sp: Scratchpad| &tile_shapes[sp as usize];

        let (pool_pad_h, pool_pad_w) = match pool {
            Some((_, _, pad)) => {
                if pad[1].0 != 0 || pad[2].0 != 0 {
                    return Err(CompileError::UnsupportedOp {
                        op: node.name.clone(),
                        reason: "leading pool padding is not supported".to_string(),
                    });
                }
                (pad[1].0 + pad[1].1, pad[2].0 + pad[2].1)
            }
            None => (0, 0),
        };

        let mut words: Vec<u32> = Vec::new();
        words.push(isa::setup(iprec, wprec)?);

        for index in 0..2 {
            words.push(isa::base_addr(Scratchpad::Ibuf as u64, index, data_addr)?);
            words.push(isa::base_addr(Scratchpad::Wbuf as u64, index, weights_addr)?);
            words.push(isa::base_addr(Scratchpad::Bias as u64, index, bias_addr)?);
            words.push(isa::base_addr(Scratchpad::Obuf as u64, index, out_addr)?);
        }

        // Outer tile loops: per-buffer DRAM strides advance each
        // scratchpad's base between tiles.
        let mut outer_loops = 0;
        for &(axis, tile) in &nest {
            if tile.num <= 1 {
                continue;
            }
            words.push(isa::loop_inst(16, 16, tile.num - 1)?);
            for sp in SP_OUTER {
                let (dim, step) = outer_stride_spec(axis, sp, &ts);
                let stride = tail_product(&layout(sp).shape, dim) * step * layout(sp).elem_bits / 8;
                if stride >= (1 << 16) {
                    words.push(isa::gen_addr_high(sp as u64, AccessType::Ld as u64, 16, stride)?);
                }
                words.push(isa::gen_addr_low(sp as u64, AccessType::Ld as u64, 16, stride)?);
                if sp == Scratchpad::Obuf {
                    if stride >= (1 << 16) {
                        words.push(isa::gen_addr_high(
                            sp as u64,
                            AccessType::St as u64,
                            16,
                            stride,
                        )?);
                    }
                    words.push(isa::gen_addr_low(sp as u64, AccessType::St as u64, 16, stride)?);
                }
            }
            outer_loops += 1;
        }
        if outer_loops == 0 {
            words.push(isa::loop_inst(16, 16, 0)?);
            for sp in SP_OUTER {
                words.push(isa::gen_addr_low(sp as u64, AccessType::Ld as u64, 16, 0)?);
                if sp == Scratchpad::Obuf {
                    words.push(isa::gen_addr_low(sp as u64, AccessType::St as u64, 16, 0)?);
                }
            }
        }

        // DRAM<->scratchpad transfer loops, one group per buffer, inner
        // dimensions first.
        for sp in SP_MEM_GROUPS {
            let loop_id = sp as u64 + 1;
            words.push(isa::ldmem(sp as u64, layout(sp).elem_bits, loop_id, 1)?);
            if sp == Scratchpad::Obuf {
                words.push(isa::stmem(sp as u64, layout(sp).elem_bits, loop_id, 1)?);
            }

            let shape = tile_shape(sp);
            let mut group_loops = 0;
            for dim in (0..shape.len()).rev() {
                if shape[dim] <= 1 {
                    continue;
                }
                let stride = tail_product(&layout(sp).shape, dim) * layout(sp).elem_bits / 8;
                words.push(isa::loop_inst(loop_id, loop_id, shape[dim] - 1)?);
                if stride >= (1 << 16) {
                    words.push(isa::gen_addr_high(
                        sp as u64,
                        AccessType::Ld as u64,
                        loop_id,
                        stride,
                    )?);
                }
                words.push(isa::gen_addr_low(sp as u64, AccessType::Ld as u64, loop_id, stride)?);
                if sp == Scratchpad::Obuf {
                    if stride >= (1 << 16) {
                        words.push(isa::gen_addr_high(
                            sp as u64,
                            AccessType::St as u64,
                            loop_id,
                            stride,
                        )?);
                    }
                    words.push(isa::gen_addr_low(
                        sp as u64,
                        AccessType::St as u64,
                        loop_id,
                        stride,
                    )?);
                }
                group_loops += 1;
            }
            if group_loops == 0 {
                words.push(isa::loop_inst(loop_id, loop_id, 0)?);
                words.push(isa::gen_addr_low(sp as u64, AccessType::Ld as u64, loop_id, 0)?);
                if sp == Scratchpad::Obuf {
                    words.push(isa::gen_addr_low(sp as u64, AccessType::St as u64, loop_id, 0)?);
                }
            }
        }

        // Inner compute loops walk the scratchpads in elements; these
        // generators have no high-word companion, so an overflowing
        // stride is fatal.
        let inner_size = |axis: NestAxis| match axis {
            NestAxis::B => ts.b,
            NestAxis::Ow => ts.ow - pool_pad_w,
            NestAxis::Oh => ts.oh - pool_pad_h,
            NestAxis::Ic => ts.ic,
            NestAxis::Oc => ts.oc,
            NestAxis::Kh => ts.kh,
            NestAxis::Kw => ts.kw,
        };
        let mut inner_loops = 0;
        for axis in INNER_ORDER {
            let size = inner_size(axis);
            if size <= 1 {
                continue;
            }
            words.push(isa::loop_inst(0, 0, size - 1)?);
            for sp in SP_OUTER {
                let (dim, step) = inner_stride_spec(axis, sp);
                let stride = tail_product(tile_shape(sp), dim) * step;
                if stride >= (1 << 16) {
                    return Err(CompileError::StrideOverflow {
                        context: axis.label(),
                        stride,
                    });
                }
                words.push(isa::gen_addr_low(sp as u64, AccessType::Rd as u64, 0, stride)?);
                if sp == Scratchpad::Obuf {
                    words.push(isa::gen_addr_low(sp as u64, AccessType::Wr as u64, 0, stride)?);
                }
            }
            inner_loops += 1;
        }
        if inner_loops == 0 {
            words.push(isa::loop_inst(0, 0, 0)?);
            words.push(isa::gen_addr_low(
                Scratchpad::Ibuf as u64,
                AccessType::Rd as u64,
                0,
                0,
            )?);
            words.push(isa::gen_addr_low(
                Scratchpad::Wbuf as u64,
                AccessType::Rd as u64,
                0,
                0,
            )?);
            words.push(isa::gen_addr_low(
                Scratchpad::Obuf as u64,
                AccessType::Wr as u64,
                0,
                0,
            )?);
            words.push(isa::gen_addr_low(
                Scratchpad::Obuf as u64,
                AccessType::Rd as u64,
                0,
                0,
            )?);
            words.push(isa::gen_addr_low(
                Scratchpad::Bias as u64,
                AccessType::Rd as u64,
                0,
                0,
            )?);
        }

        if let Some(block) = pu.compile(graph, mem, &nest, &node.pu_ops, self.acc.cols)? {
            words.extend_from_slice(&block);
        }

        words.push(isa::block_end(last));
        Ok(words)
    }
}

/// Walk the graph in execution order and cluster ops into macro-ops.
fn fuse(graph: &Graph) -> Result<Vec<MacroNode>, CompileError> {
    let mut macros: Vec<MacroNode> = Vec::new();
    let mut current: Option<MacroNode> = None;

    for (op_id, op) in graph.ops() {
        match &op.kind {
            OpKind::Convolution { group, .. } => {
                if *group != 1 {
                    return Err(CompileError::UnsupportedOp {
                        op: op.name.clone(),
                        reason: format!("grouped convolution (group = {})", group),
                    });
                }
                if let Some(node) = current.take() {
                    macros.push(node);
                }
                current = Some(MacroNode {
                    conv: op_id,
                    pu_ops: Vec::new(),
                    name: op.name.clone(),
                });
            }
            OpKind::MaxPooling { .. }
            | OpKind::BatchNorm { .. }
            | OpKind::LeakyReLU { .. }
            | OpKind::TypeCast { .. } => match current.as_mut() {
                Some(node) => {
                    node.pu_ops.push(op_id);
                    node.name = format!("{}+{}", node.name, op.name);
                }
                None => {
                    return Err(CompileError::UnsupportedOp {
                        op: op.name.clone(),
                        reason: "appears before the first convolution".to_string(),
                    });
                }
            },
            _ => {
                return Err(CompileError::UnsupportedOp {
                    op: op.name.clone(),
                    reason: "cannot be lowered to the accelerator".to_string(),
                });
            }
        }
    }

    let Some(node) = current else {
        return Err(CompileError::EmptyGraph);
    };
    macros.push(node);

    for node in &macros {
        validate_macro(graph, node)?;
    }
    Ok(macros)
}

/// The emitter handles square kernels and at most one pool and one
/// batch-norm per cluster.
fn validate_macro(graph: &Graph, node: &MacroNode) -> Result<(), CompileError> {
    let conv = conv_view(graph, node.conv)?;
    let conv_name = || graph.op(node.conv).name.clone();

    let w = graph.tensor(conv.weights);
    if w.shape[1] != w.shape[2] {
        return Err(CompileError::UnsupportedOp {
            op: conv_name(),
            reason: format!("non-square kernel {}x{}", w.shape[1], w.shape[2]),
        });
    }
    if conv.stride[1] != conv.stride[2] {
        return Err(CompileError::UnsupportedOp {
            op: conv_name(),
            reason: "anisotropic stride".to_string(),
        });
    }
    let out = graph.tensor(conv.output);
    if out.shape[1] != out.shape[2] {
        return Err(CompileError::UnsupportedOp {
            op: conv_name(),
            reason: format!("non-square output {}x{}", out.shape[1], out.shape[2]),
        });
    }

    let mut pools = 0;
    let mut batch_norms = 0;
    for &id in &node.pu_ops {
        match graph.op(id).kind {
            OpKind::MaxPooling { .. } => pools += 1,
            OpKind::BatchNorm { .. } => batch_norms += 1,
            _ => {}
        }
    }
    if pools > 1 {
        return Err(CompileError::UnsupportedOp {
            op: node.name.clone(),
            reason: "more than one pooling op in a fused chain".to_string(),
        });
    }
    if batch_norms > 1 {
        return Err(CompileError::UnsupportedOp {
            op: node.name.clone(),
            reason: "more than one batch-norm in a fused chain".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, PadSpec};
    use crate::isa::{Decoded, FnCode, OpCode, decode};
    use crate::schema::Dtype;

    fn accel(n: u64, m: u64) -> AccelSpec {
        AccelSpec {
            rows: n,
            cols: m,
            ..Default::default()
        }
    }

    /// Scenario 1: K=3, O=4, S=1, IC=1, OC=20, B=1 on a 4x4 array.
    fn single_conv_graph() -> Graph {
        let mut b = GraphBuilder::new("single-conv");
        let input = b
            .input("data", &[1, 6, 6, 1], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[20, 3, 3, 1], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b
            .param("biases", &[20], Dtype::fixed(32, 20), None)
            .unwrap();
        b.conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        b.finish()
    }

    /// Wide DRAM interface: compute dominates, so the search settles on
    /// the untiled schedule and the PU tile sizes below are exact.
    fn accel_wide_dram(n: u64, m: u64) -> AccelSpec {
        let mut acc = accel(n, m);
        acc.mem_if_width = 1 << 20;
        acc
    }

    /// Scenario 2/6: conv + leaky-relu + 2x2/2 max-pool on a 16x16 array.
    fn conv_relu_pool_graph() -> Graph {
        let mut b = GraphBuilder::new("conv-relu-pool");
        let input = b
            .input("data", &[1, 10, 10, 16], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[16, 3, 3, 16], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b
            .param("biases", &[16], Dtype::fixed(32, 16), None)
            .unwrap();
        let conv = b
            .conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let alpha = b
            .param(
                "alpha",
                &[1],
                Dtype::FP32,
                Some(0.1f32.to_le_bytes().to_vec()),
            )
            .unwrap();
        let act = b.leaky_relu(conv, alpha).unwrap();
        b.max_pool(act, [1, 2, 2, 1], [1, 2, 2, 1], PadSpec::Valid)
            .unwrap();
        b.finish()
    }

    /// Scenario 3: conv + batch-norm (pre-pool) + max-pool.
    fn conv_bn_pool_graph() -> Graph {
        let mut b = GraphBuilder::new("conv-bn-pool");
        let input = b
            .input("data", &[1, 10, 10, 16], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[16, 3, 3, 16], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b
            .param("biases", &[16], Dtype::fixed(32, 16), None)
            .unwrap();
        let conv = b
            .conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let mean = b
            .param("mean", &[16], Dtype::fixed(16, 8), None)
            .unwrap();
        let scale = b
            .param("scale", &[16], Dtype::fixed(16, 8), None)
            .unwrap();
        let bn = b.batch_norm(conv, mean, scale, 1e-5).unwrap();
        b.max_pool(bn, [1, 2, 2, 1], [1, 2, 2, 1], PadSpec::Valid)
            .unwrap();
        b.finish()
    }

    fn compute_words(words: &[u32]) -> Vec<(u8, u16, u8, u8)> {
        words
            .iter()
            .filter_map(|&w| match decode(w) {
                Decoded::Compute {
                    fn_code,
                    src1,
                    src0,
                    dest,
                    ..
                } => Some((fn_code, src1, src0, dest)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_conv_block_shape() {
        let mut g = single_conv_graph();
        let out = GraphCompiler::new(accel(4, 4)).compile(&mut g).unwrap();

        assert_eq!(out.program.blocks().len(), 1);
        let words = out.program.words();
        assert_eq!(words[0], isa::setup(16, 16).unwrap());
        assert_eq!(
            words[0],
            ((OpCode::Setup as u32) << 28) | ((4 << 3 | 4) << 21)
        );
        assert_eq!(*words.last().unwrap(), isa::block_end(true));
        assert_eq!(*words.last().unwrap(), (8 << 28) | 1);

        // No fused ops: the PU block is omitted entirely.
        assert!(
            words
                .iter()
                .all(|&w| (w >> 28) != OpCode::PuBlock as u32 && (w >> 28) < 11)
        );
    }

    #[test]
    fn test_single_conv_padding() {
        let mut g = single_conv_graph();
        GraphCompiler::new(accel(4, 4)).compile(&mut g).unwrap();

        // IC 1 pads to 4; OC 20 is already a multiple of 4.
        let data = g.find_tensor("data").unwrap();
        assert_eq!(g.tensor(data).fpga_pad()[3], (0, 3));
        let w = g.find_tensor("weights").unwrap();
        assert_eq!(g.tensor(w).fpga_pad()[0], (0, 0));
        assert_eq!(g.tensor(w).fpga_pad()[3], (0, 3));
        let bias = g.find_tensor("biases").unwrap();
        assert_eq!(g.tensor(bias).fpga_pad()[0], (0, 0));
    }

    #[test]
    fn test_padding_lane_invariant() {
        let mut g = conv_relu_pool_graph();
        let acc = accel(16, 16);
        GraphCompiler::new(acc.clone()).compile(&mut g).unwrap();
        for (_, t) in g.tensors() {
            if t.rank() == 4 && t.name.ends_with("weights") {
                let s = t.fpga_shape();
                assert_eq!(s[0] % acc.cols, 0);
                assert_eq!(s[3] % acc.rows, 0);
            }
        }
    }

    #[test]
    fn test_conv_relu_pool_pu_block() {
        let mut g = conv_relu_pool_graph();
        let out = GraphCompiler::new(accel_wide_dram(16, 16))
            .compile(&mut g)
            .unwrap();
        let words = out.program.words();

        // Locate the PU block.
        let start = words
            .iter()
            .position(|&w| (w >> 28) == OpCode::PuBlock as u32)
            .expect("PU block present");
        let Decoded::Control { immediate, .. } = decode(words[start]) else {
            panic!("PU_BLOCK is a control word");
        };
        let repeat = words[start + 1 + usize::from(immediate)];
        let Decoded::Control {
            op_code,
            immediate: repeat_count,
            ..
        } = decode(repeat)
        else {
            panic!("repeat is a control word");
        };
        assert_eq!(op_code, OpCode::BlockEnd as u8);
        // b * pool_ow * pool_oh * oc = 1 * 4 * 4 * 16.
        assert_eq!(repeat_count, 255);

        // Pre-pool leaky-relu runs once per 2x2 window element, then
        // three max-reductions fold the window, the last pushing to ST.
        let compute = compute_words(&words);
        let count = |f: FnCode| compute.iter().filter(|c| c.0 == f as u8).count();
        assert_eq!(count(FnCode::Nop), 4);
        assert_eq!(count(FnCode::Mul), 4);
        assert_eq!(count(FnCode::Rshift), 4);
        assert_eq!(count(FnCode::Max), 4 + 3);
        let last = compute.last().unwrap();
        assert_eq!(last.0, FnCode::Max as u8);
        assert_eq!(last.3, crate::isa::DEST_ST_PUSH);

        // alpha 0.1 quantizes to round(0.1 * 2^16).
        assert!(
            compute
                .iter()
                .any(|c| c.0 == FnCode::Mul as u8 && c.1 == 6554)
        );
    }

    #[test]
    fn test_conv_bn_pool_streams() {
        let mut g = conv_bn_pool_graph();
        let out = GraphCompiler::new(accel_wide_dram(16, 16))
            .compile(&mut g)
            .unwrap();
        let words = out.program.words();

        // Conv path emits 8 base addresses, the PU 7 more (OBUF-read,
        // ST x2, LD0 x2, LD1 x2).
        let base_addrs = words
            .iter()
            .filter(|&&w| (w >> 28) == OpCode::BaseAddr as u32)
            .count();
        assert_eq!(base_addrs, 15);

        // The bn parameter streams load at 32 bits per element.
        assert!(words.contains(&isa::ldmem(2, 32, 0, 0).unwrap()));
        assert!(words.contains(&isa::ldmem(3, 32, 0, 0).unwrap()));

        // bn scale/mean registers are seeded exactly once, before the
        // window reduction begins.
        let compute = compute_words(&words);
        let ld0_pops = compute
            .iter()
            .filter(|c| c.0 == FnCode::Nop as u8 && c.2 == 9)
            .count();
        let ld1_pops = compute
            .iter()
            .filter(|c| c.0 == FnCode::Nop as u8 && c.2 == 10)
            .count();
        assert_eq!(ld0_pops, 1);
        assert_eq!(ld1_pops, 1);
        let first_max = compute.iter().position(|c| c.0 == FnCode::Max as u8);
        let ld0_pos = compute
            .iter()
            .position(|c| c.0 == FnCode::Nop as u8 && c.2 == 9);
        assert!(ld0_pos.unwrap() < first_max.unwrap());
    }

    #[test]
    fn test_stride_overflow_is_fatal() {
        // IC large enough that the weight scratchpad's inner OC stride
        // (kh * kw * ic elements) crosses 2^16.
        let mut b = GraphBuilder::new("overflow");
        let input = b
            .input("data", &[1, 1, 1, 1 << 18], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[4, 1, 1, 1 << 18], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b
            .param("biases", &[4], Dtype::fixed(32, 16), None)
            .unwrap();
        b.conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let mut g = b.finish();

        let mut acc = accel(4, 4);
        acc.sram.ibuf = 1 << 21; // caps the IC tile at 2^16
        acc.sram.wbuf = 1 << 23;
        acc.sram.obuf = 1 << 30;
        acc.sram.bbuf = 1 << 20;
        // Compute-bound: the search takes the largest feasible IC tile.
        acc.mem_if_width = 1 << 20;

        let err = GraphCompiler::new(acc).compile(&mut g).unwrap_err();
        assert!(matches!(err, CompileError::StrideOverflow { .. }), "{err}");
    }

    #[test]
    fn test_infeasible_accelerator() {
        // 11x11 kernel over 1024 channels: even a 1x1 output tile needs
        // 11*11*32 input elements, which overflows an 8 KiB IBUF half.
        let mut b = GraphBuilder::new("infeasible");
        let input = b
            .input("data", &[1, 74, 74, 1024], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[1024, 11, 11, 1024], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b
            .param("biases", &[1024], Dtype::fixed(32, 16), None)
            .unwrap();
        b.conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let mut g = b.finish();

        let mut acc = accel(32, 32);
        acc.sram.ibuf = 8 * 1024 * 8;

        let err = GraphCompiler::new(acc).compile(&mut g).unwrap_err();
        assert!(matches!(err, CompileError::Infeasible(_)), "{err}");
    }

    #[test]
    fn test_deterministic_compilation() {
        let compile = || {
            let mut g = conv_relu_pool_graph();
            let out = GraphCompiler::new(accel_wide_dram(16, 16))
                .with_seed(42)
                .compile(&mut g)
                .unwrap();
            (out.program.words(), out.layout)
        };
        let (words_a, layout_a) = compile();
        let (words_b, layout_b) = compile();
        assert_eq!(words_a, words_b);
        assert_eq!(layout_a, layout_b);
    }

    #[test]
    fn test_layout_regions_disjoint() {
        let mut g = conv_bn_pool_graph();
        let out = GraphCompiler::new(accel(16, 16)).compile(&mut g).unwrap();
        let mut regions: Vec<(u64, u64)> = out
            .layout
            .tensors
            .iter()
            .map(|t| (t.dram_addr, t.dram_addr + t.size_in_bytes()))
            .collect();
        assert!(!regions.is_empty());
        regions.sort();
        for pair in regions.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
    }

    #[test]
    fn test_non_conv_before_first_conv_rejected() {
        let mut b = GraphBuilder::new("bad");
        let input = b
            .input("data", &[1, 4, 4, 4], Dtype::fixed(16, 8))
            .unwrap();
        b.max_pool(input, [1, 2, 2, 1], [1, 2, 2, 1], PadSpec::Valid)
            .unwrap();
        let mut g = b.finish();
        let err = GraphCompiler::new(accel(4, 4)).compile(&mut g).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOp { .. }), "{err}");
    }

    #[test]
    fn test_grouped_conv_rejected() {
        let mut b = GraphBuilder::new("grouped");
        let input = b
            .input("data", &[1, 4, 4, 4], Dtype::fixed(16, 8))
            .unwrap();
        let w = b
            .param("weights", &[4, 1, 1, 4], Dtype::fixed(16, 8), None)
            .unwrap();
        let bias = b.param("biases", &[4], Dtype::fixed(32, 16), None).unwrap();
        b.conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 2)
            .unwrap();
        let mut g = b.finish();
        let err = GraphCompiler::new(accel(4, 4)).compile(&mut g).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOp { .. }), "{err}");
    }

    #[test]
    fn test_two_macro_ops_share_one_stream() {
        let mut b = GraphBuilder::new("two-layer");
        let input = b
            .input("data", &[1, 10, 10, 16], Dtype::fixed(16, 8))
            .unwrap();
        let w0 = b
            .param("w0", &[16, 3, 3, 16], Dtype::fixed(16, 8), None)
            .unwrap();
        let b0 = b.param("b0", &[16], Dtype::fixed(32, 16), None).unwrap();
        let c0 = b
            .conv2d(input, w0, b0, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let w1 = b
            .param("w1", &[16, 3, 3, 16], Dtype::fixed(16, 8), None)
            .unwrap();
        let b1 = b.param("b1", &[16], Dtype::fixed(32, 16), None).unwrap();
        b.conv2d(c0, w1, b1, PadSpec::Valid, [1, 1, 1, 1], 1)
            .unwrap();
        let mut g = b.finish();

        let out = GraphCompiler::new(accel(16, 16)).compile(&mut g).unwrap();
        assert_eq!(out.program.blocks().len(), 2);

        // Only the final block carries the last-block marker.
        let blocks = out.program.blocks();
        assert_eq!(*blocks[0].words.last().unwrap(), isa::block_end(false));
        assert_eq!(*blocks[1].words.last().unwrap(), isa::block_end(true));
    }
}
