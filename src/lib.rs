//! loomc - Ahead-of-time compiler for a systolic-array CNN accelerator.
//!
//! This crate lowers a quantized convolutional network, expressed as a
//! dataflow graph, into the packed 32-bit instruction stream of an FPGA
//! accelerator built around an N x M multiply-accumulate array and a
//! post-processing unit.
//!
//! # Architecture
//!
//! - `schema`: accelerator capabilities and scalar types
//! - `graph`: tensors, ops, and the graph builder
//! - `optimizer`: roofline cost model and the tiling/ordering search
//! - `isa`: bit-exact instruction encoding
//! - `compiler`: fusion, padding, DRAM layout, and instruction emission
//! - `driver`: the device contract, with a mock for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use loomc::{
//!     compiler::GraphCompiler,
//!     graph::{GraphBuilder, PadSpec},
//!     schema::{AccelSpec, Dtype},
//! };
//!
//! // Describe one convolution layer.
//! let mut b = GraphBuilder::new("net");
//! let input = b.input("data", &[1, 10, 10, 16], Dtype::fixed(16, 8)).unwrap();
//! let weights = b
//!     .param("weights", &[16, 3, 3, 16], Dtype::fixed(16, 14), None)
//!     .unwrap();
//! let biases = b
//!     .param("biases", &[16], Dtype::fixed(32, 22), None)
//!     .unwrap();
//! b.conv2d(input, weights, biases, PadSpec::Same, [1, 1, 1, 1], 1)
//!     .unwrap();
//! let mut graph = b.finish();
//!
//! // Lower it for the default accelerator.
//! let out = GraphCompiler::new(AccelSpec::default())
//!     .compile(&mut graph)
//!     .unwrap();
//! out.program.write_binary("inst.bin").unwrap();
//! println!("{} instructions", out.program.word_count());
//! ```

pub mod compiler;
pub mod driver;
pub mod graph;
pub mod isa;
pub mod optimizer;
pub mod schema;

// Re-export commonly used types
pub use compiler::{CompileError, CompileOutput, GraphCompiler, LayoutPlan, Program};
pub use graph::{Graph, GraphBuilder};
pub use schema::{AccelSpec, Dtype};
