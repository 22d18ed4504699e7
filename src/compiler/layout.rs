//! Tensor layout plan.
//!
//! The driver uses this to marshal weights, biases and inputs into DRAM
//! and to locate outputs. Only tensors the compiler actually placed
//! appear; fused intermediates have no DRAM presence.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::graph::Graph;

/// DRAM placement record for one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub name: String,
    /// Logical shape.
    pub shape: Vec<u64>,
    /// Shape with FPGA padding applied.
    pub padded_shape: Vec<u64>,
    /// Element width in bits.
    pub element_bits: u32,
    /// DRAM byte offset.
    pub dram_addr: u64,
}

impl TensorLayout {
    /// Padded size in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        self.padded_shape.iter().product::<u64>() * u64::from(self.element_bits) / 8
    }
}

/// The full placement of a compiled graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutPlan {
    pub tensors: Vec<TensorLayout>,
}

impl LayoutPlan {
    /// Collect every placed tensor, in graph order.
    pub fn from_graph(graph: &Graph) -> Self {
        let tensors = graph
            .tensors()
            .filter_map(|(_, t)| {
                t.fpga_addr().map(|addr| TensorLayout {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    padded_shape: t.fpga_shape(),
                    element_bits: t.dtype.bits(),
                    dram_addr: addr,
                })
            })
            .collect();
        Self { tensors }
    }

    /// Find a tensor's placement by name.
    pub fn find(&self, name: &str) -> Option<&TensorLayout> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the plan next to the instruction stream.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::other)?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_roundtrips_through_json() {
        let plan = LayoutPlan {
            tensors: vec![TensorLayout {
                name: "conv0/weights".into(),
                shape: vec![16, 3, 3, 3],
                padded_shape: vec![16, 3, 3, 4],
                element_bits: 16,
                dram_addr: 0x4000,
            }],
        };
        let json = plan.to_json().unwrap();
        let back: LayoutPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.find("conv0/weights").unwrap().size_in_bytes(), 1152);
    }
}
