//! Tensor descriptors and arena identifiers.

use crate::schema::Dtype;

/// Index of a tensor in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Index of an op in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// A tensor's DRAM address was assigned twice with different values.
#[derive(Debug, thiserror::Error)]
#[error("Tensor {name}: address assigned twice ({existing:#x} then {new:#x})")]
pub struct LayoutConflict {
    pub name: String,
    pub existing: u64,
    pub new: u64,
}

/// Tensor descriptor.
///
/// Shape, dtype and name are fixed at creation. The compiler writes the
/// two FPGA layout fields exactly once each: `fpga_pad` while padding a
/// macro-op and `fpga_addr` when the memory manager places the tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Name, unique within the graph.
    pub name: String,
    /// Logical shape.
    pub shape: Vec<u64>,
    /// Element type.
    pub dtype: Dtype,
    /// Producing op, or None for graph inputs and parameters.
    pub(crate) producer: Option<OpId>,
    /// Ops consuming this tensor, in creation order.
    pub(crate) consumers: Vec<OpId>,
    /// Per-dimension (leading, trailing) padding for the FPGA layout.
    pub(crate) fpga_pad: Vec<(u64, u64)>,
    /// DRAM byte offset, assigned once by the memory manager.
    pub(crate) fpga_addr: Option<u64>,
    /// Backing bytes for parameters.
    pub data: Option<Vec<u8>>,
}

impl Tensor {
    pub(crate) fn new(name: String, shape: Vec<u64>, dtype: Dtype, data: Option<Vec<u8>>) -> Self {
        let rank = shape.len();
        Self {
            name,
            shape,
            dtype,
            producer: None,
            consumers: Vec::new(),
            fpga_pad: vec![(0, 0); rank],
            fpga_addr: None,
            data,
        }
    }

    /// Producing op, if any.
    #[inline]
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    /// Consuming ops.
    #[inline]
    pub fn consumers(&self) -> &[OpId] {
        &self.consumers
    }

    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Logical element count.
    pub fn size(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Per-dimension FPGA padding.
    #[inline]
    pub fn fpga_pad(&self) -> &[(u64, u64)] {
        &self.fpga_pad
    }

    /// Shape with FPGA padding applied.
    pub fn fpga_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(self.fpga_pad.iter())
            .map(|(&d, &(lo, hi))| d + lo + hi)
            .collect()
    }

    /// Padded element count.
    pub fn fpga_size(&self) -> u64 {
        self.fpga_shape().iter().product()
    }

    /// Padded size in bytes.
    pub fn fpga_size_in_bytes(&self) -> u64 {
        self.fpga_size() * u64::from(self.dtype.bits()) / 8
    }

    /// Assigned DRAM byte offset, if placed.
    #[inline]
    pub fn fpga_addr(&self) -> Option<u64> {
        self.fpga_addr
    }

    /// Record the DRAM address. Re-assigning the same value is a no-op;
    /// a different value is a layout conflict.
    pub(crate) fn assign_addr(&mut self, addr: u64) -> Result<(), LayoutConflict> {
        match self.fpga_addr {
            None => {
                self.fpga_addr = Some(addr);
                Ok(())
            }
            Some(existing) if existing == addr => Ok(()),
            Some(existing) => Err(LayoutConflict {
                name: self.name.clone(),
                existing,
                new: addr,
            }),
        }
    }

    /// Interpret a length-1 parameter tensor's backing bytes as an f32.
    pub fn scalar_f32(&self) -> Option<f32> {
        let data = self.data.as_ref()?;
        if data.len() != 4 {
            return None;
        }
        Some(f32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }
}
