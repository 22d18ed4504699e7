//! Graph module - Dataflow graph data model.
//!
//! Tensors and ops live in flat arenas inside [`Graph`] and reference
//! each other through [`TensorId`]/[`OpId`] indices; iteration order is
//! insertion order and is the execution order the compiler consumes.

mod builder;
mod op;
mod tensor;

pub use builder::*;
pub use op::*;
pub use tensor::*;

use std::collections::HashMap;

/// Graph construction errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Tensor with name {0} already exists")]
    DuplicateTensorName(String),
    #[error("Op with name {0} already exists")]
    DuplicateOpName(String),
    #[error("Tensor {0} already has a producer")]
    ProducerAlreadySet(String),
    #[error("{op}: expected rank {expected}, tensor {tensor} has rank {got}")]
    RankMismatch {
        op: String,
        tensor: String,
        expected: usize,
        got: usize,
    },
    #[error("{op}: expected {expected} channels, tensor {tensor} has {got}")]
    ChannelMismatch {
        op: String,
        tensor: String,
        expected: u64,
        got: u64,
    },
    #[error("{op}: {msg}")]
    InvalidOperand { op: String, msg: String },
}

/// Ordered dataflow graph.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Graph name, used in diagnostics.
    pub name: String,
    tensors: Vec<Tensor>,
    ops: Vec<Op>,
    tensor_names: HashMap<String, TensorId>,
    op_names: HashMap<String, OpId>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tensors: Vec::new(),
            ops: Vec::new(),
            tensor_names: HashMap::new(),
            op_names: HashMap::new(),
        }
    }

    /// Look up a tensor by id.
    #[inline]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    #[inline]
    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0]
    }

    /// Look up an op by id.
    #[inline]
    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.0]
    }

    /// Tensors in insertion order.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.tensors.iter().enumerate().map(|(i, t)| (TensorId(i), t))
    }

    /// Ops in insertion (execution) order.
    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Op)> {
        self.ops.iter().enumerate().map(|(i, o)| (OpId(i), o))
    }

    /// Number of ops.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Number of tensors.
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Find a tensor by name.
    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensor_names.get(name).copied()
    }

    /// Find an op by name.
    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.op_names.get(name).copied()
    }

    pub(crate) fn add_tensor(&mut self, tensor: Tensor) -> Result<TensorId, GraphError> {
        if self.tensor_names.contains_key(&tensor.name) {
            return Err(GraphError::DuplicateTensorName(tensor.name));
        }
        let id = TensorId(self.tensors.len());
        self.tensor_names.insert(tensor.name.clone(), id);
        self.tensors.push(tensor);
        Ok(id)
    }

    /// Insert an op, wiring the producer back-reference on its output
    /// and consumer lists on its inputs.
    pub(crate) fn add_op(&mut self, op: Op) -> Result<OpId, GraphError> {
        if self.op_names.contains_key(&op.name) {
            return Err(GraphError::DuplicateOpName(op.name));
        }
        let id = OpId(self.ops.len());

        let output = op.output;
        if self.tensor(output).producer.is_some() {
            return Err(GraphError::ProducerAlreadySet(
                self.tensor(output).name.clone(),
            ));
        }
        self.tensor_mut(output).producer = Some(id);
        for input in op.kind.inputs() {
            self.tensor_mut(input).consumers.push(id);
        }

        self.op_names.insert(op.name.clone(), id);
        self.ops.push(op);
        Ok(id)
    }
}
