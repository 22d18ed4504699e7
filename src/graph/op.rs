//! Operator descriptors.

use crate::schema::Dtype;

use super::TensorId;

/// Padding policy for convolution and pooling, resolved to explicit
/// per-dimension (leading, trailing) pairs when the op is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadSpec {
    /// Output spatial size equals input size (for stride 1).
    Same,
    /// No padding.
    Valid,
    /// Explicit NHWC padding.
    Explicit([(u64, u64); 4]),
}

/// Operator kind. Closed sum type; the compiler switches on the tag.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// 2-D convolution over NHWC data with OIHW-free (OC, KH, KW, IC)
    /// weights, bias per output channel.
    Convolution {
        data: TensorId,
        weights: TensorId,
        bias: TensorId,
        stride: [u64; 4],
        pad: [(u64, u64); 4],
        group: u64,
    },
    /// Max pooling over NHWC data.
    MaxPooling {
        data: TensorId,
        kernel: [u64; 4],
        stride: [u64; 4],
        pad: [(u64, u64); 4],
    },
    /// Batch normalization; scale already folds `1/sqrt(var + eps)`.
    BatchNorm {
        data: TensorId,
        mean: TensorId,
        scale: TensorId,
        eps: f32,
    },
    /// Leaky rectifier; alpha is a length-1 parameter tensor.
    LeakyReLU { data: TensorId, alpha: TensorId },
    /// Fixed-point width change (right shift by the frac-bit delta).
    TypeCast { data: TensorId, target: Dtype },
    /// Channel-axis concatenation. Not lowered by this compiler.
    Concat { inputs: Vec<TensorId>, axis: usize },
    /// Collapse to (batch, features). Not lowered by this compiler.
    Flatten { data: TensorId },
}

impl OpKind {
    /// Short tag used for auto-naming and diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            OpKind::Convolution { .. } => "conv",
            OpKind::MaxPooling { .. } => "maxpool",
            OpKind::BatchNorm { .. } => "batchnorm",
            OpKind::LeakyReLU { .. } => "leakyrelu",
            OpKind::TypeCast { .. } => "typecast",
            OpKind::Concat { .. } => "concat",
            OpKind::Flatten { .. } => "flatten",
        }
    }

    /// Input tensors in positional order.
    pub fn inputs(&self) -> Vec<TensorId> {
        match self {
            OpKind::Convolution {
                data,
                weights,
                bias,
                ..
            } => vec![*data, *weights, *bias],
            OpKind::MaxPooling { data, .. } => vec![*data],
            OpKind::BatchNorm {
                data, mean, scale, ..
            } => vec![*data, *mean, *scale],
            OpKind::LeakyReLU { data, alpha } => vec![*data, *alpha],
            OpKind::TypeCast { data, .. } => vec![*data],
            OpKind::Concat { inputs, .. } => inputs.clone(),
            OpKind::Flatten { data } => vec![*data],
        }
    }
}

/// Operator descriptor: a named kind plus its output tensor.
#[derive(Debug, Clone)]
pub struct Op {
    /// Name, unique within the graph (scoped by the builder).
    pub name: String,
    /// Operator kind with typed input references.
    pub kind: OpKind,
    /// Output tensor produced by this op.
    pub output: TensorId,
}
