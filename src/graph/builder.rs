//! Graph builder with scoped names.
//!
//! The builder is an explicit value threaded through network-definition
//! code; there is no process-wide default graph. Scope names stack into
//! `conv0/weights`-style paths and ops auto-name by kind within their
//! scope (`conv`, `conv:1`, ...).

use std::collections::HashMap;

use crate::schema::Dtype;

use super::{Graph, GraphError, Op, OpKind, PadSpec, Tensor, TensorId};

/// Builder for [`Graph`] values.
pub struct GraphBuilder {
    graph: Graph,
    scope: Vec<String>,
    op_counters: HashMap<String, usize>,
}

impl GraphBuilder {
    /// Start a new graph.
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name),
            scope: Vec::new(),
            op_counters: HashMap::new(),
        }
    }

    /// Push a name scope.
    pub fn push_scope(&mut self, name: &str) {
        self.scope.push(name.to_string());
    }

    /// Pop the innermost name scope.
    pub fn pop_scope(&mut self) {
        self.scope.pop();
    }

    /// Run `f` inside a name scope.
    pub fn scoped<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_scope(name);
        let r = f(self);
        self.pop_scope();
        r
    }

    /// Finish building and return the graph.
    pub fn finish(self) -> Graph {
        self.graph
    }

    /// Shape of a tensor built so far.
    pub fn tensor_shape(&self, id: TensorId) -> &[u64] {
        &self.graph.tensor(id).shape
    }

    /// Dtype of a tensor built so far.
    pub fn tensor_dtype(&self, id: TensorId) -> Dtype {
        self.graph.tensor(id).dtype
    }

    fn scoped_name(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope.join("/"), name)
        }
    }

    fn next_op_name(&mut self, tag: &str) -> String {
        let key = self.scoped_name(tag);
        let count = self.op_counters.entry(key.clone()).or_insert(0);
        let name = if *count == 0 {
            key
        } else {
            format!("{}:{}", key, count)
        };
        *count += 1;
        name
    }

    /// Declare a graph input.
    pub fn input(&mut self, name: &str, shape: &[u64], dtype: Dtype) -> Result<TensorId, GraphError> {
        self.graph
            .add_tensor(Tensor::new(self.scoped_name(name), shape.to_vec(), dtype, None))
    }

    /// Declare a parameter tensor, optionally with backing bytes.
    pub fn param(
        &mut self,
        name: &str,
        shape: &[u64],
        dtype: Dtype,
        data: Option<Vec<u8>>,
    ) -> Result<TensorId, GraphError> {
        self.graph
            .add_tensor(Tensor::new(self.scoped_name(name), shape.to_vec(), dtype, data))
    }

    fn add_op_with_output(
        &mut self,
        name: String,
        kind: OpKind,
        out_shape: Vec<u64>,
        out_dtype: Dtype,
    ) -> Result<TensorId, GraphError> {
        let output = self
            .graph
            .add_tensor(Tensor::new(name.clone(), out_shape, out_dtype, None))?;
        self.graph.add_op(Op { name, kind, output })?;
        Ok(output)
    }

    fn expect_rank(&self, op: &str, id: TensorId, rank: usize) -> Result<(), GraphError> {
        let t = self.graph.tensor(id);
        if t.rank() != rank {
            return Err(GraphError::RankMismatch {
                op: op.to_string(),
                tensor: t.name.clone(),
                expected: rank,
                got: t.rank(),
            });
        }
        Ok(())
    }

    /// 2-D convolution. `data` is NHWC, `weights` (OC, KH, KW, IC),
    /// `bias` (OC,). Output dtype is 64-bit fixed-point with the summed
    /// fractional widths of data and weights.
    pub fn conv2d(
        &mut self,
        data: TensorId,
        weights: TensorId,
        bias: TensorId,
        pad: PadSpec,
        stride: [u64; 4],
        group: u64,
    ) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("conv");
        self.expect_rank(&name, data, 4)?;
        self.expect_rank(&name, weights, 4)?;
        self.expect_rank(&name, bias, 1)?;

        let d = self.graph.tensor(data);
        let w = self.graph.tensor(weights);
        let bt = self.graph.tensor(bias);
        let (dn, dh, dw, dc) = (d.shape[0], d.shape[1], d.shape[2], d.shape[3]);
        let (oc, kh, kw, ic) = (w.shape[0], w.shape[1], w.shape[2], w.shape[3]);

        if ic != dc {
            return Err(GraphError::ChannelMismatch {
                op: name,
                tensor: w.name.clone(),
                expected: dc,
                got: ic,
            });
        }
        if bt.shape[0] != oc {
            return Err(GraphError::ChannelMismatch {
                op: name,
                tensor: bt.name.clone(),
                expected: oc,
                got: bt.shape[0],
            });
        }

        let pad = match pad {
            PadSpec::Same => [(0, 0), (kh / 2, kh / 2), (kw / 2, kw / 2), (0, 0)],
            PadSpec::Valid => [(0, 0); 4],
            PadSpec::Explicit(p) => p,
        };

        let hout = (dh - kh + pad[1].0 + pad[1].1) / stride[1] + 1;
        let wout = (dw - kw + pad[2].0 + pad[2].1) / stride[2] + 1;
        let out_dtype = Dtype::fixed(64, d.dtype.frac_bits() + w.dtype.frac_bits());

        self.add_op_with_output(
            name,
            OpKind::Convolution {
                data,
                weights,
                bias,
                stride,
                pad,
                group,
            },
            vec![dn, hout, wout, oc],
            out_dtype,
        )
    }

    /// Max pooling over NHWC data.
    pub fn max_pool(
        &mut self,
        data: TensorId,
        kernel: [u64; 4],
        stride: [u64; 4],
        pad: PadSpec,
    ) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("maxpool");
        self.expect_rank(&name, data, 4)?;

        let d = self.graph.tensor(data);
        let (dn, dh, dw, dc) = (d.shape[0], d.shape[1], d.shape[2], d.shape[3]);
        let (kh, kw) = (kernel[1], kernel[2]);

        let pad = match pad {
            PadSpec::Valid => [(0, 0); 4],
            PadSpec::Same => {
                let pad_h = (dh - 1) * stride[1] + kh - dh;
                let pad_w = (dw - 1) * stride[2] + kw - dw;
                [
                    (0, 0),
                    (pad_h / 2, pad_h - pad_h / 2),
                    (pad_w / 2, pad_w - pad_w / 2),
                    (0, 0),
                ]
            }
            PadSpec::Explicit(p) => p,
        };

        let hout = (dh - kh + pad[1].0 + pad[1].1) / stride[1] + 1;
        let wout = (dw - kw + pad[2].0 + pad[2].1) / stride[2] + 1;
        let out_dtype = d.dtype;

        self.add_op_with_output(
            name,
            OpKind::MaxPooling {
                data,
                kernel,
                stride,
                pad,
            },
            vec![dn, hout, wout, dc],
            out_dtype,
        )
    }

    /// Batch normalization. `mean` and `scale` are per-channel 1-D
    /// tensors; `scale` already folds `1/sqrt(var + eps)`. Output is
    /// 32-bit fixed-point with summed data/scale fractional widths.
    pub fn batch_norm(
        &mut self,
        data: TensorId,
        mean: TensorId,
        scale: TensorId,
        eps: f32,
    ) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("batchnorm");
        self.expect_rank(&name, mean, 1)?;
        self.expect_rank(&name, scale, 1)?;

        let d = self.graph.tensor(data);
        let channels = *d.shape.last().ok_or_else(|| GraphError::InvalidOperand {
            op: name.clone(),
            msg: "data tensor has rank 0".to_string(),
        })?;
        let shape = d.shape.clone();
        let out_dtype = Dtype::fixed(
            32,
            d.dtype.frac_bits() + self.graph.tensor(scale).dtype.frac_bits(),
        );

        for id in [mean, scale] {
            let t = self.graph.tensor(id);
            if t.shape[0] != channels {
                return Err(GraphError::ChannelMismatch {
                    op: name,
                    tensor: t.name.clone(),
                    expected: channels,
                    got: t.shape[0],
                });
            }
        }

        self.add_op_with_output(
            name,
            OpKind::BatchNorm {
                data,
                mean,
                scale,
                eps,
            },
            shape,
            out_dtype,
        )
    }

    /// Leaky rectifier. `alpha` is a length-1 parameter tensor.
    pub fn leaky_relu(&mut self, data: TensorId, alpha: TensorId) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("leakyrelu");
        self.expect_rank(&name, alpha, 1)?;
        let a = self.graph.tensor(alpha);
        if a.shape[0] != 1 {
            return Err(GraphError::InvalidOperand {
                op: name,
                msg: format!("alpha must be a length-1 tensor, got length {}", a.shape[0]),
            });
        }

        let d = self.graph.tensor(data);
        let (shape, dtype) = (d.shape.clone(), d.dtype);
        self.add_op_with_output(name, OpKind::LeakyReLU { data, alpha }, shape, dtype)
    }

    /// Cast to `target`. A cast to the same dtype is elided.
    pub fn typecast(&mut self, data: TensorId, target: Dtype) -> Result<TensorId, GraphError> {
        if self.graph.tensor(data).dtype == target {
            return Ok(data);
        }
        let name = self.next_op_name("typecast");
        let shape = self.graph.tensor(data).shape.clone();
        self.add_op_with_output(name, OpKind::TypeCast { data, target }, shape, target)
    }

    /// Channel-axis concatenation. Accepted by the graph but rejected by
    /// the accelerator compiler.
    pub fn concat(&mut self, inputs: &[TensorId], axis: usize) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("concat");
        let first = self.graph.tensor(inputs[0]);
        let mut shape = first.shape.clone();
        let dtype = first.dtype;
        shape[axis] = inputs
            .iter()
            .map(|&id| self.graph.tensor(id).shape[axis])
            .sum();
        self.add_op_with_output(
            name,
            OpKind::Concat {
                inputs: inputs.to_vec(),
                axis,
            },
            shape,
            dtype,
        )
    }

    /// Flatten to (batch, features). Accepted by the graph but rejected
    /// by the accelerator compiler.
    pub fn flatten(&mut self, data: TensorId) -> Result<TensorId, GraphError> {
        let name = self.next_op_name("flatten");
        let d = self.graph.tensor(data);
        let batch = d.shape[0];
        let features: u64 = d.shape[1..].iter().product();
        let dtype = d.dtype;
        self.add_op_with_output(
            name,
            OpKind::Flatten { data },
            vec![batch, features],
            dtype,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_graph() -> (Graph, TensorId) {
        let mut b = GraphBuilder::new("test");
        let input = b
            .input("data", &[1, 8, 8, 3], Dtype::fixed(16, 12))
            .unwrap();
        let out = b.scoped("conv0", |b| {
            let w = b
                .param("weights", &[16, 3, 3, 3], Dtype::fixed(16, 14), None)
                .unwrap();
            let bias = b
                .param("biases", &[16], Dtype::fixed(32, 26), None)
                .unwrap();
            b.conv2d(input, w, bias, PadSpec::Same, [1, 1, 1, 1], 1)
                .unwrap()
        });
        (b.finish(), out)
    }

    #[test]
    fn test_conv_shape_and_dtype() {
        let (g, out) = conv_graph();
        let t = g.tensor(out);
        assert_eq!(t.shape, vec![1, 8, 8, 16]);
        assert_eq!(t.dtype, Dtype::fixed(64, 26));
        assert_eq!(t.name, "conv0/conv");
    }

    #[test]
    fn test_producer_and_consumers_wired() {
        let (g, out) = conv_graph();
        let op_id = g.tensor(out).producer().expect("conv output has producer");
        assert_eq!(g.op(op_id).output, out);
        let input = g.find_tensor("data").unwrap();
        assert_eq!(g.tensor(input).consumers(), &[op_id]);
    }

    #[test]
    fn test_scoped_auto_naming() {
        let mut b = GraphBuilder::new("test");
        let input = b
            .input("data", &[1, 4, 4, 1], Dtype::FXP16)
            .unwrap();
        b.scoped("block", |b| {
            let w = b.param("w", &[4, 1, 1, 1], Dtype::FXP16, None).unwrap();
            let bias = b.param("b", &[4], Dtype::fixed(32, 16), None).unwrap();
            let c0 = b
                .conv2d(input, w, bias, PadSpec::Valid, [1, 1, 1, 1], 1)
                .unwrap();
            let w1 = b.param("w1", &[4, 1, 1, 4], Dtype::FXP16, None).unwrap();
            let b1 = b.param("b1", &[4], Dtype::fixed(32, 16), None).unwrap();
            b.conv2d(c0, w1, b1, PadSpec::Valid, [1, 1, 1, 1], 1)
                .unwrap();
        });
        let g = b.finish();
        assert!(g.find_op("block/conv").is_some());
        assert!(g.find_op("block/conv:1").is_some());
    }

    #[test]
    fn test_typecast_same_dtype_elided() {
        let mut b = GraphBuilder::new("test");
        let t = b.input("x", &[1, 2, 2, 1], Dtype::FXP16).unwrap();
        let cast = b.typecast(t, Dtype::FXP16).unwrap();
        assert_eq!(cast, t);
        assert_eq!(b.finish().op_count(), 0);
    }

    #[test]
    fn test_pool_same_padding() {
        let mut b = GraphBuilder::new("test");
        let t = b.input("x", &[1, 5, 5, 4], Dtype::FXP16).unwrap();
        let out = b
            .max_pool(t, [1, 2, 2, 1], [1, 1, 1, 1], PadSpec::Same)
            .unwrap();
        let g = b.finish();
        assert_eq!(g.tensor(out).shape, vec![1, 5, 5, 4]);
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let mut b = GraphBuilder::new("test");
        let input = b.input("data", &[1, 8, 8, 3], Dtype::FXP16).unwrap();
        let w = b.param("w", &[16, 3, 3, 4], Dtype::FXP16, None).unwrap();
        let bias = b.param("b", &[16], Dtype::fixed(32, 16), None).unwrap();
        let err = b
            .conv2d(input, w, bias, PadSpec::Same, [1, 1, 1, 1], 1)
            .unwrap_err();
        assert!(matches!(err, GraphError::ChannelMismatch { .. }));
    }
}
