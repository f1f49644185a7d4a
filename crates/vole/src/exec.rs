// Exec — reference interpreter for captured graphs and lowered programs
//
// Walks the node list in order (nodes are topologically sorted by
// construction), computing one tensor per node. Kernels operate on the
// runtime shapes of their operands, so graphs captured with dynamic
// dimensions execute correctly on inputs whose dynamic dims differ from
// the example shapes.
//
// Observed execution: an ExecObserver receives every dequantization's
// effective scale as it happens, without altering any numeric result. The
// verifier uses this to recover the quantization step size of the value
// feeding the graph output.

use vole_core::graph::{Graph, Node, NodeId, OpKind};
use vole_core::{bail, Error, Result, Tensor};

use crate::program::CompiledProgram;

/// Hook into graph execution; see module docs.
pub trait ExecObserver {
    /// Called after a dequantize op ran, with its effective scale.
    fn dequantized(&mut self, _node: NodeId, _scale: f32) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ExecObserver for NoopObserver {}

/// Execute a graph on the given inputs.
pub fn run_graph(graph: &Graph, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    run_graph_observed(graph, inputs, &mut NoopObserver)
}

/// Execute a graph, reporting dequantizations to `observer`.
pub fn run_graph_observed(
    graph: &Graph,
    inputs: &[Tensor],
    observer: &mut dyn ExecObserver,
) -> Result<Vec<Tensor>> {
    if inputs.len() != graph.inputs().len() {
        bail!(
            "graph expects {} inputs, got {}",
            graph.inputs().len(),
            inputs.len()
        );
    }
    let mut values: Vec<Option<Tensor>> = vec![None; graph.nodes().len()];

    for (index, &input_id) in graph.inputs().iter().enumerate() {
        let node = graph.node(input_id);
        check_input(node, index, graph, &inputs[index])?;
        values[input_id.0] = Some(inputs[index].clone());
    }

    for node in graph.nodes() {
        if values[node.id.0].is_some() {
            continue; // graph input, already bound
        }
        let result = eval_node(node, &values, observer)?;
        values[node.id.0] = Some(result);
    }

    graph
        .outputs()
        .iter()
        .map(|&o| {
            values[o.0]
                .clone()
                .ok_or_else(|| Error::msg(format!("output {o} was never computed")))
        })
        .collect()
}

/// Execute a lowered program's entry graph.
pub fn run_program(program: &CompiledProgram, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    run_graph(&program.graph, inputs)
}

/// Execute a graph and return every node's value, indexed by node id.
/// Used by calibration, which observes intermediate activation ranges.
pub fn run_graph_values(graph: &Graph, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    if inputs.len() != graph.inputs().len() {
        bail!(
            "graph expects {} inputs, got {}",
            graph.inputs().len(),
            inputs.len()
        );
    }
    let mut values: Vec<Option<Tensor>> = vec![None; graph.nodes().len()];
    for (index, &input_id) in graph.inputs().iter().enumerate() {
        let node = graph.node(input_id);
        check_input(node, index, graph, &inputs[index])?;
        values[input_id.0] = Some(inputs[index].clone());
    }
    let mut observer = NoopObserver;
    for node in graph.nodes() {
        if values[node.id.0].is_some() {
            continue;
        }
        values[node.id.0] = Some(eval_node(node, &values, &mut observer)?);
    }
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| Error::msg(format!("node %{i} was never computed"))))
        .collect()
}

/// Runtime input check: dtype and rank always match the captured
/// signature; a dimension may differ only if declared dynamic.
fn check_input(node: &Node, index: usize, graph: &Graph, actual: &Tensor) -> Result<()> {
    if actual.dtype() != node.dtype {
        return Err(Error::DTypeMismatch {
            expected: node.dtype,
            got: actual.dtype(),
        });
    }
    let expected = node.shape.dims();
    let got = actual.dims();
    if expected.len() != got.len() {
        return Err(Error::ShapeMismatch {
            expected: node.shape.clone(),
            got: actual.shape().clone(),
        });
    }
    let spec = graph.input_spec(index);
    for (dim_idx, (&e, &g)) in expected.iter().zip(got.iter()).enumerate() {
        let dynamic = spec.map(|s| s.get(dim_idx).is_some()).unwrap_or(false);
        if e != g && !dynamic {
            return Err(Error::ShapeMismatch {
                expected: node.shape.clone(),
                got: actual.shape().clone(),
            });
        }
    }
    Ok(())
}

fn eval_node(
    node: &Node,
    values: &[Option<Tensor>],
    observer: &mut dyn ExecObserver,
) -> Result<Tensor> {
    let operand = |i: usize| -> Result<&Tensor> {
        values[node.inputs[i].0]
            .as_ref()
            .ok_or_else(|| Error::msg(format!("operand {} of {} not computed", i, node.id)))
    };

    match &node.op {
        OpKind::Input { .. } => bail!("unbound graph input {}", node.id),
        OpKind::Constant { value } => Ok(value.clone()),
        OpKind::Add => add(operand(0)?, operand(1)?),
        OpKind::Mul => mul(operand(0)?, operand(1)?),
        OpKind::Relu => map_unary(operand(0)?, |v| v.max(0.0)),
        OpKind::Exp => map_unary(operand(0)?, f32::exp),
        OpKind::MatMul => matmul(operand(0)?, operand(1)?),
        OpKind::Conv2d { stride, padding } => {
            let bias = if node.inputs.len() == 3 {
                Some(operand(2)?)
            } else {
                None
            };
            conv2d(operand(0)?, operand(1)?, bias, *stride, *padding)
        }
        OpKind::QuantizePerTensor { scale, zero_point } => {
            quantize(operand(0)?, *scale, *zero_point)
        }
        OpKind::DequantizePerTensor { scale, zero_point } => {
            let out = dequantize(operand(0)?, *scale, *zero_point)?;
            observer.dequantized(node.id, *scale);
            Ok(out)
        }
        OpKind::ChooseQParams => choose_qparams(operand(0)?),
        OpKind::QuantizeDynamic => {
            let (scale, zero_point) = unpack_qparams(operand(1)?)?;
            quantize(operand(0)?, scale, zero_point)
        }
        OpKind::DequantizeDynamic => {
            let (scale, zero_point) = unpack_qparams(operand(1)?)?;
            let out = dequantize(operand(0)?, scale, zero_point)?;
            observer.dequantized(node.id, scale);
            Ok(out)
        }
        OpKind::Delegate { subgraph, .. } => {
            let sub_inputs: Vec<Tensor> = (0..node.inputs.len())
                .map(|i| operand(i).map(Tensor::clone))
                .collect::<Result<_>>()?;
            let mut outputs = run_graph_observed(subgraph, &sub_inputs, observer)?;
            match outputs.len() {
                1 => Ok(outputs.remove(0)),
                n => bail!("delegate {} produced {n} outputs, expected 1", node.id),
            }
        }
    }
}

// Kernels

fn map_unary(x: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    let data = x.f32_data()?.iter().map(|&v| f(v)).collect();
    Tensor::from_f32(data, x.shape().clone())
}

fn add(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let a = lhs.f32_data()?;
    let b = rhs.f32_data()?;
    let last = *lhs.dims().last().unwrap_or(&1);
    let data: Vec<f32> = if lhs.dims() == rhs.dims() {
        a.iter().zip(b.iter()).map(|(&x, &y)| x + y).collect()
    } else if rhs.dims().len() == 1 && rhs.dims()[0] == last {
        a.iter()
            .enumerate()
            .map(|(i, &x)| x + b[i % last])
            .collect()
    } else {
        return Err(Error::ShapeMismatch {
            expected: lhs.shape().clone(),
            got: rhs.shape().clone(),
        });
    };
    Tensor::from_f32(data, lhs.shape().clone())
}

fn mul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let a = lhs.f32_data()?;
    let b = rhs.f32_data()?;
    let data: Vec<f32> = if lhs.dims() == rhs.dims() {
        a.iter().zip(b.iter()).map(|(&x, &y)| x * y).collect()
    } else if rhs.elem_count() == 1 {
        let s = b[0];
        a.iter().map(|&x| x * s).collect()
    } else {
        return Err(Error::ShapeMismatch {
            expected: lhs.shape().clone(),
            got: rhs.shape().clone(),
        });
    };
    Tensor::from_f32(data, lhs.shape().clone())
}

fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let a = lhs.f32_data()?;
    let b = rhs.f32_data()?;
    let (m, k1) = (lhs.dims()[0], lhs.dims()[1]);
    let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
    if k1 != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
    }
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for kk in 0..k1 {
            let av = a[i * k1 + kk];
            for j in 0..n {
                out[i * n + j] += av * b[kk * n + j];
            }
        }
    }
    Tensor::from_f32(out, [m, n])
}

fn conv2d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let xd = x.f32_data()?;
    let wd = weight.f32_data()?;
    let bd = bias.map(|b| b.f32_data()).transpose()?;
    let [n, c, h, w] = [x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]];
    let [o, ci, kh, kw] = [
        weight.dims()[0],
        weight.dims()[1],
        weight.dims()[2],
        weight.dims()[3],
    ];
    if c != ci {
        bail!("conv2d channel mismatch at runtime: input {c}, weight {ci}");
    }
    if h + 2 * padding < kh || w + 2 * padding < kw {
        bail!("conv2d kernel {kh}x{kw} larger than padded input {h}x{w}");
    }
    let oh = (h + 2 * padding - kh) / stride + 1;
    let ow = (w + 2 * padding - kw) / stride + 1;
    let mut out = vec![0.0f32; n * o * oh * ow];
    for bi in 0..n {
        for oc in 0..o {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bd.map(|b| b[oc]).unwrap_or(0.0);
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * stride + ky) as isize - padding as isize;
                                let ix = (ox * stride + kx) as isize - padding as isize;
                                if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                                    continue;
                                }
                                let xv = xd[((bi * c + ic) * h + iy as usize) * w + ix as usize];
                                let wv = wd[((oc * ci + ic) * kh + ky) * kw + kx];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((bi * o + oc) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Tensor::from_f32(out, [n, o, oh, ow])
}

fn quantize(x: &Tensor, scale: f32, zero_point: i32) -> Result<Tensor> {
    if scale <= 0.0 {
        bail!("quantize requires a positive scale, got {scale}");
    }
    let data = x
        .f32_data()?
        .iter()
        .map(|&v| {
            let q = (v / scale).round() + zero_point as f32;
            q.clamp(i8::MIN as f32, i8::MAX as f32) as i8
        })
        .collect();
    Tensor::from_i8(data, x.shape().clone())
}

fn dequantize(q: &Tensor, scale: f32, zero_point: i32) -> Result<Tensor> {
    let data = q
        .i8_data()?
        .iter()
        .map(|&v| (v as i32 - zero_point) as f32 * scale)
        .collect();
    Tensor::from_f32(data, q.shape().clone())
}

/// Symmetric per-tensor parameters from the value range: `[scale, 0]`.
fn choose_qparams(x: &Tensor) -> Result<Tensor> {
    let max_abs = x
        .f32_data()?
        .iter()
        .fold(0.0f32, |m, &v| m.max(v.abs()));
    let scale = (max_abs / i8::MAX as f32).max(1e-8);
    Tensor::from_f32(vec![scale, 0.0], [2])
}

fn unpack_qparams(params: &Tensor) -> Result<(f32, i32)> {
    let p = params.f32_data()?;
    if p.len() != 2 {
        bail!("quantization params must be [scale, zero_point], got {} values", p.len());
    }
    Ok((p[0], p[1] as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::graph::Graph;
    use vole_core::DType;

    fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_run_add_graph() {
        let mut g = Graph::new();
        let a = g.add_input([3], DType::F32);
        let b = g.add_input([3], DType::F32);
        let c = g.add_node(OpKind::Add, vec![a, b]).unwrap();
        g.set_outputs(vec![c]).unwrap();

        let out = run_graph(
            &g,
            &[
                Tensor::from_f32(vec![1.0, 2.0, 3.0], [3]).unwrap(),
                Tensor::from_f32(vec![10.0, 20.0, 30.0], [3]).unwrap(),
            ],
        )
        .unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_input_shape_enforced() {
        let mut g = Graph::new();
        let x = g.add_input([2, 2], DType::F32);
        let y = g.add_node(OpKind::Relu, vec![x]).unwrap();
        g.set_outputs(vec![y]).unwrap();
        let wrong = Tensor::zeros([3, 2]);
        assert!(matches!(
            run_graph(&g, &[wrong]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dynamic_input_dim_allowed() {
        use vole_core::dynamic_shape::{DynDim, DynamicShapeSpec};
        let mut g = Graph::new();
        let x = g.add_input([2, 3], DType::F32);
        let y = g.add_node(OpKind::Relu, vec![x]).unwrap();
        g.set_outputs(vec![y]).unwrap();
        g.set_input_spec(0, DynamicShapeSpec::new().with_dim(0, DynDim::new("n", 1, 16)))
            .unwrap();
        let out = run_graph(&g, &[Tensor::zeros([7, 3])]).unwrap();
        assert_eq!(out[0].dims(), &[7, 3]);
    }

    #[test]
    fn test_matmul_kernel() {
        let a = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let b = Tensor::from_f32(vec![5.0, 6.0, 7.0, 8.0], [2, 2]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.to_f32_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        // 1x1 kernel with weight 1.0 is the identity on a single channel.
        let x = Tensor::from_f32((0..16).map(|v| v as f32).collect(), [1, 1, 4, 4]).unwrap();
        let w = Tensor::from_f32(vec![1.0], [1, 1, 1, 1]).unwrap();
        let y = conv2d(&x, &w, None, 1, 0).unwrap();
        assert_eq!(y.dims(), &[1, 1, 4, 4]);
        assert_eq!(y.to_f32_vec(), x.to_f32_vec());
    }

    #[test]
    fn test_conv2d_padding_and_bias() {
        let x = Tensor::from_f32(vec![1.0; 9], [1, 1, 3, 3]).unwrap();
        let w = Tensor::from_f32(vec![1.0; 9], [1, 1, 3, 3]).unwrap();
        let b = Tensor::from_f32(vec![0.5], [1]).unwrap();
        let y = conv2d(&x, &w, Some(&b), 1, 1).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3, 3]);
        // Center tap sees all 9 ones; corners see 4.
        let data = y.to_f32_vec();
        assert_eq!(data[4], 9.5);
        assert_eq!(data[0], 4.5);
    }

    #[test]
    fn test_quantize_round_trip_error_bounded() {
        let x = Tensor::from_f32(vec![-1.0, -0.25, 0.0, 0.6, 1.0], [5]).unwrap();
        let params = choose_qparams(&x).unwrap();
        let (scale, zp) = unpack_qparams(&params).unwrap();
        let q = quantize(&x, scale, zp).unwrap();
        let d = dequantize(&q, scale, zp).unwrap();
        for (orig, rec) in x.to_f32_vec().iter().zip(d.to_f32_vec()) {
            assert!(approx_eq(*orig, rec, scale / 2.0 + 1e-6));
        }
    }

    #[test]
    fn test_observer_sees_dequantize_scale() {
        struct Recorder(Vec<(NodeId, f32)>);
        impl ExecObserver for Recorder {
            fn dequantized(&mut self, node: NodeId, scale: f32) {
                self.0.push((node, scale));
            }
        }

        let mut g = Graph::new();
        let x = g.add_input([2], DType::F32);
        let q = g
            .add_node(
                OpKind::QuantizePerTensor {
                    scale: 0.5,
                    zero_point: 0,
                },
                vec![x],
            )
            .unwrap();
        let d = g
            .add_node(
                OpKind::DequantizePerTensor {
                    scale: 0.5,
                    zero_point: 0,
                },
                vec![q],
            )
            .unwrap();
        g.set_outputs(vec![d]).unwrap();

        let mut rec = Recorder(Vec::new());
        let out =
            run_graph_observed(&g, &[Tensor::from_f32(vec![1.0, 2.0], [2]).unwrap()], &mut rec)
                .unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![1.0, 2.0]);
        assert_eq!(rec.0, vec![(d, 0.5)]);
    }

    #[test]
    fn test_delegate_executes_subgraph() {
        let mut sub = Graph::new();
        let sx = sub.add_input([2], DType::F32);
        let sy = sub.add_node(OpKind::Relu, vec![sx]).unwrap();
        sub.set_outputs(vec![sy]).unwrap();

        let mut g = Graph::new();
        let x = g.add_input([2], DType::F32);
        let d = g
            .add_node(
                OpKind::Delegate {
                    backend: "cpu-ref".to_string(),
                    subgraph: sub,
                },
                vec![x],
            )
            .unwrap();
        g.set_outputs(vec![d]).unwrap();

        let out = run_graph(&g, &[Tensor::from_f32(vec![-1.0, 2.0], [2]).unwrap()]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0.0, 2.0]);
    }
}
