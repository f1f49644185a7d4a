// Graph — the captured graph representation threaded through the pipeline
//
// A Graph is a flat list of nodes in topological order (construction only
// ever references already-added nodes, and validate() re-checks this after
// rewrites). Each node records its operator, input node ids, and the
// inferred output shape/dtype. Graph-level `inputs` and `outputs` name the
// boundary nodes.
//
// The textual form (Display) is one line per node:
//
//   graph {
//     %0 = input[0] : [1, 3, 4, 4] f32
//     %1 = constant : [8, 3, 3, 3] f32
//     %2 = conv2d[stride=1, padding=0](%0, %1) : [1, 8, 2, 2] f32
//     return %2
//   }
//
// Pattern checks and occurrence counting in the orchestrator operate on
// exactly this form, so it must stay stable.

use std::collections::BTreeMap;
use std::fmt;

use crate::bail;
use crate::dtype::DType;
use crate::dynamic_shape::DynamicShapeSpec;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Index of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The closed operator set of the IR.
///
/// Operators carry their static attributes inline; runtime-only values
/// (dynamic quantization parameters) flow as ordinary tensor edges.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Graph input placeholder; `index` is the position in the input tuple.
    Input { index: usize },
    /// Embedded weight/constant tensor.
    Constant { value: Tensor },
    /// Elementwise add; rhs may be rank-1 matching lhs's last dim (bias).
    Add,
    /// Elementwise multiply; rhs may be a scalar.
    Mul,
    Relu,
    Exp,
    /// `[M, K] @ [K, N] -> [M, N]`.
    MatMul,
    /// NCHW convolution; inputs are `(x, weight)` or `(x, weight, bias)`.
    Conv2d { stride: usize, padding: usize },
    /// F32 -> I8 with static parameters.
    QuantizePerTensor { scale: f32, zero_point: i32 },
    /// I8 -> F32 with static parameters.
    DequantizePerTensor { scale: f32, zero_point: i32 },
    /// Compute `[scale, zero_point]` from the input at runtime.
    ChooseQParams,
    /// F32 -> I8 using a runtime `[scale, zero_point]` tensor.
    QuantizeDynamic,
    /// I8 -> F32 using a runtime `[scale, zero_point]` tensor.
    DequantizeDynamic,
    /// Region delegated to a named backend; the subgraph has one output.
    Delegate { backend: String, subgraph: Graph },
}

impl OpKind {
    /// Lowercase operator name, used by node-count checks and the dump.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "input",
            OpKind::Constant { .. } => "constant",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Relu => "relu",
            OpKind::Exp => "exp",
            OpKind::MatMul => "matmul",
            OpKind::Conv2d { .. } => "conv2d",
            OpKind::QuantizePerTensor { .. } => "quantize_per_tensor",
            OpKind::DequantizePerTensor { .. } => "dequantize_per_tensor",
            OpKind::ChooseQParams => "choose_qparams",
            OpKind::QuantizeDynamic => "quantize_dynamic",
            OpKind::DequantizeDynamic => "dequantize_dynamic",
            OpKind::Delegate { .. } => "delegate",
        }
    }

    /// Infer the output signature from the input signatures.
    pub fn infer(&self, inputs: &[(&Shape, DType)]) -> Result<(Shape, DType)> {
        let arity_err = |expected: &str| {
            Err(Error::msg(format!(
                "op '{}' expects {} inputs, got {}",
                self.name(),
                expected,
                inputs.len()
            )))
        };
        match self {
            OpKind::Input { .. } | OpKind::Constant { .. } => {
                Err(Error::msg("input/constant signatures are fixed at creation"))
            }
            OpKind::Add => {
                if inputs.len() != 2 {
                    return arity_err("2");
                }
                let (ls, ld) = inputs[0];
                let (rs, rd) = inputs[1];
                expect_dtype(DType::F32, ld)?;
                expect_dtype(DType::F32, rd)?;
                let bias_like = rs.rank() == 1 && ls.dims().last() == Some(&rs.dims()[0]);
                if ls != rs && !bias_like {
                    return Err(Error::ShapeMismatch {
                        expected: ls.clone(),
                        got: rs.clone(),
                    });
                }
                Ok((ls.clone(), DType::F32))
            }
            OpKind::Mul => {
                if inputs.len() != 2 {
                    return arity_err("2");
                }
                let (ls, ld) = inputs[0];
                let (rs, rd) = inputs[1];
                expect_dtype(DType::F32, ld)?;
                expect_dtype(DType::F32, rd)?;
                if ls != rs && rs.rank() != 0 {
                    return Err(Error::ShapeMismatch {
                        expected: ls.clone(),
                        got: rs.clone(),
                    });
                }
                Ok((ls.clone(), DType::F32))
            }
            OpKind::Relu | OpKind::Exp => {
                if inputs.len() != 1 {
                    return arity_err("1");
                }
                let (s, d) = inputs[0];
                expect_dtype(DType::F32, d)?;
                Ok((s.clone(), DType::F32))
            }
            OpKind::MatMul => {
                if inputs.len() != 2 {
                    return arity_err("2");
                }
                let (ls, ld) = inputs[0];
                let (rs, rd) = inputs[1];
                expect_dtype(DType::F32, ld)?;
                expect_dtype(DType::F32, rd)?;
                if ls.rank() != 2 || rs.rank() != 2 {
                    return Err(Error::msg(format!(
                        "matmul expects rank-2 operands, got {ls} @ {rs}"
                    )));
                }
                let (m, k1) = (ls.dims()[0], ls.dims()[1]);
                let (k2, n) = (rs.dims()[0], rs.dims()[1]);
                if k1 != k2 {
                    return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
                }
                Ok((Shape::from([m, n]), DType::F32))
            }
            OpKind::Conv2d { stride, padding } => {
                if inputs.len() != 2 && inputs.len() != 3 {
                    return arity_err("2 or 3");
                }
                let (xs, xd) = inputs[0];
                let (ws, wd) = inputs[1];
                expect_dtype(DType::F32, xd)?;
                expect_dtype(DType::F32, wd)?;
                if xs.rank() != 4 || ws.rank() != 4 {
                    return Err(Error::msg(format!(
                        "conv2d expects NCHW input and OIHW weight, got {xs} and {ws}"
                    )));
                }
                let [n, c, h, w] = [xs.dims()[0], xs.dims()[1], xs.dims()[2], xs.dims()[3]];
                let [o, ci, kh, kw] = [ws.dims()[0], ws.dims()[1], ws.dims()[2], ws.dims()[3]];
                if c != ci {
                    return Err(Error::msg(format!(
                        "conv2d channel mismatch: input has {c}, weight expects {ci}"
                    )));
                }
                if inputs.len() == 3 {
                    let (bs, bd) = inputs[2];
                    expect_dtype(DType::F32, bd)?;
                    if bs.dims() != [o] {
                        return Err(Error::ShapeMismatch {
                            expected: Shape::from([o]),
                            got: bs.clone(),
                        });
                    }
                }
                let oh = (h + 2 * padding).checked_sub(kh).map(|v| v / stride + 1);
                let ow = (w + 2 * padding).checked_sub(kw).map(|v| v / stride + 1);
                match (oh, ow) {
                    (Some(oh), Some(ow)) => Ok((Shape::from([n, o, oh, ow]), DType::F32)),
                    _ => Err(Error::msg(format!(
                        "conv2d kernel {kh}x{kw} larger than padded input {h}x{w}"
                    ))),
                }
            }
            OpKind::QuantizePerTensor { .. } => {
                if inputs.len() != 1 {
                    return arity_err("1");
                }
                expect_dtype(DType::F32, inputs[0].1)?;
                Ok((inputs[0].0.clone(), DType::I8))
            }
            OpKind::DequantizePerTensor { .. } => {
                if inputs.len() != 1 {
                    return arity_err("1");
                }
                expect_dtype(DType::I8, inputs[0].1)?;
                Ok((inputs[0].0.clone(), DType::F32))
            }
            OpKind::ChooseQParams => {
                if inputs.len() != 1 {
                    return arity_err("1");
                }
                expect_dtype(DType::F32, inputs[0].1)?;
                Ok((Shape::from([2]), DType::F32))
            }
            OpKind::QuantizeDynamic => {
                if inputs.len() != 2 {
                    return arity_err("2");
                }
                expect_dtype(DType::F32, inputs[0].1)?;
                expect_dtype(DType::F32, inputs[1].1)?;
                Ok((inputs[0].0.clone(), DType::I8))
            }
            OpKind::DequantizeDynamic => {
                if inputs.len() != 2 {
                    return arity_err("2");
                }
                expect_dtype(DType::I8, inputs[0].1)?;
                expect_dtype(DType::F32, inputs[1].1)?;
                Ok((inputs[0].0.clone(), DType::F32))
            }
            OpKind::Delegate { subgraph, .. } => {
                let out = subgraph.single_output()?;
                let node = subgraph.node(out);
                Ok((node.shape.clone(), node.dtype))
            }
        }
    }

    /// Static attributes as printed inside `[...]` in the textual form.
    fn attr_str(&self) -> Option<String> {
        match self {
            OpKind::Input { index } => Some(format!("{index}")),
            OpKind::Conv2d { stride, padding } => {
                Some(format!("stride={stride}, padding={padding}"))
            }
            OpKind::QuantizePerTensor { scale, zero_point }
            | OpKind::DequantizePerTensor { scale, zero_point } => {
                Some(format!("scale={scale}, zero_point={zero_point}"))
            }
            OpKind::Delegate { backend, .. } => Some(format!("backend={backend}")),
            _ => None,
        }
    }
}

fn expect_dtype(expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(Error::DTypeMismatch { expected, got });
    }
    Ok(())
}

/// One node: operator + input edges + inferred output signature.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
    pub dtype: DType,
}

/// The graph representation produced by capture and rewritten by passes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    input_specs: Vec<Option<DynamicShapeSpec>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a graph input placeholder. Inputs are numbered in the order
    /// they are added.
    pub fn add_input(&mut self, shape: impl Into<Shape>, dtype: DType) -> NodeId {
        let id = NodeId(self.nodes.len());
        let index = self.inputs.len();
        self.nodes.push(Node {
            id,
            op: OpKind::Input { index },
            inputs: Vec::new(),
            shape: shape.into(),
            dtype,
        });
        self.inputs.push(id);
        self.input_specs.push(None);
        id
    }

    /// Append a constant node holding `value`.
    pub fn add_constant(&mut self, value: Tensor) -> NodeId {
        let id = NodeId(self.nodes.len());
        let shape = value.shape().clone();
        let dtype = value.dtype();
        self.nodes.push(Node {
            id,
            op: OpKind::Constant { value },
            inputs: Vec::new(),
            shape,
            dtype,
        });
        id
    }

    /// Append an operator node; infers and records the output signature.
    /// Input ids must refer to already-added nodes.
    pub fn add_node(&mut self, op: OpKind, inputs: Vec<NodeId>) -> Result<NodeId> {
        for &i in &inputs {
            if i.0 >= self.nodes.len() {
                bail!("node input {i} does not exist yet");
            }
        }
        let sigs: Vec<(&Shape, DType)> = inputs
            .iter()
            .map(|&i| (&self.nodes[i.0].shape, self.nodes[i.0].dtype))
            .collect();
        let (shape, dtype) = op.infer(&sigs)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            op,
            inputs,
            shape,
            dtype,
        });
        Ok(id)
    }

    /// Mark the graph outputs.
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) -> Result<()> {
        for &o in &outputs {
            if o.0 >= self.nodes.len() {
                bail!("output {o} does not exist");
            }
        }
        self.outputs = outputs;
        Ok(())
    }

    /// Attach a dynamic-shape spec to input `index`.
    pub fn set_input_spec(&mut self, index: usize, spec: DynamicShapeSpec) -> Result<()> {
        if index >= self.inputs.len() {
            bail!("no input {index} to attach a dynamic shape spec to");
        }
        let input_node = &self.nodes[self.inputs[index].0];
        spec.validate_against(input_node.shape.dims())?;
        self.input_specs[index] = Some(spec);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn input_spec(&self, index: usize) -> Option<&DynamicShapeSpec> {
        self.input_specs.get(index).and_then(|s| s.as_ref())
    }

    /// Whether any input declares dynamic dimensions.
    pub fn has_dynamic_shapes(&self) -> bool {
        self.input_specs.iter().any(|s| s.is_some())
    }

    /// The single output node id; error if the graph has 0 or 2+ outputs.
    pub fn single_output(&self) -> Result<NodeId> {
        match self.outputs.as_slice() {
            [one] => Ok(*one),
            other => Err(Error::msg(format!(
                "expected exactly one graph output, found {}",
                other.len()
            ))),
        }
    }

    /// Occurrence count of each operator name, excluding the `input` and
    /// `constant` placeholders (only computation nodes are counted).
    pub fn node_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            match node.op {
                OpKind::Input { .. } | OpKind::Constant { .. } => {}
                _ => *counts.entry(node.op.name()).or_insert(0) += 1,
            }
        }
        counts
    }

    /// Structural well-formedness: topological input references, resolved
    /// outputs, consistent recorded signatures, valid delegate subgraphs.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.id.0 != idx {
                bail!("node id {} stored at position {idx}", node.id);
            }
            for &input in &node.inputs {
                if input.0 >= idx {
                    bail!("node {} references {input}, which is not before it", node.id);
                }
            }
            match &node.op {
                OpKind::Input { .. } | OpKind::Constant { .. } => {}
                op => {
                    let sigs: Vec<(&Shape, DType)> = node
                        .inputs
                        .iter()
                        .map(|&i| (&self.nodes[i.0].shape, self.nodes[i.0].dtype))
                        .collect();
                    let (shape, dtype) = op.infer(&sigs)?;
                    if shape != node.shape || dtype != node.dtype {
                        bail!(
                            "node {} signature {} {} does not match inferred {} {}",
                            node.id,
                            node.shape,
                            node.dtype,
                            shape,
                            dtype
                        );
                    }
                    if let OpKind::Delegate { subgraph, .. } = op {
                        subgraph.validate()?;
                        if subgraph.inputs().len() != node.inputs.len() {
                            bail!(
                                "delegate {} has {} inputs but its subgraph declares {}",
                                node.id,
                                node.inputs.len(),
                                subgraph.inputs().len()
                            );
                        }
                    }
                }
            }
        }
        if self.outputs.is_empty() {
            bail!("graph has no outputs");
        }
        for &o in &self.outputs {
            if o.0 >= self.nodes.len() {
                bail!("graph output {o} does not exist");
            }
        }
        Ok(())
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(f, "{pad}graph {{")?;
        for node in &self.nodes {
            match &node.op {
                OpKind::Constant { .. } => {
                    writeln!(
                        f,
                        "{pad}  {} = constant : {} {}",
                        node.id, node.shape, node.dtype
                    )?;
                }
                op => {
                    write!(f, "{pad}  {} = {}", node.id, op.name())?;
                    if let Some(attrs) = op.attr_str() {
                        write!(f, "[{attrs}]")?;
                    }
                    if !node.inputs.is_empty() {
                        write!(f, "(")?;
                        for (i, input) in node.inputs.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{input}")?;
                        }
                        write!(f, ")")?;
                    }
                    writeln!(f, " : {} {}", node.shape, node.dtype)?;
                    if let OpKind::Delegate { subgraph, .. } = op {
                        subgraph.fmt_indented(f, indent + 1)?;
                    }
                }
            }
        }
        write!(f, "{pad}  return ")?;
        for (i, o) in self.outputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{o}")?;
        }
        writeln!(f)?;
        writeln!(f, "{pad}}}")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
