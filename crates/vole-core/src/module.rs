// Module & Tracer — model definition and strict graph capture
//
// A model is anything implementing `Module`: a forward pass expressed
// against opaque value handles (`NodeId`) on a recording `Tracer`. Capture
// runs forward once with handles for the example inputs; every emitted op
// becomes a graph node with its signature inferred on the spot.
//
// Because forward only ever sees handles — never element values — a model
// cannot branch on data, so capture is strict by construction: the traced
// graph is the whole program, with no silent data-dependent control flow.

use crate::bail;
use crate::dtype::DType;
use crate::dynamic_shape::DynamicShapeSpec;
use crate::error::Result;
use crate::graph::{Graph, NodeId, OpKind};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Records a model's forward pass into a [`Graph`].
pub struct Tracer {
    graph: Graph,
}

impl Tracer {
    /// Start a trace with one graph input per example tensor.
    pub fn from_example_inputs(example_inputs: &[Tensor]) -> (Self, Vec<NodeId>) {
        let mut graph = Graph::new();
        let ids = example_inputs
            .iter()
            .map(|t| graph.add_input(t.shape().clone(), t.dtype()))
            .collect();
        (Tracer { graph }, ids)
    }

    /// Embed a weight or other constant.
    pub fn constant(&mut self, value: Tensor) -> NodeId {
        self.graph.add_constant(value)
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.graph.add_node(OpKind::Add, vec![lhs, rhs])
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.graph.add_node(OpKind::Mul, vec![lhs, rhs])
    }

    pub fn relu(&mut self, x: NodeId) -> Result<NodeId> {
        self.graph.add_node(OpKind::Relu, vec![x])
    }

    pub fn exp(&mut self, x: NodeId) -> Result<NodeId> {
        self.graph.add_node(OpKind::Exp, vec![x])
    }

    pub fn matmul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.graph.add_node(OpKind::MatMul, vec![lhs, rhs])
    }

    pub fn conv2d(
        &mut self,
        x: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: usize,
        padding: usize,
    ) -> Result<NodeId> {
        let mut inputs = vec![x, weight];
        if let Some(b) = bias {
            inputs.push(b);
        }
        self.graph
            .add_node(OpKind::Conv2d { stride, padding }, inputs)
    }

    /// `x @ weight (+ bias)` — weight is `[in, out]`, bias `[out]`.
    pub fn linear(&mut self, x: NodeId, weight: NodeId, bias: Option<NodeId>) -> Result<NodeId> {
        let y = self.matmul(x, weight)?;
        match bias {
            Some(b) => self.add(y, b),
            None => Ok(y),
        }
    }

    /// Shape of a traced value, for models that size weights off inputs.
    pub fn shape_of(&self, id: NodeId) -> &Shape {
        &self.graph.node(id).shape
    }

    pub fn dtype_of(&self, id: NodeId) -> DType {
        self.graph.node(id).dtype
    }

    fn finish(mut self, outputs: Vec<NodeId>) -> Result<Graph> {
        if outputs.is_empty() {
            bail!("capture produced no outputs");
        }
        self.graph.set_outputs(outputs)?;
        self.graph.validate()?;
        Ok(self.graph)
    }
}

/// The model contract: a forward pass over traced value handles.
pub trait Module {
    /// Emit the forward computation for the given input handles and return
    /// the output handles.
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>>;
}

/// Capture a model into a graph, attaching dynamic-shape specs when given.
///
/// `dynamic_shapes`, if present, must carry one spec per input (an empty
/// spec leaves that input fully fixed).
pub fn capture(
    module: &dyn Module,
    example_inputs: &[Tensor],
    dynamic_shapes: Option<&[DynamicShapeSpec]>,
) -> Result<Graph> {
    if example_inputs.is_empty() {
        bail!("capture requires at least one example input");
    }
    let (mut tracer, input_ids) = Tracer::from_example_inputs(example_inputs);
    let outputs = module.forward(&mut tracer, &input_ids)?;
    let mut graph = tracer.finish(outputs)?;
    if let Some(specs) = dynamic_shapes {
        if specs.len() != example_inputs.len() {
            bail!(
                "got {} dynamic shape specs for {} inputs",
                specs.len(),
                example_inputs.len()
            );
        }
        for (index, spec) in specs.iter().enumerate() {
            if !spec.is_empty() {
                graph.set_input_spec(index, spec.clone())?;
            }
        }
    }
    Ok(graph)
}

// Built-in modules
//
// Small layers used by the pipeline's own tests and by downstream callers
// that just need something to lower.

/// Multiplies its input by a fixed scalar. `Scale::identity()` is the
/// canonical identity-like model.
pub struct Scale {
    pub factor: f32,
}

impl Scale {
    pub fn identity() -> Self {
        Scale { factor: 1.0 }
    }
}

impl Module for Scale {
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
        let factor = tracer.constant(Tensor::scalar(self.factor));
        Ok(vec![tracer.mul(inputs[0], factor)?])
    }
}

/// Elementwise ReLU.
pub struct Relu;

impl Module for Relu {
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
        Ok(vec![tracer.relu(inputs[0])?])
    }
}

/// Fully-connected layer: `x @ weight (+ bias)`.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Module for Linear {
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
        let w = tracer.constant(self.weight.clone());
        let b = self.bias.clone().map(|b| tracer.constant(b));
        Ok(vec![tracer.linear(inputs[0], w, b)?])
    }
}

/// NCHW convolution layer.
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub stride: usize,
    pub padding: usize,
}

impl Module for Conv2d {
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
        let w = tracer.constant(self.weight.clone());
        let b = self.bias.clone().map(|b| tracer.constant(b));
        Ok(vec![tracer.conv2d(inputs[0], w, b, self.stride, self.padding)?])
    }
}

/// Runs modules in order, feeding each one's outputs to the next.
pub struct Sequential(pub Vec<Box<dyn Module>>);

impl Module for Sequential {
    fn forward(&self, tracer: &mut Tracer, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut current: Vec<NodeId> = inputs.to_vec();
        for module in &self.0 {
            current = module.forward(tracer, &current)?;
        }
        Ok(current)
    }
}
