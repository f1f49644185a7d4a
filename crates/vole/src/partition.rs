// Partition — backend delegation of supported graph regions
//
// A Partitioner takes a lowered program and returns it with regions of the
// graph collapsed into `delegate` nodes naming a target backend. The greedy
// default grows maximal single-output chains: a supported node joins its
// producer's region when that producer has no other consumer. Everything a
// region reads from outside (graph inputs, constants, unsupported values)
// becomes a delegate operand, mapped to an input placeholder of the
// delegate's subgraph.
//
// Whole-graph validation runs once on the reassembled program, after all
// regions are in place; delegate bodies are assembled freely before that.

use std::collections::HashMap;

use vole_core::graph::{Graph, NodeId, OpKind};
use vole_core::{Error, Result};

use crate::program::CompiledProgram;

/// The partitioner capability: mark regions for backend delegation.
pub trait Partitioner {
    /// Name of the backend delegated regions will execute on.
    fn backend(&self) -> &str;

    /// Return the program with delegated subgraphs in place.
    fn partition(&self, program: &CompiledProgram) -> Result<CompiledProgram>;
}

/// Greedy chain partitioner over the arithmetic operator set.
pub struct GreedyPartitioner {
    backend: String,
}

impl GreedyPartitioner {
    /// Delegate to the reference CPU backend.
    pub fn new() -> Self {
        Self::with_backend("cpu-ref")
    }

    pub fn with_backend(backend: impl Into<String>) -> Self {
        GreedyPartitioner {
            backend: backend.into(),
        }
    }

    fn supports(&self, op: &OpKind) -> bool {
        matches!(
            op,
            OpKind::Add
                | OpKind::Mul
                | OpKind::Relu
                | OpKind::Exp
                | OpKind::MatMul
                | OpKind::Conv2d { .. }
        )
    }
}

impl Default for GreedyPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner for GreedyPartitioner {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn partition(&self, program: &CompiledProgram) -> Result<CompiledProgram> {
        let graph = &program.graph;

        // Consumer counts decide whether a producer can be absorbed into
        // its consumer's region; graph outputs count as external consumers.
        let mut consumers: HashMap<NodeId, usize> = HashMap::new();
        for node in graph.nodes() {
            for &input in &node.inputs {
                *consumers.entry(input).or_insert(0) += 1;
            }
        }
        for &output in graph.outputs() {
            *consumers.entry(output).or_insert(0) += 1;
        }

        // Grow regions: region_of maps a node to its region index; each
        // region is a topo-ordered node list whose last node is its output.
        let mut region_of: HashMap<NodeId, usize> = HashMap::new();
        let mut regions: Vec<Vec<NodeId>> = Vec::new();
        for node in graph.nodes() {
            if !self.supports(&node.op) {
                continue;
            }
            let absorbable = node.inputs.iter().find_map(|&input| {
                let region = *region_of.get(&input)?;
                let is_region_output = *regions[region].last()? == input;
                (is_region_output && consumers.get(&input) == Some(&1)).then_some(region)
            });
            match absorbable {
                Some(region) => {
                    regions[region].push(node.id);
                    region_of.insert(node.id, region);
                }
                None => {
                    region_of.insert(node.id, regions.len());
                    regions.push(vec![node.id]);
                }
            }
        }

        // Reassemble: emit each region as one delegate node at the position
        // of its last member; copy everything else.
        let mut out = Graph::new();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for node in graph.nodes() {
            match region_of.get(&node.id) {
                Some(&region) if regions[region].last() != Some(&node.id) => {
                    // Interior region node: value never visible outside.
                }
                Some(&region) => {
                    let members = &regions[region];
                    let delegate =
                        build_delegate(graph, members, &self.backend, &remap, &mut out)?;
                    remap.insert(node.id, delegate);
                }
                None => {
                    let id = match &node.op {
                        OpKind::Input { index } => {
                            let id = out.add_input(node.shape.clone(), node.dtype);
                            if let Some(spec) = graph.input_spec(*index) {
                                out.set_input_spec(*index, spec.clone())?;
                            }
                            id
                        }
                        OpKind::Constant { value } => out.add_constant(value.clone()),
                        op => {
                            let inputs = lookup_all(&remap, &node.inputs)?;
                            out.add_node(op.clone(), inputs)?
                        }
                    };
                    remap.insert(node.id, id);
                }
            }
        }
        out.set_outputs(lookup_all(&remap, graph.outputs())?)?;
        out.validate()?;

        Ok(CompiledProgram {
            graph: out,
            dialect: program.dialect,
            entry: program.entry.clone(),
            partitioned: true,
            memory_plan: program.memory_plan.clone(),
        })
    }
}

fn lookup_all(remap: &HashMap<NodeId, NodeId>, ids: &[NodeId]) -> Result<Vec<NodeId>> {
    ids.iter()
        .map(|i| {
            remap
                .get(i)
                .copied()
                .ok_or_else(|| Error::msg(format!("unmapped node {i} during partitioning")))
        })
        .collect()
}

/// Build one delegate node from a region's members. Values the region reads
/// from outside itself become subgraph input placeholders, in first-use
/// order, and the delegate consumes the corresponding outer values.
fn build_delegate(
    graph: &Graph,
    members: &[NodeId],
    backend: &str,
    remap: &HashMap<NodeId, NodeId>,
    out: &mut Graph,
) -> Result<NodeId> {
    let mut subgraph = Graph::new();
    let mut inner: HashMap<NodeId, NodeId> = HashMap::new();
    let mut outer_operands: Vec<NodeId> = Vec::new();

    for &member in members {
        let node = graph.node(member);
        let mut sub_inputs = Vec::with_capacity(node.inputs.len());
        for &input in &node.inputs {
            let mapped = match inner.get(&input) {
                Some(&m) => m,
                None => {
                    let src = graph.node(input);
                    let placeholder = subgraph.add_input(src.shape.clone(), src.dtype);
                    inner.insert(input, placeholder);
                    outer_operands.push(input);
                    placeholder
                }
            };
            sub_inputs.push(mapped);
        }
        let id = subgraph.add_node(node.op.clone(), sub_inputs)?;
        inner.insert(member, id);
    }
    let sub_output = members
        .last()
        .and_then(|last| inner.get(last).copied())
        .ok_or_else(|| Error::msg("empty delegate region"))?;
    subgraph.set_outputs(vec![sub_output])?;

    let operands = lookup_all(remap, &outer_operands)?;
    out.add_node(
        OpKind::Delegate {
            backend: backend.to_string(),
            subgraph,
        },
        operands,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::module::{capture, Conv2d, Relu, Scale, Sequential};
    use vole_core::Tensor;

    use crate::exec;
    use crate::program::{lower, CompileConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn lowered(model: &dyn vole_core::Module, x: &Tensor) -> CompiledProgram {
        let graph = capture(model, &[x.clone()], None).unwrap();
        lower(graph, &CompileConfig::default()).unwrap()
    }

    #[test]
    fn test_single_op_delegated() {
        let x = Tensor::from_f32(vec![1.0, -2.0], [2]).unwrap();
        let program = lowered(&Scale { factor: 3.0 }, &x);
        let partitioned = GreedyPartitioner::new().partition(&program).unwrap();

        assert!(partitioned.partitioned);
        let counts = partitioned.graph.node_counts();
        assert_eq!(counts.get("delegate"), Some(&1));
        assert_eq!(counts.get("mul"), None);

        let out = exec::run_program(&partitioned, &[x]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![3.0, -6.0]);
    }

    #[test]
    fn test_chain_collapses_to_one_delegate() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = Sequential(vec![
            Box::new(Conv2d {
                weight: Tensor::randn([2, 3, 3, 3], &mut rng),
                bias: None,
                stride: 1,
                padding: 0,
            }),
            Box::new(Relu),
        ]);
        let x = Tensor::randn([1, 3, 4, 4], &mut rng);
        let program = lowered(&model, &x);
        let partitioned = GreedyPartitioner::new().partition(&program).unwrap();

        let counts = partitioned.graph.node_counts();
        assert_eq!(counts.get("delegate"), Some(&1));
        assert_eq!(counts.get("conv2d"), None);
        assert_eq!(counts.get("relu"), None);

        // Delegation must not change numerics at all.
        let expected = exec::run_program(&program, &[x.clone()]).unwrap();
        let got = exec::run_program(&partitioned, &[x]).unwrap();
        assert_eq!(expected[0].to_f32_vec(), got[0].to_f32_vec());
    }

    #[test]
    fn test_shared_value_splits_regions() {
        // x feeds relu twice; the relu result feeds two exps. The relu has
        // two consumers, so it cannot be absorbed into either exp's region.
        struct Fanout;
        impl vole_core::Module for Fanout {
            fn forward(
                &self,
                tracer: &mut vole_core::Tracer,
                inputs: &[NodeId],
            ) -> Result<Vec<NodeId>> {
                let r = tracer.relu(inputs[0])?;
                let a = tracer.exp(r)?;
                let b = tracer.exp(r)?;
                let y = tracer.add(a, b)?;
                Ok(vec![y])
            }
        }
        let x = Tensor::from_f32(vec![0.5], [1]).unwrap();
        let program = lowered(&Fanout, &x);
        let partitioned = GreedyPartitioner::new().partition(&program).unwrap();
        let counts = partitioned.graph.node_counts();
        // relu alone; each exp alone (fanout) but add absorbs one exp? No:
        // each exp has one consumer (add), add absorbs the first exp region
        // it finds; the other exp stays its own delegate.
        assert!(counts.get("delegate").copied().unwrap_or(0) >= 2);
        assert_eq!(counts.get("relu"), None);

        let expected = exec::run_program(&program, &[x.clone()]).unwrap();
        let got = exec::run_program(&partitioned, &[x]).unwrap();
        for (e, g) in expected[0].to_f32_vec().iter().zip(got[0].to_f32_vec()) {
            assert!((e - g).abs() < 1e-6);
        }
    }
}
