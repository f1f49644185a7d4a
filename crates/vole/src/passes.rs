// Passes — graph-rewrite capability and two stock rewrites
//
// A Pass is a pure Graph -> Graph function. The RunPasses stage applies an
// ordered pass list followed by an ordered list of transform closures; each
// rewrite's output feeds the next, with no rollback.

use std::collections::{HashMap, HashSet};

use vole_core::graph::{Graph, NodeId, OpKind};
use vole_core::{Error, Result};

use crate::exec;

/// A named, pure graph rewrite.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &Graph) -> Result<Graph>;
}

/// Caller-supplied rewrite without the ceremony of a named type.
pub type TransformFn = Box<dyn Fn(&Graph) -> Result<Graph>>;

fn remapped(remap: &HashMap<NodeId, NodeId>, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
    inputs
        .iter()
        .map(|i| {
            remap
                .get(i)
                .copied()
                .ok_or_else(|| Error::msg(format!("unmapped input {i}")))
        })
        .collect()
}

/// Drop nodes that no output transitively depends on. Graph inputs are
/// always kept: they are the calling convention, dead or not.
pub struct EliminateDeadNodes;

impl Pass for EliminateDeadNodes {
    fn name(&self) -> &'static str {
        "eliminate_dead_nodes"
    }

    fn run(&self, graph: &Graph) -> Result<Graph> {
        let mut live: HashSet<NodeId> = graph.outputs().iter().copied().collect();
        for node in graph.nodes().iter().rev() {
            if live.contains(&node.id) {
                live.extend(node.inputs.iter().copied());
            }
        }

        let mut out = Graph::new();
        let mut remap = HashMap::new();
        for node in graph.nodes() {
            match &node.op {
                OpKind::Input { index } => {
                    let id = out.add_input(node.shape.clone(), node.dtype);
                    if let Some(spec) = graph.input_spec(*index) {
                        out.set_input_spec(*index, spec.clone())?;
                    }
                    remap.insert(node.id, id);
                }
                _ if !live.contains(&node.id) => {}
                OpKind::Constant { value } => {
                    remap.insert(node.id, out.add_constant(value.clone()));
                }
                op => {
                    let id = out.add_node(op.clone(), remapped(&remap, &node.inputs)?)?;
                    remap.insert(node.id, id);
                }
            }
        }
        out.set_outputs(remapped(&remap, graph.outputs())?)?;
        Ok(out)
    }
}

/// Evaluate nodes whose operands are all constants and embed the result.
/// Delegate boundaries are left alone.
pub struct FoldConstants;

impl Pass for FoldConstants {
    fn name(&self) -> &'static str {
        "fold_constants"
    }

    fn run(&self, graph: &Graph) -> Result<Graph> {
        let mut out = Graph::new();
        let mut remap = HashMap::new();
        for node in graph.nodes() {
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
                    let inputs = remapped(&remap, &node.inputs)?;
                    let foldable = !matches!(op, OpKind::Delegate { .. })
                        && inputs
                            .iter()
                            .all(|&i| matches!(out.node(i).op, OpKind::Constant { .. }));
                    if foldable {
                        // Evaluate in a throwaway graph built from the
                        // constant operands.
                        let mut scratch = Graph::new();
                        let scratch_inputs: Vec<NodeId> = inputs
                            .iter()
                            .map(|&i| match &out.node(i).op {
                                OpKind::Constant { value } => scratch.add_constant(value.clone()),
                                _ => unreachable!("checked constant above"),
                            })
                            .collect();
                        let result = scratch.add_node(op.clone(), scratch_inputs)?;
                        scratch.set_outputs(vec![result])?;
                        let mut values = exec::run_graph(&scratch, &[])?;
                        out.add_constant(values.remove(0))
                    } else {
                        out.add_node(op.clone(), inputs)?
                    }
                }
            };
            remap.insert(node.id, id);
        }
        out.set_outputs(remapped(&remap, graph.outputs())?)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, Tensor};

    #[test]
    fn test_eliminate_dead_nodes() {
        let mut g = Graph::new();
        let x = g.add_input([2], DType::F32);
        let live = g.add_node(OpKind::Relu, vec![x]).unwrap();
        let _dead = g.add_node(OpKind::Exp, vec![x]).unwrap();
        g.set_outputs(vec![live]).unwrap();

        let rewritten = EliminateDeadNodes.run(&g).unwrap();
        let counts = rewritten.node_counts();
        assert_eq!(counts.get("relu"), Some(&1));
        assert_eq!(counts.get("exp"), None);
        assert_eq!(rewritten.inputs().len(), 1);
        assert!(rewritten.validate().is_ok());
    }

    #[test]
    fn test_fold_constants() {
        let mut g = Graph::new();
        let x = g.add_input([2], DType::F32);
        let a = g.add_constant(Tensor::from_f32(vec![1.0, 2.0], [2]).unwrap());
        let b = g.add_constant(Tensor::from_f32(vec![3.0, 4.0], [2]).unwrap());
        let sum = g.add_node(OpKind::Add, vec![a, b]).unwrap();
        let y = g.add_node(OpKind::Add, vec![x, sum]).unwrap();
        g.set_outputs(vec![y]).unwrap();

        let folded = FoldConstants.run(&g).unwrap();
        // The constant-only add disappears; the input-dependent one stays.
        assert_eq!(folded.node_counts().get("add"), Some(&1));

        let out = exec::run_graph(
            &folded,
            &[Tensor::from_f32(vec![10.0, 20.0], [2]).unwrap()],
        )
        .unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![14.0, 26.0]);
    }
}
