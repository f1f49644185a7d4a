// CompiledProgram — lowered form of a graph, plus finalization
//
// Lowering wraps a validated graph into a program with an entry point.
// Finalization turns an intermediate program into the runtime-loadable
// form: it applies the backend config's symbolic-shape evaluation policy
// and computes a naive bump-allocated memory plan, marking tensors whose
// shape depends on a dynamic input dimension.

use std::collections::HashSet;
use std::fmt;

use vole_core::graph::{Graph, NodeId, OpKind};
use vole_core::{Error, Result};

/// Which lowering level a program is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Backend-neutral intermediate form (pre/post partition).
    Intermediate,
    /// Finalized, runtime-loadable form with a memory plan.
    Runtime,
}

/// A lowered program: graph + entry point + lowering state.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub graph: Graph,
    pub dialect: Dialect,
    pub entry: String,
    pub partitioned: bool,
    pub memory_plan: Option<MemoryPlan>,
}

impl CompiledProgram {
    /// The program's structural view: its graph's textual form.
    pub fn debug_view(&self) -> String {
        self.graph.to_string()
    }
}

/// Configuration for lowering a graph to the intermediate form.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Validate the graph before lowering.
    pub validate: bool,
    /// Entry point name recorded in the program.
    pub entry: String,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            validate: true,
            entry: "forward".to_string(),
        }
    }
}

/// How finalization resolves symbolic (dynamic) dimensions when sizing
/// buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymShapeEval {
    /// Size dynamic dimensions at their declared upper bound.
    #[default]
    UpperBound,
    /// Size dynamic dimensions at the captured example value.
    Exact,
}

/// Backend configuration consumed by finalization.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub sym_shape_eval: SymShapeEval,
}

/// One planned buffer.
#[derive(Debug, Clone)]
pub struct TensorAlloc {
    pub node: NodeId,
    pub offset: usize,
    pub size_bytes: usize,
    /// Whether the tensor's shape depends on a dynamic input dimension.
    pub dynamic: bool,
}

/// Naive bump-allocation plan over all non-constant values.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    pub allocs: Vec<TensorAlloc>,
    pub total_bytes: usize,
}

impl fmt::Display for MemoryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory plan ({} bytes):", self.total_bytes)?;
        for alloc in &self.allocs {
            write!(
                f,
                "  {}: offset={}, size={} bytes",
                alloc.node, alloc.offset, alloc.size_bytes
            )?;
            if alloc.dynamic {
                write!(f, " *dynamic*")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Lower a graph into the backend-neutral intermediate program. Pure: no
/// partitioning, no backend specialization.
pub fn lower(graph: Graph, config: &CompileConfig) -> Result<CompiledProgram> {
    if config.validate {
        graph.validate()?;
    }
    Ok(CompiledProgram {
        graph,
        dialect: Dialect::Intermediate,
        entry: config.entry.clone(),
        partitioned: false,
        memory_plan: None,
    })
}

/// Finalize an intermediate program into the runtime-loadable form.
pub fn finalize(program: &CompiledProgram, config: &BackendConfig) -> Result<CompiledProgram> {
    if program.dialect != Dialect::Intermediate {
        return Err(Error::StageExecution(format!(
            "finalize expects an intermediate program, got {:?}",
            program.dialect
        )));
    }
    let plan = plan_memory(&program.graph, config.sym_shape_eval);
    Ok(CompiledProgram {
        graph: program.graph.clone(),
        dialect: Dialect::Runtime,
        entry: program.entry.clone(),
        partitioned: program.partitioned,
        memory_plan: Some(plan),
    })
}

/// Node ids whose value shape depends on a dynamic input dimension
/// (transitive closure from inputs carrying a dynamic-shape spec).
fn dynamic_nodes(graph: &Graph) -> HashSet<NodeId> {
    let mut dynamic: HashSet<NodeId> = HashSet::new();
    for (index, &input) in graph.inputs().iter().enumerate() {
        if graph.input_spec(index).is_some() {
            dynamic.insert(input);
        }
    }
    for node in graph.nodes() {
        if node.inputs.iter().any(|i| dynamic.contains(i)) {
            dynamic.insert(node.id);
        }
    }
    dynamic
}

fn plan_memory(graph: &Graph, eval: SymShapeEval) -> MemoryPlan {
    let dynamic = dynamic_nodes(graph);
    let mut allocs = Vec::new();
    let mut offset = 0usize;
    for node in graph.nodes() {
        if matches!(node.op, OpKind::Constant { .. }) {
            continue; // embedded in the program, not planned
        }
        let mut dims = node.shape.dims().to_vec();
        if eval == SymShapeEval::UpperBound {
            if let OpKind::Input { index } = node.op {
                if let Some(spec) = graph.input_spec(index) {
                    for (dim_idx, dyn_dim) in spec.dims() {
                        dims[dim_idx] = dyn_dim.upper_bound();
                    }
                }
            }
        }
        let size_bytes = dims.iter().product::<usize>() * node.dtype.size_bytes();
        allocs.push(TensorAlloc {
            node: node.id,
            offset,
            size_bytes,
            dynamic: dynamic.contains(&node.id),
        });
        offset += size_bytes;
    }
    MemoryPlan {
        allocs,
        total_bytes: offset,
    }
}
