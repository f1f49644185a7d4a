//! # Vole
//!
//! A staged model-lowering pipeline with numeric output verification.
//!
//! Vole threads a captured model through an ordered sequence of lowering
//! stages — quantize, export, graph rewrites, partitioning into
//! backend-delegated subgraphs, finalization, serialization — enforcing
//! which stage orderings are legal, and verifies correctness by
//! re-executing the artifact at any stage and comparing its output against
//! a reference execution, with a relaxed tolerance model for quantized
//! computation.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tester`] | The orchestrator: fluent stage driving + checks |
//! | [`stage`] / [`stages`] | Stage contract, registry, concrete stages |
//! | [`verify`] | Reference execution and tolerance-bounded comparison |
//! | [`exec`] | Reference interpreter over the graph IR |
//! | [`quantize`] | INT8 Q/DQ rewriting + dynamic-chain dedup |
//! | [`passes`] | Graph rewrite capability + stock passes |
//! | [`partition`] | Backend delegation |
//! | [`program`] | Lowered programs, finalization, memory planning |
//! | [`serialize`] | Binary program format + runtime loader |
//! | [`inputgen`] | Random inputs honoring dynamic-shape specs |
//!
//! ## Example
//!
//! ```ignore
//! use vole::prelude::*;
//!
//! let mut tester = Tester::new(model, vec![example_input]);
//! tester
//!     .quantize()?
//!     .export()?
//!     .to_intermediate_transform_and_lower()?
//!     .finalize()?
//!     .serialize()?
//!     .run_method_and_compare_outputs(CompareOptions::default().with_tolerances(
//!         1e-3, 1e-3, 1.0,
//!     ))?;
//! ```

pub mod exec;
pub mod inputgen;
pub mod partition;
pub mod passes;
pub mod program;
pub mod quantize;
pub mod serialize;
pub mod stage;
pub mod stages;
pub mod tester;
pub mod verify;

pub use vole_core::{
    capture, DType, DynDim, DynamicShapeSpec, Error, Graph, Module, NodeId, OpKind, Result, Shape,
    Tensor, Tracer,
};

pub use stage::{Artifact, ArtifactKind, Stage, StageKind};
pub use tester::Tester;
pub use verify::CompareOptions;

/// Prelude: the types most sessions need.
pub mod prelude {
    pub use crate::inputgen::RandomInputs;
    pub use crate::partition::{GreedyPartitioner, Partitioner};
    pub use crate::passes::{EliminateDeadNodes, FoldConstants, Pass};
    pub use crate::program::{BackendConfig, CompileConfig, CompiledProgram, SymShapeEval};
    pub use crate::quantize::{QuantConfig, QuantMode, Quantizer, RangeObserverQuantizer};
    pub use crate::serialize::{RefLoader, RuntimeLoader};
    pub use crate::stage::{Artifact, ArtifactKind, Stage, StageKind};
    pub use crate::stages::{
        CaptureEngine, Export, Finalize, Partition, Quantize, RunPasses, Serialize,
        ToIntermediate, ToIntermediateTransformAndLower, TracingCapture,
    };
    pub use crate::tester::Tester;
    pub use crate::verify::CompareOptions;
    pub use vole_core::module::{Conv2d, Linear, Relu, Scale, Sequential};
    pub use vole_core::{
        DType, DynDim, DynamicShapeSpec, Error, Graph, Module, Result, Shape, Tensor,
    };
}
