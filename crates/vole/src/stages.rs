// Stages — the concrete pipeline steps
//
// Each stage owns its configuration and, after run(), its artifact. The
// orchestrator wires predecessor artifacts in; stages never reach into
// each other. Construction is builder-style so a caller can hand a
// pre-configured stage instance to the corresponding Tester method.

use std::path::Path;

use vole_core::dynamic_shape::DynamicShapeSpec;
use vole_core::graph::Graph;
use vole_core::{Error, Module, Result, Tensor};

use crate::partition::{GreedyPartitioner, Partitioner};
use crate::passes::{Pass, TransformFn};
use crate::program::{self, BackendConfig, CompileConfig, CompiledProgram, Dialect};
use crate::quantize::{dedup_dynamic_quant_chains, QuantConfig, Quantizer, RangeObserverQuantizer};
use crate::serialize::{encode_program, RefLoader, RuntimeLoader};
use crate::stage::{stage_banner, write_dump, Artifact, Stage, StageInput, StageKind};

/// The capture/export engine capability: trace a model into a graph.
pub trait CaptureEngine {
    fn capture(
        &self,
        module: &dyn Module,
        example_inputs: &[Tensor],
        dynamic_shapes: Option<&[DynamicShapeSpec]>,
    ) -> Result<Graph>;
}

/// Default capture engine: the core tracer.
#[derive(Debug, Default)]
pub struct TracingCapture;

impl CaptureEngine for TracingCapture {
    fn capture(
        &self,
        module: &dyn Module,
        example_inputs: &[Tensor],
        dynamic_shapes: Option<&[DynamicShapeSpec]>,
    ) -> Result<Graph> {
        vole_core::capture(module, example_inputs, dynamic_shapes)
    }
}

fn ensure_not_run(artifact: &Option<Artifact>, kind: StageKind) -> Result<()> {
    if artifact.is_some() {
        return Err(Error::StageExecution(format!(
            "stage {kind} instance already ran"
        )));
    }
    Ok(())
}

fn stored<'a>(artifact: &'a Option<Artifact>, kind: StageKind) -> Result<&'a Artifact> {
    artifact.as_ref().ok_or_else(|| Error::NotYetRun {
        stage: kind.name().to_string(),
    })
}

// Quantize

/// Captures the model, calibrates, and converts it to the quantized graph,
/// then merges redundant dynamic quantization parameter chains.
pub struct Quantize {
    quantizer: Box<dyn Quantizer>,
    calibrate: bool,
    calibration_samples: Option<Vec<Vec<Tensor>>>,
    capture_engine: Box<dyn CaptureEngine>,
    artifact: Option<Artifact>,
}

impl Default for Quantize {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantize {
    pub fn new() -> Self {
        Self::with_config(QuantConfig::int8())
    }

    /// Default quantizer with the given global configuration.
    pub fn with_config(config: QuantConfig) -> Self {
        let mut quantizer = RangeObserverQuantizer::new();
        quantizer.set_global_config(config);
        Self::with_quantizer(Box::new(quantizer))
    }

    /// Use a caller-supplied quantizer capability.
    pub fn with_quantizer(quantizer: Box<dyn Quantizer>) -> Self {
        Quantize {
            quantizer,
            calibrate: true,
            calibration_samples: None,
            capture_engine: Box::new(TracingCapture),
            artifact: None,
        }
    }

    /// Calibrate with these samples instead of the example inputs.
    pub fn calibration_samples(mut self, samples: Vec<Vec<Tensor>>) -> Self {
        self.calibration_samples = Some(samples);
        self
    }

    /// Skip calibration entirely (dynamic quantization does not need it).
    pub fn skip_calibration(mut self) -> Self {
        self.calibrate = false;
        self
    }
}

impl Stage for Quantize {
    fn kind(&self) -> StageKind {
        StageKind::Quantize
    }

    fn run(&mut self, input: StageInput<'_>, inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let module = match input {
            StageInput::Module(m) => m,
            StageInput::Artifact(_) => {
                return Err(Error::StageExecution(
                    "Quantize consumes the raw model; it cannot follow another stage".to_string(),
                ))
            }
        };
        let example_inputs = inputs.ok_or_else(|| {
            Error::StageExecution("Quantize requires example inputs".to_string())
        })?;
        let captured = self.capture_engine.capture(module, example_inputs, None)?;

        let calibration: Vec<Vec<Tensor>> = if !self.calibrate {
            Vec::new()
        } else {
            match &self.calibration_samples {
                Some(samples) if !samples.is_empty() => samples.clone(),
                _ => vec![example_inputs.to_vec()],
            }
        };
        let converted = self.quantizer.quantize(&captured, &calibration)?;
        let merged = dedup_dynamic_quant_chains(&converted)?;
        self.artifact = Some(Artifact::Graph(merged));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// Export

/// Strict graph capture of the model (or adoption of the quantized graph),
/// honoring dynamic-shape specs. The canonical verification reference.
pub struct Export {
    dynamic_shapes: Option<Vec<DynamicShapeSpec>>,
    capture_engine: Box<dyn CaptureEngine>,
    artifact: Option<Artifact>,
}

impl Default for Export {
    fn default() -> Self {
        Self::new()
    }
}

impl Export {
    pub fn new() -> Self {
        Export {
            dynamic_shapes: None,
            capture_engine: Box::new(TracingCapture),
            artifact: None,
        }
    }

    pub fn with_dynamic_shapes(specs: Vec<DynamicShapeSpec>) -> Self {
        Export {
            dynamic_shapes: Some(specs),
            capture_engine: Box::new(TracingCapture),
            artifact: None,
        }
    }
}

impl Stage for Export {
    fn kind(&self) -> StageKind {
        StageKind::Export
    }

    fn run(&mut self, input: StageInput<'_>, inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let graph = match input {
            StageInput::Module(module) => {
                let example_inputs = inputs.ok_or_else(|| {
                    Error::StageExecution("Export requires example inputs".to_string())
                })?;
                self.capture_engine
                    .capture(module, example_inputs, self.dynamic_shapes.as_deref())?
            }
            StageInput::Artifact(artifact) => {
                // Following Quantize: the quantized graph is already
                // captured; attach the dynamic-shape specs to it.
                let mut graph = artifact.as_graph()?.clone();
                if let Some(specs) = &self.dynamic_shapes {
                    if specs.len() != graph.inputs().len() {
                        return Err(Error::StageExecution(format!(
                            "got {} dynamic shape specs for {} inputs",
                            specs.len(),
                            graph.inputs().len()
                        )));
                    }
                    for (index, spec) in specs.iter().enumerate() {
                        if !spec.is_empty() {
                            graph.set_input_spec(index, spec.clone())?;
                        }
                    }
                }
                graph.validate()?;
                graph
            }
        };
        self.artifact = Some(Artifact::Graph(graph));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// RunPasses

/// Applies an ordered pass list, then ordered transform functions; each
/// rewrite's output feeds the next. Preserves the artifact kind.
#[derive(Default)]
pub struct RunPasses {
    passes: Vec<Box<dyn Pass>>,
    transforms: Vec<TransformFn>,
    artifact: Option<Artifact>,
}

impl RunPasses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_passes(mut self, passes: Vec<Box<dyn Pass>>) -> Self {
        self.passes = passes;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<TransformFn>) -> Self {
        self.transforms = transforms;
        self
    }

    fn rewrite(&self, graph: &Graph) -> Result<Graph> {
        let mut current = graph.clone();
        for pass in &self.passes {
            tracing::debug!(pass = pass.name(), "applying pass");
            current = pass.run(&current)?;
        }
        for transform in &self.transforms {
            current = transform(&current)?;
        }
        Ok(current)
    }
}

impl Stage for RunPasses {
    fn kind(&self) -> StageKind {
        StageKind::RunPasses
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let artifact = match input.artifact()? {
            Artifact::Graph(graph) => Artifact::Graph(self.rewrite(graph)?),
            Artifact::Program(program) => Artifact::Program(CompiledProgram {
                graph: self.rewrite(&program.graph)?,
                dialect: program.dialect,
                entry: program.entry.clone(),
                partitioned: program.partitioned,
                memory_plan: program.memory_plan.clone(),
            }),
            Artifact::Bytes(_) => {
                return Err(Error::StageExecution(
                    "RunPasses cannot rewrite serialized bytes".to_string(),
                ))
            }
        };
        self.artifact = Some(artifact);
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// ToIntermediate

/// Lowers a graph into the backend-neutral intermediate program. Pure; no
/// partitioning.
#[derive(Default)]
pub struct ToIntermediate {
    config: CompileConfig,
    artifact: Option<Artifact>,
}

impl ToIntermediate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CompileConfig) -> Self {
        ToIntermediate {
            config,
            artifact: None,
        }
    }
}

impl Stage for ToIntermediate {
    fn kind(&self) -> StageKind {
        StageKind::ToIntermediate
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let graph = input.artifact()?.as_graph()?.clone();
        let program = program::lower(graph, &self.config)?;
        self.artifact = Some(Artifact::Program(program));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// ToIntermediateTransformAndLower

/// Combined lowering-and-partitioning shortcut: lowers the graph, then
/// applies each partitioner in order.
pub struct ToIntermediateTransformAndLower {
    partitioners: Vec<Box<dyn Partitioner>>,
    config: CompileConfig,
    artifact: Option<Artifact>,
}

impl Default for ToIntermediateTransformAndLower {
    fn default() -> Self {
        Self::new()
    }
}

impl ToIntermediateTransformAndLower {
    pub fn new() -> Self {
        Self::with_partitioners(vec![Box::new(GreedyPartitioner::new())])
    }

    pub fn with_partitioners(partitioners: Vec<Box<dyn Partitioner>>) -> Self {
        ToIntermediateTransformAndLower {
            partitioners,
            config: CompileConfig::default(),
            artifact: None,
        }
    }

    pub fn with_config(mut self, config: CompileConfig) -> Self {
        self.config = config;
        self
    }
}

impl Stage for ToIntermediateTransformAndLower {
    fn kind(&self) -> StageKind {
        StageKind::ToIntermediateTransformAndLower
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let graph = input.artifact()?.as_graph()?.clone();
        let mut program = program::lower(graph, &self.config)?;
        for partitioner in &self.partitioners {
            tracing::debug!(backend = partitioner.backend(), "partitioning");
            program = partitioner.partition(&program)?;
        }
        self.artifact = Some(Artifact::Program(program));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// Partition

/// Delegates regions of an already-lowered, not-yet-partitioned program.
pub struct Partition {
    partitioner: Box<dyn Partitioner>,
    artifact: Option<Artifact>,
}

impl Default for Partition {
    fn default() -> Self {
        Self::new()
    }
}

impl Partition {
    pub fn new() -> Self {
        Self::with_partitioner(Box::new(GreedyPartitioner::new()))
    }

    pub fn with_partitioner(partitioner: Box<dyn Partitioner>) -> Self {
        Partition {
            partitioner,
            artifact: None,
        }
    }
}

impl Stage for Partition {
    fn kind(&self) -> StageKind {
        StageKind::Partition
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let program = input.artifact()?.as_program()?;
        if program.partitioned {
            return Err(Error::StageExecution(
                "Partition consumes a not-yet-partitioned program".to_string(),
            ));
        }
        let partitioned = self.partitioner.partition(program)?;
        self.artifact = Some(Artifact::Program(partitioned));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }
}

// Finalize

/// Emits the runtime-loadable program: applies the backend config's
/// symbolic-shape evaluation policy and plans memory.
#[derive(Default)]
pub struct Finalize {
    config: BackendConfig,
    artifact: Option<Artifact>,
}

impl Finalize {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BackendConfig) -> Self {
        Finalize {
            config,
            artifact: None,
        }
    }
}

impl Stage for Finalize {
    fn kind(&self) -> StageKind {
        StageKind::Finalize
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let program = input.artifact()?.as_program()?;
        let finalized = program::finalize(program, &self.config)?;
        self.artifact = Some(Artifact::Program(finalized));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }

    /// The finalized dump additionally prints the memory plan, with
    /// dynamic-shape tensors marked.
    fn dump_artifact(&self, path: Option<&Path>) -> Result<()> {
        let program = self.artifact()?.as_program()?;
        let mut text = format!("{}\n\n{}", stage_banner(self.kind()), program.debug_view());
        if let Some(plan) = &program.memory_plan {
            text.push('\n');
            text.push_str(&plan.to_string());
        }
        write_dump(path, text.as_bytes())
    }
}

// Serialize

/// Extracts the finalized program's binary representation. Re-execution
/// goes through the runtime loader, exercising the serialized form.
pub struct Serialize {
    loader: Box<dyn RuntimeLoader>,
    entry: String,
    artifact: Option<Artifact>,
}

impl Default for Serialize {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize {
    pub fn new() -> Self {
        Self::with_loader(Box::new(RefLoader))
    }

    pub fn with_loader(loader: Box<dyn RuntimeLoader>) -> Self {
        Serialize {
            loader,
            entry: String::new(),
            artifact: None,
        }
    }
}

impl Stage for Serialize {
    fn kind(&self) -> StageKind {
        StageKind::Serialize
    }

    fn run(&mut self, input: StageInput<'_>, _inputs: Option<&[Tensor]>) -> Result<()> {
        ensure_not_run(&self.artifact, self.kind())?;
        let program = input.artifact()?.as_program()?;
        if program.dialect != Dialect::Runtime {
            return Err(Error::StageExecution(
                "Serialize consumes a finalized program".to_string(),
            ));
        }
        self.entry = program.entry.clone();
        self.artifact = Some(Artifact::Bytes(encode_program(program)));
        Ok(())
    }

    fn artifact(&self) -> Result<&Artifact> {
        stored(&self.artifact, self.kind())
    }

    fn run_artifact(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let bytes = self.artifact()?.as_bytes()?;
        let module = self.loader.load(bytes)?;
        module.run_method(&self.entry, inputs)
    }

    /// Serialized bytes are written raw; a path is required.
    fn dump_artifact(&self, path: Option<&Path>) -> Result<()> {
        let bytes = self.artifact()?.as_bytes()?;
        let path = path.ok_or_else(|| {
            Error::StageExecution("dumping serialized bytes requires a path".to_string())
        })?;
        std::fs::write(path, bytes)
            .map_err(|e| Error::msg(format!("cannot write program to {path:?}: {e}")))
    }
}
