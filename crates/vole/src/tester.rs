// Tester — the pipeline orchestrator
//
// Owns the model and example inputs for the session, drives stages in the
// caller's order, enforces the pipeline graph, and records each stage's
// artifact. One session runs each stage kind at most once; re-running a
// stage means constructing a fresh Tester. Not shareable across threads:
// every pipeline session owns its Tester for its lifetime.
//
// Every stage method returns `&mut Self`, so sessions read as one chain:
//
//   Tester::new(model, inputs)
//       .export()?
//       .to_intermediate()?
//       .partition()?
//       .finalize()?
//       .serialize()?
//       .run_method_and_compare_outputs(CompareOptions::default())?;

use std::collections::BTreeMap;
use std::path::Path;

use vole_core::dynamic_shape::DynamicShapeSpec;
use vole_core::{Error, Module, Result, Tensor};

use crate::inputgen::RandomInputs;
use crate::stage::{Artifact, Stage, StageInput, StageKind};
use crate::stages::{
    Export, Finalize, Partition, Quantize, RunPasses, Serialize, ToIntermediate,
    ToIntermediateTransformAndLower,
};
use crate::verify::{calculate_reference_output, compare_outputs, CompareOptions};

/// Orchestrates one lowering session over a model.
pub struct Tester {
    module: Box<dyn Module>,
    example_inputs: Vec<Tensor>,
    dynamic_shapes: Option<Vec<DynamicShapeSpec>>,
    stages: BTreeMap<StageKind, Box<dyn Stage>>,
    cur: Option<StageKind>,
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("cur", &self.cur)
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("example_inputs", &self.example_inputs.len())
            .finish_non_exhaustive()
    }
}

impl Tester {
    pub fn new(module: impl Module + 'static, example_inputs: Vec<Tensor>) -> Self {
        Tester {
            module: Box::new(module),
            example_inputs,
            dynamic_shapes: None,
            stages: BTreeMap::new(),
            cur: None,
        }
    }

    /// Declare dynamic dimensions for the example inputs (one spec per
    /// input; empty specs leave an input fixed).
    pub fn with_dynamic_shapes(mut self, specs: Vec<DynamicShapeSpec>) -> Self {
        self.dynamic_shapes = Some(specs);
        self
    }

    // Stage methods. The bare form uses a default-configured stage; the
    // `_with` form takes a pre-configured instance.

    pub fn quantize(&mut self) -> Result<&mut Self> {
        self.quantize_with(Quantize::new())
    }

    pub fn quantize_with(&mut self, stage: Quantize) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn export(&mut self) -> Result<&mut Self> {
        let stage = match &self.dynamic_shapes {
            Some(specs) => Export::with_dynamic_shapes(specs.clone()),
            None => Export::new(),
        };
        self.export_with(stage)
    }

    pub fn export_with(&mut self, stage: Export) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn run_passes(&mut self) -> Result<&mut Self> {
        self.run_passes_with(RunPasses::new())
    }

    pub fn run_passes_with(&mut self, stage: RunPasses) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn to_intermediate(&mut self) -> Result<&mut Self> {
        self.to_intermediate_with(ToIntermediate::new())
    }

    pub fn to_intermediate_with(&mut self, stage: ToIntermediate) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn to_intermediate_transform_and_lower(&mut self) -> Result<&mut Self> {
        self.to_intermediate_transform_and_lower_with(ToIntermediateTransformAndLower::new())
    }

    pub fn to_intermediate_transform_and_lower_with(
        &mut self,
        stage: ToIntermediateTransformAndLower,
    ) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn partition(&mut self) -> Result<&mut Self> {
        self.partition_with(Partition::new())
    }

    pub fn partition_with(&mut self, stage: Partition) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn finalize(&mut self) -> Result<&mut Self> {
        self.finalize_with(Finalize::new())
    }

    pub fn finalize_with(&mut self, stage: Finalize) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    pub fn serialize(&mut self) -> Result<&mut Self> {
        self.serialize_with(Serialize::new())
    }

    pub fn serialize_with(&mut self, stage: Serialize) -> Result<&mut Self> {
        self.run_stage(Box::new(stage))
    }

    /// Shared stage driver: duplicate check, transition legality, artifact
    /// handoff contract, execute, record. On any failure the session state
    /// is left untouched.
    fn run_stage(&mut self, mut stage: Box<dyn Stage>) -> Result<&mut Self> {
        let kind = stage.kind();
        if self.stages.contains_key(&kind) {
            return Err(Error::DuplicateStage {
                stage: kind.name().to_string(),
            });
        }
        match self.cur {
            None => {
                if !kind.is_entry() {
                    return Err(Error::InvalidTransition {
                        from: "pipeline start".to_string(),
                        to: kind.name().to_string(),
                    });
                }
                tracing::debug!(stage = %kind, "running entry stage");
                stage.run(
                    StageInput::Module(self.module.as_ref()),
                    Some(&self.example_inputs),
                )?;
            }
            Some(cur) => {
                if !cur.successors().contains(&kind) {
                    return Err(Error::InvalidTransition {
                        from: cur.name().to_string(),
                        to: kind.name().to_string(),
                    });
                }
                let predecessor = self.stage(cur)?.artifact()?;
                if !kind.consumes().contains(&predecessor.kind()) {
                    return Err(Error::StageExecution(format!(
                        "stage {kind} cannot consume a {} artifact",
                        predecessor.kind()
                    )));
                }
                tracing::debug!(stage = %kind, after = %cur, "running stage");
                let inputs = kind.is_entry().then_some(self.example_inputs.as_slice());
                stage.run(StageInput::Artifact(predecessor), inputs)?;
            }
        }
        self.stages.insert(kind, stage);
        self.cur = Some(kind);
        Ok(self)
    }

    fn stage(&self, kind: StageKind) -> Result<&dyn Stage> {
        self.stages
            .get(&kind)
            .map(|s| s.as_ref())
            .ok_or_else(|| Error::NotYetRun {
                stage: kind.name().to_string(),
            })
    }

    fn current(&self) -> Result<&dyn Stage> {
        match self.cur {
            Some(kind) => self.stage(kind),
            None => Err(Error::msg("no stage has run in this session")),
        }
    }

    /// The artifact of `stage`, defaulting to the most recently run stage.
    pub fn get_artifact(&self, stage: Option<StageKind>) -> Result<&Artifact> {
        match stage {
            Some(kind) => self.stage(kind)?.artifact(),
            None => self.current()?.artifact(),
        }
    }

    /// Dump a stage's artifact (banner + content) to `path`, or stdout.
    pub fn dump_artifact(
        &mut self,
        path: Option<&Path>,
        stage: Option<StageKind>,
    ) -> Result<&mut Self> {
        match stage {
            Some(kind) => self.stage(kind)?.dump_artifact(path)?,
            None => self.current()?.dump_artifact(path)?,
        }
        Ok(self)
    }

    /// Assert each pattern occurs in the current stage's debug view.
    pub fn check(&mut self, patterns: &[&str]) -> Result<&mut Self> {
        let view = self.current()?.debug_view()?;
        for pattern in patterns {
            if !view.contains(pattern) {
                return Err(Error::CheckFailed(format!(
                    "expected pattern '{pattern}' in the current graph"
                )));
            }
        }
        Ok(self)
    }

    /// Assert each pattern is absent from the current stage's debug view.
    pub fn check_not(&mut self, patterns: &[&str]) -> Result<&mut Self> {
        let view = self.current()?.debug_view()?;
        for pattern in patterns {
            if view.contains(pattern) {
                return Err(Error::CheckFailed(format!(
                    "pattern '{pattern}' must not occur in the current graph"
                )));
            }
        }
        Ok(self)
    }

    /// Assert exact textual occurrence counts in the current debug view.
    pub fn check_count(&mut self, expected: &[(&str, usize)]) -> Result<&mut Self> {
        let view = self.current()?.debug_view()?;
        for &(pattern, count) in expected {
            let found = view.matches(pattern).count();
            if found != count {
                return Err(Error::CheckFailed(format!(
                    "expected {count} occurrences of '{pattern}', found {found}"
                )));
            }
        }
        Ok(self)
    }

    /// Assert exact operator occurrence counts in the current graph.
    pub fn check_node_count(&mut self, expected: &[(&str, usize)]) -> Result<&mut Self> {
        let graph = self.get_artifact(None)?.graph_view()?;
        let counts = graph.node_counts();
        for &(op, count) in expected {
            let found = counts.get(op).copied().unwrap_or(0);
            if found != count {
                return Err(Error::NodeCountMismatch {
                    op: op.to_string(),
                    expected: count,
                    found,
                    counts: format!("{counts:?}"),
                });
            }
        }
        Ok(self)
    }

    /// A generator of fresh random input tuples for this session's model.
    pub fn generate_random_inputs(&self) -> RandomInputs<'_> {
        RandomInputs::new(&self.example_inputs, self.dynamic_shapes.as_deref())
    }

    /// Verify a stage's artifact against the Export reference; see
    /// [`CompareOptions`] for knobs.
    pub fn run_method_and_compare_outputs(
        &mut self,
        options: CompareOptions,
    ) -> Result<&mut Self> {
        let target_kind = match options.stage {
            Some(kind) => kind,
            None => self.cur.ok_or_else(|| {
                Error::msg("no stage has run in this session")
            })?,
        };
        let reference = self.stage(StageKind::Export)?;
        let reference_graph = reference.artifact()?.as_graph()?;
        let target = self.stage(target_kind)?;
        tracing::info!(
            stage = %target_kind,
            reference = %StageKind::Export,
            "comparing stage output against reference"
        );

        let num_runs = if options.inputs.is_some() {
            1
        } else {
            options.num_runs
        };
        let mut generator = RandomInputs::new(&self.example_inputs, self.dynamic_shapes.as_deref());
        for run in 0..num_runs {
            let inputs = match &options.inputs {
                Some(inputs) => inputs.clone(),
                None => generator.next_sample()?,
            };
            let shapes: Vec<_> = inputs.iter().map(|t| t.shape().clone()).collect();
            tracing::info!(run, ?shapes, "verification run");

            let (reference_output, quantization_scale) =
                calculate_reference_output(reference_graph, &inputs)?;
            let stage_output = target.run_artifact(&inputs)?;
            compare_outputs(
                &reference_output,
                &stage_output,
                quantization_scale,
                options.atol,
                options.rtol,
                options.qtol,
            )?;
        }
        Ok(self)
    }
}
