// Verify — reference execution and tolerance-bounded output comparison
//
// The reference output always comes from the Export stage's graph,
// executed under an observer that records each dequantize's scale without
// touching the numerics. If the value feeding a graph output was produced
// by a dequantize, its scale widens the absolute tolerance by qtol
// quantization steps: quantized backends may legally round a value into an
// adjacent bucket, and the step size is what "adjacent" means for that
// tensor.

use std::collections::HashMap;

use vole_core::graph::{Graph, NodeId};
use vole_core::{Error, Result, Tensor};

use crate::exec::{run_graph_observed, ExecObserver};
use crate::stage::StageKind;

/// Options for `Tester::run_method_and_compare_outputs`.
///
/// With `inputs` set, exactly one comparison runs on those inputs;
/// otherwise `num_runs` comparisons each draw a fresh random sample.
pub struct CompareOptions {
    /// Stage whose artifact to re-execute; defaults to the current stage.
    pub stage: Option<StageKind>,
    /// Fixed inputs instead of generated ones.
    pub inputs: Option<Vec<Tensor>>,
    pub num_runs: usize,
    pub atol: f32,
    pub rtol: f32,
    /// Permitted divergence in quantization steps (scales the detected
    /// quantization step size into extra absolute tolerance).
    pub qtol: f32,
}

impl Default for CompareOptions {
    fn default() -> Self {
        CompareOptions {
            stage: None,
            inputs: None,
            num_runs: 1,
            atol: 1e-3,
            rtol: 1e-3,
            qtol: 0.0,
        }
    }
}

impl CompareOptions {
    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<Tensor>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_num_runs(mut self, num_runs: usize) -> Self {
        self.num_runs = num_runs;
        self
    }

    pub fn with_tolerances(mut self, atol: f32, rtol: f32, qtol: f32) -> Self {
        self.atol = atol;
        self.rtol = rtol;
        self.qtol = qtol;
        self
    }
}

/// Records dequantize scales keyed by the node that produced the value.
struct ScaleRecorder {
    scales: HashMap<NodeId, f32>,
}

impl ExecObserver for ScaleRecorder {
    fn dequantized(&mut self, node: NodeId, scale: f32) {
        self.scales.insert(node, scale);
    }
}

/// Execute the reference graph and return its outputs plus, when a graph
/// output is fed by a dequantize, that dequantize's scale (first such
/// output wins, matching the reference semantics).
pub(crate) fn calculate_reference_output(
    graph: &Graph,
    inputs: &[Tensor],
) -> Result<(Vec<Tensor>, Option<f32>)> {
    let mut recorder = ScaleRecorder {
        scales: HashMap::new(),
    };
    let outputs = run_graph_observed(graph, inputs, &mut recorder)?;
    let scale = graph
        .outputs()
        .iter()
        .find_map(|output| recorder.scales.get(output).copied());
    Ok((outputs, scale))
}

/// Tolerance-bounded elementwise comparison of candidate vs. reference.
pub(crate) fn compare_outputs(
    reference: &[Tensor],
    candidate: &[Tensor],
    quantization_scale: Option<f32>,
    atol: f32,
    rtol: f32,
    qtol: f32,
) -> Result<()> {
    // One quantization step of divergence per qtol unit.
    let atol = match quantization_scale {
        Some(scale) => atol + scale * qtol,
        None => atol,
    };

    if reference.len() != candidate.len() {
        return Err(Error::ComparisonMismatch {
            index: 0,
            detail: format!(
                "candidate produced {} outputs but the reference produced {}",
                candidate.len(),
                reference.len()
            ),
        });
    }

    for (index, (reference, candidate)) in reference.iter().zip(candidate).enumerate() {
        if reference.dims() != candidate.dims() {
            return Err(Error::ComparisonMismatch {
                index,
                detail: format!(
                    "output shape {} does not match reference output shape {}",
                    candidate.shape(),
                    reference.shape()
                ),
            });
        }
        let ref_data = reference.to_f32_vec();
        let cand_data = candidate.to_f32_vec();
        let close = ref_data
            .iter()
            .zip(&cand_data)
            .all(|(&r, &c)| (c - r).abs() <= atol + rtol * r.abs());
        if !close {
            let max_diff = ref_data
                .iter()
                .zip(&cand_data)
                .map(|(&r, &c)| c - r)
                .fold(f32::NEG_INFINITY, f32::max);
            let max_abs = ref_data
                .iter()
                .zip(&cand_data)
                .map(|(&r, &c)| (c - r).abs())
                .fold(0.0f32, f32::max);
            let mean_abs = ref_data
                .iter()
                .zip(&cand_data)
                .map(|(&r, &c)| (c - r).abs())
                .sum::<f32>()
                / ref_data.len().max(1) as f32;
            let model_stats = candidate.stats();
            let ref_stats = reference.stats();
            return Err(Error::ComparisonMismatch {
                index,
                detail: format!(
                    "\tGiven atol: {atol}, rtol: {rtol}.\n\
                     \tOutput tensor shape: {}, dtype: {}\n\
                     \tDifference: max: {max_diff}, abs: {max_abs}, mean abs error: {mean_abs}.\n\
                     \t-- Model vs. Reference --\n\
                     \t Numel: {}, {}\n\
                     \tMedian: {}, {}\n\
                     \t  Mean: {}, {}\n\
                     \t   Max: {}, {}\n\
                     \t   Min: {}, {}",
                    candidate.shape(),
                    candidate.dtype(),
                    candidate.elem_count(),
                    reference.elem_count(),
                    model_stats.median,
                    ref_stats.median,
                    model_stats.mean,
                    ref_stats.mean,
                    model_stats.max,
                    ref_stats.max,
                    model_stats.min,
                    ref_stats.min,
                ),
            });
        }
    }
    Ok(())
}
