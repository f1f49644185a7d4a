// Quantization — post-training INT8 rewriting of captured graphs
//
// The default quantizer produces the Q/DQ representation: every supported
// operator keeps computing in f32, but its operands and result pass through
// quantize/dequantize pairs whose parameters come from calibration, so the
// graph carries real quantization rounding error and the value feeding each
// graph output is produced by a dequantize node.
//
// MODES:
//
//   - Static (default): per-tensor parameters computed offline from
//     calibration ranges; Q/DQ pairs carry the parameters as attributes.
//   - Dynamic: parameters are computed at runtime by choose_qparams nodes.
//     One chain is inserted per operand use, mirroring how independent
//     observer insertions behave; merging those redundant chains is the
//     job of dedup_dynamic_quant_chains, applied after conversion.

use std::collections::HashMap;

use vole_core::graph::{Graph, NodeId, OpKind};
use vole_core::{DType, Error, Result, Tensor};

use crate::exec;

/// Symmetric vs. asymmetric parameter computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    /// zero_point = 0, range [-max|x|, +max|x|].
    Symmetric,
    /// zero_point shifts the range to [min, max].
    Asymmetric,
}

/// Global quantization configuration.
#[derive(Debug, Clone, Copy)]
pub struct QuantConfig {
    pub mode: QuantMode,
    /// Compute activation parameters at runtime instead of via calibration.
    pub dynamic: bool,
}

impl Default for QuantConfig {
    fn default() -> Self {
        QuantConfig {
            mode: QuantMode::Symmetric,
            dynamic: false,
        }
    }
}

impl QuantConfig {
    /// Static symmetric per-tensor INT8 (the common case).
    pub fn int8() -> Self {
        Self::default()
    }

    /// Runtime (dynamic) parameter computation.
    pub fn int8_dynamic() -> Self {
        QuantConfig {
            mode: QuantMode::Symmetric,
            dynamic: true,
        }
    }

    pub fn asymmetric(mut self) -> Self {
        self.mode = QuantMode::Asymmetric;
        self
    }
}

/// The quantizer capability: annotate-and-convert a captured graph.
pub trait Quantizer {
    /// Install the global quantization configuration.
    fn set_global_config(&mut self, config: QuantConfig);

    /// Produce the quantized graph. `calibration` is a non-empty list of
    /// input tuples run through the graph to observe activation ranges.
    fn quantize(&self, graph: &Graph, calibration: &[Vec<Tensor>]) -> Result<Graph>;
}

/// Compute (scale, zero_point) for an observed value range.
fn compute_scale_zp(min: f32, max: f32, mode: QuantMode) -> (f32, i32) {
    match mode {
        QuantMode::Symmetric => {
            let max_abs = min.abs().max(max.abs());
            ((max_abs / i8::MAX as f32).max(1e-8), 0)
        }
        QuantMode::Asymmetric => {
            let (min, max) = (min.min(0.0), max.max(0.0));
            let scale = ((max - min) / 255.0).max(1e-8);
            let zp = (i8::MIN as f32 - min / scale).round();
            (scale, zp.clamp(i8::MIN as f32, i8::MAX as f32) as i32)
        }
    }
}

/// Default quantizer: observes per-node ranges over the calibration set.
#[derive(Debug, Default)]
pub struct RangeObserverQuantizer {
    config: QuantConfig,
}

impl RangeObserverQuantizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Quantizer for RangeObserverQuantizer {
    fn set_global_config(&mut self, config: QuantConfig) {
        self.config = config;
    }

    fn quantize(&self, graph: &Graph, calibration: &[Vec<Tensor>]) -> Result<Graph> {
        if self.config.dynamic {
            convert_dynamic(graph)
        } else {
            let ranges = observe_ranges(graph, calibration)?;
            convert_static(graph, &ranges, self.config.mode)
        }
    }
}

/// Per-node (min, max) over all calibration samples.
fn observe_ranges(graph: &Graph, calibration: &[Vec<Tensor>]) -> Result<Vec<(f32, f32)>> {
    if calibration.is_empty() {
        return Err(Error::StageExecution(
            "quantization requires calibration inputs".to_string(),
        ));
    }
    let mut ranges = vec![(f32::INFINITY, f32::NEG_INFINITY); graph.nodes().len()];
    for sample in calibration {
        let values = exec::run_graph_values(graph, sample)?;
        for (range, value) in ranges.iter_mut().zip(&values) {
            for v in value.to_f32_vec() {
                range.0 = range.0.min(v);
                range.1 = range.1.max(v);
            }
        }
    }
    Ok(ranges)
}

fn is_quantizable(op: &OpKind) -> bool {
    matches!(
        op,
        OpKind::Add | OpKind::Mul | OpKind::Relu | OpKind::Exp | OpKind::MatMul | OpKind::Conv2d { .. }
    )
}

/// Append a static Q/DQ pair after `src` and return the dequantized id.
fn insert_qdq(out: &mut Graph, src: NodeId, scale: f32, zero_point: i32) -> Result<NodeId> {
    let q = out.add_node(OpKind::QuantizePerTensor { scale, zero_point }, vec![src])?;
    out.add_node(OpKind::DequantizePerTensor { scale, zero_point }, vec![q])
}

/// Static conversion: rebuild the graph with Q/DQ around inputs and every
/// supported operator, using calibrated parameters.
fn convert_static(graph: &Graph, ranges: &[(f32, f32)], mode: QuantMode) -> Result<Graph> {
    let mut out = Graph::new();
    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();

    for node in graph.nodes() {
        let mapped: Result<Vec<NodeId>> = node
            .inputs
            .iter()
            .map(|i| {
                remap
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::msg(format!("unmapped input {i}")))
            })
            .collect();
        let new_id = match &node.op {
            OpKind::Input { index } => {
                let id = out.add_input(node.shape.clone(), node.dtype);
                if let Some(spec) = graph.input_spec(*index) {
                    out.set_input_spec(*index, spec.clone())?;
                }
                if node.dtype == DType::F32 {
                    let (min, max) = ranges[node.id.0];
                    let (scale, zp) = compute_scale_zp(min, max, mode);
                    insert_qdq(&mut out, id, scale, zp)?
                } else {
                    id
                }
            }
            OpKind::Constant { value } => {
                let id = out.add_constant(value.clone());
                if value.dtype() == DType::F32 {
                    let (min, max) = ranges[node.id.0];
                    let (scale, zp) = compute_scale_zp(min, max, mode);
                    insert_qdq(&mut out, id, scale, zp)?
                } else {
                    id
                }
            }
            op if is_quantizable(op) => {
                let id = out.add_node(op.clone(), mapped?)?;
                let (min, max) = ranges[node.id.0];
                let (scale, zp) = compute_scale_zp(min, max, mode);
                insert_qdq(&mut out, id, scale, zp)?
            }
            op => out.add_node(op.clone(), mapped?)?,
        };
        remap.insert(node.id, new_id);
    }

    let outputs: Result<Vec<NodeId>> = graph
        .outputs()
        .iter()
        .map(|o| {
            remap
                .get(o)
                .copied()
                .ok_or_else(|| Error::msg(format!("unmapped output {o}")))
        })
        .collect();
    out.set_outputs(outputs?)?;
    out.validate()?;
    Ok(out)
}

/// Dynamic conversion: each quantizable operator's f32 operands get their
/// own choose_qparams → quantize → dequantize chain, one per use.
fn convert_dynamic(graph: &Graph) -> Result<Graph> {
    let mut out = Graph::new();
    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();

    for node in graph.nodes() {
        let mapped: Result<Vec<NodeId>> = node
            .inputs
            .iter()
            .map(|i| {
                remap
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::msg(format!("unmapped input {i}")))
            })
            .collect();
        let new_id = match &node.op {
            OpKind::Input { index } => {
                let id = out.add_input(node.shape.clone(), node.dtype);
                if let Some(spec) = graph.input_spec(*index) {
                    out.set_input_spec(*index, spec.clone())?;
                }
                id
            }
            OpKind::Constant { value } => out.add_constant(value.clone()),
            op if is_quantizable(op) => {
                let mut chained = Vec::with_capacity(node.inputs.len());
                for src in mapped? {
                    if out.node(src).dtype == DType::F32 {
                        let params = out.add_node(OpKind::ChooseQParams, vec![src])?;
                        let q = out.add_node(OpKind::QuantizeDynamic, vec![src, params])?;
                        chained.push(out.add_node(OpKind::DequantizeDynamic, vec![q, params])?);
                    } else {
                        chained.push(src);
                    }
                }
                out.add_node(op.clone(), chained)?
            }
            op => out.add_node(op.clone(), mapped?)?,
        };
        remap.insert(node.id, new_id);
    }

    let outputs: Result<Vec<NodeId>> = graph
        .outputs()
        .iter()
        .map(|o| {
            remap
                .get(o)
                .copied()
                .ok_or_else(|| Error::msg(format!("unmapped output {o}")))
        })
        .collect();
    out.set_outputs(outputs?)?;
    out.validate()?;
    Ok(out)
}

/// Merge redundant dynamic quantization parameter chains.
///
/// Independent per-use insertion leaves structurally identical
/// choose_qparams / quantize_dynamic / dequantize_dynamic nodes rooted at
/// the same value; this rewrites the graph so each distinct chain exists
/// once and all consumers share it.
pub fn dedup_dynamic_quant_chains(graph: &Graph) -> Result<Graph> {
    #[derive(PartialEq, Eq, Hash)]
    enum ChainKey {
        Choose(Vec<NodeId>),
        Quantize(Vec<NodeId>),
        Dequantize(Vec<NodeId>),
    }

    let mut out = Graph::new();
    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
    let mut seen: HashMap<ChainKey, NodeId> = HashMap::new();

    for node in graph.nodes() {
        let mapped: Result<Vec<NodeId>> = node
            .inputs
            .iter()
            .map(|i| {
                remap
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::msg(format!("unmapped input {i}")))
            })
            .collect();
        let new_id = match &node.op {
            OpKind::Input { index } => {
                let id = out.add_input(node.shape.clone(), node.dtype);
                if let Some(spec) = graph.input_spec(*index) {
                    out.set_input_spec(*index, spec.clone())?;
                }
                id
            }
            OpKind::Constant { value } => out.add_constant(value.clone()),
            op @ (OpKind::ChooseQParams | OpKind::QuantizeDynamic | OpKind::DequantizeDynamic) => {
                let mapped = mapped?;
                let key = match op {
                    OpKind::ChooseQParams => ChainKey::Choose(mapped.clone()),
                    OpKind::QuantizeDynamic => ChainKey::Quantize(mapped.clone()),
                    _ => ChainKey::Dequantize(mapped.clone()),
                };
                if let Some(&existing) = seen.get(&key) {
                    existing
                } else {
                    let id = out.add_node(op.clone(), mapped)?;
                    seen.insert(key, id);
                    id
                }
            }
            op => out.add_node(op.clone(), mapped?)?,
        };
        remap.insert(node.id, new_id);
    }

    let outputs: Result<Vec<NodeId>> = graph
        .outputs()
        .iter()
        .map(|o| {
            remap
                .get(o)
                .copied()
                .ok_or_else(|| Error::msg(format!("unmapped output {o}")))
        })
        .collect();
    out.set_outputs(outputs?)?;
    out.validate()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::module::{capture, Scale};

    #[test]
    fn test_compute_scale_symmetric() {
        let (scale, zp) = compute_scale_zp(-2.0, 1.0, QuantMode::Symmetric);
        assert!((scale - 2.0 / 127.0).abs() < 1e-9);
        assert_eq!(zp, 0);
    }

    #[test]
    fn test_compute_scale_asymmetric_covers_range() {
        let (scale, zp) = compute_scale_zp(-1.0, 3.0, QuantMode::Asymmetric);
        // min maps near qmin, max near qmax
        let qmin = (-1.0 / scale + zp as f32).round();
        let qmax = (3.0 / scale + zp as f32).round();
        assert!(qmin >= i8::MIN as f32 - 1.0);
        assert!(qmax <= i8::MAX as f32 + 1.0);
    }

    #[test]
    fn test_static_quantize_ends_in_dequantize() {
        let x = Tensor::from_f32(vec![0.5, -0.5, 1.0, -1.0], [4]).unwrap();
        let graph = capture(&Scale { factor: 2.0 }, &[x.clone()], None).unwrap();
        let mut quantizer = RangeObserverQuantizer::new();
        quantizer.set_global_config(QuantConfig::int8());
        let quantized = quantizer.quantize(&graph, &[vec![x.clone()]]).unwrap();

        let out_node = quantized.node(quantized.outputs()[0]);
        assert_eq!(out_node.op.name(), "dequantize_per_tensor");

        // Quantized execution stays within one step of the exact result.
        let exact = exec::run_graph(&graph, &[x.clone()]).unwrap();
        let approx = exec::run_graph(&quantized, &[x]).unwrap();
        let counts = quantized.node_counts();
        assert!(counts.get("quantize_per_tensor").copied().unwrap_or(0) >= 2);
        for (e, a) in exact[0].to_f32_vec().iter().zip(approx[0].to_f32_vec()) {
            assert!((e - a).abs() < 0.1, "exact {e} vs quantized {a}");
        }
    }

    #[test]
    fn test_quantize_requires_calibration() {
        let x = Tensor::from_f32(vec![1.0], [1]).unwrap();
        let graph = capture(&Scale::identity(), &[x], None).unwrap();
        let quantizer = RangeObserverQuantizer::new();
        assert!(matches!(
            quantizer.quantize(&graph, &[]),
            Err(Error::StageExecution(_))
        ));
    }

    #[test]
    fn test_dynamic_chains_dedup() {
        // x feeds two matmuls against different weights: per-use insertion
        // creates two identical chains on x; dedup merges them.
        struct TwoHeads {
            a: Tensor,
            b: Tensor,
        }
        impl vole_core::Module for TwoHeads {
            fn forward(
                &self,
                tracer: &mut vole_core::Tracer,
                inputs: &[vole_core::NodeId],
            ) -> Result<Vec<vole_core::NodeId>> {
                let wa = tracer.constant(self.a.clone());
                let wb = tracer.constant(self.b.clone());
                let ya = tracer.matmul(inputs[0], wa)?;
                let yb = tracer.matmul(inputs[0], wb)?;
                Ok(vec![ya, yb])
            }
        }

        let x = Tensor::from_f32(vec![1.0, -2.0], [1, 2]).unwrap();
        let model = TwoHeads {
            a: Tensor::from_f32(vec![1.0, 0.0], [2, 1]).unwrap(),
            b: Tensor::from_f32(vec![0.0, 1.0], [2, 1]).unwrap(),
        };
        let graph = capture(&model, &[x.clone()], None).unwrap();

        let mut quantizer = RangeObserverQuantizer::new();
        quantizer.set_global_config(QuantConfig::int8_dynamic());
        let converted = quantizer.quantize(&graph, &[vec![x.clone()]]).unwrap();
        assert_eq!(converted.node_counts()["choose_qparams"], 4);

        let deduped = dedup_dynamic_quant_chains(&converted).unwrap();
        // One chain per distinct source: x (shared), wa, wb.
        assert_eq!(deduped.node_counts()["choose_qparams"], 3);

        // Dedup must not change results.
        let before = exec::run_graph(&converted, &[x.clone()]).unwrap();
        let after = exec::run_graph(&deduped, &[x]).unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.to_f32_vec(), a.to_f32_vec());
        }
    }
}
