// Serialize — binary program format and the runtime loader
//
// Binary format (.vole):
//
//   Header:
//     magic:       [u8; 4]  = b"VOLE"
//     version:     u32 LE   = 1
//     dialect:     u8       (0=intermediate, 1=runtime)
//     partitioned: u8
//     entry:       u32 LE len + UTF-8 bytes
//
//   Graph (recursive for delegate subgraphs):
//     node_count: u32 LE
//     per node:
//       op_tag: u8
//       payload (op-dependent; see tags below)
//       input_count: u32 LE, then input ids as u32 LE
//     output_count: u32 LE, then output ids as u32 LE
//     spec_count: u32 LE, then per dynamic input:
//       input_index u32, dim_count u32,
//       per dim: dim_idx u32, name (u32 len + UTF-8), min u64, max u64
//
//   Memory plan (present: u8, then allocs):
//     alloc_count u32; per alloc: node u32, offset u64, size u64, dynamic u8
//
// Only input and constant nodes carry shape/dtype payloads; every other
// node's signature is re-inferred while decoding. Dynamic-dim derivation
// functions are not representable in bytes; bounds travel, derivations do
// not. That only matters for re-finalizing a decoded program, which the
// pipeline never does (Serialize is terminal).

use vole_core::dynamic_shape::{DynDim, DynamicShapeSpec};
use vole_core::graph::{Graph, NodeId, OpKind};
use vole_core::{DType, Error, Result, Tensor};

use crate::exec;
use crate::program::{CompiledProgram, Dialect, MemoryPlan, TensorAlloc};

const MAGIC: &[u8; 4] = b"VOLE";
const VERSION: u32 = 1;

// Encoding

/// Serialize a program to its binary representation.
pub fn encode_program(program: &CompiledProgram) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    write_u32(&mut buf, VERSION);
    buf.push(match program.dialect {
        Dialect::Intermediate => 0,
        Dialect::Runtime => 1,
    });
    buf.push(program.partitioned as u8);
    write_str(&mut buf, &program.entry);
    encode_graph(&mut buf, &program.graph);
    match &program.memory_plan {
        Some(plan) => {
            buf.push(1);
            write_u32(&mut buf, plan.allocs.len() as u32);
            for alloc in &plan.allocs {
                write_u32(&mut buf, alloc.node.0 as u32);
                write_u64(&mut buf, alloc.offset as u64);
                write_u64(&mut buf, alloc.size_bytes as u64);
                buf.push(alloc.dynamic as u8);
            }
            write_u64(&mut buf, plan.total_bytes as u64);
        }
        None => buf.push(0),
    }
    buf
}

fn encode_graph(buf: &mut Vec<u8>, graph: &Graph) {
    write_u32(buf, graph.nodes().len() as u32);
    for node in graph.nodes() {
        match &node.op {
            OpKind::Input { index } => {
                buf.push(0);
                write_u32(buf, *index as u32);
                write_shape(buf, node.shape.dims());
                buf.push(dtype_to_u8(node.dtype));
            }
            OpKind::Constant { value } => {
                buf.push(1);
                buf.push(dtype_to_u8(value.dtype()));
                write_shape(buf, value.dims());
                write_tensor_data(buf, value);
            }
            OpKind::Add => buf.push(2),
            OpKind::Mul => buf.push(3),
            OpKind::Relu => buf.push(4),
            OpKind::Exp => buf.push(5),
            OpKind::MatMul => buf.push(6),
            OpKind::Conv2d { stride, padding } => {
                buf.push(7);
                write_u32(buf, *stride as u32);
                write_u32(buf, *padding as u32);
            }
            OpKind::QuantizePerTensor { scale, zero_point } => {
                buf.push(8);
                write_f32(buf, *scale);
                write_i32(buf, *zero_point);
            }
            OpKind::DequantizePerTensor { scale, zero_point } => {
                buf.push(9);
                write_f32(buf, *scale);
                write_i32(buf, *zero_point);
            }
            OpKind::ChooseQParams => buf.push(10),
            OpKind::QuantizeDynamic => buf.push(11),
            OpKind::DequantizeDynamic => buf.push(12),
            OpKind::Delegate { backend, subgraph } => {
                buf.push(13);
                write_str(buf, backend);
                encode_graph(buf, subgraph);
            }
        }
        write_u32(buf, node.inputs.len() as u32);
        for input in &node.inputs {
            write_u32(buf, input.0 as u32);
        }
    }
    write_u32(buf, graph.outputs().len() as u32);
    for output in graph.outputs() {
        write_u32(buf, output.0 as u32);
    }
    let dynamic_inputs: Vec<(usize, &DynamicShapeSpec)> = (0..graph.inputs().len())
        .filter_map(|i| graph.input_spec(i).map(|s| (i, s)))
        .collect();
    write_u32(buf, dynamic_inputs.len() as u32);
    for (input_index, spec) in dynamic_inputs {
        write_u32(buf, input_index as u32);
        let dims: Vec<_> = spec.dims().collect();
        write_u32(buf, dims.len() as u32);
        for (dim_idx, dim) in dims {
            write_u32(buf, dim_idx as u32);
            write_str(buf, dim.name());
            write_u64(buf, dim.min() as u64);
            write_u64(buf, dim.max() as u64);
        }
    }
}

// Decoding

/// Decode a program from its binary representation.
pub fn decode_program(bytes: &[u8]) -> Result<CompiledProgram> {
    let mut r = Reader::new(bytes);
    let magic = r.take(4)?;
    if magic != MAGIC {
        return bail_decode("bad magic; not a vole program");
    }
    let version = r.u32()?;
    if version != VERSION {
        return bail_decode(&format!("unsupported version {version}"));
    }
    let dialect = match r.u8()? {
        0 => Dialect::Intermediate,
        1 => Dialect::Runtime,
        other => return bail_decode(&format!("unknown dialect tag {other}")),
    };
    let partitioned = r.u8()? != 0;
    let entry = r.str()?;
    let graph = decode_graph(&mut r)?;
    let memory_plan = match r.u8()? {
        0 => None,
        _ => {
            let count = r.u32()? as usize;
            let mut allocs = Vec::with_capacity(count);
            for _ in 0..count {
                allocs.push(TensorAlloc {
                    node: NodeId(r.u32()? as usize),
                    offset: r.u64()? as usize,
                    size_bytes: r.u64()? as usize,
                    dynamic: r.u8()? != 0,
                });
            }
            Some(MemoryPlan {
                allocs,
                total_bytes: r.u64()? as usize,
            })
        }
    };
    let program = CompiledProgram {
        graph,
        dialect,
        entry,
        partitioned,
        memory_plan,
    };
    program.graph.validate()?;
    Ok(program)
}

fn decode_graph(r: &mut Reader<'_>) -> Result<Graph> {
    let node_count = r.u32()? as usize;
    let mut graph = Graph::new();
    for position in 0..node_count {
        let tag = r.u8()?;
        let id = match tag {
            0 => {
                let index = r.u32()? as usize;
                let shape = r.shape()?;
                let dtype = u8_to_dtype(r.u8()?)?;
                if index != graph.inputs().len() {
                    return bail_decode(&format!(
                        "input index {index} out of order at node {position}"
                    ));
                }
                let id = graph.add_input(shape, dtype);
                Some(id)
            }
            1 => {
                let dtype = u8_to_dtype(r.u8()?)?;
                let shape = r.shape()?;
                let value = r.tensor(dtype, shape)?;
                Some(graph.add_constant(value))
            }
            _ => None,
        };
        let op = match tag {
            0 | 1 => None,
            2 => Some(OpKind::Add),
            3 => Some(OpKind::Mul),
            4 => Some(OpKind::Relu),
            5 => Some(OpKind::Exp),
            6 => Some(OpKind::MatMul),
            7 => Some(OpKind::Conv2d {
                stride: r.u32()? as usize,
                padding: r.u32()? as usize,
            }),
            8 => Some(OpKind::QuantizePerTensor {
                scale: r.f32()?,
                zero_point: r.i32()?,
            }),
            9 => Some(OpKind::DequantizePerTensor {
                scale: r.f32()?,
                zero_point: r.i32()?,
            }),
            10 => Some(OpKind::ChooseQParams),
            11 => Some(OpKind::QuantizeDynamic),
            12 => Some(OpKind::DequantizeDynamic),
            13 => Some(OpKind::Delegate {
                backend: r.str()?,
                subgraph: decode_graph(r)?,
            }),
            other => return bail_decode(&format!("unknown op tag {other}")),
        };
        let input_count = r.u32()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(NodeId(r.u32()? as usize));
        }
        let id = match (id, op) {
            (Some(id), None) => {
                if !inputs.is_empty() {
                    return bail_decode("input/constant nodes take no operands");
                }
                id
            }
            (None, Some(op)) => graph.add_node(op, inputs)?,
            _ => return bail_decode("malformed node record"),
        };
        if id.0 != position {
            return bail_decode(&format!("node {position} decoded out of position"));
        }
    }
    let output_count = r.u32()? as usize;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        outputs.push(NodeId(r.u32()? as usize));
    }
    graph.set_outputs(outputs)?;
    let spec_count = r.u32()? as usize;
    for _ in 0..spec_count {
        let input_index = r.u32()? as usize;
        let dim_count = r.u32()? as usize;
        let mut spec = DynamicShapeSpec::new();
        for _ in 0..dim_count {
            let dim_idx = r.u32()? as usize;
            let name = r.str()?;
            let min = r.u64()? as usize;
            let max = r.u64()? as usize;
            spec = spec.with_dim(dim_idx, DynDim::new(name, min, max));
        }
        graph.set_input_spec(input_index, spec)?;
    }
    Ok(graph)
}

fn bail_decode<T>(msg: &str) -> Result<T> {
    Err(Error::msg(format!("decode error: {msg}")))
}

// Runtime loader capability

/// A deserialized program ready for execution.
pub trait LoadedModel {
    /// Execute the named entry point on a flattened input list.
    fn run_method(&self, method: &str, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Loads serialized bytes back into something executable. Used only by the
/// Serialize stage's re-execution path.
pub trait RuntimeLoader {
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn LoadedModel>>;
}

/// Reference loader: decode the `.vole` format and interpret it.
#[derive(Debug, Default)]
pub struct RefLoader;

struct RefLoadedModel {
    program: CompiledProgram,
}

impl LoadedModel for RefLoadedModel {
    fn run_method(&self, method: &str, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if method != self.program.entry {
            return Err(Error::msg(format!(
                "program has no method '{method}' (entry point is '{}')",
                self.program.entry
            )));
        }
        exec::run_program(&self.program, inputs)
    }
}

impl RuntimeLoader for RefLoader {
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn LoadedModel>> {
        let program = decode_program(bytes)?;
        Ok(Box::new(RefLoadedModel { program }))
    }
}

// Low-level write/read helpers

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_shape(buf: &mut Vec<u8>, dims: &[usize]) {
    write_u32(buf, dims.len() as u32);
    for &d in dims {
        write_u32(buf, d as u32);
    }
}

fn write_tensor_data(buf: &mut Vec<u8>, t: &Tensor) {
    match t.storage() {
        vole_core::Storage::F32(data) => {
            write_u64(buf, (data.len() * 4) as u64);
            for v in data {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        vole_core::Storage::I8(data) => {
            write_u64(buf, data.len() as u64);
            for &v in data {
                buf.push(v as u8);
            }
        }
    }
}

fn dtype_to_u8(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::I8 => 1,
    }
}

fn u8_to_dtype(v: u8) -> Result<DType> {
    match v {
        0 => Ok(DType::F32),
        1 => Ok(DType::I8),
        other => Err(Error::msg(format!("unknown dtype tag: {other}"))),
    }
}

/// Cursor over the byte buffer with bounds-checked reads.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return bail_decode("unexpected end of buffer");
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::msg("decode error: invalid UTF-8"))
    }

    fn shape(&mut self) -> Result<Vec<usize>> {
        let ndim = self.u32()? as usize;
        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            dims.push(self.u32()? as usize);
        }
        Ok(dims)
    }

    fn tensor(&mut self, dtype: DType, dims: Vec<usize>) -> Result<Tensor> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        match dtype {
            DType::F32 => {
                let data: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Tensor::from_f32(data, dims)
            }
            DType::I8 => {
                let data: Vec<i8> = bytes.iter().map(|&b| b as i8).collect();
                Tensor::from_i8(data, dims)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::module::{capture, Scale};

    use crate::partition::{GreedyPartitioner, Partitioner};
    use crate::program::{finalize, lower, BackendConfig, CompileConfig};

    fn runtime_program() -> (CompiledProgram, Tensor) {
        let x = Tensor::from_f32(vec![1.0, -2.0, 3.0], [3]).unwrap();
        let graph = capture(&Scale { factor: 2.0 }, &[x.clone()], None).unwrap();
        let program = lower(graph, &CompileConfig::default()).unwrap();
        let partitioned = GreedyPartitioner::new().partition(&program).unwrap();
        (
            finalize(&partitioned, &BackendConfig::default()).unwrap(),
            x,
        )
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let (program, _) = runtime_program();
        let bytes = encode_program(&program);
        assert_eq!(&bytes[..4], b"VOLE");

        let decoded = decode_program(&bytes).unwrap();
        assert_eq!(decoded.dialect, Dialect::Runtime);
        assert!(decoded.partitioned);
        assert_eq!(decoded.entry, "forward");
        assert_eq!(
            decoded.graph.node_counts(),
            program.graph.node_counts()
        );
        assert!(decoded.memory_plan.is_some());
    }

    #[test]
    fn test_loader_executes_entry_point() {
        let (program, x) = runtime_program();
        let bytes = encode_program(&program);
        let module = RefLoader.load(&bytes).unwrap();
        let out = module.run_method("forward", &[x]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![2.0, -4.0, 6.0]);
        assert!(module.run_method("backward", &[]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_program(b"NOPE").is_err());
        let (program, _) = runtime_program();
        let mut bytes = encode_program(&program);
        bytes.truncate(bytes.len() - 3);
        assert!(decode_program(&bytes).is_err());
    }
}
