// Stage — artifact sum type, stage registry, pipeline graph, stage contract
//
// The artifact handed between stages is a closed tagged union; every stage
// kind statically declares which tags it accepts and which it produces, and
// the orchestrator checks each handoff. The registry is the StageKind enum
// itself plus the static tables below — built at compile time, read-only,
// no load-time registration step.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use vole_core::graph::Graph;
use vole_core::{Error, Module, Result, Tensor};

use crate::exec;
use crate::program::CompiledProgram;

/// Tag of an [`Artifact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Graph,
    Program,
    Bytes,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Graph => "graph",
            ArtifactKind::Program => "program",
            ArtifactKind::Bytes => "bytes",
        };
        f.write_str(s)
    }
}

/// The value a stage produces and the next stage consumes.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Captured (possibly rewritten) graph representation.
    Graph(Graph),
    /// Lowered program, pre- or post-partition, or finalized.
    Program(CompiledProgram),
    /// Serialized program bytes.
    Bytes(Vec<u8>),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Graph(_) => ArtifactKind::Graph,
            Artifact::Program(_) => ArtifactKind::Program,
            Artifact::Bytes(_) => ArtifactKind::Bytes,
        }
    }

    pub fn as_graph(&self) -> Result<&Graph> {
        match self {
            Artifact::Graph(g) => Ok(g),
            other => Err(kind_mismatch(ArtifactKind::Graph, other.kind())),
        }
    }

    pub fn as_program(&self) -> Result<&CompiledProgram> {
        match self {
            Artifact::Program(p) => Ok(p),
            other => Err(kind_mismatch(ArtifactKind::Program, other.kind())),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Artifact::Bytes(b) => Ok(b),
            other => Err(kind_mismatch(ArtifactKind::Bytes, other.kind())),
        }
    }

    /// The graph inside a graph or program artifact, for structural checks.
    pub fn graph_view(&self) -> Result<&Graph> {
        match self {
            Artifact::Graph(g) => Ok(g),
            Artifact::Program(p) => Ok(&p.graph),
            Artifact::Bytes(_) => Err(Error::StageExecution(
                "a serialized artifact has no graph view".to_string(),
            )),
        }
    }
}

fn kind_mismatch(expected: ArtifactKind, got: ArtifactKind) -> Error {
    Error::StageExecution(format!(
        "artifact kind mismatch: expected {expected}, got {got}"
    ))
}

/// The registry of stage kinds. Uniqueness is a property of the enum; the
/// pipeline graph below is the only transition authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Quantize,
    Export,
    RunPasses,
    ToIntermediate,
    ToIntermediateTransformAndLower,
    Partition,
    Finalize,
    Serialize,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        StageKind::Quantize,
        StageKind::Export,
        StageKind::RunPasses,
        StageKind::ToIntermediate,
        StageKind::ToIntermediateTransformAndLower,
        StageKind::Partition,
        StageKind::Finalize,
        StageKind::Serialize,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Quantize => "Quantize",
            StageKind::Export => "Export",
            StageKind::RunPasses => "RunPasses",
            StageKind::ToIntermediate => "ToIntermediate",
            StageKind::ToIntermediateTransformAndLower => "ToIntermediateTransformAndLower",
            StageKind::Partition => "Partition",
            StageKind::Finalize => "Finalize",
            StageKind::Serialize => "Serialize",
        }
    }

    /// Legal next stages. Quantize and Export are the two entry points; the
    /// graph is a DAG terminating at Serialize.
    pub fn successors(self) -> &'static [StageKind] {
        match self {
            StageKind::Quantize => &[StageKind::Export],
            StageKind::Export => &[
                StageKind::RunPasses,
                StageKind::ToIntermediate,
                StageKind::ToIntermediateTransformAndLower,
            ],
            StageKind::ToIntermediateTransformAndLower => {
                &[StageKind::RunPasses, StageKind::Finalize]
            }
            StageKind::ToIntermediate => &[StageKind::Partition, StageKind::RunPasses],
            StageKind::RunPasses => &[
                StageKind::Partition,
                StageKind::ToIntermediateTransformAndLower,
            ],
            StageKind::Partition => &[StageKind::Finalize],
            StageKind::Finalize => &[StageKind::Serialize],
            StageKind::Serialize => &[],
        }
    }

    /// Whether this stage may start a pipeline (consuming the model itself).
    pub fn is_entry(self) -> bool {
        matches!(self, StageKind::Quantize | StageKind::Export)
    }

    /// Artifact kinds this stage accepts from a predecessor.
    pub fn consumes(self) -> &'static [ArtifactKind] {
        match self {
            StageKind::Quantize => &[],
            StageKind::Export => &[ArtifactKind::Graph],
            StageKind::RunPasses => &[ArtifactKind::Graph, ArtifactKind::Program],
            StageKind::ToIntermediate => &[ArtifactKind::Graph],
            StageKind::ToIntermediateTransformAndLower => &[ArtifactKind::Graph],
            StageKind::Partition => &[ArtifactKind::Program],
            StageKind::Finalize => &[ArtifactKind::Program],
            StageKind::Serialize => &[ArtifactKind::Program],
        }
    }

    /// Artifact kind this stage produces. RunPasses preserves its input's
    /// kind, so this is its widest answer; the concrete stage upholds it.
    pub fn produces(self) -> ArtifactKind {
        match self {
            StageKind::Quantize | StageKind::Export => ArtifactKind::Graph,
            StageKind::RunPasses => ArtifactKind::Graph,
            StageKind::ToIntermediate
            | StageKind::ToIntermediateTransformAndLower
            | StageKind::Partition
            | StageKind::Finalize => ArtifactKind::Program,
            StageKind::Serialize => ArtifactKind::Bytes,
        }
    }

    pub fn from_name(name: &str) -> Option<StageKind> {
        StageKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage receives: the original model (first stage only) or the
/// predecessor's artifact.
pub enum StageInput<'a> {
    Module(&'a dyn Module),
    Artifact(&'a Artifact),
}

impl<'a> StageInput<'a> {
    /// The artifact, or a contract-violation error for a model input.
    pub fn artifact(&self) -> Result<&'a Artifact> {
        match self {
            StageInput::Artifact(a) => Ok(*a),
            StageInput::Module(_) => Err(Error::StageExecution(
                "stage expected a predecessor artifact, got the raw model".to_string(),
            )),
        }
    }
}

/// Banner framing a stage name, printed above every artifact dump.
pub fn stage_banner(kind: StageKind) -> String {
    let frame = "#".repeat(36);
    format!("{frame} {} {frame}", kind.name())
}

/// The uniform stage contract.
///
/// `run` executes at most once per instance; `artifact` and `debug_view`
/// fail with `NotYetRun` before that. The default `run_artifact`
/// re-executes the stored artifact on the reference interpreter; Serialize
/// overrides it to go through the runtime loader instead.
pub trait Stage {
    fn kind(&self) -> StageKind;

    /// Consume the predecessor artifact (or model) and produce this
    /// stage's artifact. `inputs` is only provided to entry stages.
    fn run(&mut self, input: StageInput<'_>, inputs: Option<&[Tensor]>) -> Result<()>;

    /// The artifact produced by `run`.
    fn artifact(&self) -> Result<&Artifact>;

    /// Textual graph form for diagnostics; never required for correctness.
    fn debug_view(&self) -> Result<String> {
        match self.artifact()? {
            Artifact::Graph(g) => Ok(g.to_string()),
            Artifact::Program(p) => Ok(p.debug_view()),
            Artifact::Bytes(_) => Err(Error::StageExecution(
                "a serialized artifact has no textual form".to_string(),
            )),
        }
    }

    /// Re-execute this stage's artifact on the given inputs.
    fn run_artifact(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        match self.artifact()? {
            Artifact::Graph(g) => exec::run_graph(g, inputs),
            Artifact::Program(p) => exec::run_program(p, inputs),
            Artifact::Bytes(_) => Err(Error::StageExecution(
                "serialized bytes re-execute through the Serialize stage's loader".to_string(),
            )),
        }
    }

    /// Append banner + artifact text to `path`, or print to stdout.
    fn dump_artifact(&self, path: Option<&Path>) -> Result<()> {
        let text = format!("{}\n\n{}", stage_banner(self.kind()), self.debug_view()?);
        write_dump(path, text.as_bytes())
    }
}

/// Shared file-append helper for artifact dumps. The handle is opened,
/// written, and released within this call on every exit path.
pub(crate) fn write_dump(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match path {
        Some(path) => {
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|e| Error::msg(format!("cannot open dump file {path:?}: {e}")))?;
            file.write_all(bytes)
                .map_err(|e| Error::msg(format!("cannot write dump file {path:?}: {e}")))
        }
        None => {
            let mut stdout = std::io::stdout();
            stdout
                .write_all(bytes)
                .and_then(|_| stdout.write_all(b"\n"))
                .map_err(|e| Error::msg(format!("cannot write dump to stdout: {e}")))
        }
    }
}
