//! Graph descriptor: the fixed vertex/edge taxonomy of a transformer
//!
//! Vertices are the embedding, one unit per attention head, one MLP block per
//! layer (when present) and the output readout. An edge routes a source
//! vertex's output into one input slot of a later vertex: the query, key or
//! value input of an attention head, or the single residual input of an MLP
//! block or of the output.
//!
//! ## Evaluation order
//!
//! ```text
//! embed, a0.0 .. a0.{H-1}, m0, a1.0 .. a1.{H-1}, m1, ..., output
//! ```
//!
//! An attention head in layer `l` reads from the embedding and from every
//! head and MLP of layers `< l`. The MLP of layer `l` also reads from the
//! heads of layer `l`. The output reads from everything.
//!
//! ## Id strings
//!
//! `embed`, `a{layer}.{head}`, `m{layer}`, `output` for vertices;
//! `{src}->{dst}` for residual inputs and `{src}->{dst}.{q|k|v}` for
//! attention inputs, e.g. `a0.1->a1.0.q`. Checkpoints and circuits use
//! these strings as keys.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PruneError, Result};

/// Architecture description supplied by the model-loading collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Number of transformer blocks
    pub n_layers: usize,
    /// Attention heads per block
    pub n_heads: usize,
    /// Whether each block has an MLP (length `n_layers`)
    pub mlp_layers: Vec<bool>,
}

impl ArchitectureConfig {
    /// Standard transformer: every block has attention and an MLP
    pub fn new(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            mlp_layers: vec![true; n_layers],
        }
    }

    /// Attention-only transformer
    pub fn attention_only(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            mlp_layers: vec![false; n_layers],
        }
    }

    /// Override which layers carry an MLP block
    pub fn with_mlp_layers(mut self, mlp_layers: Vec<bool>) -> Self {
        self.mlp_layers = mlp_layers;
        self
    }

    /// Whether layer `layer` has an MLP block
    pub fn has_mlp(&self, layer: usize) -> bool {
        self.mlp_layers.get(layer).copied().unwrap_or(false)
    }

    fn validate(&self) -> Result<()> {
        if self.n_layers == 0 {
            return Err(PruneError::Config("n_layers must be positive".into()));
        }
        if self.n_heads == 0 {
            return Err(PruneError::Config("n_heads must be positive".into()));
        }
        if self.mlp_layers.len() != self.n_layers {
            return Err(PruneError::ShapeMismatch {
                what: "mlp_layers".into(),
                expected: self.n_layers,
                got: self.mlp_layers.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ArchitectureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mlps = self.mlp_layers.iter().filter(|&&m| m).count();
        write!(
            f,
            "{} layers x {} heads, {} MLP blocks",
            self.n_layers, self.n_heads, mlps
        )
    }
}

/// Whether masks address vertices or edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruningMode {
    Vertex,
    Edge,
}

impl fmt::Display for PruningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex => write!(f, "vertex"),
            Self::Edge => write!(f, "edge"),
        }
    }
}

/// A vertex of the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VertexId {
    /// Token embedding (source only)
    Embed,
    /// One attention head
    Attn { layer: usize, head: usize },
    /// The MLP block of a layer
    Mlp { layer: usize },
    /// Final readout (sink only)
    Output,
}

impl VertexId {
    pub fn attn(layer: usize, head: usize) -> Self {
        Self::Attn { layer, head }
    }

    pub fn mlp(layer: usize) -> Self {
        Self::Mlp { layer }
    }

    /// Input slots this vertex accepts
    pub fn input_slots(&self) -> &'static [InputSlot] {
        match self {
            Self::Embed => &[],
            Self::Attn { .. } => &[InputSlot::Query, InputSlot::Key, InputSlot::Value],
            Self::Mlp { .. } | Self::Output => &[InputSlot::Residual],
        }
    }

    /// Number of input slots
    pub fn arity(&self) -> usize {
        self.input_slots().len()
    }

    /// Attention heads and MLP blocks can be masked; embed and output cannot
    pub fn is_maskable(&self) -> bool {
        matches!(self, Self::Attn { .. } | Self::Mlp { .. })
    }

    /// Layer index, if the vertex belongs to a block
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::Attn { layer, .. } | Self::Mlp { layer } => Some(*layer),
            Self::Embed | Self::Output => None,
        }
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "embed"),
            Self::Attn { layer, head } => write!(f, "a{layer}.{head}"),
            Self::Mlp { layer } => write!(f, "m{layer}"),
            Self::Output => write!(f, "output"),
        }
    }
}

impl FromStr for VertexId {
    type Err = PruneError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || PruneError::UnknownVertex(s.to_string());
        match s {
            "embed" => return Ok(Self::Embed),
            "output" => return Ok(Self::Output),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix('a') {
            let (layer, head) = rest.split_once('.').ok_or_else(unknown)?;
            let layer = layer.parse().map_err(|_| unknown())?;
            let head = head.parse().map_err(|_| unknown())?;
            return Ok(Self::Attn { layer, head });
        }
        if let Some(rest) = s.strip_prefix('m') {
            let layer = rest.parse().map_err(|_| unknown())?;
            return Ok(Self::Mlp { layer });
        }
        Err(unknown())
    }
}

impl From<VertexId> for String {
    fn from(v: VertexId) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for VertexId {
    type Error = PruneError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Input channel of a destination vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputSlot {
    Query,
    Key,
    Value,
    /// The single input of an MLP block or of the output
    Residual,
}

impl InputSlot {
    fn suffix(&self) -> Option<&'static str> {
        match self {
            Self::Query => Some("q"),
            Self::Key => Some("k"),
            Self::Value => Some("v"),
            Self::Residual => None,
        }
    }
}

/// A directed edge `src -> dst.slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EdgeId {
    pub src: VertexId,
    pub dst: VertexId,
    pub slot: InputSlot,
}

impl EdgeId {
    pub fn new(src: VertexId, dst: VertexId, slot: InputSlot) -> Self {
        Self { src, dst, slot }
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.suffix() {
            Some(suffix) => write!(f, "{}->{}.{}", self.src, self.dst, suffix),
            None => write!(f, "{}->{}", self.src, self.dst),
        }
    }
}

impl FromStr for EdgeId {
    type Err = PruneError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || PruneError::UnknownEdge(s.to_string());
        let (src, dst) = s.split_once("->").ok_or_else(unknown)?;
        let src: VertexId = src.parse().map_err(|_| unknown())?;

        // "a1.0.q" has two dots; "a1.0" and "m1" are residual-free vertex ids
        let (dst, slot) = match dst.rsplit_once('.') {
            Some((head, "q")) => (head, InputSlot::Query),
            Some((head, "k")) => (head, InputSlot::Key),
            Some((head, "v")) => (head, InputSlot::Value),
            _ => (dst, InputSlot::Residual),
        };
        let dst: VertexId = dst.parse().map_err(|_| unknown())?;
        if !dst.input_slots().contains(&slot) {
            return Err(unknown());
        }
        Ok(Self { src, dst, slot })
    }
}

impl From<EdgeId> for String {
    fn from(e: EdgeId) -> Self {
        e.to_string()
    }
}

impl TryFrom<String> for EdgeId {
    type Error = PruneError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Static enumeration of vertices and legal edges for one architecture.
///
/// Built once and shared read-only by every sampler and pruner.
#[derive(Debug, Clone)]
pub struct GraphDescriptor {
    arch: ArchitectureConfig,
    /// All vertices in evaluation order
    vertices: Vec<VertexId>,
    vertex_index: HashMap<VertexId, usize>,
    /// Attention heads and MLP blocks in evaluation order
    maskable: Vec<VertexId>,
    maskable_index: HashMap<VertexId, usize>,
    /// Sources feeding each vertex, in evaluation order
    upstream: HashMap<VertexId, Vec<VertexId>>,
    /// Edges grouped by destination, slot, then source
    edges: Vec<EdgeId>,
    edge_index: HashMap<EdgeId, usize>,
    incoming: HashMap<(VertexId, InputSlot), Vec<usize>>,
    outgoing: HashMap<VertexId, Vec<usize>>,
}

impl GraphDescriptor {
    /// Enumerate vertices and edges for an architecture
    pub fn new(arch: ArchitectureConfig) -> Result<Self> {
        arch.validate()?;

        let mut vertices = vec![VertexId::Embed];
        for layer in 0..arch.n_layers {
            for head in 0..arch.n_heads {
                vertices.push(VertexId::attn(layer, head));
            }
            if arch.has_mlp(layer) {
                vertices.push(VertexId::mlp(layer));
            }
        }
        vertices.push(VertexId::Output);

        let vertex_index = vertices.iter().enumerate().map(|(i, v)| (*v, i)).collect();
        let maskable: Vec<VertexId> = vertices.iter().copied().filter(VertexId::is_maskable).collect();
        let maskable_index = maskable.iter().enumerate().map(|(i, v)| (*v, i)).collect();

        let mut upstream = HashMap::new();
        for (pos, &dst) in vertices.iter().enumerate() {
            let sources: Vec<VertexId> = vertices[..pos]
                .iter()
                .copied()
                .filter(|src| match (dst, src) {
                    // heads of one layer run in parallel
                    (VertexId::Attn { layer, .. }, VertexId::Attn { layer: l, .. }) => *l != layer,
                    _ => true,
                })
                .collect();
            upstream.insert(dst, sources);
        }

        let mut edges = Vec::new();
        let mut incoming: HashMap<(VertexId, InputSlot), Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<VertexId, Vec<usize>> = HashMap::new();
        for &dst in &vertices {
            for &slot in dst.input_slots() {
                for &src in &upstream[&dst] {
                    let idx = edges.len();
                    edges.push(EdgeId::new(src, dst, slot));
                    incoming.entry((dst, slot)).or_default().push(idx);
                    outgoing.entry(src).or_default().push(idx);
                }
            }
        }
        let edge_index = edges.iter().enumerate().map(|(i, e)| (*e, i)).collect();

        Ok(Self {
            arch,
            vertices,
            vertex_index,
            maskable,
            maskable_index,
            upstream,
            edges,
            edge_index,
            incoming,
            outgoing,
        })
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.arch
    }

    /// All vertices in evaluation order
    pub fn vertices(&self) -> &[VertexId] {
        &self.vertices
    }

    /// Maskable vertices (heads and MLPs) in evaluation order
    pub fn maskable_vertices(&self) -> &[VertexId] {
        &self.maskable
    }

    /// All edges, grouped by destination
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn contains_vertex(&self, vertex: &VertexId) -> bool {
        self.vertex_index.contains_key(vertex)
    }

    pub fn contains_edge(&self, edge: &EdgeId) -> bool {
        self.edge_index.contains_key(edge)
    }

    /// Position of a vertex in evaluation order
    pub fn vertex_index(&self, vertex: &VertexId) -> Result<usize> {
        self.vertex_index
            .get(vertex)
            .copied()
            .ok_or_else(|| PruneError::UnknownVertex(vertex.to_string()))
    }

    /// Mask index of a maskable vertex
    pub fn maskable_index(&self, vertex: &VertexId) -> Result<usize> {
        self.maskable_index
            .get(vertex)
            .copied()
            .ok_or_else(|| PruneError::UnknownVertex(vertex.to_string()))
    }

    /// Mask index of an edge
    pub fn edge_index(&self, edge: &EdgeId) -> Result<usize> {
        self.edge_index
            .get(edge)
            .copied()
            .ok_or_else(|| PruneError::UnknownEdge(edge.to_string()))
    }

    /// Vertices whose outputs feed `vertex`, in evaluation order
    pub fn upstream(&self, vertex: &VertexId) -> Result<&[VertexId]> {
        self.upstream
            .get(vertex)
            .map(Vec::as_slice)
            .ok_or_else(|| PruneError::UnknownVertex(vertex.to_string()))
    }

    /// Indices of the edges entering `vertex` at `slot`
    pub fn incoming_edges(&self, vertex: &VertexId, slot: InputSlot) -> &[usize] {
        self.incoming
            .get(&(*vertex, slot))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Indices of the edges leaving `vertex`
    pub fn outgoing_edges(&self, vertex: &VertexId) -> &[usize] {
        self.outgoing.get(vertex).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of mask elements in a pruning mode
    pub fn n_elements(&self, mode: PruningMode) -> usize {
        match mode {
            PruningMode::Vertex => self.maskable.len(),
            PruningMode::Edge => self.edges.len(),
        }
    }

    /// Id strings of the mask elements, in mask order
    pub fn element_ids(&self, mode: PruningMode) -> Vec<String> {
        match mode {
            PruningMode::Vertex => self.maskable.iter().map(ToString::to_string).collect(),
            PruningMode::Edge => self.edges.iter().map(ToString::to_string).collect(),
        }
    }

    /// Mask index of an element id string
    pub fn element_index(&self, mode: PruningMode, id: &str) -> Result<usize> {
        match mode {
            PruningMode::Vertex => self.maskable_index(&id.parse()?),
            PruningMode::Edge => self.edge_index(&id.parse()?),
        }
    }

    /// The vertex whose ablation constant stands in for mask element `index`.
    ///
    /// In vertex mode that is the masked vertex itself; in edge mode it is the
    /// edge's source.
    pub fn element_source(&self, mode: PruningMode, index: usize) -> Result<VertexId> {
        let source = match mode {
            PruningMode::Vertex => self.maskable.get(index).copied(),
            PruningMode::Edge => self.edges.get(index).map(|e| e.src),
        };
        source.ok_or_else(|| PruneError::ShapeMismatch {
            what: format!("{mode} mask index"),
            expected: self.n_elements(mode),
            got: index,
        })
    }

    /// Source vertices with their outgoing edge indices, in evaluation order
    pub fn source_groups(&self) -> Vec<(VertexId, Vec<usize>)> {
        self.vertices
            .iter()
            .filter(|v| !self.outgoing_edges(v).is_empty())
            .map(|v| (*v, self.outgoing_edges(v).to_vec()))
            .collect()
    }
}
