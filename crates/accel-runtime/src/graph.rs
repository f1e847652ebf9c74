//! Operator graph expressions.
//!
//! A small expression builder for the graphs handed to [`crate::ComputeDevice::compile_operator`].
//! Every node knows its output descriptor, so shape errors surface while the graph is built
//! rather than inside the driver.

use accel_tensor::{DataType, ShapeError, TensorDesc, TensorShape};
use thiserror::Error;

/// An error raised while building or lowering an operator graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node produced an invalid shape.
    #[error(transparent)]
    Shape(#[from] ShapeError),

    /// The operands of an elementwise node have different shapes.
    #[error("Operand shapes differ: {0:?} != {1:?}")]
    ShapeMismatch(TensorShape, TensorShape),

    /// The operands of an elementwise node have different element types.
    #[error("Operand types differ: {0} != {1}")]
    TypeMismatch(DataType, DataType),

    /// A node id does not belong to this graph.
    #[error("Unknown node {0}")]
    UnknownNode(usize),

    /// Two input nodes claim the same input index.
    #[error("Input index {0} is declared twice")]
    DuplicateInput(u32),

    /// Input indices must be dense, starting at zero.
    #[error("Input indices are not contiguous")]
    SparseInputs,

    /// The graph has no output.
    #[error("Graph has no output")]
    NoOutput,

    /// The graph cannot be lowered to the requested form.
    #[error("Unsupported graph: {0}")]
    Unsupported(String),
}

/// Identifies a node of an [`OperatorGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// An operation in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A bound operator input.
    Input {
        /// The input slot.
        index: u32,
        /// Descriptor of the bound tensor.
        desc: TensorDesc,
    },
    /// Views the input with a different shape and the same element order.
    Reinterpret {
        /// The node to view.
        input: NodeId,
        /// The new sizes.
        sizes: TensorShape,
    },
    /// Repeats the input along every axis.
    Tile {
        /// The node to repeat.
        input: NodeId,
        /// Repetitions per axis.
        repeats: TensorShape,
    },
    /// Elementwise sum.
    Add {
        /// Left operand.
        lhs: NodeId,
        /// Right operand.
        rhs: NodeId,
    },
}

/// A directed acyclic graph of tensor operations.
///
/// Nodes are appended in topological order: a node can only reference nodes created before
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorGraph {
    nodes: Vec<Node>,
    descs: Vec<TensorDesc>,
    outputs: Vec<NodeId>,
}

impl OperatorGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node, desc: TensorDesc) -> NodeId {
        self.nodes.push(node);
        self.descs.push(desc);
        NodeId(self.nodes.len() - 1)
    }

    /// Returns the output descriptor of a node.
    pub fn desc(&self, id: NodeId) -> Result<&TensorDesc, GraphError> {
        self.descs.get(id.0).ok_or(GraphError::UnknownNode(id.0))
    }

    /// Returns a node.
    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id.0))
    }

    /// Returns all nodes in creation order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Declares an operator input bound at `index`.
    pub fn input(&mut self, index: u32, desc: TensorDesc) -> Result<NodeId, GraphError> {
        let taken = self
            .nodes
            .iter()
            .any(|n| matches!(n, Node::Input { index: i, .. } if *i == index));
        if taken {
            return Err(GraphError::DuplicateInput(index));
        }
        Ok(self.push(Node::Input { index, desc }, desc))
    }

    /// Views `input` with new sizes holding the same number of elements.
    pub fn reinterpret(&mut self, input: NodeId, sizes: TensorShape) -> Result<NodeId, GraphError> {
        let src = *self.desc(input)?;
        let desc = src.with_sizes(sizes)?;
        if desc.element_count() != src.element_count() {
            return Err(ShapeError::ElementCountMismatch(
                src.element_count(),
                desc.element_count(),
            )
            .into());
        }
        Ok(self.push(Node::Reinterpret { input, sizes }, desc))
    }

    /// Repeats `input` `repeats[i]` times along axis `i`.
    pub fn tile(&mut self, input: NodeId, repeats: TensorShape) -> Result<NodeId, GraphError> {
        let src = *self.desc(input)?;
        let mut sizes = src.sizes;
        for (s, r) in sizes.iter_mut().zip(repeats.iter()) {
            *s *= r;
        }
        let desc = src.with_sizes(sizes)?;
        Ok(self.push(Node::Tile { input, repeats }, desc))
    }

    /// Adds two nodes of identical shape and type.
    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        let a = *self.desc(lhs)?;
        let b = *self.desc(rhs)?;
        if a.data_type != b.data_type {
            return Err(GraphError::TypeMismatch(a.data_type, b.data_type));
        }
        if a.sizes != b.sizes {
            return Err(GraphError::ShapeMismatch(a.sizes, b.sizes));
        }
        Ok(self.push(Node::Add { lhs, rhs }, a))
    }

    /// Marks a node as a graph output. Outputs are bound in the order they are marked.
    pub fn mark_output(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.desc(id)?;
        self.outputs.push(id);
        Ok(())
    }

    /// Returns the output nodes.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Returns the input descriptors ordered by input index.
    pub fn input_descs(&self) -> Result<Vec<TensorDesc>, GraphError> {
        let mut inputs: Vec<(u32, TensorDesc)> = self
            .nodes
            .iter()
            .filter_map(|n| match n {
                Node::Input { index, desc } => Some((*index, *desc)),
                _ => None,
            })
            .collect();
        inputs.sort_by_key(|(index, _)| *index);
        if inputs
            .iter()
            .enumerate()
            .any(|(i, (index, _))| *index as usize != i)
        {
            return Err(GraphError::SparseInputs);
        }
        Ok(inputs.into_iter().map(|(_, desc)| desc).collect())
    }

    /// Returns the output descriptors in binding order.
    pub fn output_descs(&self) -> Result<Vec<TensorDesc>, GraphError> {
        if self.outputs.is_empty() {
            return Err(GraphError::NoOutput);
        }
        self.outputs.iter().map(|&id| self.desc(id).copied()).collect()
    }

    /// Returns true if any node repeats its input.
    pub fn has_tile(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, Node::Tile { .. }))
    }

    /// Lowers a single-output binary elementwise graph to per-operand index maps.
    ///
    /// Each operand of the output add node must be an input, optionally reinterpreted, then
    /// optionally tiled. Tiling is expressed by the operand's source sizes: an output
    /// coordinate reads the operand at `coord % sizes` on every axis.
    pub fn lower_elementwise(&self) -> Result<ElementwiseProgram, GraphError> {
        let [output] = self.outputs[..] else {
            return Err(GraphError::Unsupported(format!(
                "expected one output, got {}",
                self.outputs.len()
            )));
        };
        let Node::Add { lhs, rhs } = *self.node(output)? else {
            return Err(GraphError::Unsupported("output is not an add node".into()));
        };
        Ok(ElementwiseProgram {
            output: *self.desc(output)?,
            operands: [self.lower_operand(lhs)?, self.lower_operand(rhs)?],
        })
    }

    fn lower_operand(&self, mut id: NodeId) -> Result<OperandLayout, GraphError> {
        while let Node::Tile { input, .. } = self.node(id)? {
            id = *input;
        }
        let sizes = self.desc(id)?.sizes;
        if let Node::Reinterpret { input, .. } = self.node(id)? {
            id = *input;
        }
        match self.node(id)? {
            Node::Input { index, .. } => Ok(OperandLayout {
                input_index: *index,
                sizes,
            }),
            other => Err(GraphError::Unsupported(format!(
                "operand chain ends in {other:?}"
            ))),
        }
    }
}

/// How one operand of an elementwise program is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandLayout {
    /// The operator input the operand reads.
    pub input_index: u32,
    /// The sizes the input is viewed with before tiling.
    pub sizes: TensorShape,
}

/// A binary elementwise graph lowered to index arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseProgram {
    /// Descriptor of the single output.
    pub output: TensorDesc,
    /// Left and right operand layouts.
    pub operands: [OperandLayout; 2],
}
