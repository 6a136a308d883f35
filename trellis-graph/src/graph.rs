use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use futures::future::BoxFuture;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use trellis_core::{NodeValue, ToolRegistry};

use crate::edge::{identity_selector, Edge, Route};
use crate::node::{ErasedNode, FnNode, GraphNode, NodeTypes, TypedNode};
use crate::{AgentContext, GraphError};

pub const START: &str = "__start__";
pub const FINISH: &str = "__finish__";

pub(crate) const START_INDEX: usize = 0;
pub(crate) const FINISH_INDEX: usize = 1;

static NEXT_BUILDER_ID: AtomicU64 = AtomicU64::new(1);

/// Tool scope and model override applied while a subgraph runs.
#[derive(Clone, Debug, Default)]
pub struct SubgraphOptions {
    /// Names of the enclosing scope's tools visible inside. `None` inherits
    /// the whole enclosing scope.
    pub tools: Option<Vec<String>>,
    pub model: Option<String>,
}

impl SubgraphOptions {
    pub fn with_tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

pub(crate) struct Subgraph {
    pub(crate) program: Arc<GraphProgram>,
    pub(crate) options: SubgraphOptions,
}

pub(crate) enum NodeKind {
    Start,
    Finish,
    Task(Box<dyn ErasedNode>),
    Subgraph(Subgraph),
}

pub(crate) struct NodeSlot {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) types: NodeTypes,
}

/// Immutable, validated graph shared by every run of an agent.
pub(crate) struct GraphProgram {
    pub(crate) name: String,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) outgoing: Vec<Vec<Edge>>,
    pub(crate) by_name: AHashMap<String, usize>,
}

impl GraphProgram {
    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// Typed reference to a node, valid only for the builder that created it.
pub struct NodeHandle<I, O> {
    builder: u64,
    index: usize,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for NodeHandle<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for NodeHandle<I, O> {}

impl<I, O> std::fmt::Debug for NodeHandle<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("builder", &self.builder)
            .field("index", &self.index)
            .finish()
    }
}

/// Assembles a [`Graph`] from typed nodes and edges.
///
/// Edge endpoints are checked against each other at compile time through the
/// handle types; everything else is checked by [`GraphBuilder::build`].
///
/// ```rust
/// use trellis_graph::{GraphBuilder, Route};
///
/// let mut builder = GraphBuilder::<String, usize>::new("count");
/// let count = builder.add_fn_node("count", |_ctx, text: String| {
///     Box::pin(async move { Ok::<usize, trellis_graph::GraphError>(text.len()) })
/// });
/// let (start, finish) = (builder.start(), builder.finish());
/// builder.add_edge(&start, &count);
/// builder.add_conditional_edge(&count, &finish, Route::new().map(|n: usize| n));
/// let graph = builder.build().unwrap();
/// assert_eq!(graph.name(), "count");
/// ```
pub struct GraphBuilder<I, O> {
    id: u64,
    name: String,
    nodes: Vec<NodeSlot>,
    edges: Vec<(usize, Edge)>,
    errors: Vec<String>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I: NodeValue, O: NodeValue> GraphBuilder<I, O> {
    pub fn new(name: impl Into<String>) -> Self {
        let nodes = vec![
            NodeSlot {
                name: START.to_string(),
                kind: NodeKind::Start,
                types: NodeTypes::of::<I, I>(),
            },
            NodeSlot {
                name: FINISH.to_string(),
                kind: NodeKind::Finish,
                types: NodeTypes::of::<O, O>(),
            },
        ];
        Self {
            id: NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            nodes,
            edges: Vec::new(),
            errors: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn start(&self) -> NodeHandle<I, I> {
        self.handle(START_INDEX)
    }

    pub fn finish(&self) -> NodeHandle<O, O> {
        self.handle(FINISH_INDEX)
    }

    pub fn add_node<N: GraphNode>(
        &mut self,
        name: impl Into<String>,
        node: N,
    ) -> NodeHandle<N::Input, N::Output> {
        let index = self.push_slot(
            name.into(),
            NodeKind::Task(Box::new(TypedNode(node))),
            NodeTypes::of::<N::Input, N::Output>(),
        );
        self.handle(index)
    }

    pub fn add_fn_node<A, B, F>(&mut self, name: impl Into<String>, f: F) -> NodeHandle<A, B>
    where
        A: NodeValue,
        B: NodeValue,
        F: for<'a> Fn(&'a mut AgentContext, A) -> BoxFuture<'a, Result<B, GraphError>>
            + Send
            + Sync
            + 'static,
    {
        self.add_node(name, FnNode::new(f))
    }

    /// Adds a node named after the call site.
    #[track_caller]
    pub fn add_anonymous_node<N: GraphNode>(
        &mut self,
        node: N,
    ) -> NodeHandle<N::Input, N::Output> {
        let location = Location::caller();
        let name = format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
        self.add_node(name, node)
    }

    /// Embeds `graph` as a single node. Only its input and output types are
    /// visible here.
    pub fn add_subgraph<A: NodeValue, B: NodeValue>(
        &mut self,
        name: impl Into<String>,
        graph: &Graph<A, B>,
        options: SubgraphOptions,
    ) -> NodeHandle<A, B> {
        let index = self.push_slot(
            name.into(),
            NodeKind::Subgraph(Subgraph {
                program: Arc::clone(&graph.program),
                options,
            }),
            NodeTypes::of::<A, B>(),
        );
        self.handle(index)
    }

    /// Always-taken edge passing the output through unchanged.
    pub fn add_edge<A, T, B>(
        &mut self,
        from: &NodeHandle<A, T>,
        to: &NodeHandle<T, B>,
    ) -> &mut Self {
        if self.owns(from.builder) && self.owns(to.builder) {
            self.edges.push((
                from.index,
                Edge {
                    to: to.index,
                    select: identity_selector(),
                },
            ));
        }
        self
    }

    pub fn add_conditional_edge<A, T, U, B>(
        &mut self,
        from: &NodeHandle<A, T>,
        to: &NodeHandle<U, B>,
        route: Route<T, U>,
    ) -> &mut Self
    where
        T: NodeValue,
        U: NodeValue,
    {
        if !(self.owns(from.builder) && self.owns(to.builder)) {
            return self;
        }
        if route.is_empty() {
            let from_name = self.nodes[from.index].name.clone();
            self.errors.push(format!(
                "conditional edge from '{from_name}' has no conditions, use add_edge instead"
            ));
            return self;
        }
        self.edges.push((
            from.index,
            Edge {
                to: to.index,
                select: route.into_selector(),
            },
        ));
        self
    }

    pub fn build(self) -> Result<Graph<I, O>, GraphError> {
        let mut errors = self.errors;

        let mut by_name = AHashMap::with_capacity(self.nodes.len());
        for (index, slot) in self.nodes.iter().enumerate() {
            if index > FINISH_INDEX && (slot.name == START || slot.name == FINISH) {
                errors.push(format!("node name '{}' is reserved", slot.name));
                continue;
            }
            if by_name.insert(slot.name.clone(), index).is_some() {
                errors.push(format!("duplicate node name '{}'", slot.name));
            }
        }

        let mut topology: DiGraph<usize, ()> =
            DiGraph::with_capacity(self.nodes.len(), self.edges.len());
        let indices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|index| topology.add_node(index))
            .collect();
        let mut outgoing: Vec<Vec<Edge>> = vec![Vec::new(); self.nodes.len()];
        for (from, edge) in self.edges {
            topology.add_edge(indices[from], indices[edge.to], ());
            outgoing[from].push(edge);
        }

        if !outgoing[FINISH_INDEX].is_empty() {
            errors.push(format!("'{FINISH}' cannot have outgoing edges"));
        }

        let mut reachable = vec![false; self.nodes.len()];
        let mut dfs = Dfs::new(&topology, indices[START_INDEX]);
        while let Some(next) = dfs.next(&topology) {
            reachable[topology[next]] = true;
        }

        let reversed = Reversed(&topology);
        let mut finishes = vec![false; self.nodes.len()];
        let mut dfs = Dfs::new(reversed, indices[FINISH_INDEX]);
        while let Some(next) = dfs.next(reversed) {
            finishes[topology[next]] = true;
        }

        for (index, slot) in self.nodes.iter().enumerate() {
            if index != FINISH_INDEX && outgoing[index].is_empty() {
                errors.push(format!("node '{}' has no outgoing edges", slot.name));
            }
            if !reachable[index] {
                errors.push(format!("node '{}' is not reachable from '{START}'", slot.name));
            } else if !finishes[index] {
                errors.push(format!("node '{}' cannot reach '{FINISH}'", slot.name));
            }
        }

        if !errors.is_empty() {
            return Err(GraphError::Configuration(format!(
                "graph '{}': {}",
                self.name,
                errors.join("; ")
            )));
        }

        Ok(Graph {
            program: Arc::new(GraphProgram {
                name: self.name,
                nodes: self.nodes,
                outgoing,
                by_name,
            }),
            _marker: PhantomData,
        })
    }

    fn push_slot(&mut self, name: String, kind: NodeKind, types: NodeTypes) -> usize {
        self.nodes.push(NodeSlot { name, kind, types });
        self.nodes.len() - 1
    }

    fn handle<A, B>(&self, index: usize) -> NodeHandle<A, B> {
        NodeHandle {
            builder: self.id,
            index,
            _marker: PhantomData,
        }
    }

    fn owns(&mut self, builder: u64) -> bool {
        if builder == self.id {
            return true;
        }
        self.errors
            .push("edge endpoint belongs to a different graph builder".to_string());
        false
    }
}

/// A validated graph with input `I` and output `O`. Cheap to clone.
pub struct Graph<I, O> {
    pub(crate) program: Arc<GraphProgram>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Graph<I, O> {
    fn clone(&self) -> Self {
        Self {
            program: Arc::clone(&self.program),
            _marker: PhantomData,
        }
    }
}

impl<I, O> std::fmt::Debug for Graph<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.program.name)
            .field("nodes", &self.node_names())
            .finish()
    }
}

impl<I, O> Graph<I, O> {
    pub fn name(&self) -> &str {
        &self.program.name
    }

    /// Node names in declaration order, reserved nodes first.
    pub fn node_names(&self) -> Vec<String> {
        self.program
            .nodes
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// `(from, to)` pairs in declaration order per source node.
    pub fn edge_names(&self) -> Vec<(String, String)> {
        let nodes = &self.program.nodes;
        self.program
            .outgoing
            .iter()
            .enumerate()
            .flat_map(|(from, edges)| {
                edges
                    .iter()
                    .map(move |edge| (nodes[from].name.clone(), nodes[edge.to].name.clone()))
            })
            .collect()
    }

    pub fn contains_path(&self, path: &[String]) -> bool {
        let mut program = &self.program;
        for (depth, name) in path.iter().enumerate() {
            let Some(index) = program.index_of(name) else {
                return false;
            };
            if depth + 1 == path.len() {
                return true;
            }
            match &program.nodes[index].kind {
                NodeKind::Subgraph(sub) => program = &sub.program,
                _ => return false,
            }
        }
        false
    }

    /// Checks that every subgraph's tool scope names tools available in its
    /// enclosing scope, starting from `tools` at the root.
    pub fn validate_tool_scopes(&self, tools: &ToolRegistry) -> Result<(), GraphError> {
        validate_scopes(&self.program, tools, &mut Vec::new())
    }
}

fn validate_scopes(
    program: &GraphProgram,
    tools: &ToolRegistry,
    path: &mut Vec<String>,
) -> Result<(), GraphError> {
    for slot in &program.nodes {
        let NodeKind::Subgraph(sub) = &slot.kind else {
            continue;
        };
        path.push(slot.name.clone());
        let scoped = match &sub.options.tools {
            Some(names) => tools.subset(names).map_err(|err| {
                GraphError::Configuration(format!(
                    "subgraph '{}' tool scope: {err}",
                    path.join("/")
                ))
            })?,
            None => tools.clone(),
        };
        validate_scopes(&sub.program, &scoped, path)?;
        path.pop();
    }
    Ok(())
}
