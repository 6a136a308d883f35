use std::any::Any;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use trellis_core::{type_name_of, NodeValue, Value};

use crate::{AgentContext, GraphError};

/// One typed processing step of a graph.
#[async_trait::async_trait]
pub trait GraphNode: Send + Sync + 'static {
    type Input: NodeValue;
    type Output: NodeValue;

    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        input: Self::Input,
    ) -> Result<Self::Output, GraphError>;
}

/// Node backed by a closure returning a boxed future.
pub struct FnNode<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnNode<I, O, F>
where
    I: NodeValue,
    O: NodeValue,
    F: for<'a> Fn(&'a mut AgentContext, I) -> BoxFuture<'a, Result<O, GraphError>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<I, O, F> GraphNode for FnNode<I, O, F>
where
    I: NodeValue,
    O: NodeValue,
    F: for<'a> Fn(&'a mut AgentContext, I) -> BoxFuture<'a, Result<O, GraphError>>
        + Send
        + Sync
        + 'static,
{
    type Input = I;
    type Output = O;

    async fn invoke(&self, ctx: &mut AgentContext, input: I) -> Result<O, GraphError> {
        (self.f)(ctx, input).await
    }
}

/// A node input or output in flight between nodes. Values move as they are;
/// JSON is produced only for event payloads and checkpoints.
pub(crate) trait Carried: Any + Send {
    fn to_json(&self) -> Result<Value, GraphError>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: NodeValue> Carried for T {
    fn to_json(&self) -> Result<Value, GraphError> {
        Ok(serde_json::to_value(self)?)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub(crate) type Payload = Box<dyn Carried>;

/// Recovers the concrete value. Edges are type-checked when the graph is
/// built, so a mismatch here is an engine bug.
pub(crate) fn unpack<T: NodeValue>(payload: Payload) -> Result<T, GraphError> {
    payload
        .into_any()
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| {
            GraphError::custom(format!(
                "expected a value of type {} between nodes",
                type_name_of::<T>()
            ))
        })
}

/// Type-erased view of a [`GraphNode`] used by the runtime.
#[async_trait::async_trait]
pub(crate) trait ErasedNode: Send + Sync {
    async fn invoke(&self, ctx: &mut AgentContext, input: Payload)
        -> Result<Payload, GraphError>;
}

pub(crate) struct TypedNode<N>(pub(crate) N);

#[async_trait::async_trait]
impl<N: GraphNode> ErasedNode for TypedNode<N> {
    async fn invoke(
        &self,
        ctx: &mut AgentContext,
        input: Payload,
    ) -> Result<Payload, GraphError> {
        let input = unpack::<N::Input>(input)?;
        let output = self.0.invoke(ctx, input).await?;
        Ok(Box::new(output))
    }
}

/// Type information the runtime keeps next to every erased node.
#[derive(Clone, Copy)]
pub(crate) struct NodeTypes {
    pub(crate) input: &'static str,
    pub(crate) output: &'static str,
    /// Rebuilds a recorded input when resuming from a checkpoint.
    pub(crate) decode: fn(Value) -> Result<Payload, GraphError>,
}

impl NodeTypes {
    pub(crate) fn of<I: NodeValue, O: NodeValue>() -> Self {
        Self {
            input: type_name_of::<I>(),
            output: type_name_of::<O>(),
            decode: decode::<I>,
        }
    }
}

fn decode<T: NodeValue>(value: Value) -> Result<Payload, GraphError> {
    let value: T = serde_json::from_value(value)?;
    Ok(Box::new(value))
}
