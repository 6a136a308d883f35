use std::sync::Arc;

use trellis_core::NodeValue;

use crate::node::{unpack, Payload};
use crate::GraphError;

type Predicate<A> = Box<dyn Fn(&A) -> bool + Send + Sync>;
type Transform<A, B> = Box<dyn Fn(A) -> B + Send + Sync>;

/// Ordered `(predicate, transform)` pairs guarding a conditional edge. The
/// first pair whose predicate accepts the producing node's output decides the
/// target's input.
///
/// ```rust
/// use trellis_graph::Route;
///
/// let short_only: Route<String, usize> = Route::new()
///     .when(|text: &String| text.len() < 5, |text| text.len());
/// # let _ = short_only;
/// ```
pub struct Route<A, B> {
    pairs: Vec<(Predicate<A>, Transform<A, B>)>,
}

impl<A, B> Default for Route<A, B> {
    fn default() -> Self {
        Self { pairs: Vec::new() }
    }
}

impl<A: NodeValue, B: NodeValue> Route<A, B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when<P, T>(mut self, predicate: P, transform: T) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        T: Fn(A) -> B + Send + Sync + 'static,
    {
        self.pairs.push((Box::new(predicate), Box::new(transform)));
        self
    }

    /// Unconditional pair.
    pub fn map<T>(self, transform: T) -> Self
    where
        T: Fn(A) -> B + Send + Sync + 'static,
    {
        self.when(|_| true, transform)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub(crate) fn into_selector(self) -> Selector {
        Arc::new(move |output: Payload| -> Result<Selection, GraphError> {
            let value = unpack::<A>(output)?;
            for (predicate, transform) in &self.pairs {
                if predicate(&value) {
                    return Ok(Selection::Taken(Box::new(transform(value))));
                }
            }
            Ok(Selection::Skipped(Box::new(value)))
        })
    }
}

impl<A: NodeValue> Route<A, A> {
    /// Passes the value through unchanged when `predicate` holds.
    pub fn only_if<P>(self, predicate: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.when(predicate, |value| value)
    }
}

/// Result of offering a node's output to one edge. A skipped edge hands the
/// output back untouched so the next edge can be tried.
pub(crate) enum Selection {
    Taken(Payload),
    Skipped(Payload),
}

pub(crate) type Selector = Arc<dyn Fn(Payload) -> Result<Selection, GraphError> + Send + Sync>;

pub(crate) fn identity_selector() -> Selector {
    Arc::new(|output: Payload| -> Result<Selection, GraphError> { Ok(Selection::Taken(output)) })
}

#[derive(Clone)]
pub(crate) struct Edge {
    pub(crate) to: usize,
    pub(crate) select: Selector,
}
